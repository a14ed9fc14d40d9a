// This file is part of tilepipe released under the MIT license.
// Copyright (c) 2023 TileDB, Inc.

use miniz_oxide::deflate::compress_to_vec_zlib;
use miniz_oxide::inflate::decompress_slice_iter_to_slice;

use crate::datatype::DataType;
use crate::error::{FilterError, Result};
use crate::filters::compressors::Compressor;

pub const DEFAULT_LEVEL: u8 = 6;

pub struct GzipCompressor {
    level: u8,
}

impl GzipCompressor {
    pub fn new(level: i32) -> Self {
        let level = if (0..10).contains(&level) {
            level as u8
        } else {
            DEFAULT_LEVEL
        };
        GzipCompressor { level }
    }
}

impl Compressor for GzipCompressor {
    fn compress(&self, _datatype: DataType, input: &[u8]) -> Result<Vec<u8>> {
        Ok(compress_to_vec_zlib(input, self.level))
    }

    fn decompress(
        &self,
        _datatype: DataType,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<()> {
        let written = decompress_slice_iter_to_slice(
            output,
            [input].iter().copied(),
            true,
            false,
        )
        .map_err(|err| FilterError::codec("gzip", format!("{:?}", err)))?;
        if written != output.len() {
            return Err(FilterError::codec(
                "gzip",
                format!(
                    "decompressed {} bytes, expected {}",
                    written,
                    output.len()
                ),
            ));
        }
        Ok(())
    }
}
