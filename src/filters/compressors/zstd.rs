// This file is part of tilepipe released under the MIT license.
// Copyright (c) 2023 TileDB, Inc.

use crate::datatype::DataType;
use crate::error::{FilterError, Result};
use crate::filters::compressors::Compressor;

pub const DEFAULT_LEVEL: i32 = 3;

pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    pub fn new(level: i32) -> Self {
        let level = if (1..=22).contains(&level) {
            level
        } else {
            DEFAULT_LEVEL
        };
        ZstdCompressor { level }
    }
}

impl Compressor for ZstdCompressor {
    fn compress(&self, _datatype: DataType, input: &[u8]) -> Result<Vec<u8>> {
        let mut output =
            Vec::with_capacity(zstd_safe::compress_bound(input.len()));
        zstd_safe::compress(&mut output, input, self.level).map_err(
            |code| {
                FilterError::codec("zstd", zstd_safe::get_error_name(code))
            },
        )?;
        Ok(output)
    }

    fn decompress(
        &self,
        _datatype: DataType,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<()> {
        let written =
            zstd_safe::decompress(output, input).map_err(|code| {
                FilterError::codec("zstd", zstd_safe::get_error_name(code))
            })?;
        if written != output.len() {
            return Err(FilterError::codec(
                "zstd",
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
