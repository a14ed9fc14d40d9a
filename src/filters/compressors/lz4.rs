// This file is part of tilepipe released under the MIT license.
// Copyright (c) 2023 TileDB, Inc.

use lzzzz::lz4;

use crate::datatype::DataType;
use crate::error::{FilterError, Result};
use crate::filters::compressors::Compressor;

pub struct Lz4Compressor {
    acceleration: i32,
}

impl Lz4Compressor {
    pub fn new(level: i32) -> Self {
        // LZ4's knob is an acceleration factor rather than a level.
        Lz4Compressor {
            acceleration: level.max(lz4::ACC_LEVEL_DEFAULT),
        }
    }
}

impl Compressor for Lz4Compressor {
    fn compress(&self, _datatype: DataType, input: &[u8]) -> Result<Vec<u8>> {
        let mut output = Vec::new();
        lz4::compress_to_vec(input, &mut output, self.acceleration)
            .map_err(|err| FilterError::codec("lz4", err))?;
        Ok(output)
    }

    fn decompress(
        &self,
        _datatype: DataType,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<()> {
        let written = lz4::decompress(input, output)
            .map_err(|err| FilterError::codec("lz4", err))?;
        if written != output.len() {
            return Err(FilterError::codec(
                "lz4",
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
