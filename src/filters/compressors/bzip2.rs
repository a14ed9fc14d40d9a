// This file is part of tilepipe released under the MIT license.
// Copyright (c) 2023 TileDB, Inc.

use std::io::Read;

use bzip2::read::{BzDecoder, BzEncoder};
use bzip2::Compression;

use crate::datatype::DataType;
use crate::error::{FilterError, Result};
use crate::filters::compressors::Compressor;

pub const DEFAULT_LEVEL: u32 = 9;

pub struct Bzip2Compressor {
    level: u32,
}

impl Bzip2Compressor {
    pub fn new(level: i32) -> Self {
        let level = if (1..=9).contains(&level) {
            level as u32
        } else {
            DEFAULT_LEVEL
        };
        Bzip2Compressor { level }
    }
}

impl Compressor for Bzip2Compressor {
    fn compress(&self, _datatype: DataType, input: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = BzEncoder::new(input, Compression::new(self.level));
        let mut output = Vec::new();
        encoder
            .read_to_end(&mut output)
            .map_err(|err| FilterError::codec("bzip2", err))?;
        Ok(output)
    }

    fn decompress(
        &self,
        _datatype: DataType,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<()> {
        let mut decoder = BzDecoder::new(input);
        let mut decompressed = Vec::with_capacity(output.len());
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|err| FilterError::codec("bzip2", err))?;
        if decompressed.len() != output.len() {
            return Err(FilterError::codec(
                "bzip2",
                format!(
                    "decompressed {} bytes, expected {}",
                    decompressed.len(),
                    output.len()
                ),
            ));
        }
        output.copy_from_slice(&decompressed);
        Ok(())
    }
}
