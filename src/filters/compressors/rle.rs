// This file is part of tilepipe released under the MIT license.
// Copyright (c) 2023 TileDB, Inc.

use crate::buffer::{push_scalar, ByteReader};
use crate::datatype::DataType;
use crate::error::{FilterError, Result};
use crate::filters::compressors::Compressor;

/// Run-length encoding over fixed-width cells. Each run is stored as
/// `u32 run_length` followed by one cell's bytes.
#[derive(Default)]
pub struct RleCompressor;

fn cell_size(datatype: DataType) -> usize {
    datatype.size().max(1)
}

impl Compressor for RleCompressor {
    fn compress(&self, datatype: DataType, input: &[u8]) -> Result<Vec<u8>> {
        let cell = cell_size(datatype);
        if input.len() % cell != 0 {
            return Err(FilterError::codec(
                "rle",
                format!(
                    "input of {} bytes is not a multiple of cell size {}",
                    input.len(),
                    cell
                ),
            ));
        }

        let mut output = Vec::new();
        let mut cells = input.chunks_exact(cell);
        let Some(first) = cells.next() else {
            return Ok(output);
        };

        let mut current = first;
        let mut run_length = 1u32;
        for value in cells {
            if value == current && run_length < u32::MAX {
                run_length += 1;
            } else {
                push_scalar(&mut output, run_length);
                output.extend_from_slice(current);
                current = value;
                run_length = 1;
            }
        }
        push_scalar(&mut output, run_length);
        output.extend_from_slice(current);
        Ok(output)
    }

    fn decompress(
        &self,
        datatype: DataType,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<()> {
        let cell = cell_size(datatype);
        let mut reader = ByteReader::new(input);
        let mut filled = 0usize;
        while reader.remaining() > 0 {
            let run_length = reader.read::<u32>()? as usize;
            let value = reader.read_bytes(cell)?;
            let end = filled + run_length * cell;
            if end > output.len() {
                return Err(FilterError::codec(
                    "rle",
                    "runs exceed the original length",
                ));
            }
            for _ in 0..run_length {
                output[filled..filled + cell].copy_from_slice(value);
                filled += cell;
            }
        }
        if filled != output.len() {
            return Err(FilterError::codec(
                "rle",
                format!(
                    "runs cover {} bytes, expected {}",
                    filled,
                    output.len()
                ),
            ));
        }
        Ok(())
    }
}
