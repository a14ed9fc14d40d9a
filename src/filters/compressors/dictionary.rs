// This file is part of tilepipe released under the MIT license.
// Copyright (c) 2023 TileDB, Inc.

use std::collections::HashMap;

use crate::buffer::{push_scalar, ByteReader};
use crate::datatype::DataType;
use crate::error::{FilterError, Result};
use crate::filters::compressors::Compressor;

/// Dictionary encoding over fixed-width cells. Distinct cells are listed
/// in first-appearance order, then every cell is replaced by its id at the
/// smallest width in {1, 2, 4} bytes that holds the dictionary size.
///
/// Layout: `u32 num_entries; u8 id_width; entries; ids`.
#[derive(Default)]
pub struct DictionaryCompressor;

fn cell_size(datatype: DataType) -> usize {
    datatype.size().max(1)
}

fn id_width(num_entries: usize) -> usize {
    if num_entries <= usize::from(u8::MAX) + 1 {
        1
    } else if num_entries <= usize::from(u16::MAX) + 1 {
        2
    } else {
        4
    }
}

impl Compressor for DictionaryCompressor {
    fn compress(&self, datatype: DataType, input: &[u8]) -> Result<Vec<u8>> {
        let cell = cell_size(datatype);
        if input.len() % cell != 0 {
            return Err(FilterError::codec(
                "dictionary",
                format!(
                    "input of {} bytes is not a multiple of cell size {}",
                    input.len(),
                    cell
                ),
            ));
        }

        let mut entries: Vec<&[u8]> = Vec::new();
        let mut ids = Vec::with_capacity(input.len() / cell);
        let mut seen: HashMap<&[u8], u32> = HashMap::new();
        for value in input.chunks_exact(cell) {
            let next_id = entries.len() as u32;
            let id = *seen.entry(value).or_insert_with(|| {
                entries.push(value);
                next_id
            });
            ids.push(id);
        }

        let width = id_width(entries.len());
        let mut output = Vec::new();
        push_scalar(&mut output, entries.len() as u32);
        push_scalar(&mut output, width as u8);
        for entry in &entries {
            output.extend_from_slice(entry);
        }
        for id in ids {
            match width {
                1 => push_scalar(&mut output, id as u8),
                2 => push_scalar(&mut output, id as u16),
                _ => push_scalar(&mut output, id),
            }
        }
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
        let num_entries = reader.read::<u32>()? as usize;
        let width = usize::from(reader.read::<u8>()?);
        if !matches!(width, 1 | 2 | 4) {
            return Err(FilterError::codec(
                "dictionary",
                format!("invalid id width {}", width),
            ));
        }
        let entries = reader.read_bytes(num_entries * cell)?;

        if output.len() % cell != 0 {
            return Err(FilterError::codec(
                "dictionary",
                "original length is not a multiple of the cell size",
            ));
        }
        let num_cells = output.len() / cell;
        for slot in 0..num_cells {
            let id = match width {
                1 => usize::from(reader.read::<u8>()?),
                2 => usize::from(reader.read::<u16>()?),
                _ => reader.read::<u32>()? as usize,
            };
            if id >= num_entries {
                return Err(FilterError::codec(
                    "dictionary",
                    format!("id {} out of range of {} entries", id, num_entries),
                ));
            }
            output[slot * cell..(slot + 1) * cell]
                .copy_from_slice(&entries[id * cell..(id + 1) * cell]);
        }
        Ok(())
    }
}
