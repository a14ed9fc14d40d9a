// This file is part of tilepipe released under the MIT license.
// Copyright (c) 2023 TileDB, Inc.

use crate::buffer::FilterBuffer;
use crate::error::{FilterError, Result};
use crate::filters::{
    forward_remaining_metadata, Filter, FilterType, ForwardContext,
    ReverseContext,
};

/// Byte shuffle: permutes the bytes of each element into per-byte planes,
/// so that the first bytes of all elements are contiguous, then all second
/// bytes, and so on. Improves downstream compression of multi-byte values.
///
/// Each input part is shuffled independently; the forward metadata is
/// `u32 num_parts` followed by the byte size of each part. Trailing bytes
/// of a part that do not fill a whole element are copied verbatim.
#[derive(Clone, Copy, Debug, Default)]
pub struct ByteShuffleFilter;

impl Filter for ByteShuffleFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::ByteShuffle
    }

    fn clone_dyn(&self) -> Box<dyn Filter> {
        Box::new(*self)
    }

    fn run_forward<'a>(
        &self,
        ctx: &mut ForwardContext<'_>,
        input_metadata: &mut FilterBuffer<'a>,
        input: &mut FilterBuffer<'a>,
        output_metadata: &mut FilterBuffer<'a>,
        output: &mut FilterBuffer<'a>,
    ) -> Result<()> {
        let elem_size = element_size(ctx.datatype)?;
        let parts: Vec<Vec<u8>> =
            input.parts().iter().map(|p| p.to_vec()).collect();

        output.prepend_buffer(input.size())?;

        output_metadata.append_view(input_metadata)?;
        output_metadata.prepend_buffer(4 + parts.len() * 4)?;
        output_metadata.write_scalar(parts.len() as u32)?;

        for part in &parts {
            output_metadata.write_scalar(part.len() as u32)?;
            output.write(&shuffle(part, elem_size))?;
        }

        Ok(())
    }

    fn run_reverse<'a>(
        &self,
        ctx: &mut ReverseContext<'_>,
        input_metadata: &mut FilterBuffer<'a>,
        input: &mut FilterBuffer<'a>,
        output_metadata: &mut FilterBuffer<'a>,
        output: &mut FilterBuffer<'a>,
    ) -> Result<()> {
        let elem_size = element_size(ctx.datatype)?;
        let num_parts: u32 = input_metadata.read_scalar()?;

        output.prepend_buffer(input.size())?;

        for _ in 0..num_parts {
            let part_size: u32 = input_metadata.read_scalar()?;
            let mut part = vec![0u8; part_size as usize];
            input.read_exact(&mut part)?;
            output.write(&unshuffle(&part, elem_size))?;
        }

        forward_remaining_metadata(input_metadata, output_metadata)
    }
}

fn element_size(datatype: crate::datatype::DataType) -> Result<usize> {
    match datatype.size() {
        0 => Err(FilterError::InvalidArgument(format!(
            "byte shuffle cannot run on datatype {:?}",
            datatype
        ))),
        size => Ok(size),
    }
}

fn shuffle(part: &[u8], elem_size: usize) -> Vec<u8> {
    let num_elems = part.len() / elem_size;
    let body = num_elems * elem_size;
    let mut out = Vec::with_capacity(part.len());
    for plane in 0..elem_size {
        for elem in 0..num_elems {
            out.push(part[elem * elem_size + plane]);
        }
    }
    out.extend_from_slice(&part[body..]);
    out
}

fn unshuffle(part: &[u8], elem_size: usize) -> Vec<u8> {
    let num_elems = part.len() / elem_size;
    let body = num_elems * elem_size;
    let mut out = vec![0u8; part.len()];
    for plane in 0..elem_size {
        for elem in 0..num_elems {
            out[elem * elem_size + plane] = part[plane * num_elems + elem];
        }
    }
    out[body..].copy_from_slice(&part[body..]);
    out
}
