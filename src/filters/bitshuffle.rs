// This file is part of tilepipe released under the MIT license.
// Copyright (c) 2023 TileDB, Inc.

use crate::buffer::FilterBuffer;
use crate::error::{FilterError, Result};
use crate::filters::{
    forward_remaining_metadata, Filter, FilterType, ForwardContext,
    ReverseContext,
};

/// Bit shuffle: transposes the bit matrix of a run of elements so that
/// bit k of every element lands in one contiguous plane. The transpose
/// needs the element count to be a multiple of eight, so each input part
/// is split into a transposable prefix and a remainder that is copied
/// verbatim; both sub-parts are recorded in the metadata.
///
/// The forward metadata is `u32 num_parts` followed by the byte size of
/// each sub-part.
#[derive(Clone, Copy, Debug, Default)]
pub struct BitShuffleFilter;

impl Filter for BitShuffleFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::BitShuffle
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
        let sub_parts = compute_parts(&input.parts(), elem_size);

        output.prepend_buffer(input.size())?;

        output_metadata.append_view(input_metadata)?;
        output_metadata.prepend_buffer(4 + sub_parts.len() * 4)?;
        output_metadata.write_scalar(sub_parts.len() as u32)?;

        for part in &sub_parts {
            output_metadata.write_scalar(part.len() as u32)?;
            if part.len() % (8 * elem_size) == 0 {
                output.write(&transpose_bits(part, elem_size))?;
            } else {
                output.write(part)?;
            }
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
            if part.len() % (8 * elem_size) == 0 {
                output.write(&untranspose_bits(&part, elem_size))?;
            } else {
                output.write(&part)?;
            }
        }

        forward_remaining_metadata(input_metadata, output_metadata)
    }
}

fn element_size(datatype: crate::datatype::DataType) -> Result<usize> {
    match datatype.size() {
        0 => Err(FilterError::InvalidArgument(format!(
            "bit shuffle cannot run on datatype {:?}",
            datatype
        ))),
        size => Ok(size),
    }
}

/// Splits each input part into a prefix holding a multiple of eight
/// elements and a verbatim remainder.
fn compute_parts(parts: &[&[u8]], elem_size: usize) -> Vec<Vec<u8>> {
    let block = 8 * elem_size;
    let mut out = Vec::new();
    for part in parts {
        let body = part.len() / block * block;
        if body > 0 {
            out.push(part[..body].to_vec());
        }
        if body < part.len() {
            out.push(part[body..].to_vec());
        }
    }
    out
}

/// Bit-plane transpose of a run whose element count is a multiple of 8.
/// Plane p (LSB-first across the element's bytes) collects bit p of every
/// element, packed LSB-first.
fn transpose_bits(part: &[u8], elem_size: usize) -> Vec<u8> {
    let num_elems = part.len() / elem_size;
    let plane_bytes = num_elems / 8;
    let mut out = vec![0u8; part.len()];
    for (elem, bytes) in part.chunks_exact(elem_size).enumerate() {
        for (byte_idx, byte) in bytes.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    let plane = byte_idx * 8 + bit;
                    out[plane * plane_bytes + elem / 8] |= 1 << (elem % 8);
                }
            }
        }
    }
    out
}

fn untranspose_bits(part: &[u8], elem_size: usize) -> Vec<u8> {
    let num_elems = part.len() / elem_size;
    let plane_bytes = num_elems / 8;
    let mut out = vec![0u8; part.len()];
    for plane in 0..elem_size * 8 {
        let byte_idx = plane / 8;
        let bit = plane % 8;
        for elem in 0..num_elems {
            let coded = part[plane * plane_bytes + elem / 8];
            if coded & (1 << (elem % 8)) != 0 {
                out[elem * elem_size + byte_idx] |= 1 << bit;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transpose_round_trip() {
        let part: Vec<u8> = (0u8..32).collect();
        for elem_size in [1usize, 2, 4] {
            let coded = transpose_bits(&part, elem_size);
            assert_eq!(untranspose_bits(&coded, elem_size), part);
        }
    }

    #[test]
    fn all_ones_plane() {
        // Eight u8 elements with only bit 0 set: plane 0 is 0xff, the
        // rest empty.
        let part = [1u8; 8];
        let coded = transpose_bits(&part, 1);
        assert_eq!(coded[0], 0xff);
        assert!(coded[1..].iter().all(|b| *b == 0));
    }

    #[test]
    fn parts_split_on_eight_elements() {
        let data = [0u8; 37];
        let parts = compute_parts(&[&data], 2);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len(), 32);
        assert_eq!(parts[1].len(), 5);

        let aligned = [0u8; 32];
        let parts = compute_parts(&[&aligned], 2);
        assert_eq!(parts.len(), 1);
    }
}
