// This file is part of tilepipe released under the MIT license.
// Copyright (c) 2023 TileDB, Inc.

use crate::buffer::{FilterBuffer, IntScalar};
use crate::datatype::DataType;
use crate::error::{FilterError, Result};
use crate::filters::{
    forward_remaining_metadata, Filter, FilterType, ForwardContext,
    ReverseContext,
};

/// XOR-with-previous encoding of fixed-width values. The first value of
/// every part is stored verbatim; each subsequent value is XORed with its
/// predecessor. Reverse runs the XOR prefix scan to reconstruct.
///
/// The forward output metadata is `u32 num_parts` followed by the byte
/// size of each part.
#[derive(Clone, Copy, Debug, Default)]
pub struct XorFilter;

impl XorFilter {
    fn width_type(datatype: DataType) -> Option<DataType> {
        match datatype.size() {
            1 | 2 | 4 | 8 => {
                Some(DataType::signed_int_of_width(datatype.size()))
            }
            _ => None,
        }
    }
}

impl Filter for XorFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::Xor
    }

    fn accepts_input_datatype(&self, datatype: DataType) -> bool {
        XorFilter::width_type(datatype).is_some()
    }

    fn output_datatype(&self, input: DataType) -> DataType {
        XorFilter::width_type(input).unwrap_or(input)
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
        let width = XorFilter::width_type(ctx.datatype)
            .ok_or_else(|| invalid_width(ctx.datatype))?;
        crate::datatype::integral_dispatch!(
            width,
            xor_forward(input_metadata, input, output_metadata, output),
            Err(invalid_width(ctx.datatype))
        )
    }

    fn run_reverse<'a>(
        &self,
        ctx: &mut ReverseContext<'_>,
        input_metadata: &mut FilterBuffer<'a>,
        input: &mut FilterBuffer<'a>,
        output_metadata: &mut FilterBuffer<'a>,
        output: &mut FilterBuffer<'a>,
    ) -> Result<()> {
        let width = XorFilter::width_type(ctx.datatype)
            .ok_or_else(|| invalid_width(ctx.datatype))?;
        crate::datatype::integral_dispatch!(
            width,
            xor_reverse(input_metadata, input, output_metadata, output),
            Err(invalid_width(ctx.datatype))
        )
    }
}

fn invalid_width(datatype: DataType) -> FilterError {
    FilterError::InvalidArgument(format!(
        "XOR filter cannot run on datatype {:?}",
        datatype
    ))
}

fn xor_forward<'a, T: IntScalar>(
    input_metadata: &mut FilterBuffer<'a>,
    input: &mut FilterBuffer<'a>,
    output_metadata: &mut FilterBuffer<'a>,
    output: &mut FilterBuffer<'a>,
) -> Result<()> {
    let parts: Vec<Vec<u8>> =
        input.parts().iter().map(|p| p.to_vec()).collect();
    let num_parts = parts.len() as u32;

    output.prepend_buffer(input.size())?;

    let metadata_size = 4 + parts.len() * 4;
    output_metadata.append_view(input_metadata)?;
    output_metadata.prepend_buffer(metadata_size)?;
    output_metadata.write_scalar(num_parts)?;

    for part in &parts {
        output_metadata.write_scalar(part.len() as u32)?;
        xor_part::<T>(part, output, false)?;
    }

    Ok(())
}

fn xor_reverse<'a, T: IntScalar>(
    input_metadata: &mut FilterBuffer<'a>,
    input: &mut FilterBuffer<'a>,
    output_metadata: &mut FilterBuffer<'a>,
    output: &mut FilterBuffer<'a>,
) -> Result<()> {
    let num_parts: u32 = input_metadata.read_scalar()?;

    output.prepend_buffer(input.size())?;

    for _ in 0..num_parts {
        let part_size: u32 = input_metadata.read_scalar()?;
        let mut part = vec![0u8; part_size as usize];
        input.read_exact(&mut part)?;
        xor_part::<T>(&part, output, true)?;
    }

    forward_remaining_metadata(input_metadata, output_metadata)
}

/// XORs consecutive elements of one part into the output. In the inverted
/// direction the scan uses the decoded predecessor, making the transform
/// self-inverse across the whole part.
fn xor_part<T: IntScalar>(
    part: &[u8],
    output: &mut FilterBuffer<'_>,
    invert: bool,
) -> Result<()> {
    if part.len() % T::SIZE != 0 {
        return Err(FilterError::InvalidArgument(format!(
            "XOR part of {} bytes is not a multiple of element width {}",
            part.len(),
            T::SIZE
        )));
    }
    let num_elems = part.len() / T::SIZE;
    if num_elems == 0 {
        return Ok(());
    }

    let mut prev = T::read_le(part);
    output.write_scalar(prev)?;
    for i in 1..num_elems {
        let raw = T::read_le(&part[i * T::SIZE..]);
        let coded = raw.bitxor(prev);
        output.write_scalar(coded)?;
        prev = if invert { coded } else { raw };
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::filters::tests::{forward_ctx, reverse_ctx};

    fn round_trip(datatype: DataType, raw: &[u8]) -> Vec<u8> {
        let filter = XorFilter;
        let mut input_metadata = FilterBuffer::new();
        let mut input = FilterBuffer::from_slice(raw);
        let mut output_metadata = FilterBuffer::new();
        let mut output = FilterBuffer::new();
        filter
            .run_forward(
                &mut forward_ctx(datatype),
                &mut input_metadata,
                &mut input,
                &mut output_metadata,
                &mut output,
            )
            .unwrap();
        let coded = output.to_vec();
        assert_eq!(coded.len(), raw.len());

        let config = Config::default();
        let metadata = output_metadata.to_vec();
        let mut input_metadata = FilterBuffer::from_slice(&metadata);
        let mut input = FilterBuffer::from_slice(&coded);
        let mut output_metadata = FilterBuffer::new();
        let mut decoded = FilterBuffer::new();
        filter
            .run_reverse(
                &mut reverse_ctx(datatype, &config),
                &mut input_metadata,
                &mut input,
                &mut output_metadata,
                &mut decoded,
            )
            .unwrap();
        assert_eq!(decoded.to_vec(), raw);
        coded
    }

    #[test]
    fn round_trips_and_codes_xor() {
        let values: Vec<i32> = vec![3, 1, 4, 1, -5, 9, 2, 6];
        let mut raw = Vec::new();
        for v in &values {
            raw.extend_from_slice(&v.to_le_bytes());
        }
        let coded = round_trip(DataType::Int32, &raw);
        // Second element is v[1] ^ v[0].
        let second = i32::from_le_bytes(coded[4..8].try_into().unwrap());
        assert_eq!(second, 1 ^ 3);
    }

    #[test]
    fn floats_code_through_raw_bits() {
        let values: Vec<f64> = vec![1.5, -2.25, 1e300, 0.0];
        let mut raw = Vec::new();
        for v in &values {
            raw.extend_from_slice(&v.to_le_bytes());
        }
        round_trip(DataType::Float64, &raw);
    }

    #[test]
    fn output_datatype_is_signed_of_width() {
        assert_eq!(
            XorFilter.output_datatype(DataType::Float32),
            DataType::Int32
        );
        assert_eq!(
            XorFilter.output_datatype(DataType::Uint64),
            DataType::Int64
        );
        assert_eq!(XorFilter.output_datatype(DataType::Uint8), DataType::Int8);
    }
}
