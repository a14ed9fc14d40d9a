// This file is part of tilepipe released under the MIT license.
// Copyright (c) 2023 TileDB, Inc.

use crate::buffer::{push_scalar, IntScalar};
use crate::datatype::{integral_dispatch, DataType};
use crate::error::{FilterError, Result};
use crate::filters::compressors::Compressor;

/// First-order delta encoding at full element width. The first value is
/// stored raw and every following value as the wrapping difference from
/// its predecessor. Trailing bytes that do not fill an element are copied
/// verbatim.
#[derive(Default)]
pub struct DeltaCompressor;

impl Compressor for DeltaCompressor {
    fn compress(&self, datatype: DataType, input: &[u8]) -> Result<Vec<u8>> {
        integral_dispatch!(
            datatype,
            encode(input),
            Err(non_integral(datatype))
        )
    }

    fn decompress(
        &self,
        datatype: DataType,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<()> {
        integral_dispatch!(
            datatype,
            decode(input, output),
            Err(non_integral(datatype))
        )
    }
}

fn non_integral(datatype: DataType) -> FilterError {
    FilterError::codec(
        "delta",
        format!("cannot reinterpret input as datatype {:?}", datatype),
    )
}

fn encode<T: IntScalar>(input: &[u8]) -> Result<Vec<u8>> {
    let body = input.len() / T::SIZE * T::SIZE;
    let mut output = Vec::with_capacity(input.len());

    let mut prev = T::default();
    for (index, raw) in input[..body].chunks_exact(T::SIZE).enumerate() {
        let value = T::read_le(raw);
        if index == 0 {
            push_scalar(&mut output, value);
        } else {
            push_scalar(&mut output, value.wrapping_sub(prev));
        }
        prev = value;
    }
    output.extend_from_slice(&input[body..]);
    Ok(output)
}

fn decode<T: IntScalar>(input: &[u8], output: &mut [u8]) -> Result<()> {
    if input.len() != output.len() {
        return Err(FilterError::codec(
            "delta",
            format!(
                "encoded length {} does not match original {}",
                input.len(),
                output.len()
            ),
        ));
    }
    let body = input.len() / T::SIZE * T::SIZE;

    let mut prev = T::default();
    for (index, raw) in input[..body].chunks_exact(T::SIZE).enumerate() {
        let delta = T::read_le(raw);
        let value = if index == 0 {
            delta
        } else {
            prev.wrapping_add(delta)
        };
        value.write_le(&mut output[index * T::SIZE..(index + 1) * T::SIZE]);
        prev = value;
    }
    output[body..].copy_from_slice(&input[body..]);
    Ok(())
}
