// This file is part of tilepipe released under the MIT license.
// Copyright (c) 2023 TileDB, Inc.

use crate::buffer::{FilterBuffer, IntScalar};
use crate::datatype::DataType;
use crate::error::{FilterError, Result};
use crate::filters::{
    forward_remaining_metadata, pass_through, unsupported_option, Filter,
    FilterOption, FilterType, ForwardContext, OptionValue, ReverseContext,
};
use crate::storage::FilterConfig;

pub const DEFAULT_MAX_WINDOW_SIZE: u32 = 256 * 1024;

/// Reduces the bit width of integer data window by window.
///
/// Each window of at most `max_window_size` bytes records its minimum
/// value, and the values are rewritten as `value - min` at the smallest
/// power-of-two bit width in {8, 16, 32, 64} that represents `range + 1`.
/// A window that cannot shrink is emitted verbatim.
///
/// The forward metadata is `u32 original_length; u32 num_windows` followed
/// by a `T min; u8 bits; u32 window_bytes` header per window.
#[derive(Clone, Copy, Debug)]
pub struct BitWidthReductionFilter {
    max_window_size: u32,
}

impl Default for BitWidthReductionFilter {
    fn default() -> Self {
        BitWidthReductionFilter {
            max_window_size: DEFAULT_MAX_WINDOW_SIZE,
        }
    }
}

impl BitWidthReductionFilter {
    pub fn new(max_window_size: u32) -> Self {
        BitWidthReductionFilter { max_window_size }
    }

    pub fn max_window_size(&self) -> u32 {
        self.max_window_size
    }

    pub(crate) fn try_from_config(config: &FilterConfig) -> Result<Self> {
        match config {
            FilterConfig::BitWidthReduction { max_window_size } => {
                Ok(BitWidthReductionFilter::new(*max_window_size))
            }
            other => Err(FilterError::InvalidArgument(format!(
                "invalid config {:?} for bit width reduction filter",
                other
            ))),
        }
    }

    fn applies_to(datatype: DataType) -> bool {
        datatype.is_integer() && datatype.size() > 1
    }
}

impl Filter for BitWidthReductionFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::BitWidthReduction
    }

    fn accepts_input_datatype(&self, datatype: DataType) -> bool {
        datatype.is_integer()
    }

    fn set_option(
        &mut self,
        option: FilterOption,
        value: OptionValue,
    ) -> Result<()> {
        match option {
            FilterOption::BitWidthMaxWindow => {
                self.max_window_size = value.as_u32()?;
                Ok(())
            }
            other => Err(unsupported_option(self.filter_type(), other)),
        }
    }

    fn get_option(&self, option: FilterOption) -> Result<OptionValue> {
        match option {
            FilterOption::BitWidthMaxWindow => {
                Ok(OptionValue::Uint32(self.max_window_size))
            }
            other => Err(unsupported_option(self.filter_type(), other)),
        }
    }

    fn clone_dyn(&self) -> Box<dyn Filter> {
        Box::new(*self)
    }

    fn serial_config(&self) -> FilterConfig {
        FilterConfig::BitWidthReduction {
            max_window_size: self.max_window_size,
        }
    }

    fn run_forward<'a>(
        &self,
        ctx: &mut ForwardContext<'_>,
        input_metadata: &mut FilterBuffer<'a>,
        input: &mut FilterBuffer<'a>,
        output_metadata: &mut FilterBuffer<'a>,
        output: &mut FilterBuffer<'a>,
    ) -> Result<()> {
        if !BitWidthReductionFilter::applies_to(ctx.datatype) {
            return pass_through(input_metadata, input, output_metadata, output);
        }
        let window = self.max_window_size;
        crate::datatype::integral_dispatch!(
            ctx.datatype,
            forward(window, input_metadata, input, output_metadata, output),
            pass_through(input_metadata, input, output_metadata, output)
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
        if !BitWidthReductionFilter::applies_to(ctx.datatype) {
            return pass_through(input_metadata, input, output_metadata, output);
        }
        crate::datatype::integral_dispatch!(
            ctx.datatype,
            reverse(input_metadata, input, output_metadata, output),
            pass_through(input_metadata, input, output_metadata, output)
        )
    }
}

/// Window size in bytes for one part: the configured cap floored to a
/// multiple of the element width, or the whole part when the cap cannot
/// hold a single element.
fn window_nbytes<T: IntScalar>(part_len: usize, max_window_size: u32) -> usize {
    let window = part_len.min(max_window_size as usize) / T::SIZE * T::SIZE;
    if window == 0 {
        part_len
    } else {
        window
    }
}

fn num_windows(part_len: usize, window: usize) -> usize {
    part_len / window + usize::from(part_len % window != 0)
}

fn forward<'a, T: IntScalar>(
    max_window_size: u32,
    input_metadata: &mut FilterBuffer<'a>,
    input: &mut FilterBuffer<'a>,
    output_metadata: &mut FilterBuffer<'a>,
    output: &mut FilterBuffer<'a>,
) -> Result<()> {
    let parts: Vec<Vec<u8>> =
        input.parts().iter().map(|p| p.to_vec()).collect();
    let input_size = input.size() as u32;

    let mut output_size_ub = 0usize;
    let mut metadata_size = 8usize;
    let mut total_num_windows = 0u32;
    for part in &parts {
        if part.is_empty() {
            continue;
        }
        let window = window_nbytes::<T>(part.len(), max_window_size);
        let windows = num_windows(part.len(), window);
        output_size_ub += part.len();
        metadata_size += windows * (4 + T::SIZE + 1);
        total_num_windows += windows as u32;
    }

    output.prepend_buffer(output_size_ub)?;

    output_metadata.append_view(input_metadata)?;
    output_metadata.prepend_buffer(metadata_size)?;
    output_metadata.write_scalar(input_size)?;
    output_metadata.write_scalar(total_num_windows)?;

    for part in &parts {
        if part.is_empty() {
            continue;
        }
        compress_part::<T>(part, max_window_size, output, output_metadata)?;
    }

    Ok(())
}

fn compress_part<T: IntScalar>(
    part: &[u8],
    max_window_size: u32,
    output: &mut FilterBuffer<'_>,
    output_metadata: &mut FilterBuffer<'_>,
) -> Result<()> {
    let window = window_nbytes::<T>(part.len(), max_window_size);
    let windows = num_windows(part.len(), window);

    for i in 0..windows {
        let start = i * window;
        let bytes = &part[start..part.len().min(start + window)];
        let (min_value, bits) = compute_bits_required::<T>(bytes);

        output_metadata.write_scalar(min_value)?;
        output_metadata.write_scalar(bits)?;
        output_metadata.write_scalar(bytes.len() as u32)?;

        if u32::from(bits) >= T::BITS || bytes.len() % T::SIZE != 0 {
            output.write(bytes)?;
        } else {
            for raw in bytes.chunks_exact(T::SIZE) {
                let value = T::read_le(raw);
                let relative =
                    (value.to_i128() - min_value.to_i128()) as u64;
                write_reduced(output, relative, bits)?;
            }
        }
    }

    Ok(())
}

fn reverse<'a, T: IntScalar>(
    input_metadata: &mut FilterBuffer<'a>,
    input: &mut FilterBuffer<'a>,
    output_metadata: &mut FilterBuffer<'a>,
    output: &mut FilterBuffer<'a>,
) -> Result<()> {
    let orig_length: u32 = input_metadata.read_scalar()?;
    let windows: u32 = input_metadata.read_scalar()?;

    output.prepend_buffer(orig_length as usize)?;

    for _ in 0..windows {
        let min_value: T = input_metadata.read_scalar()?;
        let bits: u8 = input_metadata.read_scalar()?;
        let window_nbytes: u32 = input_metadata.read_scalar()?;

        if u32::from(bits) >= T::BITS || window_nbytes as usize % T::SIZE != 0
        {
            output.copy_from(input, window_nbytes as usize)?;
        } else {
            let num_elems = window_nbytes as usize / T::SIZE;
            for _ in 0..num_elems {
                let relative = read_reduced(input, bits)?;
                let value =
                    T::from_i128(min_value.to_i128() + relative as i128);
                output.write_scalar(value)?;
            }
        }
    }

    forward_remaining_metadata(input_metadata, output_metadata)
}

/// Minimum value and the reduced width for one window. Values are coded
/// relative to the minimum, so the width covers `range + 1` states.
fn compute_bits_required<T: IntScalar>(bytes: &[u8]) -> (T, u8) {
    if bytes.len() % T::SIZE != 0 {
        return (T::default(), T::BITS as u8);
    }

    let mut min = None;
    let mut max = None;
    for raw in bytes.chunks_exact(T::SIZE) {
        let value = T::read_le(raw);
        min = Some(min.map_or(value, |m: T| m.min(value)));
        max = Some(max.map_or(value, |m: T| m.max(value)));
    }
    let (Some(min), Some(max)) = (min, max) else {
        return (T::default(), T::BITS as u8);
    };

    let range = (max.to_i128() - min.to_i128()) as u128;
    if range >= (1u128 << T::BITS) - 1 {
        return (min, T::BITS as u8);
    }

    let bits = 128 - (range + 1).leading_zeros();
    let bits = match bits {
        0..=8 => 8,
        9..=16 => 16,
        17..=32 => 32,
        _ => 64,
    };
    (min, bits as u8)
}

fn write_reduced(
    output: &mut FilterBuffer<'_>,
    relative: u64,
    bits: u8,
) -> Result<()> {
    match bits {
        8 => output.write_scalar(relative as u8),
        16 => output.write_scalar(relative as u16),
        32 => output.write_scalar(relative as u32),
        _ => output.write_scalar(relative),
    }
}

fn read_reduced(input: &mut FilterBuffer<'_>, bits: u8) -> Result<u64> {
    Ok(match bits {
        8 => u64::from(input.read_scalar::<u8>()?),
        16 => u64::from(input.read_scalar::<u16>()?),
        32 => u64::from(input.read_scalar::<u32>()?),
        _ => input.read_scalar::<u64>()?,
    })
}
