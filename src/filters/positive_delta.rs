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

pub const DEFAULT_MAX_WINDOW_SIZE: u32 = 1024;

/// Window at which datetime and time datatypes started being encoded; all
/// earlier tiles pass through untouched for compatibility.
const DATETIME_ENCODING_VERSION: u32 = 20;

/// Positive-delta encoding for monotonically non-decreasing integer data.
///
/// Windows mirror bit width reduction. Each window records its first value
/// as a `u64` base and stores every element as the delta from its
/// predecessor; a negative delta aborts the forward pass. Windows whose
/// byte count is not a multiple of the element width pass through.
///
/// The forward metadata is `u32 num_windows` followed by a
/// `u64 base; u32 window_bytes` header per window.
#[derive(Clone, Copy, Debug)]
pub struct PositiveDeltaFilter {
    max_window_size: u32,
}

impl Default for PositiveDeltaFilter {
    fn default() -> Self {
        PositiveDeltaFilter {
            max_window_size: DEFAULT_MAX_WINDOW_SIZE,
        }
    }
}

impl PositiveDeltaFilter {
    pub fn new(max_window_size: u32) -> Self {
        PositiveDeltaFilter { max_window_size }
    }

    pub fn max_window_size(&self) -> u32 {
        self.max_window_size
    }

    pub(crate) fn try_from_config(config: &FilterConfig) -> Result<Self> {
        match config {
            FilterConfig::PositiveDelta { max_window_size } => {
                Ok(PositiveDeltaFilter::new(*max_window_size))
            }
            other => Err(FilterError::InvalidArgument(format!(
                "invalid config {:?} for positive delta filter",
                other
            ))),
        }
    }

    fn encodes(datatype: DataType, format_version: u32) -> bool {
        if datatype.is_integer() {
            return true;
        }
        datatype.is_datetime_or_time()
            && format_version >= DATETIME_ENCODING_VERSION
    }
}

impl Filter for PositiveDeltaFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::PositiveDelta
    }

    fn accepts_input_datatype(&self, datatype: DataType) -> bool {
        datatype.is_integer() || datatype.is_datetime_or_time()
    }

    fn set_option(
        &mut self,
        option: FilterOption,
        value: OptionValue,
    ) -> Result<()> {
        match option {
            FilterOption::PositiveDeltaMaxWindow => {
                self.max_window_size = value.as_u32()?;
                Ok(())
            }
            other => Err(unsupported_option(self.filter_type(), other)),
        }
    }

    fn get_option(&self, option: FilterOption) -> Result<OptionValue> {
        match option {
            FilterOption::PositiveDeltaMaxWindow => {
                Ok(OptionValue::Uint32(self.max_window_size))
            }
            other => Err(unsupported_option(self.filter_type(), other)),
        }
    }

    fn clone_dyn(&self) -> Box<dyn Filter> {
        Box::new(*self)
    }

    fn serial_config(&self) -> FilterConfig {
        FilterConfig::PositiveDelta {
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
        if !PositiveDeltaFilter::encodes(ctx.datatype, ctx.format_version) {
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
        if !PositiveDeltaFilter::encodes(ctx.datatype, ctx.format_version) {
            return pass_through(input_metadata, input, output_metadata, output);
        }
        crate::datatype::integral_dispatch!(
            ctx.datatype,
            reverse(input_metadata, input, output_metadata, output),
            pass_through(input_metadata, input, output_metadata, output)
        )
    }
}

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

    let mut output_size_ub = 0usize;
    let mut metadata_size = 4usize;
    let mut total_num_windows = 0u32;
    for part in &parts {
        if part.is_empty() {
            continue;
        }
        let window = window_nbytes::<T>(part.len(), max_window_size);
        let windows = num_windows(part.len(), window);
        output_size_ub += part.len();
        metadata_size += windows * (8 + 4);
        total_num_windows += windows as u32;
    }

    output.prepend_buffer(output_size_ub)?;

    output_metadata.append_view(input_metadata)?;
    output_metadata.prepend_buffer(metadata_size)?;
    output_metadata.write_scalar(total_num_windows)?;

    for part in &parts {
        if part.is_empty() {
            continue;
        }
        encode_part::<T>(part, max_window_size, output, output_metadata)?;
    }

    Ok(())
}

fn encode_part<T: IntScalar>(
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

        if bytes.len() % T::SIZE != 0 {
            output_metadata.write_scalar(0u64)?;
            output_metadata.write_scalar(bytes.len() as u32)?;
            output.write(bytes)?;
            continue;
        }

        let base = T::read_le(bytes);
        output_metadata.write_scalar(base.to_u64_lossy())?;
        output_metadata.write_scalar(bytes.len() as u32)?;

        let mut prev = base;
        for raw in bytes.chunks_exact(T::SIZE) {
            let current = T::read_le(raw);
            if current < prev {
                return Err(FilterError::NonPositiveDelta);
            }
            output.write_scalar(current.wrapping_sub(prev))?;
            prev = current;
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
    let windows: u32 = input_metadata.read_scalar()?;

    output.prepend_buffer(input.size())?;

    for _ in 0..windows {
        let base: u64 = input_metadata.read_scalar()?;
        let window_nbytes: u32 = input_metadata.read_scalar()?;

        if window_nbytes as usize % T::SIZE != 0 {
            output.copy_from(input, window_nbytes as usize)?;
            continue;
        }

        let mut prev = T::from_u64_lossy(base);
        for _ in 0..window_nbytes as usize / T::SIZE {
            let delta: T = input.read_scalar()?;
            let decoded = prev.wrapping_add(delta);
            output.write_scalar(decoded)?;
            prev = decoded;
        }
    }

    forward_remaining_metadata(input_metadata, output_metadata)
}
