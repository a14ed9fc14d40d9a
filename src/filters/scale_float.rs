// This file is part of tilepipe released under the MIT license.
// Copyright (c) 2023 TileDB, Inc.

use crate::buffer::FilterBuffer;
use crate::datatype::DataType;
use crate::error::{FilterError, Result};
use crate::filters::{
    forward_remaining_metadata, unsupported_option, Filter, FilterOption,
    FilterType, ForwardContext, OptionValue, ReverseContext,
};
use crate::storage::FilterConfig;

/// Quantizes floating point data to scaled signed integers.
///
/// Forward maps `x` to `round((x - offset) / factor)` stored as a signed
/// integer of the configured byte width; reverse maps `y` back to
/// `factor * y + offset`. Downstream filters see the signed integer
/// datatype of the configured width.
#[derive(Clone, Copy, Debug)]
pub struct ScaleFloatFilter {
    factor: f64,
    offset: f64,
    byte_width: u64,
}

impl Default for ScaleFloatFilter {
    fn default() -> Self {
        ScaleFloatFilter {
            factor: 1.0,
            offset: 0.0,
            byte_width: 8,
        }
    }
}

impl ScaleFloatFilter {
    pub fn new(factor: f64, offset: f64, byte_width: u64) -> Result<Self> {
        let mut filter = ScaleFloatFilter::default();
        filter.set_option(
            FilterOption::ScaleFloatFactor,
            OptionValue::Float64(factor),
        )?;
        filter.set_option(
            FilterOption::ScaleFloatOffset,
            OptionValue::Float64(offset),
        )?;
        filter.set_option(
            FilterOption::ScaleFloatByteWidth,
            OptionValue::Uint64(byte_width),
        )?;
        Ok(filter)
    }

    pub(crate) fn try_from_config(config: &FilterConfig) -> Result<Self> {
        match config {
            FilterConfig::ScaleFloat {
                scale,
                offset,
                byte_width,
            } => ScaleFloatFilter::new(*scale, *offset, *byte_width),
            other => Err(FilterError::InvalidArgument(format!(
                "invalid config {:?} for scale float filter",
                other
            ))),
        }
    }
}

impl Filter for ScaleFloatFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::ScaleFloat
    }

    fn accepts_input_datatype(&self, datatype: DataType) -> bool {
        datatype.is_float()
    }

    fn output_datatype(&self, _input: DataType) -> DataType {
        DataType::signed_int_of_width(self.byte_width as usize)
    }

    fn set_option(
        &mut self,
        option: FilterOption,
        value: OptionValue,
    ) -> Result<()> {
        match option {
            FilterOption::ScaleFloatFactor => {
                let factor = value.as_f64()?;
                if factor == 0.0 || !factor.is_finite() {
                    return Err(FilterError::InvalidOption(format!(
                        "scale float factor {} is not usable",
                        factor
                    )));
                }
                self.factor = factor;
                Ok(())
            }
            FilterOption::ScaleFloatOffset => {
                let offset = value.as_f64()?;
                if !offset.is_finite() {
                    return Err(FilterError::InvalidOption(format!(
                        "scale float offset {} is not usable",
                        offset
                    )));
                }
                self.offset = offset;
                Ok(())
            }
            FilterOption::ScaleFloatByteWidth => {
                let width = value.as_u64()?;
                if !matches!(width, 1 | 2 | 4 | 8) {
                    return Err(FilterError::InvalidOption(format!(
                        "scale float byte width {} is not in {{1, 2, 4, 8}}",
                        width
                    )));
                }
                self.byte_width = width;
                Ok(())
            }
            other => Err(unsupported_option(self.filter_type(), other)),
        }
    }

    fn get_option(&self, option: FilterOption) -> Result<OptionValue> {
        match option {
            FilterOption::ScaleFloatFactor => {
                Ok(OptionValue::Float64(self.factor))
            }
            FilterOption::ScaleFloatOffset => {
                Ok(OptionValue::Float64(self.offset))
            }
            FilterOption::ScaleFloatByteWidth => {
                Ok(OptionValue::Uint64(self.byte_width))
            }
            other => Err(unsupported_option(self.filter_type(), other)),
        }
    }

    fn clone_dyn(&self) -> Box<dyn Filter> {
        Box::new(*self)
    }

    fn serial_config(&self) -> FilterConfig {
        FilterConfig::ScaleFloat {
            scale: self.factor,
            offset: self.offset,
            byte_width: self.byte_width,
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
        let float_size = float_size(ctx.datatype)?;
        if input.size() % float_size != 0 {
            return Err(FilterError::InvalidArgument(format!(
                "input of {} bytes is not a multiple of the float width {}",
                input.size(),
                float_size
            )));
        }
        let num_values = input.size() / float_size;
        let width = self.byte_width as usize;

        output.prepend_buffer(num_values * width)?;
        input.reset_offset();
        for _ in 0..num_values {
            let raw = match float_size {
                4 => f64::from(input.read_scalar::<f32>()?),
                _ => input.read_scalar::<f64>()?,
            };
            let scaled = ((raw - self.offset) / self.factor).round();
            match width {
                1 => output.write_scalar(scaled as i8)?,
                2 => output.write_scalar(scaled as i16)?,
                4 => output.write_scalar(scaled as i32)?,
                _ => output.write_scalar(scaled as i64)?,
            }
        }

        output_metadata.append_view(input_metadata)?;
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
        let float_size = float_size(ctx.datatype)?;
        let width = self.byte_width as usize;
        if input.size() % width != 0 {
            return Err(FilterError::FormatCorrupt(format!(
                "scaled input of {} bytes is not a multiple of width {}",
                input.size(),
                width
            )));
        }
        let num_values = input.size() / width;

        output.prepend_buffer(num_values * float_size)?;
        input.reset_offset();
        for _ in 0..num_values {
            let scaled = match width {
                1 => f64::from(input.read_scalar::<i8>()?),
                2 => f64::from(input.read_scalar::<i16>()?),
                4 => f64::from(input.read_scalar::<i32>()?),
                _ => input.read_scalar::<i64>()? as f64,
            };
            let raw = self.factor * scaled + self.offset;
            match float_size {
                4 => output.write_scalar(raw as f32)?,
                _ => output.write_scalar(raw)?,
            }
        }

        forward_remaining_metadata(input_metadata, output_metadata)
    }
}

fn float_size(datatype: DataType) -> Result<usize> {
    match datatype {
        DataType::Float32 => Ok(4),
        DataType::Float64 => Ok(8),
        other => Err(FilterError::InvalidArgument(format!(
            "scale float filter cannot run on datatype {:?}",
            other
        ))),
    }
}
