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

/// Colorspace layout of the raw pixel rows fed to the WebP filter.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WebpInputFormat {
    #[default]
    None = 0,
    Rgb = 1,
    Bgr = 2,
    Rgba = 3,
    Bgra = 4,
}

impl WebpInputFormat {
    pub fn pixel_depth(&self) -> usize {
        match self {
            WebpInputFormat::None => 0,
            WebpInputFormat::Rgb | WebpInputFormat::Bgr => 3,
            WebpInputFormat::Rgba | WebpInputFormat::Bgra => 4,
        }
    }

    fn has_alpha(&self) -> bool {
        matches!(self, WebpInputFormat::Rgba | WebpInputFormat::Bgra)
    }

    fn swaps_channels(&self) -> bool {
        matches!(self, WebpInputFormat::Bgr | WebpInputFormat::Bgra)
    }

    fn try_from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => WebpInputFormat::None,
            1 => WebpInputFormat::Rgb,
            2 => WebpInputFormat::Bgr,
            3 => WebpInputFormat::Rgba,
            4 => WebpInputFormat::Bgra,
            other => {
                return Err(FilterError::InvalidOption(format!(
                    "unknown WebP input format {}",
                    other
                )))
            }
        })
    }
}

/// Lossy or lossless WebP coding of two-dimensional uint8 imagery.
///
/// The filter requires the non-chunked mode: its input is the whole tile,
/// `y_extent` rows of `x_extent` bytes, with the extents captured from the
/// array schema. On write the raw colorspace rows are encoded into one
/// WebP payload; on read the payload is decoded and channels are swapped
/// back for the BGR orderings.
#[derive(Clone, Copy, Debug)]
pub struct WebpFilter {
    quality: f32,
    format: WebpInputFormat,
    lossless: bool,
    y_extent: u16,
    x_extent: u16,
}

impl Default for WebpFilter {
    fn default() -> Self {
        WebpFilter {
            quality: 100.0,
            format: WebpInputFormat::None,
            lossless: false,
            y_extent: 0,
            x_extent: 0,
        }
    }
}

impl WebpFilter {
    pub fn new(
        quality: f32,
        format: WebpInputFormat,
        lossless: bool,
        y_extent: u16,
        x_extent: u16,
    ) -> Result<Self> {
        let mut filter = WebpFilter {
            y_extent,
            x_extent,
            ..WebpFilter::default()
        };
        filter.set_option(
            FilterOption::WebpQuality,
            OptionValue::Float32(quality),
        )?;
        filter.set_option(
            FilterOption::WebpInputFormat,
            OptionValue::Uint8(format as u8),
        )?;
        filter.set_option(
            FilterOption::WebpLossless,
            OptionValue::Uint8(u8::from(lossless)),
        )?;
        Ok(filter)
    }

    /// Captures the row count and row stride from the schema's extents.
    pub fn set_extents(&mut self, y_extent: u16, x_extent: u16) {
        self.y_extent = y_extent;
        self.x_extent = x_extent;
    }

    pub(crate) fn try_from_config(config: &FilterConfig) -> Result<Self> {
        match config {
            FilterConfig::WebP {
                quality,
                format,
                lossless,
                y_extent,
                x_extent,
                padding: _,
            } => WebpFilter::new(
                *quality,
                WebpInputFormat::try_from_tag(*format)?,
                *lossless != 0,
                *y_extent,
                *x_extent,
            ),
            other => Err(FilterError::InvalidArgument(format!(
                "invalid config {:?} for WebP filter",
                other
            ))),
        }
    }

    fn image_shape(&self) -> Result<(u32, u32, usize)> {
        let depth = self.format.pixel_depth();
        if depth == 0 {
            return Err(FilterError::InvalidArgument(
                "WebP input format is not configured".to_string(),
            ));
        }
        if self.y_extent == 0
            || self.x_extent == 0
            || usize::from(self.x_extent) % depth != 0
        {
            return Err(FilterError::InvalidArgument(format!(
                "WebP extents {}x{} do not describe {}-byte pixel rows",
                self.y_extent, self.x_extent, depth
            )));
        }
        let width = u32::from(self.x_extent) / depth as u32;
        Ok((width, u32::from(self.y_extent), depth))
    }
}

impl Filter for WebpFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::WebP
    }

    fn accepts_input_datatype(&self, datatype: DataType) -> bool {
        matches!(datatype, DataType::Uint8)
    }

    fn set_option(
        &mut self,
        option: FilterOption,
        value: OptionValue,
    ) -> Result<()> {
        match option {
            FilterOption::WebpQuality => {
                let quality = value.as_f32()?;
                if !(0.0..=100.0).contains(&quality) {
                    return Err(FilterError::InvalidOption(format!(
                        "WebP quality {} is not in 0..=100",
                        quality
                    )));
                }
                self.quality = quality;
                Ok(())
            }
            FilterOption::WebpInputFormat => {
                self.format = WebpInputFormat::try_from_tag(value.as_u8()?)?;
                Ok(())
            }
            FilterOption::WebpLossless => {
                let lossless = value.as_u8()?;
                if lossless > 1 {
                    return Err(FilterError::InvalidOption(format!(
                        "WebP lossless flag {} is not 0 or 1",
                        lossless
                    )));
                }
                self.lossless = lossless == 1;
                Ok(())
            }
            other => Err(unsupported_option(self.filter_type(), other)),
        }
    }

    fn get_option(&self, option: FilterOption) -> Result<OptionValue> {
        match option {
            FilterOption::WebpQuality => {
                Ok(OptionValue::Float32(self.quality))
            }
            FilterOption::WebpInputFormat => {
                Ok(OptionValue::Uint8(self.format as u8))
            }
            FilterOption::WebpLossless => {
                Ok(OptionValue::Uint8(u8::from(self.lossless)))
            }
            other => Err(unsupported_option(self.filter_type(), other)),
        }
    }

    fn clone_dyn(&self) -> Box<dyn Filter> {
        Box::new(*self)
    }

    fn serial_config(&self) -> FilterConfig {
        FilterConfig::WebP {
            quality: self.quality,
            format: self.format as u8,
            lossless: u8::from(self.lossless),
            y_extent: self.y_extent,
            x_extent: self.x_extent,
            padding: 0,
        }
    }

    fn run_forward<'a>(
        &self,
        _ctx: &mut ForwardContext<'_>,
        input_metadata: &mut FilterBuffer<'a>,
        input: &mut FilterBuffer<'a>,
        output_metadata: &mut FilterBuffer<'a>,
        output: &mut FilterBuffer<'a>,
    ) -> Result<()> {
        let (width, height, depth) = self.image_shape()?;
        let expected = width as usize * height as usize * depth;
        if input.size() != expected {
            return Err(FilterError::InvalidArgument(format!(
                "input of {} bytes does not match a {}x{} image of depth {}",
                input.size(),
                width,
                height,
                depth
            )));
        }

        let mut pixels = input.to_vec();
        if self.format.swaps_channels() {
            swap_channels(&mut pixels, depth);
        }

        let encoder = if self.format.has_alpha() {
            webp::Encoder::from_rgba(&pixels, width, height)
        } else {
            webp::Encoder::from_rgb(&pixels, width, height)
        };
        let payload = if self.lossless {
            encoder.encode_lossless()
        } else {
            encoder.encode(self.quality)
        };

        output.append_data(payload.to_vec())?;
        output_metadata.append_view(input_metadata)?;
        Ok(())
    }

    fn run_reverse<'a>(
        &self,
        _ctx: &mut ReverseContext<'_>,
        input_metadata: &mut FilterBuffer<'a>,
        input: &mut FilterBuffer<'a>,
        output_metadata: &mut FilterBuffer<'a>,
        output: &mut FilterBuffer<'a>,
    ) -> Result<()> {
        let (width, height, depth) = self.image_shape()?;

        let payload = input.to_vec();
        let image = webp::Decoder::new(&payload).decode().ok_or_else(|| {
            FilterError::codec("webp", "payload did not decode")
        })?;
        if image.width() != width || image.height() != height {
            return Err(FilterError::codec(
                "webp",
                format!(
                    "decoded a {}x{} image, expected {}x{}",
                    image.width(),
                    image.height(),
                    width,
                    height
                ),
            ));
        }

        let mut pixels = image.to_vec();
        let expected = width as usize * height as usize * depth;
        if pixels.len() != expected {
            return Err(FilterError::codec(
                "webp",
                format!(
                    "decoded {} bytes, expected {}",
                    pixels.len(),
                    expected
                ),
            ));
        }
        if self.format.swaps_channels() {
            swap_channels(&mut pixels, depth);
        }

        output.prepend_buffer(pixels.len())?;
        output.write(&pixels)?;
        forward_remaining_metadata(input_metadata, output_metadata)
    }
}

/// Swaps the first and third channel of every pixel, converting between
/// the RGB and BGR families in either direction.
fn swap_channels(pixels: &mut [u8], depth: usize) {
    for pixel in pixels.chunks_exact_mut(depth) {
        pixel.swap(0, 2);
    }
}
