// This file is part of tilepipe released under the MIT license.
// Copyright (c) 2023 TileDB, Inc.

use crate::buffer::FilterBuffer;
use crate::config::Config;
use crate::datatype::DataType;
use crate::error::{FilterError, Result};
use crate::storage;

pub mod bit_width_reduction;
pub mod bitshuffle;
pub mod byteshuffle;
pub mod checksum;
pub mod compression;
pub mod compressors;
pub mod encryption_aes256gcm;
pub mod noop;
pub mod pipeline;
pub mod positive_delta;
pub mod scale_float;
pub mod webp;
pub mod xor;

pub use pipeline::FilterPipeline;

/// The stable filter type registry. Tags are persisted and must never be
/// renumbered; any tag of 20 or above is invalid.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FilterType {
    #[default]
    NoOp = 0,
    GZip = 1,
    Zstd = 2,
    LZ4 = 3,
    Rle = 4,
    BZip2 = 5,
    DoubleDelta = 6,
    BitWidthReduction = 7,
    BitShuffle = 8,
    ByteShuffle = 9,
    PositiveDelta = 10,
    Aes256Gcm = 11,
    ChecksumMD5 = 12,
    ChecksumSHA256 = 13,
    Dictionary = 14,
    ScaleFloat = 15,
    Xor = 16,
    Deprecated = 17,
    WebP = 18,
    Delta = 19,
    Invalid = 255,
}

impl From<u8> for FilterType {
    fn from(orig: u8) -> Self {
        match orig {
            0 => FilterType::NoOp,
            1 => FilterType::GZip,
            2 => FilterType::Zstd,
            3 => FilterType::LZ4,
            4 => FilterType::Rle,
            5 => FilterType::BZip2,
            6 => FilterType::DoubleDelta,
            7 => FilterType::BitWidthReduction,
            8 => FilterType::BitShuffle,
            9 => FilterType::ByteShuffle,
            10 => FilterType::PositiveDelta,
            11 => FilterType::Aes256Gcm,
            12 => FilterType::ChecksumMD5,
            13 => FilterType::ChecksumSHA256,
            14 => FilterType::Dictionary,
            15 => FilterType::ScaleFloat,
            16 => FilterType::Xor,
            17 => FilterType::Deprecated,
            18 => FilterType::WebP,
            19 => FilterType::Delta,
            _ => FilterType::Invalid,
        }
    }
}

impl FilterType {
    /// True for tags that name a compressor codec wrapped by the
    /// compression filter.
    pub fn is_compression(&self) -> bool {
        matches!(
            self,
            FilterType::GZip
                | FilterType::Zstd
                | FilterType::LZ4
                | FilterType::Rle
                | FilterType::BZip2
                | FilterType::Delta
                | FilterType::DoubleDelta
                | FilterType::Dictionary
        )
    }
}

/// The closed set of options a filter may carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterOption {
    BitWidthMaxWindow,
    PositiveDeltaMaxWindow,
    CompressionLevel,
    CompressionReinterpretDatatype,
    ScaleFloatFactor,
    ScaleFloatOffset,
    ScaleFloatByteWidth,
    WebpQuality,
    WebpInputFormat,
    WebpLossless,
}

/// A typed option value. Get and set are total over
/// `(FilterOption, OptionValue)`; mismatches report `InvalidOption`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OptionValue {
    Uint8(u8),
    Uint32(u32),
    Int32(i32),
    Uint64(u64),
    Float32(f32),
    Float64(f64),
    Datatype(DataType),
}

impl OptionValue {
    pub fn as_u8(&self) -> Result<u8> {
        match self {
            OptionValue::Uint8(v) => Ok(*v),
            other => Err(type_mismatch("uint8", other)),
        }
    }

    pub fn as_u32(&self) -> Result<u32> {
        match self {
            OptionValue::Uint32(v) => Ok(*v),
            other => Err(type_mismatch("uint32", other)),
        }
    }

    pub fn as_i32(&self) -> Result<i32> {
        match self {
            OptionValue::Int32(v) => Ok(*v),
            other => Err(type_mismatch("int32", other)),
        }
    }

    pub fn as_u64(&self) -> Result<u64> {
        match self {
            OptionValue::Uint64(v) => Ok(*v),
            other => Err(type_mismatch("uint64", other)),
        }
    }

    pub fn as_f32(&self) -> Result<f32> {
        match self {
            OptionValue::Float32(v) => Ok(*v),
            other => Err(type_mismatch("float32", other)),
        }
    }

    pub fn as_f64(&self) -> Result<f64> {
        match self {
            OptionValue::Float64(v) => Ok(*v),
            other => Err(type_mismatch("float64", other)),
        }
    }

    pub fn as_datatype(&self) -> Result<DataType> {
        match self {
            OptionValue::Datatype(v) => Ok(*v),
            other => Err(type_mismatch("datatype", other)),
        }
    }
}

fn type_mismatch(expected: &str, got: &OptionValue) -> FilterError {
    FilterError::InvalidOption(format!(
        "expected a {} value, got {:?}",
        expected, got
    ))
}

pub(crate) fn unsupported_option(
    ftype: FilterType,
    option: FilterOption,
) -> FilterError {
    FilterError::InvalidOption(format!(
        "filter {:?} does not support option {:?}",
        ftype, option
    ))
}

/// Per-stage context for the forward direction. The datatype is the input
/// datatype of this stage after propagation through its predecessors; the
/// offsets are the cell offsets of a var-sized tile, present only for
/// filters that encode values and offsets jointly.
pub struct ForwardContext<'c> {
    pub datatype: DataType,
    pub format_version: u32,
    pub offsets: Option<&'c mut Vec<u64>>,
}

/// Per-stage context for the reverse direction.
pub struct ReverseContext<'c> {
    pub datatype: DataType,
    pub format_version: u32,
    pub offsets: Option<&'c mut Vec<u64>>,
    pub config: &'c Config,
}

/// A filter processes one chunk's bytes, forward during writes and in
/// reverse during reads.
///
/// Forward consumes `input` and produces `output`, optionally emitting
/// side-band bytes into `output_metadata`; metadata received from the
/// predecessor stage is forwarded by appending a view and a filter's own
/// bytes are prepended in front of it. Reverse exactly inverts forward
/// given matching metadata. Input buffers are never modified; a filter that
/// cannot apply to its input datatype appends views of input to output
/// unchanged and emits no metadata.
pub trait Filter: Send + Sync {
    fn filter_type(&self) -> FilterType;

    /// Whether this filter can accept the given input datatype.
    fn accepts_input_datatype(&self, _datatype: DataType) -> bool {
        true
    }

    /// The datatype this filter's successor will see. Defaults to the
    /// input datatype for data-preserving filters.
    fn output_datatype(&self, input: DataType) -> DataType {
        input
    }

    fn set_option(
        &mut self,
        option: FilterOption,
        value: OptionValue,
    ) -> Result<()> {
        let _ = value;
        Err(unsupported_option(self.filter_type(), option))
    }

    fn get_option(&self, option: FilterOption) -> Result<OptionValue> {
        Err(unsupported_option(self.filter_type(), option))
    }

    fn clone_dyn(&self) -> Box<dyn Filter>;

    /// The filter's serialized option block.
    fn serial_config(&self) -> storage::FilterConfig {
        storage::FilterConfig::None
    }

    fn run_forward<'a>(
        &self,
        ctx: &mut ForwardContext<'_>,
        input_metadata: &mut FilterBuffer<'a>,
        input: &mut FilterBuffer<'a>,
        output_metadata: &mut FilterBuffer<'a>,
        output: &mut FilterBuffer<'a>,
    ) -> Result<()>;

    fn run_reverse<'a>(
        &self,
        ctx: &mut ReverseContext<'_>,
        input_metadata: &mut FilterBuffer<'a>,
        input: &mut FilterBuffer<'a>,
        output_metadata: &mut FilterBuffer<'a>,
        output: &mut FilterBuffer<'a>,
    ) -> Result<()>;
}

impl Clone for Box<dyn Filter> {
    fn clone(&self) -> Self {
        self.clone_dyn()
    }
}

/// Forwards input data and metadata to the output unchanged, as views.
/// The unsupported-datatype escape hatch every conditional filter shares.
pub(crate) fn pass_through<'a>(
    input_metadata: &mut FilterBuffer<'a>,
    input: &mut FilterBuffer<'a>,
    output_metadata: &mut FilterBuffer<'a>,
    output: &mut FilterBuffer<'a>,
) -> Result<()> {
    output.append_view(input)?;
    output_metadata.append_view(input_metadata)?;
    Ok(())
}

/// Appends a view over the unconsumed remainder of the input metadata to
/// the output metadata. Every reverse stage ends with this so its successor
/// sees only the metadata it produced.
pub(crate) fn forward_remaining_metadata<'a>(
    input_metadata: &mut FilterBuffer<'a>,
    output_metadata: &mut FilterBuffer<'a>,
) -> Result<()> {
    let offset = input_metadata.offset();
    output_metadata.append_view_range(
        input_metadata,
        offset,
        input_metadata.size() - offset,
    )
}


/// Builds a runtime filter from a deserialized pipeline entry.
///
/// A compression entry whose codec tag is `NoOp` was written by older
/// libraries in place of a no-op filter and is constructed as one.
pub fn try_from_storage(entry: &storage::Filter) -> Result<Box<dyn Filter>> {
    match entry.filter_type() {
        FilterType::NoOp => Ok(Box::new(noop::NoOpFilter::default())),
        ftype if ftype.is_compression() => {
            compression::CompressionFilter::try_from_config(entry.config())
        }
        FilterType::BitWidthReduction => Ok(Box::new(
            bit_width_reduction::BitWidthReductionFilter::try_from_config(
                entry.config(),
            )?,
        )),
        FilterType::BitShuffle => {
            Ok(Box::new(bitshuffle::BitShuffleFilter::default()))
        }
        FilterType::ByteShuffle => {
            Ok(Box::new(byteshuffle::ByteShuffleFilter::default()))
        }
        FilterType::PositiveDelta => Ok(Box::new(
            positive_delta::PositiveDeltaFilter::try_from_config(
                entry.config(),
            )?,
        )),
        FilterType::Aes256Gcm => Ok(Box::new(
            encryption_aes256gcm::Aes256GcmFilter::default(),
        )),
        FilterType::ChecksumMD5 => {
            Ok(Box::new(checksum::ChecksumMd5Filter::default()))
        }
        FilterType::ChecksumSHA256 => {
            Ok(Box::new(checksum::ChecksumSha256Filter::default()))
        }
        FilterType::ScaleFloat => Ok(Box::new(
            scale_float::ScaleFloatFilter::try_from_config(entry.config())?,
        )),
        FilterType::Xor => Ok(Box::new(xor::XorFilter::default())),
        FilterType::WebP => Ok(Box::new(webp::WebpFilter::try_from_config(
            entry.config(),
        )?)),
        ftype => Err(FilterError::UnknownFilter(ftype as u8)),
    }
}
