// This file is part of tilepipe released under the MIT license.
// Copyright (c) 2023 TileDB, Inc.

use std::io::Cursor;

use binrw::{BinRead, BinResult, BinWrite, Endian};

use crate::datatype::DataType;
use crate::error::{FilterError, Result};
use crate::filters::{self, FilterPipeline, FilterType};

fn is_bit_width_reduction_filter(ftype: FilterType) -> bool {
    matches!(ftype, FilterType::BitWidthReduction)
}

fn is_positive_delta_filter(ftype: FilterType) -> bool {
    matches!(ftype, FilterType::PositiveDelta)
}

fn is_scale_float_filter(ftype: FilterType) -> bool {
    matches!(ftype, FilterType::ScaleFloat)
}

fn is_webp_filter(ftype: FilterType) -> bool {
    matches!(ftype, FilterType::WebP)
}

fn is_no_config_filter(ftype: FilterType) -> bool {
    !(ftype.is_compression()
        || is_bit_width_reduction_filter(ftype)
        || is_positive_delta_filter(ftype)
        || is_scale_float_filter(ftype)
        || is_webp_filter(ftype))
}

/// Whether a serialized compression entry carries the reinterpret datatype
/// byte. Older writers predate the field.
fn has_reinterpret_type(version: u32, filter_type: FilterType) -> bool {
    if version >= 19 && matches!(filter_type, FilterType::Delta) {
        return true;
    }

    if version >= 20 && matches!(filter_type, FilterType::DoubleDelta) {
        return true;
    }

    false
}

/// The per-filter option block as stored on disk.
#[derive(Clone, Debug, Default, BinRead)]
#[br(little)]
#[br(import { version: u32, filter_type: FilterType })]
pub enum FilterConfig {
    #[br(pre_assert(filter_type.is_compression()))]
    Compression {
        #[br(map = |ftype: u8| ftype.into())]
        compressor_type: FilterType,

        compression_level: i32,

        #[br(if(has_reinterpret_type(version, filter_type), DataType::Any as u8))]
        reinterpret_type: u8,
    },
    #[br(pre_assert(is_bit_width_reduction_filter(filter_type)))]
    BitWidthReduction { max_window_size: u32 },
    #[br(pre_assert(is_positive_delta_filter(filter_type)))]
    PositiveDelta { max_window_size: u32 },
    #[br(pre_assert(is_scale_float_filter(filter_type)))]
    ScaleFloat {
        scale: f64,
        offset: f64,
        byte_width: u64,
    },
    #[br(pre_assert(is_webp_filter(filter_type)))]
    WebP {
        quality: f32,
        format: u8,
        lossless: u8,
        y_extent: u16,
        x_extent: u16,
        padding: u16,
    },
    #[default]
    #[br(pre_assert(is_no_config_filter(filter_type)))]
    None,
}

impl FilterConfig {
    /// Serializes this option block for the given on-disk format version.
    fn write_to(
        &self,
        out: &mut Vec<u8>,
        version: u32,
        filter_type: FilterType,
    ) -> BinResult<()> {
        let mut cursor = Cursor::new(&mut *out);
        match self {
            FilterConfig::Compression {
                compressor_type,
                compression_level,
                reinterpret_type,
            } => {
                (*compressor_type as u8).write_le(&mut cursor)?;
                compression_level.write_le(&mut cursor)?;
                if has_reinterpret_type(version, filter_type) {
                    reinterpret_type.write_le(&mut cursor)?;
                }
            }
            FilterConfig::BitWidthReduction { max_window_size }
            | FilterConfig::PositiveDelta { max_window_size } => {
                max_window_size.write_le(&mut cursor)?;
            }
            FilterConfig::ScaleFloat {
                scale,
                offset,
                byte_width,
            } => {
                scale.write_le(&mut cursor)?;
                offset.write_le(&mut cursor)?;
                byte_width.write_le(&mut cursor)?;
            }
            FilterConfig::WebP {
                quality,
                format,
                lossless,
                y_extent,
                x_extent,
                padding,
            } => {
                quality.write_le(&mut cursor)?;
                format.write_le(&mut cursor)?;
                lossless.write_le(&mut cursor)?;
                y_extent.write_le(&mut cursor)?;
                x_extent.write_le(&mut cursor)?;
                padding.write_le(&mut cursor)?;
            }
            FilterConfig::None => {}
        }
        Ok(())
    }
}

/// One serialized pipeline entry: a type tag, the declared length of the
/// option block, and the block itself. Deserialization enforces that the
/// block consumes exactly its declared length.
#[derive(Clone, Debug, Default)]
pub struct Filter {
    filter_type: FilterType,
    config: FilterConfig,
}

impl Filter {
    pub fn new(filter_type: FilterType, config: FilterConfig) -> Self {
        Filter {
            filter_type,
            config,
        }
    }

    pub fn filter_type(&self) -> FilterType {
        self.filter_type
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }
}

fn custom_error(pos: u64, err: FilterError) -> binrw::Error {
    binrw::Error::Custom {
        pos,
        err: Box::new(err),
    }
}

impl BinRead for Filter {
    type Args<'a> = (u32,);

    fn read_options<R: std::io::Read + std::io::Seek>(
        reader: &mut R,
        endian: Endian,
        (version,): Self::Args<'_>,
    ) -> BinResult<Self> {
        let tag_pos = reader.stream_position()?;
        let raw_type = u8::read_options(reader, endian, ())?;
        let filter_type = FilterType::from(raw_type);
        if matches!(filter_type, FilterType::Invalid) {
            return Err(custom_error(
                tag_pos,
                FilterError::UnknownFilter(raw_type),
            ));
        }

        let metadata_len = u32::read_options(reader, endian, ())?;
        let start = reader.stream_position()?;

        // Ancient writers stored a no-op entry with a compressor byte and
        // a level; accept and discard them.
        if matches!(filter_type, FilterType::NoOp) && metadata_len == 5 {
            let _ = u8::read_options(reader, endian, ())?;
            let _ = i32::read_options(reader, endian, ())?;
            return Ok(Filter {
                filter_type,
                config: FilterConfig::None,
            });
        }

        let config = FilterConfig::read_options(
            reader,
            endian,
            binrw::args! { version, filter_type },
        )?;

        let consumed = reader.stream_position()? - start;
        if consumed != metadata_len as u64 {
            return Err(custom_error(
                start,
                FilterError::FormatCorrupt(format!(
                    "filter {:?} consumed {} metadata bytes, declared {}",
                    filter_type, consumed, metadata_len
                )),
            ));
        }

        Ok(Filter {
            filter_type,
            config,
        })
    }
}

impl BinWrite for Filter {
    type Args<'a> = (u32,);

    fn write_options<W: std::io::Write + std::io::Seek>(
        &self,
        writer: &mut W,
        endian: Endian,
        (version,): Self::Args<'_>,
    ) -> BinResult<()> {
        let mut block = Vec::new();
        self.config.write_to(&mut block, version, self.filter_type)?;

        (self.filter_type as u8).write_options(writer, endian, ())?;
        (block.len() as u32).write_options(writer, endian, ())?;
        writer.write_all(&block)?;
        Ok(())
    }
}

/// The serialized form of a whole pipeline.
#[derive(Clone, Debug, Default, BinRead, BinWrite)]
#[brw(little)]
#[br(import(version: u32))]
#[bw(import(version: u32))]
pub struct FilterList {
    max_chunk_size: u32,

    num_filters: u32,

    #[br(count(num_filters))]
    #[br(args { inner: (version,) })]
    #[bw(args_raw = (version,))]
    filters: Vec<Filter>,
}

impl FilterList {
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn max_chunk_size(&self) -> u32 {
        self.max_chunk_size
    }

    /// Captures a runtime pipeline for serialization. A compression filter
    /// wrapping the no-compression codec is recorded as a plain no-op
    /// entry, mirroring how such entries are read back.
    pub fn from_pipeline(pipeline: &FilterPipeline) -> FilterList {
        let filters: Vec<Filter> = pipeline
            .filters()
            .iter()
            .map(|f| {
                let config = f.serial_config();
                match &config {
                    FilterConfig::Compression {
                        compressor_type: FilterType::NoOp,
                        ..
                    } => Filter::new(FilterType::NoOp, FilterConfig::None),
                    _ => Filter::new(f.filter_type(), config),
                }
            })
            .collect();
        FilterList {
            max_chunk_size: pipeline.max_chunk_size(),
            num_filters: filters.len() as u32,
            filters,
        }
    }

    /// Builds the runtime pipeline this serialized form describes.
    pub fn to_pipeline(&self) -> Result<FilterPipeline> {
        let mut built = Vec::with_capacity(self.filters.len());
        for entry in &self.filters {
            built.push(filters::try_from_storage(entry)?);
        }
        Ok(FilterPipeline::new(self.max_chunk_size, built))
    }
}

impl From<binrw::Error> for FilterError {
    fn from(err: binrw::Error) -> Self {
        match err {
            binrw::Error::Custom { err, pos } => {
                match err.downcast::<FilterError>() {
                    Ok(inner) => *inner,
                    Err(_) => FilterError::FormatCorrupt(format!(
                        "deserialization failed at offset {}",
                        pos
                    )),
                }
            }
            other => FilterError::FormatCorrupt(other.to_string()),
        }
    }
}

/// Serializes a pipeline at the given format version.
pub fn serialize_pipeline(
    pipeline: &FilterPipeline,
    version: u32,
) -> Result<Vec<u8>> {
    let list = FilterList::from_pipeline(pipeline);
    let mut cursor = Cursor::new(Vec::new());
    list.write_le_args(&mut cursor, (version,))?;
    Ok(cursor.into_inner())
}

/// Deserializes a pipeline written at the given format version.
pub fn deserialize_pipeline(
    bytes: &[u8],
    version: u32,
) -> Result<FilterPipeline> {
    let mut cursor = Cursor::new(bytes);
    let list = FilterList::read_le_args(&mut cursor, (version,))?;
    list.to_pipeline()
}
