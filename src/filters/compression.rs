// This file is part of tilepipe released under the MIT license.
// Copyright (c) 2023 TileDB, Inc.

use crate::buffer::{push_scalar, ByteReader, FilterBuffer};
use crate::datatype::DataType;
use crate::error::{FilterError, Result};
use crate::filters::compressors::{
    Bzip2Compressor, Compressor, DeltaCompressor, DictionaryCompressor,
    DoubleDeltaCompressor, GzipCompressor, Lz4Compressor, RleCompressor,
    ZstdCompressor,
};
use crate::filters::noop::NoOpFilter;
use crate::filters::{
    pass_through, unsupported_option, Filter, FilterOption, FilterType,
    ForwardContext, OptionValue, ReverseContext,
};
use crate::storage::FilterConfig;

/// Format version at which run-length encoding of var-length strings
/// consumes the offsets tile; dictionary encoding followed one version
/// later.
pub const STRING_RLE_VERSION: u32 = 12;
pub const STRING_DICTIONARY_VERSION: u32 = 13;

/// A compression filter wrapping one of the block codecs.
///
/// Every input part, metadata parts included, is compressed independently.
/// The forward metadata is:
///   `u32 num_metadata_parts; u32 num_data_parts;`
///   then per part `u32 original_len; u32 compressed_len`.
/// The forward output data holds the concatenated encoded parts, metadata
/// parts first.
///
/// The delta codecs view their input through an optional reinterpret
/// datatype. On var-length string input at sufficiently recent format
/// versions, RLE and dictionary encode values and offsets jointly and the
/// offsets tile is not filtered separately.
#[derive(Clone, Copy, Debug)]
pub struct CompressionFilter {
    kind: FilterType,
    level: i32,
    reinterpret: DataType,
}

impl CompressionFilter {
    pub fn new(kind: FilterType, level: i32) -> Self {
        CompressionFilter {
            kind,
            level,
            reinterpret: DataType::Any,
        }
    }

    pub fn with_reinterpret(mut self, reinterpret: DataType) -> Self {
        self.reinterpret = reinterpret;
        self
    }

    pub fn kind(&self) -> FilterType {
        self.kind
    }

    pub(crate) fn try_from_config(
        config: &FilterConfig,
    ) -> Result<Box<dyn Filter>> {
        match config {
            FilterConfig::Compression {
                compressor_type: FilterType::NoOp,
                ..
            } => Ok(Box::new(NoOpFilter)),
            FilterConfig::Compression {
                compressor_type,
                compression_level,
                reinterpret_type,
            } => Ok(Box::new(
                CompressionFilter::new(*compressor_type, *compression_level)
                    .with_reinterpret(DataType::from(*reinterpret_type)),
            )),
            other => Err(FilterError::InvalidArgument(format!(
                "invalid config {:?} for compression filter",
                other
            ))),
        }
    }

    fn is_delta_kind(&self) -> bool {
        matches!(self.kind, FilterType::Delta | FilterType::DoubleDelta)
    }

    fn has_reinterpret(&self) -> bool {
        !matches!(self.reinterpret, DataType::Any | DataType::Invalid)
    }

    /// The element type the codec views bytes as for this input datatype.
    fn resolved_datatype(&self, input: DataType) -> DataType {
        if self.is_delta_kind() && self.has_reinterpret() {
            self.reinterpret
        } else {
            input
        }
    }

    fn make_codec(&self) -> Result<Box<dyn Compressor>> {
        Ok(match self.kind {
            FilterType::GZip => Box::new(GzipCompressor::new(self.level)),
            FilterType::Zstd => Box::new(ZstdCompressor::new(self.level)),
            FilterType::LZ4 => Box::new(Lz4Compressor::new(self.level)),
            FilterType::BZip2 => Box::new(Bzip2Compressor::new(self.level)),
            FilterType::Rle => Box::new(RleCompressor),
            FilterType::Dictionary => Box::new(DictionaryCompressor),
            FilterType::Delta => Box::new(DeltaCompressor),
            FilterType::DoubleDelta => Box::new(DoubleDeltaCompressor),
            other => {
                return Err(FilterError::InvalidArgument(format!(
                    "{:?} is not a compression codec",
                    other
                )))
            }
        })
    }

    /// Whether this stage encodes values and offsets jointly.
    fn joint_strings(
        &self,
        datatype: DataType,
        format_version: u32,
        has_offsets: bool,
    ) -> bool {
        has_offsets
            && datatype.is_string()
            && ((self.kind == FilterType::Rle
                && format_version >= STRING_RLE_VERSION)
                || (self.kind == FilterType::Dictionary
                    && format_version >= STRING_DICTIONARY_VERSION))
    }
}

impl Filter for CompressionFilter {
    fn filter_type(&self) -> FilterType {
        self.kind
    }

    fn accepts_input_datatype(&self, datatype: DataType) -> bool {
        if self.is_delta_kind() {
            let viewed = self.resolved_datatype(datatype);
            return !viewed.is_float() && viewed.size() > 0;
        }
        true
    }

    fn output_datatype(&self, input: DataType) -> DataType {
        if self.is_delta_kind() && self.has_reinterpret() {
            self.reinterpret
        } else {
            input
        }
    }

    fn set_option(
        &mut self,
        option: FilterOption,
        value: OptionValue,
    ) -> Result<()> {
        match option {
            FilterOption::CompressionLevel => {
                self.level = value.as_i32()?;
                Ok(())
            }
            FilterOption::CompressionReinterpretDatatype => {
                let datatype = value.as_datatype()?;
                if matches!(datatype, DataType::Invalid) {
                    return Err(FilterError::InvalidOption(
                        "cannot reinterpret as an invalid datatype"
                            .to_string(),
                    ));
                }
                self.reinterpret = datatype;
                Ok(())
            }
            other => Err(unsupported_option(self.filter_type(), other)),
        }
    }

    fn get_option(&self, option: FilterOption) -> Result<OptionValue> {
        match option {
            FilterOption::CompressionLevel => {
                Ok(OptionValue::Int32(self.level))
            }
            FilterOption::CompressionReinterpretDatatype => {
                Ok(OptionValue::Datatype(self.reinterpret))
            }
            other => Err(unsupported_option(self.filter_type(), other)),
        }
    }

    fn clone_dyn(&self) -> Box<dyn Filter> {
        Box::new(*self)
    }

    fn serial_config(&self) -> FilterConfig {
        FilterConfig::Compression {
            compressor_type: self.kind,
            compression_level: self.level,
            reinterpret_type: self.reinterpret as u8,
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
        if matches!(self.kind, FilterType::NoOp) {
            return pass_through(input_metadata, input, output_metadata, output);
        }

        if self.joint_strings(
            ctx.datatype,
            ctx.format_version,
            ctx.offsets.is_some(),
        ) {
            let offsets = ctx.offsets.as_deref().ok_or_else(|| {
                FilterError::InvalidArgument(
                    "joint string encoding requires an offsets tile"
                        .to_string(),
                )
            })?;
            if input_metadata.size() > 0 {
                return Err(FilterError::InvalidArgument(
                    "joint string encoding must be the first pipeline stage"
                        .to_string(),
                ));
            }
            let values = input.to_vec();
            let stream = match self.kind {
                FilterType::Rle => string_rle_encode(&values, offsets)?,
                _ => string_dictionary_encode(&values, offsets)?,
            };
            write_part_metadata(
                output_metadata,
                &[],
                &[(values.len() as u32, stream.len() as u32)],
            )?;
            output.append_data(stream)?;
            return Ok(());
        }

        let codec = self.make_codec()?;
        let datatype = self.resolved_datatype(ctx.datatype);

        let metadata_parts: Vec<Vec<u8>> = input_metadata
            .parts()
            .iter()
            .map(|part| codec.compress(datatype, part))
            .collect::<Result<_>>()?;
        let metadata_sizes: Vec<(u32, u32)> = input_metadata
            .parts()
            .iter()
            .zip(&metadata_parts)
            .map(|(orig, comp)| (orig.len() as u32, comp.len() as u32))
            .collect();

        let data_parts: Vec<Vec<u8>> = input
            .parts()
            .iter()
            .map(|part| codec.compress(datatype, part))
            .collect::<Result<_>>()?;
        let data_sizes: Vec<(u32, u32)> = input
            .parts()
            .iter()
            .zip(&data_parts)
            .map(|(orig, comp)| (orig.len() as u32, comp.len() as u32))
            .collect();

        write_part_metadata(output_metadata, &metadata_sizes, &data_sizes)?;
        for part in metadata_parts.into_iter().chain(data_parts) {
            output.append_data(part)?;
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
        if matches!(self.kind, FilterType::NoOp) {
            return pass_through(input_metadata, input, output_metadata, output);
        }

        let num_metadata_parts: u32 = input_metadata.read_scalar()?;
        let num_data_parts: u32 = input_metadata.read_scalar()?;
        let total = u64::from(num_metadata_parts) + u64::from(num_data_parts);
        let mut sizes = Vec::new();
        for _ in 0..total {
            let original: u32 = input_metadata.read_scalar()?;
            let compressed: u32 = input_metadata.read_scalar()?;
            sizes.push((original, compressed));
        }
        let (metadata_sizes, data_sizes) =
            sizes.split_at(num_metadata_parts as usize);

        if self.joint_strings(
            ctx.datatype,
            ctx.format_version,
            ctx.offsets.is_some(),
        ) {
            let [(original, compressed)] = data_sizes else {
                return Err(FilterError::FormatCorrupt(
                    "joint string stream must be a single part".to_string(),
                ));
            };
            let mut stream = vec![0u8; *compressed as usize];
            input.read_exact(&mut stream)?;
            let (values, offsets) = match self.kind {
                FilterType::Rle => string_rle_decode(&stream)?,
                _ => string_dictionary_decode(&stream)?,
            };
            if values.len() != *original as usize {
                return Err(FilterError::FormatCorrupt(format!(
                    "joint string stream decoded to {} bytes, expected {}",
                    values.len(),
                    original
                )));
            }
            if let Some(out_offsets) = ctx.offsets.as_mut() {
                **out_offsets = offsets;
            }
            output.prepend_buffer(values.len())?;
            output.write(&values)?;
            return Ok(());
        }

        let codec = self.make_codec()?;
        let datatype = self.resolved_datatype(ctx.datatype);

        let metadata_total: usize =
            metadata_sizes.iter().map(|(o, _)| *o as usize).sum();
        output_metadata.prepend_buffer(metadata_total)?;
        for (original, compressed) in metadata_sizes {
            let plain =
                decompress_part(&*codec, datatype, input, *original, *compressed)?;
            output_metadata.write(&plain)?;
        }

        let data_total: usize =
            data_sizes.iter().map(|(o, _)| *o as usize).sum();
        output.prepend_buffer(data_total)?;
        for (original, compressed) in data_sizes {
            let plain =
                decompress_part(&*codec, datatype, input, *original, *compressed)?;
            output.write(&plain)?;
        }
        Ok(())
    }
}

fn write_part_metadata(
    output_metadata: &mut FilterBuffer<'_>,
    metadata_sizes: &[(u32, u32)],
    data_sizes: &[(u32, u32)],
) -> Result<()> {
    let num_parts = metadata_sizes.len() + data_sizes.len();
    output_metadata.prepend_buffer(8 + num_parts * 8)?;
    output_metadata.write_scalar(metadata_sizes.len() as u32)?;
    output_metadata.write_scalar(data_sizes.len() as u32)?;
    for (original, compressed) in metadata_sizes.iter().chain(data_sizes) {
        output_metadata.write_scalar(*original)?;
        output_metadata.write_scalar(*compressed)?;
    }
    Ok(())
}

fn decompress_part(
    codec: &dyn Compressor,
    datatype: DataType,
    input: &mut FilterBuffer<'_>,
    original: u32,
    compressed: u32,
) -> Result<Vec<u8>> {
    let mut coded = vec![0u8; compressed as usize];
    input.read_exact(&mut coded)?;
    let mut plain = vec![0u8; original as usize];
    codec.decompress(datatype, &coded, &mut plain)?;
    Ok(plain)
}

/// Byte ranges of each cell of a var-length tile.
fn string_bounds(values: &[u8], offsets: &[u64]) -> Result<Vec<(usize, usize)>> {
    let mut bounds = Vec::with_capacity(offsets.len());
    for (index, start) in offsets.iter().enumerate() {
        let end = offsets
            .get(index + 1)
            .copied()
            .unwrap_or(values.len() as u64);
        if *start > end || end > values.len() as u64 {
            return Err(FilterError::InvalidArgument(
                "offsets tile does not describe the values tile".to_string(),
            ));
        }
        bounds.push((*start as usize, end as usize));
    }
    Ok(bounds)
}

/// Run-length encoding of whole strings:
/// `u64 num_strings; u64 num_runs;` then per run
/// `u32 length; u32 count; bytes`.
fn string_rle_encode(values: &[u8], offsets: &[u64]) -> Result<Vec<u8>> {
    let bounds = string_bounds(values, offsets)?;
    let mut runs: Vec<(&[u8], u32)> = Vec::new();
    for (start, end) in bounds {
        let cell = &values[start..end];
        match runs.last_mut() {
            Some((value, count)) if *value == cell && *count < u32::MAX => {
                *count += 1
            }
            _ => runs.push((cell, 1)),
        }
    }

    let mut output = Vec::new();
    push_scalar(&mut output, offsets.len() as u64);
    push_scalar(&mut output, runs.len() as u64);
    for (value, count) in runs {
        push_scalar(&mut output, value.len() as u32);
        push_scalar(&mut output, count);
        output.extend_from_slice(value);
    }
    Ok(output)
}

fn string_rle_decode(stream: &[u8]) -> Result<(Vec<u8>, Vec<u64>)> {
    let mut reader = ByteReader::new(stream);
    let num_strings = reader.read::<u64>()?;
    let num_runs = reader.read::<u64>()?;

    let mut values = Vec::new();
    let mut offsets = Vec::new();
    for _ in 0..num_runs {
        let length = reader.read::<u32>()? as usize;
        let count = reader.read::<u32>()?;
        let cell = reader.read_bytes(length)?;
        for _ in 0..count {
            offsets.push(values.len() as u64);
            values.extend_from_slice(cell);
        }
    }
    if offsets.len() as u64 != num_strings {
        return Err(FilterError::FormatCorrupt(format!(
            "string runs decode to {} cells, expected {}",
            offsets.len(),
            num_strings
        )));
    }
    Ok((values, offsets))
}

/// Dictionary encoding of whole strings:
/// `u64 num_strings; u32 num_entries;` then per entry
/// `u32 length; bytes`, then one `u32` id per string.
fn string_dictionary_encode(values: &[u8], offsets: &[u64]) -> Result<Vec<u8>> {
    let bounds = string_bounds(values, offsets)?;
    let mut entries: Vec<&[u8]> = Vec::new();
    let mut ids = Vec::with_capacity(bounds.len());
    let mut seen = std::collections::HashMap::new();
    for (start, end) in bounds {
        let cell = &values[start..end];
        let next_id = entries.len() as u32;
        let id = *seen.entry(cell).or_insert_with(|| {
            entries.push(cell);
            next_id
        });
        ids.push(id);
    }

    let mut output = Vec::new();
    push_scalar(&mut output, ids.len() as u64);
    push_scalar(&mut output, entries.len() as u32);
    for entry in entries {
        push_scalar(&mut output, entry.len() as u32);
        output.extend_from_slice(entry);
    }
    for id in ids {
        push_scalar(&mut output, id);
    }
    Ok(output)
}

fn string_dictionary_decode(stream: &[u8]) -> Result<(Vec<u8>, Vec<u64>)> {
    let mut reader = ByteReader::new(stream);
    let num_strings = reader.read::<u64>()?;
    let num_entries = reader.read::<u32>()?;

    let mut entries = Vec::new();
    for _ in 0..num_entries {
        let length = reader.read::<u32>()? as usize;
        entries.push(reader.read_bytes(length)?);
    }

    let mut values = Vec::new();
    let mut offsets = Vec::new();
    for _ in 0..num_strings {
        let id = reader.read::<u32>()? as usize;
        let entry = entries.get(id).ok_or_else(|| {
            FilterError::FormatCorrupt(format!(
                "string id {} out of range of {} entries",
                id,
                entries.len()
            ))
        })?;
        offsets.push(values.len() as u64);
        values.extend_from_slice(entry);
    }
    Ok((values, offsets))
}
