// This file is part of tilepipe released under the MIT license.
// Copyright (c) 2023 TileDB, Inc.

use std::io::Cursor;
use std::ops::Range;

use binrw::{binrw, BinRead, BinWrite};

use crate::buffer::ByteReader;
use crate::config::Config;
use crate::datatype::DataType;
use crate::error::{FilterError, Result};
use crate::filters::FilterPipeline;
use crate::storage;

pub const GENERIC_TILE_HEADER_SIZE: u64 = 34;
pub const CELL_VAR_OFFSET_SIZE: u64 = 8;

/// The unit of filtering on the write path: plain bytes plus the framed
/// filtered buffer the pipeline produces from them.
#[derive(Debug)]
pub struct WriterTile {
    format_version: u32,
    datatype: DataType,
    cell_size: u64,
    original_size: u64,
    data: Vec<u8>,
    filtered: Vec<u8>,
}

impl WriterTile {
    pub fn new(
        format_version: u32,
        datatype: DataType,
        cell_size: u64,
        data: Vec<u8>,
    ) -> Self {
        let original_size = data.len() as u64;
        WriterTile {
            format_version,
            datatype,
            cell_size,
            original_size,
            data,
            filtered: Vec::new(),
        }
    }

    /// An offsets tile for a var-length attribute, holding the given cell
    /// start offsets.
    pub fn offsets(format_version: u32, offsets: &[u64]) -> Self {
        let mut data = Vec::with_capacity(offsets.len() * 8);
        for offset in offsets {
            data.extend_from_slice(&offset.to_le_bytes());
        }
        WriterTile::new(
            format_version,
            DataType::Uint64,
            CELL_VAR_OFFSET_SIZE,
            data,
        )
    }

    pub fn format_version(&self) -> u32 {
        self.format_version
    }

    pub fn datatype(&self) -> DataType {
        self.datatype
    }

    pub fn cell_size(&self) -> u64 {
        self.cell_size
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// The size of the plain data before it was filtered away.
    pub fn original_size(&self) -> u64 {
        self.original_size
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn filtered(&self) -> &[u8] {
        &self.filtered
    }

    /// Interprets the plain bytes as uint64 cell offsets.
    pub fn as_offsets(&self) -> Result<Vec<u64>> {
        if self.data.len() % 8 != 0 {
            return Err(FilterError::InvalidArgument(
                "offsets tile size is not a multiple of eight".to_string(),
            ));
        }
        Ok(self
            .data
            .chunks_exact(8)
            .map(|raw| u64::from_le_bytes(raw.try_into().unwrap_or_default()))
            .collect())
    }

    pub(crate) fn set_filtered(&mut self, filtered: Vec<u8>) {
        self.filtered = filtered;
    }

    pub(crate) fn clear_data(&mut self) {
        self.data.clear();
        self.data.shrink_to_fit();
    }
}

/// The unit of filtering on the read path: framed filtered bytes plus the
/// plain bytes the reverse pipeline reconstructs.
#[derive(Debug)]
pub struct Tile {
    format_version: u32,
    datatype: DataType,
    cell_size: u64,
    data: Vec<u8>,
    filtered: Vec<u8>,
}

impl Tile {
    pub fn from_filtered(
        format_version: u32,
        datatype: DataType,
        cell_size: u64,
        filtered: Vec<u8>,
    ) -> Self {
        Tile {
            format_version,
            datatype,
            cell_size,
            data: Vec::new(),
            filtered,
        }
    }

    /// An empty offsets tile to be reconstructed by a joint string
    /// encoding.
    pub fn empty_offsets(format_version: u32) -> Self {
        Tile::from_filtered(
            format_version,
            DataType::Uint64,
            CELL_VAR_OFFSET_SIZE,
            Vec::new(),
        )
    }

    pub fn format_version(&self) -> u32 {
        self.format_version
    }

    pub fn datatype(&self) -> DataType {
        self.datatype
    }

    pub fn cell_size(&self) -> u64 {
        self.cell_size
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn filtered(&self) -> &[u8] {
        &self.filtered
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub(crate) fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    pub(crate) fn set_data_from_offsets(&mut self, offsets: &[u64]) {
        let mut data = Vec::with_capacity(offsets.len() * 8);
        for offset in offsets {
            data.extend_from_slice(&offset.to_le_bytes());
        }
        self.data = data;
    }

    pub(crate) fn clear_filtered(&mut self) {
        self.filtered.clear();
        self.filtered.shrink_to_fit();
    }
}

/// One chunk's spans within a framed filtered buffer.
#[derive(Clone, Debug)]
pub struct FilteredChunk {
    original_size: u32,
    metadata_range: Range<usize>,
    data_range: Range<usize>,
}

impl FilteredChunk {
    pub fn original_size(&self) -> u32 {
        self.original_size
    }

    pub fn metadata_range(&self) -> Range<usize> {
        self.metadata_range.clone()
    }

    pub fn data_range(&self) -> Range<usize> {
        self.data_range.clone()
    }
}

/// The chunk table of a framed filtered buffer: every chunk's spans plus
/// its target offset in the plain tile, precomputed so chunks can be
/// reversed in parallel.
#[derive(Clone, Debug, Default)]
pub struct ChunkData {
    chunks: Vec<FilteredChunk>,
    chunk_offsets: Vec<u64>,
    total_original_size: u64,
}

impl ChunkData {
    /// Scans a framed buffer, validating its structure.
    pub fn parse(framed: &[u8]) -> Result<ChunkData> {
        let mut reader = ByteReader::new(framed);
        let num_chunks = reader.read::<u64>()?;

        let mut chunks = Vec::new();
        let mut chunk_offsets = Vec::new();
        let mut total_original_size = 0u64;
        for _ in 0..num_chunks {
            let original_size = reader.read::<u32>()?;
            let filtered_size = reader.read::<u32>()?;
            let metadata_size = reader.read::<u32>()?;

            let metadata_start = reader.pos();
            reader.read_bytes(metadata_size as usize)?;
            let data_start = reader.pos();
            reader.read_bytes(filtered_size as usize)?;

            chunk_offsets.push(total_original_size);
            total_original_size += u64::from(original_size);
            chunks.push(FilteredChunk {
                original_size,
                metadata_range: metadata_start
                    ..metadata_start + metadata_size as usize,
                data_range: data_start..data_start + filtered_size as usize,
            });
        }

        if reader.remaining() != 0 {
            return Err(FilterError::FormatCorrupt(format!(
                "{} trailing bytes after the last chunk",
                reader.remaining()
            )));
        }

        Ok(ChunkData {
            chunks,
            chunk_offsets,
            total_original_size,
        })
    }

    pub fn chunks(&self) -> &[FilteredChunk] {
        &self.chunks
    }

    /// The target byte offset of every chunk in the plain tile.
    pub fn chunk_offsets(&self) -> &[u64] {
        &self.chunk_offsets
    }

    pub fn total_original_size(&self) -> u64 {
        self.total_original_size
    }
}

/// The on-disk header of a generic tile: a tile serialized standalone
/// together with its own filter pipeline.
#[derive(Debug, Default)]
#[binrw]
#[brw(little)]
pub struct GenericTileHeader {
    pub version: u32,
    pub persisted_size: u64,
    pub tile_size: u64,
    pub datatype: u8,
    pub cell_size: u64,
    pub encryption_type: u8,
    pub filter_pipeline_size: u32,
}

/// Serializes an already-filtered tile as a generic tile: header, filter
/// pipeline, framed chunk data.
pub fn write_generic_tile(
    tile: &WriterTile,
    pipeline: &FilterPipeline,
) -> Result<Vec<u8>> {
    let pipeline_bytes =
        storage::filter::serialize_pipeline(pipeline, tile.format_version())?;

    let header = GenericTileHeader {
        version: tile.format_version(),
        persisted_size: tile.filtered().len() as u64,
        tile_size: tile.original_size(),
        datatype: tile.datatype() as u8,
        cell_size: tile.cell_size(),
        encryption_type: 0,
        filter_pipeline_size: pipeline_bytes.len() as u32,
    };

    let mut cursor = Cursor::new(Vec::new());
    header.write(&mut cursor)?;
    let mut bytes = cursor.into_inner();
    bytes.extend_from_slice(&pipeline_bytes);
    bytes.extend_from_slice(tile.filtered());
    Ok(bytes)
}

/// Reads a generic tile, reversing its pipeline, and returns the plain
/// bytes.
pub fn read_generic_tile(bytes: &[u8], config: &Config) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(bytes);
    let header = GenericTileHeader::read(&mut cursor)
        .map_err(FilterError::from)?;

    let mut reader = ByteReader::new(bytes);
    reader.read_bytes(GENERIC_TILE_HEADER_SIZE as usize)?;
    let pipeline_bytes =
        reader.read_bytes(header.filter_pipeline_size as usize)?;
    let chunk_bytes = reader.read_bytes(header.persisted_size as usize)?;

    let pipeline = storage::filter::deserialize_pipeline(
        pipeline_bytes,
        header.version,
    )?;

    let mut tile = Tile::from_filtered(
        header.version,
        DataType::from(header.datatype),
        header.cell_size,
        chunk_bytes.to_vec(),
    );
    pipeline.run_reverse_generic_tile(&mut tile, config)?;

    if tile.data().len() as u64 != header.tile_size {
        return Err(FilterError::FormatCorrupt(format!(
            "generic tile reversed to {} bytes, expected {}",
            tile.data().len(),
            header.tile_size
        )));
    }
    Ok(tile.into_data())
}
