// This file is part of tilepipe released under the MIT license.
// Copyright (c) 2023 TileDB, Inc.

use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::{debug, warn};

use crate::buffer::FilterBuffer;
use crate::config::Config;
use crate::datatype::DataType;
use crate::error::{FilterError, Result};
use crate::filters::{Filter, FilterType, ForwardContext, ReverseContext};
use crate::storage::{ChunkData, FilteredChunk, Tile, WriterTile};

/// Default cap on the size of a tile chunk.
pub const MAX_TILE_CHUNK_SIZE: u32 = 64 * 1024;

/// An ordered sequence of filters run over tile data, forward during
/// writes and in reverse during reads.
///
/// The tile is cut into chunks that move through the whole pipeline
/// independently, one worker-pool task per chunk. The framed layout of a
/// filtered tile is a `u64` chunk count followed by each chunk's
/// `u32 original_size; u32 filtered_size; u32 metadata_size`, its filter
/// metadata, and its filtered bytes, all little-endian.
#[derive(Clone)]
pub struct FilterPipeline {
    filters: Vec<Box<dyn Filter>>,
    max_chunk_size: u32,
}

impl Default for FilterPipeline {
    fn default() -> Self {
        FilterPipeline::empty()
    }
}

impl std::fmt::Debug for FilterPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterPipeline")
            .field("max_chunk_size", &self.max_chunk_size)
            .field(
                "filters",
                &self
                    .filters
                    .iter()
                    .map(|f| f.filter_type())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl FilterPipeline {
    pub fn new(max_chunk_size: u32, filters: Vec<Box<dyn Filter>>) -> Self {
        FilterPipeline {
            filters,
            max_chunk_size,
        }
    }

    pub fn empty() -> Self {
        FilterPipeline::new(MAX_TILE_CHUNK_SIZE, Vec::new())
    }

    pub fn add_filter(&mut self, filter: Box<dyn Filter>) {
        self.filters.push(filter);
    }

    pub fn filters(&self) -> &[Box<dyn Filter>] {
        &self.filters
    }

    pub fn filters_mut(&mut self) -> &mut [Box<dyn Filter>] {
        &mut self.filters
    }

    pub fn max_chunk_size(&self) -> u32 {
        self.max_chunk_size
    }

    pub fn set_max_chunk_size(&mut self, max_chunk_size: u32) {
        self.max_chunk_size = max_chunk_size;
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn has_filter(&self, filter_type: FilterType) -> bool {
        self.filters.iter().any(|f| f.filter_type() == filter_type)
    }

    /// The input datatype of every stage, following each filter's output
    /// datatype through the chain.
    fn stage_datatypes(&self, first_input: DataType) -> Vec<DataType> {
        let mut types = Vec::with_capacity(self.filters.len());
        let mut current = first_input;
        for filter in &self.filters {
            types.push(current);
            current = filter.output_datatype(current);
        }
        types
    }

    /// Checks that every successive filter accepts the datatype its
    /// predecessor emits, and that the special ordering constraints on
    /// var-length string pipelines hold.
    pub fn check_filter_types(
        &self,
        first_input: DataType,
        is_var: bool,
    ) -> Result<()> {
        if self.filters.is_empty() {
            return Ok(());
        }

        if first_input.is_string() && is_var && self.filters.len() > 1 {
            for kind in [FilterType::Rle, FilterType::Dictionary] {
                if self.has_filter(kind)
                    && self.filters[0].filter_type() != kind
                {
                    return Err(FilterError::FilterChainIncompatible(format!(
                        "{:?} must be the first filter on a var-length \
                         string attribute",
                        kind
                    )));
                }
            }
        }

        let mut input = first_input;
        for filter in &self.filters {
            if !filter.accepts_input_datatype(input) {
                return Err(FilterError::FilterChainIncompatible(format!(
                    "filter {:?} does not accept input datatype {:?}",
                    filter.filter_type(),
                    input
                )));
            }
            input = filter.output_datatype(input);
        }
        Ok(())
    }

    /// Whether the offsets tile of a var attribute is consumed by a
    /// filter in this pipeline instead of being filtered on its own.
    pub fn skip_offsets_filtering(
        &self,
        datatype: DataType,
        format_version: u32,
    ) -> bool {
        if !datatype.is_string() {
            return false;
        }
        (format_version >= super::compression::STRING_RLE_VERSION
            && self.has_filter(FilterType::Rle))
            || (format_version
                >= super::compression::STRING_DICTIONARY_VERSION
                && self.has_filter(FilterType::Dictionary))
    }

    /// Whether a tile should be cut into chunks at all. WebP and the
    /// joint string encodings need the whole tile in one piece.
    pub fn use_tile_chunking(
        &self,
        is_var: bool,
        format_version: u32,
        datatype: DataType,
    ) -> bool {
        if self.has_filter(FilterType::WebP) {
            return false;
        }
        !(is_var && self.skip_offsets_filtering(datatype, format_version))
    }

    /// Runs the pipeline forward over the tile. The plain bytes are
    /// consumed and replaced by the framed filtered buffer.
    pub fn run_forward(
        &self,
        tile: &mut WriterTile,
        mut offsets_tile: Option<&mut WriterTile>,
        pool: &ThreadPool,
    ) -> Result<()> {
        let is_var = offsets_tile.is_some();
        self.check_filter_types(tile.datatype(), is_var)?;

        let use_chunking = self.use_tile_chunking(
            is_var,
            tile.format_version(),
            tile.datatype(),
        );
        let chunk_size = if use_chunking {
            compute_chunk_size(
                tile.size() as u64,
                tile.cell_size(),
                self.max_chunk_size,
            )?
        } else {
            whole_tile_chunk_size(tile.size() as u64)?
        };

        let cell_offsets = match &offsets_tile {
            Some(offsets_tile) => Some(offsets_tile.as_offsets()?),
            None => None,
        };
        let chunk_offsets = match &cell_offsets {
            Some(offsets) => self.var_chunk_offsets(
                chunk_size,
                tile.size() as u64,
                offsets,
            )?,
            None => Vec::new(),
        };

        let joint_strings = is_var
            && self.skip_offsets_filtering(
                tile.datatype(),
                tile.format_version(),
            );

        let framed = if joint_strings {
            // A single chunk processed inline so the stage can consume
            // the cell offsets.
            let mut offsets = cell_offsets.unwrap_or_default();
            let result = self.run_chunk_forward(
                tile.datatype(),
                tile.format_version(),
                tile.data(),
                Some(&mut offsets),
            );
            frame_chunks(vec![result], &[tile.size() as u32], pool)?
        } else {
            self.filter_chunks_forward(tile, chunk_size, &chunk_offsets, pool)?
        };

        tile.set_filtered(framed);
        tile.clear_data();
        if joint_strings {
            if let Some(offsets_tile) = offsets_tile.as_mut() {
                // The offsets were encoded into the values stream; the
                // offsets tile is not written separately.
                offsets_tile.clear_data();
            }
        }
        Ok(())
    }

    /// Runs the pipeline in reverse over the tile, reconstructing the
    /// plain bytes from the framed filtered buffer. On failure the plain
    /// bytes are left empty.
    pub fn run_reverse(
        &self,
        tile: &mut Tile,
        mut offsets_tile: Option<&mut Tile>,
        pool: &ThreadPool,
        config: &Config,
    ) -> Result<()> {
        let chunk_data = ChunkData::parse(tile.filtered())?;
        let stage_types = self.stage_datatypes(tile.datatype());
        let total = chunk_data.total_original_size() as usize;

        let joint_strings = offsets_tile.is_some()
            && self.skip_offsets_filtering(
                tile.datatype(),
                tile.format_version(),
            );

        let mut plain = vec![0u8; total];
        let result = if joint_strings {
            let mut offsets = Vec::new();
            let result = self.reverse_chunks_serial(
                &stage_types,
                tile.format_version(),
                config,
                &chunk_data,
                tile.filtered(),
                &mut plain,
                Some(&mut offsets),
            );
            if result.is_ok() {
                if let Some(offsets_tile) = offsets_tile.as_mut() {
                    offsets_tile.set_data_from_offsets(&offsets);
                }
            }
            result
        } else {
            self.reverse_chunks_parallel(
                &stage_types,
                tile.format_version(),
                config,
                &chunk_data,
                tile.filtered(),
                &mut plain,
                pool,
            )
        };

        match result {
            Ok(()) => {
                tile.set_data(plain);
                tile.clear_filtered();
                Ok(())
            }
            Err(err) => {
                warn!(%err, "reverse filter pipeline failed");
                tile.set_data(Vec::new());
                Err(err)
            }
        }
    }

    /// Reverses a whole generic tile on the calling thread.
    pub fn run_reverse_generic_tile(
        &self,
        tile: &mut Tile,
        config: &Config,
    ) -> Result<()> {
        let chunk_data = ChunkData::parse(tile.filtered())?;
        let stage_types = self.stage_datatypes(tile.datatype());
        let total = chunk_data.total_original_size() as usize;

        let mut plain = vec![0u8; total];
        let result = self.reverse_chunks_serial(
            &stage_types,
            tile.format_version(),
            config,
            &chunk_data,
            tile.filtered(),
            &mut plain,
            None,
        );
        match result {
            Ok(()) => {
                tile.set_data(plain);
                tile.clear_filtered();
                Ok(())
            }
            Err(err) => {
                tile.set_data(Vec::new());
                Err(err)
            }
        }
    }

    /// Chunk boundaries for a var-length tile: cells never straddle a
    /// boundary, and chunks aim for the target size while staying within
    /// half of it on either side where the cells allow.
    fn var_chunk_offsets(
        &self,
        chunk_size: u32,
        tile_size: u64,
        cell_offsets: &[u64],
    ) -> Result<Vec<u64>> {
        let chunk_size = u64::from(chunk_size);
        let min_size = chunk_size / 2;
        let max_size = chunk_size + chunk_size / 2;

        let mut chunk_offsets = vec![0u64];
        let mut current_size = 0u64;
        for (index, start) in cell_offsets.iter().enumerate() {
            let cell_size = if index == cell_offsets.len() - 1 {
                tile_size - start
            } else {
                cell_offsets[index + 1] - start
            };

            let new_size = current_size + cell_size;
            if new_size > chunk_size {
                if current_size <= min_size || new_size <= max_size {
                    // Close the chunk with this cell included.
                    ensure_chunk_fits(new_size)?;
                    chunk_offsets.push(start + cell_size);
                    current_size = 0;
                } else {
                    chunk_offsets.push(*start);
                    if cell_size > chunk_size {
                        // The cell forms its own chunk.
                        ensure_chunk_fits(cell_size)?;
                        if index != cell_offsets.len() - 1 {
                            chunk_offsets.push(start + cell_size);
                        }
                        current_size = 0;
                    } else {
                        current_size = cell_size;
                    }
                }
            } else {
                current_size = new_size;
            }
        }

        // A boundary flush with the tile end would describe an empty
        // trailing chunk.
        if chunk_offsets.len() > 1 && *chunk_offsets.last().unwrap_or(&0)
            == tile_size
        {
            chunk_offsets.pop();
        }

        Ok(chunk_offsets)
    }

    fn filter_chunks_forward(
        &self,
        tile: &WriterTile,
        chunk_size: u32,
        chunk_offsets: &[u64],
        pool: &ThreadPool,
    ) -> Result<Vec<u8>> {
        let data = tile.data();
        let tile_size = data.len() as u64;
        let var_sizes = !chunk_offsets.is_empty();

        let (nchunks, last_chunk_size) = if tile_size == 0 {
            (0u64, 0u64)
        } else if tile_size == u64::from(chunk_size) {
            (1, tile_size)
        } else if var_sizes {
            let nchunks = chunk_offsets.len() as u64;
            (nchunks, tile_size - chunk_offsets[chunk_offsets.len() - 1])
        } else {
            let full = tile_size / u64::from(chunk_size);
            let remainder = tile_size % u64::from(chunk_size);
            if remainder != 0 {
                (full + 1, remainder)
            } else {
                (full, u64::from(chunk_size))
            }
        };

        debug!(
            nchunks,
            chunk_size,
            tile_size,
            "running filter pipeline forward"
        );

        let chunk_range = |i: u64| -> std::ops::Range<usize> {
            let start = if var_sizes {
                chunk_offsets[i as usize]
            } else {
                i * u64::from(chunk_size)
            };
            let len = if i == nchunks - 1 {
                last_chunk_size
            } else if var_sizes {
                chunk_offsets[i as usize + 1] - start
            } else {
                u64::from(chunk_size)
            };
            start as usize..(start + len) as usize
        };

        let mut original_sizes = Vec::with_capacity(nchunks as usize);
        for i in 0..nchunks {
            let range = chunk_range(i);
            original_sizes.push(range.len() as u32);
        }

        let results: Vec<Result<(FilterBuffer<'_>, FilterBuffer<'_>)>> =
            pool.install(|| {
                (0..nchunks)
                    .into_par_iter()
                    .map(|i| {
                        self.run_chunk_forward(
                            tile.datatype(),
                            tile.format_version(),
                            &data[chunk_range(i)],
                            None,
                        )
                    })
                    .collect()
            });

        frame_chunks(results, &original_sizes, pool)
    }

    /// Runs one chunk through every filter in order, returning the final
    /// stage's metadata and data.
    fn run_chunk_forward<'a>(
        &self,
        datatype: DataType,
        format_version: u32,
        chunk: &'a [u8],
        mut offsets: Option<&mut Vec<u64>>,
    ) -> Result<(FilterBuffer<'a>, FilterBuffer<'a>)> {
        let stage_types = self.stage_datatypes(datatype);

        let mut input_metadata = FilterBuffer::new();
        let mut input_data = FilterBuffer::from_slice(chunk);
        let mut output_metadata = FilterBuffer::new();
        let mut output_data = FilterBuffer::new();

        for (filter, stage_type) in self.filters.iter().zip(stage_types) {
            input_data.reset_offset();
            input_data.set_read_only(true);
            input_metadata.reset_offset();
            input_metadata.set_read_only(true);
            output_data.clear()?;
            output_metadata.clear()?;

            let mut ctx = ForwardContext {
                datatype: stage_type,
                format_version,
                offsets: offsets.as_mut().map(|o| &mut **o),
            };
            filter.run_forward(
                &mut ctx,
                &mut input_metadata,
                &mut input_data,
                &mut output_metadata,
                &mut output_data,
            )?;

            input_data.set_read_only(false);
            input_metadata.set_read_only(false);
            input_data.swap(&mut output_data);
            input_metadata.swap(&mut output_metadata);
        }

        Ok((input_metadata, input_data))
    }

    #[allow(clippy::too_many_arguments)]
    fn reverse_chunks_parallel(
        &self,
        stage_types: &[DataType],
        format_version: u32,
        config: &Config,
        chunk_data: &ChunkData,
        framed: &[u8],
        plain: &mut [u8],
        pool: &ThreadPool,
    ) -> Result<()> {
        let slices = split_chunk_slices(plain, chunk_data.chunks())?;

        let results: Vec<Result<()>> = pool.install(|| {
            chunk_data
                .chunks()
                .par_iter()
                .zip(slices)
                .map(|(chunk, out)| {
                    self.run_chunk_reverse(
                        stage_types,
                        format_version,
                        config,
                        chunk,
                        framed,
                        out,
                        None,
                    )
                })
                .collect()
        });

        results.into_iter().collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn reverse_chunks_serial(
        &self,
        stage_types: &[DataType],
        format_version: u32,
        config: &Config,
        chunk_data: &ChunkData,
        framed: &[u8],
        plain: &mut [u8],
        mut offsets: Option<&mut Vec<u64>>,
    ) -> Result<()> {
        let slices = split_chunk_slices(plain, chunk_data.chunks())?;
        for (chunk, out) in chunk_data.chunks().iter().zip(slices) {
            self.run_chunk_reverse(
                stage_types,
                format_version,
                config,
                chunk,
                framed,
                out,
                offsets.as_mut().map(|o| &mut **o),
            )?;
        }
        Ok(())
    }

    /// Runs one chunk through every filter in reverse. The final stage
    /// writes straight into the chunk's slice of the plain tile.
    #[allow(clippy::too_many_arguments)]
    fn run_chunk_reverse<'a>(
        &self,
        stage_types: &[DataType],
        format_version: u32,
        config: &Config,
        chunk: &FilteredChunk,
        framed: &'a [u8],
        out: &'a mut [u8],
        mut offsets: Option<&mut Vec<u64>>,
    ) -> Result<()> {
        let mut input_metadata =
            FilterBuffer::from_slice(&framed[chunk.metadata_range()]);
        let mut input_data =
            FilterBuffer::from_slice(&framed[chunk.data_range()]);

        if self.filters.is_empty() {
            input_data.copy_to(out).map_err(|_| {
                FilterError::FormatCorrupt(
                    "chunk data does not match its original size".to_string(),
                )
            })?;
            return Ok(());
        }

        let mut output_metadata = FilterBuffer::new();
        let mut output_data = FilterBuffer::new();
        let mut out_slot = Some(out);

        for filter_idx in (0..self.filters.len()).rev() {
            let filter = &self.filters[filter_idx];
            input_data.reset_offset();
            input_data.set_read_only(true);
            input_metadata.reset_offset();
            input_metadata.set_read_only(true);
            output_data.clear()?;
            output_metadata.clear()?;

            let last_filter = filter_idx == 0;
            if last_filter {
                let slot = out_slot.take().ok_or_else(|| {
                    FilterError::InvalidArgument(
                        "chunk output slot already consumed".to_string(),
                    )
                })?;
                output_data.set_fixed_allocation(slot)?;
            }

            let mut ctx = ReverseContext {
                datatype: stage_types[filter_idx],
                format_version,
                offsets: offsets.as_mut().map(|o| &mut **o),
                config,
            };
            filter.run_reverse(
                &mut ctx,
                &mut input_metadata,
                &mut input_data,
                &mut output_metadata,
                &mut output_data,
            )?;

            input_data.set_read_only(false);
            input_metadata.set_read_only(false);

            if !last_filter {
                input_data.swap(&mut output_data);
                input_metadata.swap(&mut output_metadata);
            }
        }

        if output_data.size() != chunk.original_size() as usize {
            return Err(FilterError::FormatCorrupt(format!(
                "chunk reversed to {} bytes, expected {}",
                output_data.size(),
                chunk.original_size()
            )));
        }
        Ok(())
    }
}

/// The chunk size for a fixed-width tile: the cap floored to a multiple
/// of the cell size. A zero cap disables chunking. A cell larger than the
/// cap becomes a chunk on its own.
pub fn compute_chunk_size(
    tile_size: u64,
    cell_size: u64,
    max_chunk_size: u32,
) -> Result<u32> {
    if max_chunk_size == 0 {
        return whole_tile_chunk_size(tile_size);
    }
    let cell_size = cell_size.max(1);
    let capped = u64::from(max_chunk_size).min(tile_size);
    let mut chunk_size = capped / cell_size * cell_size;
    if chunk_size == 0 {
        chunk_size = cell_size;
    }
    u32::try_from(chunk_size)
        .map_err(|_| FilterError::ChunkSizeOverflow(chunk_size))
}

fn whole_tile_chunk_size(tile_size: u64) -> Result<u32> {
    u32::try_from(tile_size)
        .map_err(|_| FilterError::ChunkSizeOverflow(tile_size))
}

fn ensure_chunk_fits(size: u64) -> Result<()> {
    if size > u64::from(u32::MAX) {
        return Err(FilterError::ChunkSizeOverflow(size));
    }
    Ok(())
}

/// Splits the plain tile into one disjoint mutable slice per chunk.
fn split_chunk_slices<'p>(
    plain: &'p mut [u8],
    chunks: &[FilteredChunk],
) -> Result<Vec<&'p mut [u8]>> {
    let mut slices = Vec::with_capacity(chunks.len());
    let mut rest = plain;
    for chunk in chunks {
        let (head, tail) = rest.split_at_mut(chunk.original_size() as usize);
        slices.push(head);
        rest = tail;
    }
    Ok(slices)
}

/// Assembles the framed filtered buffer: writes the chunk count, then
/// copies every chunk's header, metadata, and data into its precomputed
/// slot, in parallel.
fn frame_chunks(
    results: Vec<Result<(FilterBuffer<'_>, FilterBuffer<'_>)>>,
    original_sizes: &[u32],
    pool: &ThreadPool,
) -> Result<Vec<u8>> {
    let results: Vec<(FilterBuffer<'_>, FilterBuffer<'_>)> =
        results.into_iter().collect::<Result<_>>()?;

    let mut total = 8usize;
    for (metadata, data) in &results {
        if metadata.size() > u32::MAX as usize {
            return Err(FilterError::ChunkSizeOverflow(metadata.size() as u64));
        }
        if data.size() > u32::MAX as usize {
            return Err(FilterError::ChunkSizeOverflow(data.size() as u64));
        }
        total += 12 + metadata.size() + data.size();
    }

    let mut framed = vec![0u8; total];
    let (header, mut rest) = framed.split_at_mut(8);
    header.copy_from_slice(&(results.len() as u64).to_le_bytes());

    let mut slots = Vec::with_capacity(results.len());
    for (metadata, data) in &results {
        let (slot, tail) =
            rest.split_at_mut(12 + metadata.size() + data.size());
        slots.push(slot);
        rest = tail;
    }

    let copies: Vec<Result<()>> = pool.install(|| {
        results
            .par_iter()
            .zip(slots)
            .zip(original_sizes.par_iter())
            .map(|(((metadata, data), slot), original_size)| {
                slot[0..4].copy_from_slice(&original_size.to_le_bytes());
                slot[4..8]
                    .copy_from_slice(&(data.size() as u32).to_le_bytes());
                slot[8..12]
                    .copy_from_slice(&(metadata.size() as u32).to_le_bytes());
                let metadata_end = 12 + metadata.size();
                metadata.copy_to(&mut slot[12..metadata_end])?;
                data.copy_to(&mut slot[metadata_end..])?;
                Ok(())
            })
            .collect()
    });
    copies.into_iter().collect::<Result<()>>()?;

    Ok(framed)
}
