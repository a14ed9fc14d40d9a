//! Shared helpers and test-only filters for the integration suite.

use rayon::ThreadPool;

use tilepipe::buffer::FilterBuffer;
use tilepipe::config::Config;
use tilepipe::datatype::DataType;
use tilepipe::error::{FilterError, Result};
use tilepipe::filters::{
    Filter, FilterPipeline, FilterType, ForwardContext, ReverseContext,
};
use tilepipe::storage::{Tile, WriterTile, CURRENT_FORMAT_VERSION};

pub fn thread_pool() -> ThreadPool {
    rayon::ThreadPoolBuilder::new()
        .num_threads(4)
        .build()
        .expect("building a worker pool")
}

pub fn u64_bytes(values: impl Iterator<Item = u64>) -> Vec<u8> {
    values.flat_map(|v| v.to_le_bytes()).collect()
}

/// A writer tile of increasing uint64 values, the common fixture.
pub fn increasing_tile(nelts: u64) -> WriterTile {
    WriterTile::new(
        CURRENT_FORMAT_VERSION,
        DataType::Uint64,
        8,
        u64_bytes(0..nelts),
    )
}

/// Moves a filtered writer tile's bytes into a reader-side tile.
pub fn tile_for_unfiltering(tile: &WriterTile) -> Tile {
    Tile::from_filtered(
        tile.format_version(),
        tile.datatype(),
        tile.cell_size(),
        tile.filtered().to_vec(),
    )
}

/// Runs the pipeline forward and straight back, returning the
/// reconstructed plain bytes.
pub fn filter_unfilter(
    pipeline: &FilterPipeline,
    tile: &mut WriterTile,
) -> Result<Vec<u8>> {
    let pool = thread_pool();
    pipeline.run_forward(tile, None, &pool)?;
    let mut unfiltered = tile_for_unfiltering(tile);
    pipeline.run_reverse(&mut unfiltered, None, &pool, &Config::default())?;
    Ok(unfiltered.into_data())
}

/// Adds one to every uint64, allocating a fresh output buffer.
#[derive(Clone, Copy, Debug, Default)]
pub struct AddOneFilter;

impl Filter for AddOneFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::NoOp
    }

    fn clone_dyn(&self) -> Box<dyn Filter> {
        Box::new(*self)
    }

    fn run_forward<'a>(
        &self,
        _ctx: &mut ForwardContext<'_>,
        input_metadata: &mut FilterBuffer<'a>,
        input: &mut FilterBuffer<'a>,
        output_metadata: &mut FilterBuffer<'a>,
        output: &mut FilterBuffer<'a>,
    ) -> Result<()> {
        output.prepend_buffer(input.size())?;
        input.reset_offset();
        for _ in 0..input.size() / 8 {
            let value: u64 = input.read_scalar()?;
            output.write_scalar(value.wrapping_add(1))?;
        }
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
        output.prepend_buffer(input.size())?;
        input.reset_offset();
        for _ in 0..input.size() / 8 {
            let value: u64 = input.read_scalar()?;
            output.write_scalar(value.wrapping_sub(1))?;
        }
        output_metadata.append_view(input_metadata)?;
        Ok(())
    }
}

/// Sums the input's uint64 values into a metadata word; reverse recomputes
/// the sum and fails on a mismatch.
#[derive(Clone, Copy, Debug, Default)]
pub struct PseudoChecksumFilter;

fn sum_u64(buffer: &mut FilterBuffer<'_>) -> Result<u64> {
    buffer.reset_offset();
    let mut sum = 0u64;
    for _ in 0..buffer.size() / 8 {
        sum = sum.wrapping_add(buffer.read_scalar::<u64>()?);
    }
    Ok(sum)
}

impl Filter for PseudoChecksumFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::NoOp
    }

    fn clone_dyn(&self) -> Box<dyn Filter> {
        Box::new(*self)
    }

    fn run_forward<'a>(
        &self,
        _ctx: &mut ForwardContext<'_>,
        input_metadata: &mut FilterBuffer<'a>,
        input: &mut FilterBuffer<'a>,
        output_metadata: &mut FilterBuffer<'a>,
        output: &mut FilterBuffer<'a>,
    ) -> Result<()> {
        let sum = sum_u64(input)?;
        output.append_view(input)?;
        output_metadata.append_view(input_metadata)?;
        output_metadata.prepend_buffer(8)?;
        output_metadata.write_scalar(sum)?;
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
        let expected: u64 = input_metadata.read_scalar()?;
        let actual = sum_u64(input)?;
        if expected != actual {
            return Err(FilterError::ChecksumMismatch {
                algorithm: "pseudo",
            });
        }
        output.append_view(input)?;
        let consumed = input_metadata.offset();
        output_metadata.append_view_range(
            input_metadata,
            consumed,
            input_metadata.size() - consumed,
        )?;
        Ok(())
    }
}
