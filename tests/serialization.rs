//! Pipeline serialization, option protocol, and generic tile coverage.

use anyhow::Result;

use tilepipe::config::Config;
use tilepipe::datatype::DataType;
use tilepipe::filters::bit_width_reduction::BitWidthReductionFilter;
use tilepipe::filters::compression::CompressionFilter;
use tilepipe::filters::positive_delta::PositiveDeltaFilter;
use tilepipe::filters::scale_float::ScaleFloatFilter;
use tilepipe::filters::webp::{WebpFilter, WebpInputFormat};
use tilepipe::filters::{
    Filter, FilterOption, FilterPipeline, FilterType, OptionValue,
};
use tilepipe::storage::{
    deserialize_pipeline, read_generic_tile, serialize_pipeline,
    write_generic_tile, WriterTile, CURRENT_FORMAT_VERSION,
};

use crate::support::{thread_pool, tile_for_unfiltering, u64_bytes};

fn rich_pipeline() -> Result<FilterPipeline> {
    Ok(FilterPipeline::new(
        4096,
        vec![
            Box::new(PositiveDeltaFilter::new(2048)),
            Box::new(BitWidthReductionFilter::new(512)),
            Box::new(
                CompressionFilter::new(FilterType::Zstd, 7),
            ),
        ],
    ))
}

// A deserialized pipeline behaves identically to the original on a tile.
#[test]
fn serialized_pipeline_behaves_identically() -> Result<()> {
    let pool = thread_pool();
    let pipeline = rich_pipeline()?;
    let bytes = serialize_pipeline(&pipeline, CURRENT_FORMAT_VERSION)?;
    let decoded = deserialize_pipeline(&bytes, CURRENT_FORMAT_VERSION)?;
    assert_eq!(decoded.max_chunk_size(), pipeline.max_chunk_size());
    assert_eq!(decoded.len(), pipeline.len());

    let raw = u64_bytes(0..5000);
    let mut original_tile = WriterTile::new(
        CURRENT_FORMAT_VERSION,
        DataType::Uint64,
        8,
        raw.clone(),
    );
    let mut decoded_tile = WriterTile::new(
        CURRENT_FORMAT_VERSION,
        DataType::Uint64,
        8,
        raw.clone(),
    );
    pipeline.run_forward(&mut original_tile, None, &pool)?;
    decoded.run_forward(&mut decoded_tile, None, &pool)?;
    assert_eq!(original_tile.filtered(), decoded_tile.filtered());

    let mut unfiltered = tile_for_unfiltering(&decoded_tile);
    decoded.run_reverse(&mut unfiltered, None, &pool, &Config::default())?;
    assert_eq!(unfiltered.data(), raw.as_slice());
    Ok(())
}

#[test]
fn serialized_bytes_follow_the_layout() -> Result<()> {
    let pipeline = rich_pipeline()?;
    let bytes = serialize_pipeline(&pipeline, CURRENT_FORMAT_VERSION)?;

    // max_chunk_size, num_filters.
    assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 4096);
    assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 3);
    // First entry: positive delta with a u32 window.
    assert_eq!(bytes[8], FilterType::PositiveDelta as u8);
    assert_eq!(u32::from_le_bytes(bytes[9..13].try_into().unwrap()), 4);
    assert_eq!(
        u32::from_le_bytes(bytes[13..17].try_into().unwrap()),
        2048
    );
    Ok(())
}

#[test]
fn webp_and_scale_float_configs_round_trip() -> Result<()> {
    let pipeline = FilterPipeline::new(
        65536,
        vec![
            Box::new(WebpFilter::new(
                82.5,
                WebpInputFormat::Bgra,
                false,
                16,
                64,
            )?),
            Box::new(ScaleFloatFilter::new(0.5, -4.0, 2)?),
        ],
    );
    let bytes = serialize_pipeline(&pipeline, CURRENT_FORMAT_VERSION)?;
    let decoded = deserialize_pipeline(&bytes, CURRENT_FORMAT_VERSION)?;

    let webp = &decoded.filters()[0];
    assert_eq!(
        webp.get_option(FilterOption::WebpQuality)?,
        OptionValue::Float32(82.5)
    );
    assert_eq!(
        webp.get_option(FilterOption::WebpInputFormat)?,
        OptionValue::Uint8(WebpInputFormat::Bgra as u8)
    );
    assert_eq!(
        webp.get_option(FilterOption::WebpLossless)?,
        OptionValue::Uint8(0)
    );

    let scale = &decoded.filters()[1];
    assert_eq!(
        scale.get_option(FilterOption::ScaleFloatFactor)?,
        OptionValue::Float64(0.5)
    );
    assert_eq!(
        scale.get_option(FilterOption::ScaleFloatOffset)?,
        OptionValue::Float64(-4.0)
    );
    assert_eq!(
        scale.get_option(FilterOption::ScaleFloatByteWidth)?,
        OptionValue::Uint64(2)
    );
    Ok(())
}

// Every supported option survives a set/get cycle on its filter.
#[test]
fn option_set_get_round_trip() -> Result<()> {
    let mut cases: Vec<(Box<dyn Filter>, FilterOption, OptionValue)> = vec![
        (
            Box::new(BitWidthReductionFilter::default()),
            FilterOption::BitWidthMaxWindow,
            OptionValue::Uint32(333),
        ),
        (
            Box::new(PositiveDeltaFilter::default()),
            FilterOption::PositiveDeltaMaxWindow,
            OptionValue::Uint32(4444),
        ),
        (
            Box::new(CompressionFilter::new(FilterType::GZip, 1)),
            FilterOption::CompressionLevel,
            OptionValue::Int32(9),
        ),
        (
            Box::new(CompressionFilter::new(FilterType::Delta, 0)),
            FilterOption::CompressionReinterpretDatatype,
            OptionValue::Datatype(DataType::Int16),
        ),
        (
            Box::new(ScaleFloatFilter::default()),
            FilterOption::ScaleFloatFactor,
            OptionValue::Float64(0.125),
        ),
        (
            Box::new(ScaleFloatFilter::default()),
            FilterOption::ScaleFloatByteWidth,
            OptionValue::Uint64(1),
        ),
        (
            Box::new(WebpFilter::default()),
            FilterOption::WebpQuality,
            OptionValue::Float32(55.0),
        ),
        (
            Box::new(WebpFilter::default()),
            FilterOption::WebpInputFormat,
            OptionValue::Uint8(WebpInputFormat::Rgb as u8),
        ),
        (
            Box::new(WebpFilter::default()),
            FilterOption::WebpLossless,
            OptionValue::Uint8(1),
        ),
    ];
    for (filter, option, value) in &mut cases {
        filter.set_option(*option, *value)?;
        assert_eq!(filter.get_option(*option)?, *value, "{:?}", option);
    }
    Ok(())
}

#[test]
fn options_are_total() {
    let filter = BitWidthReductionFilter::default();
    assert!(filter.get_option(FilterOption::WebpQuality).is_err());
    let noop = tilepipe::filters::noop::NoOpFilter::default();
    assert!(noop.get_option(FilterOption::CompressionLevel).is_err());
}

#[test]
fn generic_tile_round_trip() -> Result<()> {
    let pool = thread_pool();
    let raw = u64_bytes((0..2500).map(|i| i / 3));
    let pipeline = FilterPipeline::new(
        8192,
        vec![Box::new(CompressionFilter::new(FilterType::GZip, 6))],
    );
    let mut tile = WriterTile::new(
        CURRENT_FORMAT_VERSION,
        DataType::Uint64,
        8,
        raw.clone(),
    );
    pipeline.run_forward(&mut tile, None, &pool)?;

    let bytes = write_generic_tile(&tile, &pipeline)?;
    let decoded = read_generic_tile(&bytes, &Config::default())?;
    assert_eq!(decoded, raw);
    Ok(())
}

#[test]
fn truncated_generic_tile_is_corrupt() -> Result<()> {
    let pool = thread_pool();
    let raw = u64_bytes(0..100);
    let pipeline = FilterPipeline::empty();
    let mut tile = WriterTile::new(
        CURRENT_FORMAT_VERSION,
        DataType::Uint64,
        8,
        raw,
    );
    pipeline.run_forward(&mut tile, None, &pool)?;
    let bytes = write_generic_tile(&tile, &pipeline)?;
    assert!(read_generic_tile(&bytes[..bytes.len() - 4], &Config::default())
        .is_err());
    Ok(())
}
