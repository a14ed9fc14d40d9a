//! Round-trip coverage across filter compositions, chunking shapes, and
//! the chunking predicates.

use anyhow::Result;

use tilepipe::config::Config;
use tilepipe::datatype::DataType;
use tilepipe::filters::bit_width_reduction::BitWidthReductionFilter;
use tilepipe::filters::bitshuffle::BitShuffleFilter;
use tilepipe::filters::byteshuffle::ByteShuffleFilter;
use tilepipe::filters::checksum::{ChecksumMd5Filter, ChecksumSha256Filter};
use tilepipe::filters::compression::CompressionFilter;
use tilepipe::filters::positive_delta::PositiveDeltaFilter;
use tilepipe::filters::xor::XorFilter;
use tilepipe::filters::{FilterPipeline, FilterType};
use tilepipe::storage::{Tile, WriterTile, CURRENT_FORMAT_VERSION};

use crate::support::{
    filter_unfilter, thread_pool, tile_for_unfiltering, u64_bytes,
};

fn wavy_data(nelts: u64) -> Vec<u8> {
    u64_bytes((0..nelts).map(|i| 1_000_000 + (i % 311) * 17))
}

fn uint64_tile(data: Vec<u8>) -> WriterTile {
    WriterTile::new(CURRENT_FORMAT_VERSION, DataType::Uint64, 8, data)
}

#[test]
fn every_codec_round_trips_across_chunks() -> Result<()> {
    // A small chunk cap so every codec sees many chunks.
    let raw = wavy_data(4000);
    for kind in [
        FilterType::GZip,
        FilterType::Zstd,
        FilterType::LZ4,
        FilterType::BZip2,
        FilterType::Rle,
        FilterType::Dictionary,
        FilterType::Delta,
        FilterType::DoubleDelta,
    ] {
        let pipeline = FilterPipeline::new(
            1024,
            vec![Box::new(CompressionFilter::new(kind, -1))],
        );
        let mut tile = uint64_tile(raw.clone());
        let reversed = filter_unfilter(&pipeline, &mut tile)?;
        assert_eq!(reversed, raw, "codec {:?}", kind);
    }
    Ok(())
}

#[test]
fn shuffle_then_compress_chain() -> Result<()> {
    let raw = wavy_data(2000);
    for shuffle in [true, false] {
        let shuffle_filter: Box<dyn tilepipe::filters::Filter> = if shuffle {
            Box::new(BitShuffleFilter)
        } else {
            Box::new(ByteShuffleFilter)
        };
        let pipeline = FilterPipeline::new(
            4096,
            vec![
                shuffle_filter,
                Box::new(CompressionFilter::new(FilterType::Zstd, 5)),
            ],
        );
        let mut tile = uint64_tile(raw.clone());
        assert_eq!(filter_unfilter(&pipeline, &mut tile)?, raw);
    }
    Ok(())
}

#[test]
fn windowed_encoders_then_gzip() -> Result<()> {
    let raw = u64_bytes(0..3000);
    let pipeline = FilterPipeline::new(
        2048,
        vec![
            Box::new(PositiveDeltaFilter::default()),
            Box::new(BitWidthReductionFilter::default()),
            Box::new(CompressionFilter::new(FilterType::GZip, 6)),
        ],
    );
    let mut tile = uint64_tile(raw.clone());
    assert_eq!(filter_unfilter(&pipeline, &mut tile)?, raw);
    Ok(())
}

#[test]
fn stacked_checksums_round_trip() -> Result<()> {
    let raw = wavy_data(1500);
    let pipeline = FilterPipeline::new(
        4096,
        vec![
            Box::new(ChecksumMd5Filter),
            Box::new(CompressionFilter::new(FilterType::LZ4, -1)),
            Box::new(ChecksumSha256Filter),
        ],
    );
    let mut tile = uint64_tile(raw.clone());
    assert_eq!(filter_unfilter(&pipeline, &mut tile)?, raw);
    Ok(())
}

#[test]
fn xor_chain_round_trips() -> Result<()> {
    let raw = wavy_data(1000);
    let pipeline = FilterPipeline::new(
        2048,
        vec![
            Box::new(XorFilter),
            Box::new(CompressionFilter::new(FilterType::Zstd, 3)),
        ],
    );
    let mut tile = uint64_tile(raw.clone());
    assert_eq!(filter_unfilter(&pipeline, &mut tile)?, raw);
    Ok(())
}

// Deterministic framing: two forward runs over identical inputs produce
// identical bytes even though chunks run on a pool.
#[test]
fn forward_is_deterministic() -> Result<()> {
    let pool = thread_pool();
    let raw = wavy_data(5000);
    let pipeline = FilterPipeline::new(
        512,
        vec![
            Box::new(ByteShuffleFilter),
            Box::new(CompressionFilter::new(FilterType::GZip, 6)),
        ],
    );

    let mut first = uint64_tile(raw.clone());
    pipeline.run_forward(&mut first, None, &pool)?;
    let mut second = uint64_tile(raw);
    pipeline.run_forward(&mut second, None, &pool)?;
    assert_eq!(first.filtered(), second.filtered());
    Ok(())
}

// Framing integrity: the framed length is the header plus per-chunk
// headers plus payloads, and original sizes sum to the tile size.
#[test]
fn framed_sizes_add_up() -> Result<()> {
    let pool = thread_pool();
    let raw = wavy_data(3000);
    let pipeline = FilterPipeline::new(
        1000,
        vec![Box::new(CompressionFilter::new(FilterType::Zstd, 3))],
    );
    let mut tile = uint64_tile(raw.clone());
    pipeline.run_forward(&mut tile, None, &pool)?;

    let framed = tile.filtered();
    let num_chunks =
        u64::from_le_bytes(framed[0..8].try_into().unwrap()) as usize;
    let mut offset = 8usize;
    let mut original_total = 0u64;
    for _ in 0..num_chunks {
        let original =
            u32::from_le_bytes(framed[offset..offset + 4].try_into().unwrap());
        let filtered = u32::from_le_bytes(
            framed[offset + 4..offset + 8].try_into().unwrap(),
        );
        let metadata = u32::from_le_bytes(
            framed[offset + 8..offset + 12].try_into().unwrap(),
        );
        original_total += u64::from(original);
        offset += 12 + filtered as usize + metadata as usize;
    }
    assert_eq!(offset, framed.len());
    assert_eq!(original_total, raw.len() as u64);
    Ok(())
}

#[test]
fn skip_checksum_validation_ignores_tampering() -> Result<()> {
    let pool = thread_pool();
    let raw = wavy_data(500);
    let pipeline =
        FilterPipeline::new(65536, vec![Box::new(ChecksumMd5Filter)]);
    let mut tile = uint64_tile(raw.clone());
    pipeline.run_forward(&mut tile, None, &pool)?;

    let mut tampered = tile.filtered().to_vec();
    let last = tampered.len() - 1;
    tampered[last] ^= 0xff;
    let mut unfiltered = Tile::from_filtered(
        CURRENT_FORMAT_VERSION,
        DataType::Uint64,
        8,
        tampered,
    );

    // Validating reverse fails...
    assert!(pipeline
        .run_reverse(&mut unfiltered, None, &pool, &Config::default())
        .is_err());

    // ...but the skip key accepts any structurally sound buffer.
    let mut config = Config::default();
    config.set("sm.skip_checksum_validation", "true")?;
    let mut tampered_tile = tile_for_unfiltering(&tile);
    let mut bytes = tampered_tile.filtered().to_vec();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    tampered_tile = Tile::from_filtered(
        CURRENT_FORMAT_VERSION,
        DataType::Uint64,
        8,
        bytes,
    );
    pipeline.run_reverse(&mut tampered_tile, None, &pool, &config)?;
    assert_eq!(tampered_tile.data().len(), raw.len());
    Ok(())
}

#[test]
fn incompatible_chain_is_rejected() {
    let pipeline = FilterPipeline::new(
        65536,
        vec![Box::new(CompressionFilter::new(FilterType::DoubleDelta, -1))],
    );
    let err = pipeline
        .check_filter_types(DataType::Float64, false)
        .unwrap_err();
    assert!(matches!(
        err,
        tilepipe::FilterError::FilterChainIncompatible(_)
    ));
}

#[test]
fn string_rle_consumes_offsets() -> Result<()> {
    let pool = thread_pool();
    let strings =
        ["tile", "tile", "tile", "pipe", "pipe", "line", "line", "line"];
    let values: Vec<u8> = strings.iter().flat_map(|s| s.bytes()).collect();
    let mut offsets = Vec::new();
    let mut cursor = 0u64;
    for s in &strings {
        offsets.push(cursor);
        cursor += s.len() as u64;
    }

    let pipeline = FilterPipeline::new(
        65536,
        vec![Box::new(CompressionFilter::new(FilterType::Rle, -1))],
    );
    assert!(pipeline.skip_offsets_filtering(
        DataType::StringAscii,
        CURRENT_FORMAT_VERSION
    ));
    assert!(!pipeline.use_tile_chunking(
        true,
        CURRENT_FORMAT_VERSION,
        DataType::StringAscii
    ));

    let mut tile = WriterTile::new(
        CURRENT_FORMAT_VERSION,
        DataType::StringAscii,
        1,
        values.clone(),
    );
    let mut offsets_tile =
        WriterTile::offsets(CURRENT_FORMAT_VERSION, &offsets);
    pipeline.run_forward(&mut tile, Some(&mut offsets_tile), &pool)?;
    assert_eq!(offsets_tile.size(), 0, "offsets are encoded jointly");

    let mut unfiltered = Tile::from_filtered(
        CURRENT_FORMAT_VERSION,
        DataType::StringAscii,
        1,
        tile.filtered().to_vec(),
    );
    let mut offsets_out = Tile::empty_offsets(CURRENT_FORMAT_VERSION);
    pipeline.run_reverse(
        &mut unfiltered,
        Some(&mut offsets_out),
        &pool,
        &Config::default(),
    )?;
    assert_eq!(unfiltered.data(), values.as_slice());

    let decoded_offsets: Vec<u64> = offsets_out
        .data()
        .chunks_exact(8)
        .map(|raw| u64::from_le_bytes(raw.try_into().unwrap()))
        .collect();
    assert_eq!(decoded_offsets, offsets);
    Ok(())
}

#[test]
fn string_dictionary_consumes_offsets() -> Result<()> {
    let pool = thread_pool();
    let strings = ["aa", "bb", "aa", "cc", "bb", "aa"];
    let values: Vec<u8> = strings.iter().flat_map(|s| s.bytes()).collect();
    let mut offsets = Vec::new();
    let mut cursor = 0u64;
    for s in &strings {
        offsets.push(cursor);
        cursor += s.len() as u64;
    }

    let pipeline = FilterPipeline::new(
        65536,
        vec![Box::new(CompressionFilter::new(FilterType::Dictionary, -1))],
    );
    let mut tile = WriterTile::new(
        CURRENT_FORMAT_VERSION,
        DataType::StringAscii,
        1,
        values.clone(),
    );
    let mut offsets_tile =
        WriterTile::offsets(CURRENT_FORMAT_VERSION, &offsets);
    pipeline.run_forward(&mut tile, Some(&mut offsets_tile), &pool)?;

    let mut unfiltered = Tile::from_filtered(
        CURRENT_FORMAT_VERSION,
        DataType::StringAscii,
        1,
        tile.filtered().to_vec(),
    );
    let mut offsets_out = Tile::empty_offsets(CURRENT_FORMAT_VERSION);
    pipeline.run_reverse(
        &mut unfiltered,
        Some(&mut offsets_out),
        &pool,
        &Config::default(),
    )?;
    assert_eq!(unfiltered.data(), values.as_slice());
    Ok(())
}

#[test]
fn webp_pipeline_is_not_chunked() -> Result<()> {
    use tilepipe::filters::webp::{WebpFilter, WebpInputFormat};

    let pool = thread_pool();
    let width = 64usize;
    let height = 48usize;
    let mut pixels = Vec::with_capacity(width * height * 3);
    for y in 0..height {
        for x in 0..width {
            pixels.push((x * 4) as u8);
            pixels.push((y * 5) as u8);
            pixels.push(200);
        }
    }

    let pipeline = FilterPipeline::new(
        1024,
        vec![Box::new(WebpFilter::new(
            100.0,
            WebpInputFormat::Rgb,
            true,
            height as u16,
            (width * 3) as u16,
        )?)],
    );
    assert!(!pipeline.use_tile_chunking(
        false,
        CURRENT_FORMAT_VERSION,
        DataType::Uint8
    ));

    let mut tile = WriterTile::new(
        CURRENT_FORMAT_VERSION,
        DataType::Uint8,
        1,
        pixels.clone(),
    );
    pipeline.run_forward(&mut tile, None, &pool)?;
    assert_eq!(
        u64::from_le_bytes(tile.filtered()[0..8].try_into().unwrap()),
        1,
        "the whole image is one chunk"
    );

    let mut unfiltered = Tile::from_filtered(
        CURRENT_FORMAT_VERSION,
        DataType::Uint8,
        1,
        tile.filtered().to_vec(),
    );
    pipeline.run_reverse(&mut unfiltered, None, &pool, &Config::default())?;
    assert_eq!(unfiltered.data(), pixels.as_slice());
    Ok(())
}

#[test]
fn zero_chunk_cap_disables_chunking() -> Result<()> {
    let pool = thread_pool();
    let raw = wavy_data(2000);
    let pipeline = FilterPipeline::new(
        0,
        vec![Box::new(CompressionFilter::new(FilterType::GZip, 6))],
    );
    let mut tile = uint64_tile(raw.clone());
    pipeline.run_forward(&mut tile, None, &pool)?;
    assert_eq!(
        u64::from_le_bytes(tile.filtered()[0..8].try_into().unwrap()),
        1,
        "chunking disabled"
    );

    let mut unfiltered = tile_for_unfiltering(&tile);
    pipeline.run_reverse(&mut unfiltered, None, &pool, &Config::default())?;
    assert_eq!(unfiltered.data(), raw.as_slice());
    Ok(())
}

#[test]
fn empty_tile_round_trips() -> Result<()> {
    let pool = thread_pool();
    let pipeline = FilterPipeline::new(
        65536,
        vec![Box::new(CompressionFilter::new(FilterType::Zstd, 3))],
    );
    let mut tile = uint64_tile(Vec::new());
    pipeline.run_forward(&mut tile, None, &pool)?;
    let mut unfiltered = tile_for_unfiltering(&tile);
    pipeline.run_reverse(&mut unfiltered, None, &pool, &Config::default())?;
    assert!(unfiltered.data().is_empty());
    Ok(())
}
