//! End-to-end pipeline scenarios over literal inputs.

use anyhow::Result;

use tilepipe::config::Config;
use tilepipe::datatype::DataType;
use tilepipe::error::FilterError;
use tilepipe::filters::bit_width_reduction::BitWidthReductionFilter;
use tilepipe::filters::compression::CompressionFilter;
use tilepipe::filters::encryption_aes256gcm::Aes256GcmFilter;
use tilepipe::filters::positive_delta::PositiveDeltaFilter;
use tilepipe::filters::scale_float::ScaleFloatFilter;
use tilepipe::filters::{FilterPipeline, FilterType};
use tilepipe::storage::{Tile, WriterTile, CURRENT_FORMAT_VERSION};

use crate::support::{
    filter_unfilter, increasing_tile, thread_pool, tile_for_unfiltering,
    u64_bytes, AddOneFilter, PseudoChecksumFilter,
};

fn header_at(framed: &[u8], offset: usize) -> (u32, u32, u32) {
    let u32_at = |at: usize| {
        u32::from_le_bytes(framed[at..at + 4].try_into().unwrap())
    };
    (u32_at(offset), u32_at(offset + 4), u32_at(offset + 8))
}

// S1: an empty pipeline frames the tile verbatim in a single chunk.
#[test]
fn empty_pipeline_single_chunk() -> Result<()> {
    let pool = thread_pool();
    let mut tile = increasing_tile(100);
    let pipeline = FilterPipeline::empty();
    pipeline.run_forward(&mut tile, None, &pool)?;

    assert_eq!(tile.size(), 0);
    let framed = tile.filtered();
    assert_eq!(framed.len(), 8 + 12 + 800);
    assert_eq!(
        u64::from_le_bytes(framed[0..8].try_into().unwrap()),
        1,
        "one chunk"
    );
    assert_eq!(header_at(framed, 8), (800, 800, 0));
    assert_eq!(&framed[20..], u64_bytes(0..100).as_slice());

    let mut unfiltered = tile_for_unfiltering(&tile);
    pipeline.run_reverse(&mut unfiltered, None, &pool, &Config::default())?;
    assert_eq!(unfiltered.data(), u64_bytes(0..100).as_slice());
    Ok(())
}

// S2: three "+1" stages shift every element by three and reverse exactly.
#[test]
fn add_one_three_times() -> Result<()> {
    let pool = thread_pool();
    let mut tile = increasing_tile(100);
    let pipeline = FilterPipeline::new(
        65536,
        vec![
            Box::new(AddOneFilter),
            Box::new(AddOneFilter),
            Box::new(AddOneFilter),
        ],
    );
    pipeline.run_forward(&mut tile, None, &pool)?;

    let framed = tile.filtered();
    assert_eq!(header_at(framed, 8), (800, 800, 0));
    assert_eq!(&framed[20..], u64_bytes(3..103).as_slice());

    let mut unfiltered = tile_for_unfiltering(&tile);
    pipeline.run_reverse(&mut unfiltered, None, &pool, &Config::default())?;
    assert_eq!(unfiltered.data(), u64_bytes(0..100).as_slice());
    Ok(())
}

// S3: var-length cells with an 80-byte chunk target split into the
// expected nine chunks without splitting any cell.
#[test]
fn var_sized_chunks() -> Result<()> {
    let pool = thread_pool();
    let cell_sizes: [u64; 15] = [
        32, 80, 48, 88, 56, 72, 8, 80, 160, 16, 16, 16, 16, 16, 96,
    ];
    let mut offsets = Vec::new();
    let mut cursor = 0u64;
    for size in cell_sizes {
        offsets.push(cursor);
        cursor += size;
    }

    let mut tile = increasing_tile(100);
    let mut offsets_tile =
        WriterTile::offsets(CURRENT_FORMAT_VERSION, &offsets);
    let pipeline = FilterPipeline::new(80, vec![]);
    pipeline.run_forward(&mut tile, Some(&mut offsets_tile), &pool)?;

    let framed = tile.filtered();
    assert_eq!(
        u64::from_le_bytes(framed[0..8].try_into().unwrap()),
        9,
        "nine chunks"
    );
    let expected_sizes = [112u32, 48, 88, 56, 80, 80, 160, 80, 96];
    let mut offset = 8usize;
    for expected in expected_sizes {
        let (original, filtered, metadata) = header_at(framed, offset);
        assert_eq!(original, expected);
        assert_eq!(filtered, expected);
        assert_eq!(metadata, 0);
        offset += 12 + filtered as usize;
    }
    assert_eq!(offset, framed.len());

    let mut unfiltered = tile_for_unfiltering(&tile);
    pipeline.run_reverse(&mut unfiltered, None, &pool, &Config::default())?;
    assert_eq!(unfiltered.data(), u64_bytes(0..100).as_slice());
    Ok(())
}

// S4: a checksum-style stage records the element sum and any bit flip in
// the chunk data fails the reverse pass.
#[test]
fn pseudo_checksum_detects_corruption() -> Result<()> {
    let pool = thread_pool();
    let mut tile = increasing_tile(100);
    let pipeline =
        FilterPipeline::new(65536, vec![Box::new(PseudoChecksumFilter)]);
    pipeline.run_forward(&mut tile, None, &pool)?;

    let framed = tile.filtered();
    assert_eq!(header_at(framed, 8), (800, 800, 8));
    let metadata =
        u64::from_le_bytes(framed[20..28].try_into().unwrap());
    assert_eq!(metadata, 4950);

    let mut unfiltered = tile_for_unfiltering(&tile);
    pipeline.run_reverse(
        &mut unfiltered,
        None,
        &pool,
        &Config::default(),
    )?;
    assert_eq!(unfiltered.data(), u64_bytes(0..100).as_slice());

    // Flip one bit inside the chunk data.
    let mut tampered = tile.filtered().to_vec();
    tampered[40] ^= 0x01;
    let mut unfiltered = Tile::from_filtered(
        CURRENT_FORMAT_VERSION,
        DataType::Uint64,
        8,
        tampered,
    );
    let err = pipeline
        .run_reverse(&mut unfiltered, None, &pool, &Config::default())
        .unwrap_err();
    assert!(matches!(err, FilterError::ChecksumMismatch { .. }));
    assert!(unfiltered.data().is_empty(), "failed reverse leaves no data");
    Ok(())
}

// S5: bit width reduction shrinks a small-range tile and reverses it.
#[test]
fn bit_width_reduction_shrinks() -> Result<()> {
    let raw = u64_bytes((0..1000).map(|i| i % 257));
    let mut tile = WriterTile::new(
        CURRENT_FORMAT_VERSION,
        DataType::Uint64,
        8,
        raw.clone(),
    );
    let pipeline = FilterPipeline::new(
        65536,
        vec![Box::new(BitWidthReductionFilter::default())],
    );
    let reversed = filter_unfilter(&pipeline, &mut tile)?;
    assert_eq!(reversed, raw);

    let mut tile = WriterTile::new(
        CURRENT_FORMAT_VERSION,
        DataType::Uint64,
        8,
        raw.clone(),
    );
    pipeline.run_forward(&mut tile, None, &thread_pool())?;
    let (original, filtered, _) = header_at(tile.filtered(), 8);
    assert_eq!(original, 8000);
    assert!(filtered < 8000, "output must shrink");
    Ok(())
}

// S6: positive delta rejects non-monotone input.
#[test]
fn positive_delta_rejects_decreasing_data() {
    let raw = u64_bytes((0..100).map(|i| 1000 - i));
    let mut tile =
        WriterTile::new(CURRENT_FORMAT_VERSION, DataType::Uint64, 8, raw);
    let pipeline = FilterPipeline::new(
        65536,
        vec![Box::new(PositiveDeltaFilter::default())],
    );
    let err = pipeline
        .run_forward(&mut tile, None, &thread_pool())
        .unwrap_err();
    assert!(matches!(err, FilterError::NonPositiveDelta));
}

// S7: AES-256-GCM recovers with the right key and rejects a key that
// differs in one byte.
#[test]
fn aes_round_trip_and_wrong_key() -> Result<()> {
    let pool = thread_pool();
    let key = [0x42u8; 32];
    let raw = u64_bytes(0..1000);
    let mut tile = WriterTile::new(
        CURRENT_FORMAT_VERSION,
        DataType::Uint64,
        8,
        raw.clone(),
    );
    let pipeline =
        FilterPipeline::new(65536, vec![Box::new(Aes256GcmFilter::new(key))]);
    pipeline.run_forward(&mut tile, None, &pool)?;

    let mut unfiltered = tile_for_unfiltering(&tile);
    pipeline.run_reverse(&mut unfiltered, None, &pool, &Config::default())?;
    assert_eq!(unfiltered.data(), raw.as_slice());

    let mut wrong_key = key;
    wrong_key[7] ^= 0x10;
    let wrong_pipeline = FilterPipeline::new(
        65536,
        vec![Box::new(Aes256GcmFilter::new(wrong_key))],
    );
    let mut unfiltered = tile_for_unfiltering(&tile);
    let err = wrong_pipeline
        .run_reverse(&mut unfiltered, None, &pool, &Config::default())
        .unwrap_err();
    assert!(matches!(err, FilterError::AuthTagInvalid));
    assert!(unfiltered.data().is_empty());
    Ok(())
}

// S8: the double delta overflow corner emits the chunk uncompressed and
// still reverses byte for byte.
#[test]
fn double_delta_overflow_chunk() -> Result<()> {
    let values = [0u64, 0x8000000000000001, 1, 2, 3, 4, 5, 6];
    let raw = u64_bytes(values.into_iter());
    let mut tile = WriterTile::new(
        CURRENT_FORMAT_VERSION,
        DataType::Uint64,
        8,
        raw.clone(),
    );
    let pipeline = FilterPipeline::new(
        65536,
        vec![Box::new(CompressionFilter::new(FilterType::DoubleDelta, -1))],
    );
    let reversed = filter_unfilter(&pipeline, &mut tile)?;
    assert_eq!(reversed, raw);
    Ok(())
}

// S9: float scaling into delta (reinterpreted as int32) into bit width
// reduction validates as a chain and reconstructs within rounding.
#[test]
fn scale_float_delta_chain() -> Result<()> {
    let factor = 0.25f64;
    let values: Vec<f32> =
        (0..512).map(|i| (i as f32) * 0.26 - 66.0).collect();
    let raw: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();

    let pipeline = FilterPipeline::new(
        65536,
        vec![
            Box::new(ScaleFloatFilter::new(factor, 0.0, 4)?),
            Box::new(
                CompressionFilter::new(FilterType::Delta, -1)
                    .with_reinterpret(DataType::Int32),
            ),
            Box::new(BitWidthReductionFilter::default()),
        ],
    );
    pipeline.check_filter_types(DataType::Float32, false)?;

    let mut tile = WriterTile::new(
        CURRENT_FORMAT_VERSION,
        DataType::Float32,
        4,
        raw,
    );
    let reversed = filter_unfilter(&pipeline, &mut tile)?;
    for (chunk, original) in reversed.chunks_exact(4).zip(&values) {
        let value = f32::from_le_bytes(chunk.try_into().unwrap());
        assert!(
            (value - original).abs() <= (factor / 2.0) as f32 + f32::EPSILON,
            "{} too far from {}",
            value,
            original
        );
    }
    Ok(())
}
