//! Property coverage for the numeric invariants.

use proptest::prelude::*;

use tilepipe::datatype::DataType;
use tilepipe::filters::compressors::double_delta::{
    checked_delta_i64, checked_delta_u64,
};
use tilepipe::filters::compressors::{
    Compressor, DeltaCompressor, DoubleDeltaCompressor, RleCompressor,
};

proptest! {
    // The checked unsigned delta equals the mathematical difference
    // exactly when that difference fits an int64.
    #[test]
    fn unsigned_delta_matches_wide_arithmetic(a: u64, b: u64) {
        let wide = a as i128 - b as i128;
        let fits = wide >= i64::MIN as i128 && wide <= i64::MAX as i128;
        match checked_delta_u64(a, b) {
            Some(delta) => {
                prop_assert!(fits);
                prop_assert_eq!(delta as i128, wide);
            }
            None => prop_assert!(!fits),
        }
    }

    #[test]
    fn signed_delta_matches_wide_arithmetic(a: i64, b: i64) {
        let wide = a as i128 - b as i128;
        let fits = wide >= i64::MIN as i128 && wide <= i64::MAX as i128;
        match checked_delta_i64(a, b) {
            Some(delta) => {
                prop_assert!(fits);
                prop_assert_eq!(delta as i128, wide);
            }
            None => prop_assert!(!fits),
        }
    }

    #[test]
    fn double_delta_round_trips(values in proptest::collection::vec(any::<u64>(), 0..200)) {
        let data: Vec<u8> =
            values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let codec = DoubleDeltaCompressor;
        let coded = codec.compress(DataType::Uint64, &data).unwrap();
        let mut decoded = vec![0u8; data.len()];
        codec
            .decompress(DataType::Uint64, &coded, &mut decoded)
            .unwrap();
        prop_assert_eq!(decoded, data);
    }

    #[test]
    fn delta_round_trips(values in proptest::collection::vec(any::<i32>(), 0..300)) {
        let data: Vec<u8> =
            values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let codec = DeltaCompressor;
        let coded = codec.compress(DataType::Int32, &data).unwrap();
        let mut decoded = vec![0u8; data.len()];
        codec
            .decompress(DataType::Int32, &coded, &mut decoded)
            .unwrap();
        prop_assert_eq!(decoded, data);
    }

    #[test]
    fn rle_round_trips(runs in proptest::collection::vec((any::<u16>(), 1usize..20), 0..40)) {
        let mut data = Vec::new();
        for (value, count) in &runs {
            for _ in 0..*count {
                data.extend_from_slice(&value.to_le_bytes());
            }
        }
        let codec = RleCompressor;
        let coded = codec.compress(DataType::Uint16, &data).unwrap();
        let mut decoded = vec![0u8; data.len()];
        codec
            .decompress(DataType::Uint16, &coded, &mut decoded)
            .unwrap();
        prop_assert_eq!(decoded, data);
    }
}
