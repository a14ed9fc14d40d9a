// This file is part of tilepipe released under the MIT license.
// Copyright (c) 2023 TileDB, Inc.

use crate::datatype::DataType;
use crate::error::Result;

pub mod bzip2;
pub mod delta;
pub mod dictionary;
pub mod double_delta;
pub mod gzip;
pub mod lz4;
pub mod rle;
pub mod zstd;

pub use bzip2::Bzip2Compressor;
pub use delta::DeltaCompressor;
pub use dictionary::DictionaryCompressor;
pub use double_delta::DoubleDeltaCompressor;
pub use gzip::GzipCompressor;
pub use lz4::Lz4Compressor;
pub use rle::RleCompressor;
pub use zstd::ZstdCompressor;

/// A block codec wrapped by the compression filter. Compression produces a
/// fresh encoded buffer; decompression fills a caller-allocated buffer of
/// exactly the original length.
///
/// The datatype is the element type the codec should view the bytes as;
/// byte-oriented codecs ignore it.
pub trait Compressor: Send + Sync {
    fn compress(&self, datatype: DataType, input: &[u8]) -> Result<Vec<u8>>;

    fn decompress(
        &self,
        datatype: DataType,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<()>;
}
