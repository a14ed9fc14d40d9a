// This file is part of tilepipe released under the MIT license.
// Copyright (c) 2023 TileDB, Inc.

use thiserror::Error;

/// Error kinds surfaced by the filter pipeline and its filters.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Invalid filter option; {0}")]
    InvalidOption(String),

    #[error("Filter chain incompatible; {0}")]
    FilterChainIncompatible(String),

    #[error("Filtered chunk size {0} exceeds uint32 range")]
    ChunkSizeOverflow(u64),

    #[error("Positive delta filter error; delta is not positive")]
    NonPositiveDelta,

    #[error("{algorithm} checksum mismatch on reverse")]
    ChecksumMismatch { algorithm: &'static str },

    #[error("AES-256-GCM tag verification failed")]
    AuthTagInvalid,

    #[error("Unknown filter type tag {0}")]
    UnknownFilter(u8),

    #[error("Corrupt filtered data; {0}")]
    FormatCorrupt(String),

    #[error("{codec} codec error; {reason}")]
    CodecFailure {
        codec: &'static str,
        reason: String,
    },

    #[error("Buffer error; {0}")]
    BufferError(String),

    #[error("Invalid argument; {0}")]
    InvalidArgument(String),
}

impl FilterError {
    pub(crate) fn codec(codec: &'static str, reason: impl ToString) -> Self {
        FilterError::CodecFailure {
            codec,
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FilterError>;
