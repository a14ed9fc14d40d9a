// This file is part of tilepipe released under the MIT license.
// Copyright (c) 2023 TileDB, Inc.

use crate::error::{FilterError, Result};

pub const SKIP_CHECKSUM_VALIDATION: &str = "sm.skip_checksum_validation";

/// Engine configuration honored by the pipeline. Only the keys the
/// pipeline reads are represented; everything else lives with the engine.
#[derive(Clone, Debug, Default)]
pub struct Config {
    skip_checksum_validation: bool,
}

impl Config {
    pub fn skip_checksum_validation(&self) -> bool {
        self.skip_checksum_validation
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            SKIP_CHECKSUM_VALIDATION => {
                self.skip_checksum_validation = parse_bool(key, value)?;
                Ok(())
            }
            _ => Err(FilterError::InvalidArgument(format!(
                "unknown config key '{}'",
                key
            ))),
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(FilterError::InvalidArgument(format!(
            "invalid boolean '{}' for config key '{}'",
            value, key
        ))),
    }
}
