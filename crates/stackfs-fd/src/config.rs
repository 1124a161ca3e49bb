// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fd table configuration

use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};
use crate::table::DEFAULT_BLOCK_SLOTS;

/// Highest fd number space usable by a table; fds travel as `i32`.
pub const FD_NUMBER_LIMIT: usize = i32::MAX as usize;

/// Sizing policy for an [`FdTable`](crate::FdTable).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FdTableConfig {
    /// Growth unit in slots. Capacity is always a power of two times this.
    pub block_slots: usize,
    /// Exclusive upper bound on fd numbers handed out by the table.
    pub max_fds: usize,
}

impl Default for FdTableConfig {
    fn default() -> Self {
        Self {
            block_slots: DEFAULT_BLOCK_SLOTS,
            max_fds: FD_NUMBER_LIMIT,
        }
    }
}

impl FdTableConfig {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Check the sizing policy before a table is built from it.
    ///
    /// A block may not be larger than the fd number space it serves, since the
    /// first block is allocated up front.
    pub fn validate(&self) -> FsResult<()> {
        if self.block_slots == 0 || self.max_fds == 0 || self.max_fds > FD_NUMBER_LIMIT {
            return Err(FsError::InvalidArgument);
        }
        if self.block_slots > self.max_fds {
            return Err(FsError::InvalidArgument);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let cfg = FdTableConfig::from_json_bytes(br#"{ "max-fds": 4096 }"#).expect("config");
        assert_eq!(cfg.block_slots, DEFAULT_BLOCK_SLOTS);
        assert_eq!(cfg.max_fds, 4096);
        cfg.validate().unwrap();
    }

    #[test]
    fn default_block_is_one_kib_of_slots() {
        assert_eq!(DEFAULT_BLOCK_SLOTS * std::mem::size_of::<usize>(), 1024);
        assert_eq!(FdTableConfig::default().block_slots, DEFAULT_BLOCK_SLOTS);
    }

    #[test]
    fn rejects_degenerate_values() {
        let zero_block = FdTableConfig {
            block_slots: 0,
            ..Default::default()
        };
        assert!(matches!(zero_block.validate(), Err(FsError::InvalidArgument)));

        let too_many = FdTableConfig {
            max_fds: FD_NUMBER_LIMIT + 1,
            ..Default::default()
        };
        assert!(matches!(too_many.validate(), Err(FsError::InvalidArgument)));
    }

    #[test]
    fn rejects_block_larger_than_fd_space() {
        let json = br#"{ "block-slots": 16777216, "max-fds": 8 }"#;
        let oversized = FdTableConfig::from_json_bytes(json).expect("config");
        assert!(matches!(oversized.validate(), Err(FsError::InvalidArgument)));

        let unbounded = FdTableConfig {
            block_slots: usize::MAX,
            ..Default::default()
        };
        assert!(matches!(unbounded.validate(), Err(FsError::InvalidArgument)));

        let beyond_limit = FdTableConfig {
            block_slots: FD_NUMBER_LIMIT + 1,
            ..Default::default()
        };
        assert!(matches!(beyond_limit.validate(), Err(FsError::InvalidArgument)));

        let exact = FdTableConfig {
            block_slots: 8,
            max_fds: 8,
        };
        exact.validate().unwrap();
    }

    #[test]
    fn rejects_unknown_types() {
        assert!(FdTableConfig::from_json_bytes(br#"{ "block-slots": "lots" }"#).is_err());
    }
}
