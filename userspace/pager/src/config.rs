// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! TOML configuration for the block cache and fork range.
//!
//! ```toml
//! [cache]
//! window-base = 0x10000000
//! window-size = 0xC0000000
//! eviction = "clock"
//! capacity = 16
//! pinned-blocks = 2
//! self-test = true
//!
//! [fork]
//! user-base = 0x800000
//! stack-top = 0xeebfe000
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::layout::{
    is_page_aligned, BLOCK_SIZE, DISKMAP, DISKSIZE, EXCEPTION_STACK, PAGE_SIZE, PFTEMP, USTACKTOP,
    UTEXT, UTOP, UXSTACKTOP,
};

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read pager config {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The document is not valid TOML or has unknown keys.
    #[error("failed to parse pager config: {source}")]
    Parse {
        /// Underlying parse error.
        #[source]
        source: toml::de::Error,
    },
    /// Values parsed but are inconsistent.
    #[error("invalid pager config: {0}")]
    Invalid(&'static str),
}

/// Block-cache replacement policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionMode {
    /// Blocks stay resident once loaded.
    #[default]
    None,
    /// Second-chance eviction over a fixed-capacity ring.
    Clock,
}

/// `[cache]` table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct CacheConfig {
    /// Virtual address of block 0.
    pub window_base: usize,
    /// Bytes of address space reserved for the window.
    pub window_size: usize,
    /// Replacement policy.
    pub eviction: EvictionMode,
    /// Ring capacity in clock mode.
    pub capacity: usize,
    /// Blocks up to and including this number are never evicted.
    pub pinned_blocks: u32,
    /// Number of blocks on the device, when known up front.
    pub total_blocks: Option<u32>,
    /// Run the flush/unmap self-test during init.
    pub self_test: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            window_base: DISKMAP,
            window_size: DISKSIZE,
            eviction: EvictionMode::None,
            capacity: 16,
            pinned_blocks: 2,
            total_blocks: None,
            self_test: true,
        }
    }
}

/// `[fork]` table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ForkConfig {
    /// Lowest address duplicated.
    pub user_base: usize,
    /// End of the duplicated range (exclusive).
    pub stack_top: usize,
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self { user_base: UTEXT, stack_top: USTACKTOP }
    }
}

/// Complete pager configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PagerConfig {
    /// Block-cache settings.
    pub cache: CacheConfig,
    /// Fork settings.
    pub fork: ForkConfig,
}

impl PagerConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(src).map_err(|source| ConfigError::Parse { source })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads, parses and validates the file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&data)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate()?;
        self.fork.validate()
    }
}

impl CacheConfig {
    /// Checks window placement and ring sizing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_page_aligned(self.window_base) {
            return Err(ConfigError::Invalid("cache window base is not page aligned"));
        }
        if self.window_size == 0 || self.window_size % BLOCK_SIZE != 0 {
            return Err(ConfigError::Invalid(
                "cache window size must be a non-zero multiple of the block size",
            ));
        }
        let end = match self.window_base.checked_add(self.window_size) {
            Some(end) if end <= UTOP => end,
            _ => {
                return Err(ConfigError::Invalid(
                    "cache window extends past the user address space",
                ))
            }
        };
        let overlaps = |lo: usize, hi: usize| self.window_base < hi && lo < end;
        if overlaps(EXCEPTION_STACK, UXSTACKTOP) {
            return Err(ConfigError::Invalid("cache window overlaps the exception stack"));
        }
        if overlaps(PFTEMP, PFTEMP + PAGE_SIZE) {
            return Err(ConfigError::Invalid(
                "cache window overlaps the copy-on-write scratch page",
            ));
        }
        if self.eviction == EvictionMode::Clock && self.capacity == 0 {
            return Err(ConfigError::Invalid("clock eviction needs a non-zero capacity"));
        }
        if self.total_blocks == Some(0) {
            return Err(ConfigError::Invalid("total-blocks must be non-zero"));
        }
        Ok(())
    }

    /// Number of blocks the window can address.
    pub fn window_blocks(&self) -> usize {
        self.window_size / BLOCK_SIZE
    }
}

impl ForkConfig {
    /// Checks that the duplicated range is page aligned and below the exception stack.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_page_aligned(self.user_base) || !is_page_aligned(self.stack_top) {
            return Err(ConfigError::Invalid("fork range is not page aligned"));
        }
        if self.user_base >= self.stack_top {
            return Err(ConfigError::Invalid("fork range is empty"));
        }
        if self.stack_top > EXCEPTION_STACK {
            return Err(ConfigError::Invalid("fork range overlaps the exception stack"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let cfg = PagerConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, PagerConfig::default());
        assert_eq!(cfg.cache.eviction, EvictionMode::None);
        assert_eq!(cfg.fork.stack_top, USTACKTOP);
    }

    #[test]
    fn partial_tables_keep_remaining_defaults() {
        let cfg = PagerConfig::from_toml_str(
            r#"
            [cache]
            eviction = "clock"
            capacity = 3
            total-blocks = 64
            "#,
        )
        .unwrap();
        assert_eq!(cfg.cache.eviction, EvictionMode::Clock);
        assert_eq!(cfg.cache.capacity, 3);
        assert_eq!(cfg.cache.total_blocks, Some(64));
        assert_eq!(cfg.cache.window_base, DISKMAP);
        assert_eq!(cfg.cache.pinned_blocks, 2);
    }

    #[test]
    fn rejects_inconsistent_values() {
        let src = "[cache]\neviction = \"clock\"\ncapacity = 0\n";
        let err = PagerConfig::from_toml_str(src).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = PagerConfig::from_toml_str("[cache]\nwindow-base = 0x10000010\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = PagerConfig::from_toml_str("[fork]\nstack-top = 0xeec00000\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("fork range overlaps the exception stack")));
    }

    #[test]
    fn window_must_avoid_reserved_pages() {
        let cfg = CacheConfig {
            window_base: EXCEPTION_STACK - PAGE_SIZE,
            window_size: 2 * PAGE_SIZE,
            ..CacheConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid("cache window overlaps the exception stack"))
        ));

        let cfg =
            CacheConfig { window_base: PFTEMP, window_size: PAGE_SIZE, ..CacheConfig::default() };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid("cache window overlaps the copy-on-write scratch page"))
        ));

        let cfg = CacheConfig {
            window_base: PFTEMP + PAGE_SIZE,
            window_size: PAGE_SIZE,
            ..CacheConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn unknown_keys_are_parse_errors() {
        let err = PagerConfig::from_toml_str("[cache]\nsize = 4\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
