//! Tunable storage constants.
//!
//! [`EcsConfig`] is plain data: it can be built in code, or loaded from a JSON
//! document where every field is optional and falls back to its default.

use serde::{Deserialize, Serialize};

use crate::EcsError;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Default size of a single data block in bytes (16 KiB).
pub const DEFAULT_BLOCK_SIZE: usize = 16 * 1024;

/// Default number of freed indices that must queue up before one is reused.
pub const DEFAULT_MIN_FREE_INDICES_BEFORE_REUSE: usize = 32;

// ---------------------------------------------------------------------------
// EcsConfig
// ---------------------------------------------------------------------------

/// Configuration for a [`World`](crate::world::World) and its storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EcsConfig {
    /// Size in bytes of every data block handed out by the block allocator.
    pub block_size: usize,
    /// The free list must hold *more* than this many indices before the
    /// entity manager starts recycling them. `0` recycles immediately.
    pub min_free_indices_before_reuse: usize,
    /// Upper bound on the number of entity indices ever handed out.
    pub max_entity_count: u32,
    /// Optional cap on live blocks for the default heap allocator.
    pub max_blocks: Option<usize>,
}

impl Default for EcsConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            min_free_indices_before_reuse: DEFAULT_MIN_FREE_INDICES_BEFORE_REUSE,
            max_entity_count: u32::MAX,
            max_blocks: None,
        }
    }
}

impl EcsConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`EcsError::Config`] if the document is malformed or the
    /// resulting values fail [`validate`](Self::validate).
    pub fn from_json_str(json: &str) -> Result<Self, EcsError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| EcsError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the values describe a usable storage setup.
    ///
    /// # Errors
    ///
    /// Returns [`EcsError::Config`] naming the offending field.
    pub fn validate(&self) -> Result<(), EcsError> {
        if self.block_size < 64 {
            return Err(EcsError::Config(format!(
                "block_size must be at least 64 bytes, got {}",
                self.block_size
            )));
        }
        if self.block_size > u32::MAX as usize {
            return Err(EcsError::Config(format!(
                "block_size must fit in 32 bits, got {}",
                self.block_size
            )));
        }
        if self.max_entity_count == 0 {
            return Err(EcsError::Config(
                "max_entity_count must be non-zero".to_owned(),
            ));
        }
        if self.max_blocks == Some(0) {
            return Err(EcsError::Config(
                "max_blocks must be non-zero when set".to_owned(),
            ));
        }
        Ok(())
    }
}
