/*!
 * Allocator Configuration
 *
 * Runtime configuration of an [`crate::Allocator`]. Loaded from code,
 * from `SUBALLOC_*` environment variables or from JSON.
 */

use super::types::{MemorySegment, Strategy};
use crate::core::errors::{AllocError, AllocResult};
use crate::core::limits::DEFAULT_PREFERRED_BLOCK_SIZE;
use crate::core::types::DeviceSize;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Allocator-wide settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Block size default pools grow towards (default: 64MB)
    pub preferred_block_size: DeviceSize,

    /// Bytes reserved after every pool allocation (default: 0)
    pub debug_margin: DeviceSize,

    /// Alignment floor applied to every pool allocation (default: 0)
    pub min_allocation_alignment: DeviceSize,

    /// Give every default-pool allocation its own region
    pub always_committed: bool,

    /// Report default-pool allocations as not zero-initialized
    pub default_pools_not_zeroed: bool,

    /// Strategy used when a request carries no strategy flag
    pub default_strategy: Strategy,

    /// Budget of local memory when the provider reports none
    pub local_budget: Option<DeviceSize>,

    /// Budget of non-local memory when the provider reports none
    pub non_local_budget: Option<DeviceSize>,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            preferred_block_size: DEFAULT_PREFERRED_BLOCK_SIZE,
            debug_margin: 0,
            min_allocation_alignment: 0,
            always_committed: false,
            default_pools_not_zeroed: false,
            default_strategy: Strategy::MinMemory,
            local_budget: None,
            non_local_budget: None,
        }
    }
}

impl AllocatorConfig {
    /// Smaller blocks and offset-ordered placement
    pub const fn low_fragmentation() -> Self {
        Self {
            preferred_block_size: DEFAULT_PREFERRED_BLOCK_SIZE / 4,
            debug_margin: 0,
            min_allocation_alignment: 0,
            always_committed: false,
            default_pools_not_zeroed: false,
            default_strategy: Strategy::MinOffset,
            local_budget: None,
            non_local_budget: None,
        }
    }

    /// Guard bytes after every allocation to catch overruns
    pub const fn debug() -> Self {
        Self {
            preferred_block_size: DEFAULT_PREFERRED_BLOCK_SIZE,
            debug_margin: 16,
            min_allocation_alignment: 16,
            always_committed: false,
            default_pools_not_zeroed: true,
            default_strategy: Strategy::MinMemory,
            local_budget: None,
            non_local_budget: None,
        }
    }

    /// Fallback budget of a segment
    pub fn segment_budget(&self, segment: MemorySegment) -> Option<DeviceSize> {
        match segment {
            MemorySegment::Local => self.local_budget,
            MemorySegment::NonLocal => self.non_local_budget,
        }
    }

    /// Start from the defaults and apply `SUBALLOC_*` overrides
    ///
    /// Environment variables:
    /// - SUBALLOC_PREFERRED_BLOCK_SIZE, SUBALLOC_DEBUG_MARGIN, SUBALLOC_MIN_ALIGNMENT: bytes
    /// - SUBALLOC_ALWAYS_COMMITTED, SUBALLOC_DEFAULT_POOLS_NOT_ZEROED: `1`/`true`
    /// - SUBALLOC_STRATEGY: `min_memory`, `min_time` or `min_offset`
    /// - SUBALLOC_LOCAL_BUDGET, SUBALLOC_NON_LOCAL_BUDGET: bytes
    pub fn from_env() -> AllocResult<Self> {
        let mut config = Self::default();

        if let Some(v) = env_parse("SUBALLOC_PREFERRED_BLOCK_SIZE")? {
            config.preferred_block_size = v;
        }
        if let Some(v) = env_parse("SUBALLOC_DEBUG_MARGIN")? {
            config.debug_margin = v;
        }
        if let Some(v) = env_parse("SUBALLOC_MIN_ALIGNMENT")? {
            config.min_allocation_alignment = v;
        }
        if let Some(v) = env_flag("SUBALLOC_ALWAYS_COMMITTED") {
            config.always_committed = v;
        }
        if let Some(v) = env_flag("SUBALLOC_DEFAULT_POOLS_NOT_ZEROED") {
            config.default_pools_not_zeroed = v;
        }
        if let Ok(raw) = std::env::var("SUBALLOC_STRATEGY") {
            config.default_strategy = match raw.trim() {
                "min_memory" => Strategy::MinMemory,
                "min_time" => Strategy::MinTime,
                "min_offset" => Strategy::MinOffset,
                other => {
                    return Err(AllocError::invalid(format!(
                        "SUBALLOC_STRATEGY: unknown strategy '{}'",
                        other
                    )))
                }
            };
        }
        if let Some(v) = env_parse("SUBALLOC_LOCAL_BUDGET")? {
            config.local_budget = Some(v);
        }
        if let Some(v) = env_parse("SUBALLOC_NON_LOCAL_BUDGET")? {
            config.non_local_budget = Some(v);
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document; missing fields keep their defaults
    pub fn from_json(json: &str) -> AllocResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| AllocError::invalid(format!("allocator config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AllocResult<()> {
        if self.preferred_block_size == 0 {
            return Err(AllocError::invalid("preferred_block_size must be non-zero"));
        }
        if self.min_allocation_alignment != 0 && !self.min_allocation_alignment.is_power_of_two() {
            return Err(AllocError::invalid(
                "min_allocation_alignment must be 0 or a power of two",
            ));
        }
        if self.debug_margin >= self.preferred_block_size {
            return Err(AllocError::invalid(
                "debug_margin must be smaller than preferred_block_size",
            ));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> AllocResult<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| AllocError::invalid(format!("{}: cannot parse '{}'", key, raw))),
        Err(_) => Ok(None),
    }
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}
