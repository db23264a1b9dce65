/*
 * Created on Wed Feb 14 2024
 *
 * This file is a part of Stormcache
 * Stormcache is a free and open-source in-memory key/value cache engine that
 * aims to deliver predictable latency under heavy multi-core concurrency
 * without compromising on correctness or memory safety.
 *
 * Copyright (c) 2024, the Stormcache authors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

use {
    crate::{
        error::{EngineError, EngineResult},
        idx::mtcht::meta::MAX_KEY_LENGTH,
    },
    serde::Deserialize,
};

#[derive(Debug, PartialEq, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
/// Engine configuration. Every knob has a production default; the enclosing
/// server hands this struct over after decoding its own configuration file
pub struct EngineConfig {
    /// Requested bucket count; rounded up to the next power of two
    pub initial_buckets: usize,
    /// Interleave the table backing store across the NUMA nodes in
    /// `numa_mask`
    pub numa_aware: bool,
    /// Bitmask of NUMA nodes eligible for interleaving (bit n = node n)
    pub numa_mask: u64,
    /// Longest accepted key in bytes; hard-clamped at 65535
    pub max_key_length: u32,
    /// Back the table with 2 MiB pages when the kernel has them free
    pub use_huge_pages_2m: bool,
    pub gc: GcConfig,
}

#[derive(Debug, PartialEq, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct GcConfig {
    /// Per-thread staging ring capacity (rounded up to a power of two). A
    /// thread whose ring fills up drains synchronously, so this bounds
    /// memory, not correctness
    pub staging_capacity: usize,
    /// Collector pass period in milliseconds
    pub loop_wait_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_buckets: 1 << 16,
            numa_aware: false,
            numa_mask: 0,
            max_key_length: MAX_KEY_LENGTH,
            use_huge_pages_2m: false,
            gc: GcConfig::default(),
        }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            staging_capacity: 16384,
            loop_wait_ms: 20,
        }
    }
}

impl EngineConfig {
    /// Decode a YAML configuration document
    pub fn from_yaml(doc: &str) -> EngineResult<Self> {
        let config: Self = serde_yaml::from_str(doc).map_err(|e| {
            log::error!("failed to decode engine configuration: {e}");
            EngineError::BadConfiguration
        })?;
        Ok(config.validated())
    }
    /// Apply the hard limits, warning when a knob had to be clamped
    pub fn validated(&self) -> Self {
        let mut config = self.clone();
        if config.max_key_length > MAX_KEY_LENGTH {
            log::warn!(
                "max_key_length {} exceeds the engine limit; clamping to {MAX_KEY_LENGTH}",
                config.max_key_length
            );
            config.max_key_length = MAX_KEY_LENGTH;
        }
        if config.max_key_length == 0 {
            config.max_key_length = MAX_KEY_LENGTH;
        }
        if config.gc.staging_capacity < 2 {
            config.gc.staging_capacity = 2;
        }
        if config.gc.loop_wait_ms == 0 {
            config.gc.loop_wait_ms = 1;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::{EngineConfig, GcConfig};

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.initial_buckets, 1 << 16);
        assert_eq!(config.max_key_length, 65535);
        assert!(!config.numa_aware);
        assert!(!config.use_huge_pages_2m);
        assert_eq!(config.gc, GcConfig::default());
    }

    #[test]
    fn decode_partial_document() {
        let config = EngineConfig::from_yaml(
            r#"
initial_buckets: 4096
use_huge_pages_2m: true
gc:
  loop_wait_ms: 5
"#,
        )
        .unwrap();
        assert_eq!(config.initial_buckets, 4096);
        assert!(config.use_huge_pages_2m);
        assert_eq!(config.gc.loop_wait_ms, 5);
        // untouched knobs keep their defaults
        assert_eq!(config.gc.staging_capacity, 16384);
        assert_eq!(config.max_key_length, 65535);
    }

    #[test]
    fn clamps_key_length() {
        let config = EngineConfig::from_yaml("max_key_length: 1000000").unwrap();
        assert_eq!(config.max_key_length, 65535);
    }

    #[test]
    fn rejects_unknown_fields() {
        assert_eq!(
            EngineConfig::from_yaml("initial_bucketz: 12"),
            Err(crate::error::EngineError::BadConfiguration)
        );
    }
}
