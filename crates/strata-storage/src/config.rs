//! Configuration for the storage system

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ff;
use crate::{Result, StorageError};

/// Configuration for the storage system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Page size for file-backed memory (rounded up to the OS mapping granularity)
    pub file_page_size: usize,

    /// Number of row ids per bitmap index value block (power of two)
    pub index_value_block_size: u32,

    /// Page size for in-memory map regions
    pub map_page_size: usize,

    /// Expected number of distinct map keys before the first grow
    pub map_key_capacity: u64,

    /// Ratio of live map entries to slots, strictly between 0 and 1
    pub map_load_factor: f64,

    /// How long a reader spins waiting for a consistent index header
    #[serde(with = "duration_micros")]
    pub spin_lock_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            file_page_size: ff::os_page_size(),
            index_value_block_size: 256,
            map_page_size: 4 * 1024 * 1024, // 4 MB
            map_key_capacity: 2048,
            map_load_factor: 0.5,
            spin_lock_timeout: Duration::from_secs(1),
        }
    }
}

impl StorageConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the page size for file-backed memory
    #[must_use]
    pub const fn with_file_page_size(mut self, size: usize) -> Self {
        self.file_page_size = size;
        self
    }

    /// Set the number of values per bitmap index block
    #[must_use]
    pub const fn with_index_value_block_size(mut self, count: u32) -> Self {
        self.index_value_block_size = count;
        self
    }

    /// Set the page size for map regions
    #[must_use]
    pub const fn with_map_page_size(mut self, size: usize) -> Self {
        self.map_page_size = size;
        self
    }

    /// Set the initial map key capacity
    #[must_use]
    pub const fn with_map_key_capacity(mut self, capacity: u64) -> Self {
        self.map_key_capacity = capacity;
        self
    }

    /// Set the map load factor
    #[must_use]
    pub const fn with_map_load_factor(mut self, load_factor: f64) -> Self {
        self.map_load_factor = load_factor;
        self
    }

    /// Set the reader spin timeout
    #[must_use]
    pub const fn with_spin_lock_timeout(mut self, timeout: Duration) -> Self {
        self.spin_lock_timeout = timeout;
        self
    }

    /// Check that every setting is usable
    pub fn validate(&self) -> Result<()> {
        if self.file_page_size == 0 || self.map_page_size == 0 {
            return Err(StorageError::Config("page size must be positive".to_string()));
        }
        if !self.index_value_block_size.is_power_of_two() {
            return Err(StorageError::Config(format!(
                "index value block size must be a power of two, got {}",
                self.index_value_block_size
            )));
        }
        if self.map_key_capacity == 0 {
            return Err(StorageError::Config("map key capacity must be positive".to_string()));
        }
        if !(self.map_load_factor > 0.0 && self.map_load_factor < 1.0) {
            return Err(StorageError::Config(format!(
                "map load factor must be in (0, 1), got {}",
                self.map_load_factor
            )));
        }
        Ok(())
    }
}

mod duration_micros {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_micros()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_micros)
    }
}
