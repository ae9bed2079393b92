//! Storage substrate for a columnar database engine.
//!
//! This crate provides the lowest storage layer that table readers and
//! writers are built on:
//!
//! - **Paged memory**: a growable sequence of power-of-two pages with an
//!   append cursor and random-access typed reads/writes that transparently
//!   split across page boundaries ([`memory::PagedMemory`])
//! - **Append-only files**: paged memory whose pages are memory-mapped
//!   windows of a backing file ([`memory::AppendOnlyFile`])
//! - **Bitmap indexes**: crash-resilient key → row-id lists for symbol
//!   columns, written by a single writer and read lock-free
//!   ([`bitmap::BitmapIndexWriter`], [`bitmap::BitmapIndexReader`])
//! - **Composite-key maps**: off-heap open-addressing hash tables used by
//!   group-by and distinct ([`map::CompositeKeyMap`])
//!
//! # Example
//!
//! ```rust,ignore
//! use strata_storage::bitmap::BitmapIndexWriter;
//! use strata_storage::{DefaultFilesFacade, StorageConfig};
//! use std::sync::Arc;
//!
//! # fn example() -> strata_storage::Result<()> {
//! let config = StorageConfig::new();
//! let ff = Arc::new(DefaultFilesFacade);
//! let mut writer = BitmapIndexWriter::open(ff, &config, "/data/trades", "symbol")?;
//! writer.add(3, 1000)?;
//! let rows: Vec<i64> = writer.get_cursor(3).collect();
//! assert_eq!(rows, vec![1000]);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::must_use_candidate)]

use std::path::PathBuf;

use thiserror::Error;

// Paged memory and its page sources
pub mod memory;

// File system facade
pub mod ff;

// Bitmap (inverted) index
pub mod bitmap;

// Composite-key hash map
pub mod map;

// Configuration
pub mod config;

pub use config::StorageConfig;
pub use ff::{DefaultFilesFacade, FilesFacade};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A file system operation failed.
    ///
    /// Carries the operation parameters and the OS error code so the
    /// caller can decide whether to retry or distress the table.
    #[error("{op} failed [path={}, offset={offset}, size={size}, errno={errno}]: {source}", .path.display())]
    FileOp {
        /// Operation that failed.
        op: FileOp,
        /// File the operation was issued against.
        path: PathBuf,
        /// Byte offset of the operation.
        offset: u64,
        /// Byte size of the operation.
        size: u64,
        /// OS error code (0 if the OS did not report one).
        errno: i32,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A structure failed validation when it was opened.
    #[error("Data corruption detected in {}: {reason}", .path.display())]
    Corruption {
        /// File that failed validation.
        path: PathBuf,
        /// The check that failed.
        reason: Corruption,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The file backing a memory region has already been closed.
    #[error("File is closed: {}", .0.display())]
    Closed(PathBuf),

    /// A reader could not observe a consistent header in time.
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl StorageError {
    /// Build a [`StorageError::FileOp`] from an I/O error.
    pub fn file_op(
        op: FileOp,
        path: impl Into<PathBuf>,
        offset: u64,
        size: u64,
        source: std::io::Error,
    ) -> Self {
        Self::FileOp {
            op,
            path: path.into(),
            offset,
            size,
            errno: source.raw_os_error().unwrap_or(0),
            source,
        }
    }

    /// Build a [`StorageError::Corruption`].
    pub fn corruption(path: impl Into<PathBuf>, reason: Corruption) -> Self {
        Self::Corruption {
            path: path.into(),
            reason,
        }
    }

    /// OS error code carried by this error, if any.
    pub const fn errno(&self) -> Option<i32> {
        match self {
            Self::FileOp { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}

/// File system operation named in [`StorageError::FileOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOp {
    /// Opening a file.
    Open,
    /// Querying file length.
    Length,
    /// Growing or shrinking a file.
    Truncate,
    /// Mapping a file region.
    Map,
}

impl std::fmt::Display for FileOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::Length => "length",
            Self::Truncate => "truncate",
            Self::Map => "mmap",
        };
        f.write_str(name)
    }
}

/// Open-time validation failure of a bitmap index.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Corruption {
    /// File is shorter than its reserved header.
    #[error("file too short [length={length}, required={required}]")]
    TooShort {
        /// Actual file length.
        length: u64,
        /// Minimum length.
        required: u64,
    },

    /// Signature byte does not match.
    #[error("unknown format [signature={found:#04x}]")]
    UnknownSignature {
        /// Signature byte found in the file.
        found: u8,
    },

    /// Key count in the header disagrees with the file length.
    #[error("key count does not match file length [keyCount={key_count}, expected={expected}, actual={actual}]")]
    KeyCountMismatch {
        /// Key count stored in the header.
        key_count: u64,
        /// File length implied by the key count.
        expected: u64,
        /// Actual file length.
        actual: u64,
    },

    /// Header was torn by a partial write.
    #[error("sequence mismatch [sequence={sequence}, check={check}]")]
    SequenceMismatch {
        /// Leading sequence number.
        sequence: i64,
        /// Trailing sequence number.
        check: i64,
    },

    /// Value file length disagrees with the header.
    #[error("incorrect value file size [expected={expected}, actual={actual}]")]
    ValueFileSize {
        /// Size recorded in the key file header.
        expected: u64,
        /// Actual value file length.
        actual: u64,
    },

    /// Block value count is not a positive power of two.
    #[error("invalid block value count [{0}]")]
    BlockValueCount(i32),
}

/// Version information for the storage system.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Length written in place of a string or binary length for null values.
pub const NULL_LEN: i32 = -1;
