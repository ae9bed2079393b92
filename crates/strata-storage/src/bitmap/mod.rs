//! Bitmap (inverted) index: key → list of row ids.
//!
//! An index is a pair of files, written by a single
//! [`BitmapIndexWriter`] and read lock-free by any number of
//! [`BitmapIndexReader`]s.
//!
//! ## Key file (`<name>.k`)
//!
//! | Offset | Size | Field             |
//! |--------|------|-------------------|
//! | 0      | 1    | signature (`0xfa`)|
//! | 1      | 8    | sequence          |
//! | 9      | 8    | value_mem_size    |
//! | 17     | 4    | block_value_count |
//! | 21     | 8    | key_count         |
//! | 29     | 8    | sequence_check    |
//! | 37     | 27   | reserved          |
//!
//! followed by one 32-byte entry per key at `64 + key * 32`:
//!
//! | Offset | Size | Field                    |
//! |--------|------|--------------------------|
//! | 0      | 8    | value_count              |
//! | 8      | 8    | first_value_block_offset |
//! | 16     | 8    | last_value_block_offset  |
//! | 24     | 8    | value_count_check        |
//!
//! ## Value file (`<name>.v`)
//!
//! A sequence of value blocks, each `block_value_count` row ids followed by
//! a 16-byte trailer holding the offsets of the previous and next block of
//! the same key.
//!
//! ## Publication
//!
//! The writer stores data before the count that makes it visible and writes
//! each check field last. Readers read the check field first and the
//! guarded field last, and retry until the two agree. Key entry fields are
//! 8-byte aligned, so their count and check are release stores and acquire
//! loads on `AtomicI64`. The unaligned header fields are ordered by fences.

use std::path::{Path, PathBuf};

use crate::memory::{PageProvider, PagedMemory, ReadOnlyFile};

pub mod reader;
pub mod writer;

pub use reader::BitmapIndexReader;
pub use writer::BitmapIndexWriter;

/// Key file signature byte.
pub const SIGNATURE: u8 = 0xfa;

/// Bytes reserved for the key file header.
pub const KEY_FILE_RESERVED: u64 = 64;

/// Header field offsets.
pub const KEY_RESERVED_OFFSET_SIGNATURE: u64 = 0;
/// Header field offsets.
pub const KEY_RESERVED_OFFSET_SEQUENCE: u64 = 1;
/// Header field offsets.
pub const KEY_RESERVED_OFFSET_VALUE_MEM_SIZE: u64 = 9;
/// Header field offsets.
pub const KEY_RESERVED_OFFSET_BLOCK_VALUE_COUNT: u64 = 17;
/// Header field offsets.
pub const KEY_RESERVED_OFFSET_KEY_COUNT: u64 = 21;
/// Header field offsets.
pub const KEY_RESERVED_OFFSET_SEQUENCE_CHECK: u64 = 29;

/// Size of a key entry.
pub const KEY_ENTRY_SIZE: u64 = 32;

/// Key entry field offsets.
pub const KEY_ENTRY_OFFSET_VALUE_COUNT: u64 = 0;
/// Key entry field offsets.
pub const KEY_ENTRY_OFFSET_FIRST_VALUE_BLOCK_OFFSET: u64 = 8;
/// Key entry field offsets.
pub const KEY_ENTRY_OFFSET_LAST_VALUE_BLOCK_OFFSET: u64 = 16;
/// Key entry field offsets.
pub const KEY_ENTRY_OFFSET_COUNT_CHECK: u64 = 24;

/// Trailer of a value block: previous and next block offsets.
pub const VALUE_BLOCK_FILE_RESERVED: u64 = 16;

/// Path of the key file of index `name` in `dir`.
pub fn key_file_path(dir: impl AsRef<Path>, name: &str) -> PathBuf {
    dir.as_ref().join(format!("{name}.k"))
}

/// Path of the value file of index `name` in `dir`.
pub fn value_file_path(dir: impl AsRef<Path>, name: &str) -> PathBuf {
    dir.as_ref().join(format!("{name}.v"))
}

/// Offset of the entry for `key` in the key file.
pub const fn key_entry_offset(key: u32) -> u64 {
    KEY_FILE_RESERVED + key as u64 * KEY_ENTRY_SIZE
}

/// Bytes occupied by one value block of `block_value_count` row ids.
pub const fn block_capacity(block_value_count: u64) -> u64 {
    block_value_count * 8 + VALUE_BLOCK_FILE_RESERVED
}

/// Memory that value blocks can be read from.
pub trait ValueMemory {
    /// Read the 8-byte value at `offset`.
    fn value_at(&self, offset: u64) -> i64;
}

impl<P: PageProvider> ValueMemory for PagedMemory<P> {
    fn value_at(&self, offset: u64) -> i64 {
        self.get_long(offset)
    }
}

impl ValueMemory for ReadOnlyFile {
    fn value_at(&self, offset: u64) -> i64 {
        self.get_long(offset)
    }
}

/// Find how many of a key's values are `<= max_value`.
///
/// Starts from the last block of the key and walks backward over blocks
/// whose first value exceeds `max_value`, then binary-searches the block
/// that holds the boundary. Values of a key must be ascending. Returns the
/// retained count and the block holding the last retained value (the
/// original `block` when nothing is dropped, the earliest visited block
/// when nothing is retained).
pub fn seek_value_block<M: ValueMemory + ?Sized>(
    mem: &M,
    mut count: u64,
    mut block: u64,
    max_value: i64,
    block_value_count_mod: u64,
    block_capacity: u64,
) -> (u64, u64) {
    while count > 0 {
        let cells = ((count - 1) & block_value_count_mod) + 1;
        if mem.value_at(block) <= max_value {
            // first index in the block holding a value above max
            let (mut lo, mut hi) = (1, cells);
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                if mem.value_at(block + mid * 8) <= max_value {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            return (count - cells + lo, block);
        }
        count -= cells;
        if count > 0 {
            block = mem.value_at(block + block_capacity - VALUE_BLOCK_FILE_RESERVED) as u64;
        }
    }
    (0, block)
}

/// Iterator over the row ids of one key, newest first.
pub struct Cursor<'a, M: ValueMemory + ?Sized> {
    mem: &'a M,
    remaining: u64,
    block: u64,
    block_value_count_mod: u64,
    block_capacity: u64,
}

impl<'a, M: ValueMemory + ?Sized> Cursor<'a, M> {
    pub(crate) const fn new(
        mem: &'a M,
        count: u64,
        last_block: u64,
        block_value_count_mod: u64,
        block_capacity: u64,
    ) -> Self {
        Self {
            mem,
            remaining: count,
            block: last_block,
            block_value_count_mod,
            block_capacity,
        }
    }

    pub(crate) const fn empty(mem: &'a M) -> Self {
        Self::new(mem, 0, 0, 0, 0)
    }
}

impl<M: ValueMemory + ?Sized> Iterator for Cursor<'_, M> {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let cell = self.remaining & self.block_value_count_mod;
        let value = self.mem.value_at(self.block + cell * 8);
        if cell == 0 && self.remaining > 0 {
            // continue in the previous block
            self.block = self
                .mem
                .value_at(self.block + self.block_capacity - VALUE_BLOCK_FILE_RESERVED)
                as u64;
        }
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        (n, Some(n))
    }
}

impl<M: ValueMemory + ?Sized> ExactSizeIterator for Cursor<'_, M> {}

impl<M: ValueMemory + ?Sized> std::fmt::Debug for Cursor<'_, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("remaining", &self.remaining)
            .field("block", &self.block)
            .finish_non_exhaustive()
    }
}
