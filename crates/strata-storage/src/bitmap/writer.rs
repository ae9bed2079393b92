//! Single-writer side of a bitmap index.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};

use tracing::{debug, error, info, warn};

use super::{
    Cursor, KEY_ENTRY_OFFSET_COUNT_CHECK, KEY_ENTRY_OFFSET_FIRST_VALUE_BLOCK_OFFSET,
    KEY_ENTRY_OFFSET_LAST_VALUE_BLOCK_OFFSET, KEY_ENTRY_OFFSET_VALUE_COUNT, KEY_ENTRY_SIZE,
    KEY_FILE_RESERVED, KEY_RESERVED_OFFSET_BLOCK_VALUE_COUNT, KEY_RESERVED_OFFSET_KEY_COUNT,
    KEY_RESERVED_OFFSET_SEQUENCE, KEY_RESERVED_OFFSET_SEQUENCE_CHECK,
    KEY_RESERVED_OFFSET_SIGNATURE, KEY_RESERVED_OFFSET_VALUE_MEM_SIZE, SIGNATURE,
    VALUE_BLOCK_FILE_RESERVED, block_capacity, key_entry_offset, key_file_path, seek_value_block,
    value_file_path,
};
use crate::config::StorageConfig;
use crate::ff::FilesFacade;
use crate::memory::{AppendOnlyFile, FilePages, PagedMemory};
use crate::{Corruption, Result, StorageError};

/// Appends row ids to per-key lists in a bitmap index.
///
/// Every mutation is published so that a concurrent
/// [`BitmapIndexReader`](super::BitmapIndexReader) on the same files sees
/// either the previous or the new state of a key, never a torn one. There
/// must be at most one writer per index.
#[derive(Debug)]
pub struct BitmapIndexWriter {
    key_mem: AppendOnlyFile,
    value_mem: AppendOnlyFile,
    block_value_count_mod: u64,
    block_capacity: u64,
    key_count: u64,
    value_mem_size: u64,
}

impl BitmapIndexWriter {
    /// Open the index `name` in `dir`, creating it if the key file does not
    /// exist.
    ///
    /// `config` is validated first; an invalid one fails with
    /// [`StorageError::Config`] before any file is touched.
    ///
    /// An existing index is validated: header length, signature, key count
    /// against file length, header sequence, value file length, and block
    /// value count. Any failure is a [`StorageError::Corruption`].
    pub fn open(
        ff: Arc<dyn FilesFacade>,
        config: &StorageConfig,
        dir: impl AsRef<Path>,
        name: &str,
    ) -> Result<Self> {
        // a bad block size must not reach the header of a new index
        config.validate()?;

        let key_path = key_file_path(&dir, name);
        let exists = ff.exists(&key_path);
        let mut key_mem = AppendOnlyFile::open_rw(ff.clone(), &key_path, config.file_page_size)?;
        if !exists {
            init_key_memory(&mut key_mem, config.index_value_block_size)?;
        }

        let key_mem_size = key_mem.append_offset();
        if key_mem_size < KEY_FILE_RESERVED {
            error!(path = %key_path.display(), length = key_mem_size, "file too short [corrupt]");
            return Err(StorageError::corruption(
                &key_path,
                Corruption::TooShort {
                    length: key_mem_size,
                    required: KEY_FILE_RESERVED,
                },
            ));
        }

        let signature = key_mem.get_byte(KEY_RESERVED_OFFSET_SIGNATURE) as u8;
        if signature != SIGNATURE {
            error!(path = %key_path.display(), signature, "unknown format [corrupt]");
            return Err(StorageError::corruption(
                &key_path,
                Corruption::UnknownSignature { found: signature },
            ));
        }

        let key_count = key_mem.get_long(KEY_RESERVED_OFFSET_KEY_COUNT) as u64;
        let expected = key_count
            .checked_mul(KEY_ENTRY_SIZE)
            .and_then(|n| n.checked_add(KEY_FILE_RESERVED))
            .unwrap_or(u64::MAX);
        if key_mem_size != expected {
            error!(
                path = %key_path.display(),
                key_count,
                expected,
                actual = key_mem_size,
                "key count does not match file length [corrupt]"
            );
            return Err(StorageError::corruption(
                &key_path,
                Corruption::KeyCountMismatch {
                    key_count,
                    expected,
                    actual: key_mem_size,
                },
            ));
        }

        let sequence = key_mem.get_long(KEY_RESERVED_OFFSET_SEQUENCE);
        let check = key_mem.get_long(KEY_RESERVED_OFFSET_SEQUENCE_CHECK);
        if sequence != check {
            error!(path = %key_path.display(), sequence, check, "sequence mismatch [corrupt]");
            return Err(StorageError::corruption(
                &key_path,
                Corruption::SequenceMismatch { sequence, check },
            ));
        }

        let value_mem_size = key_mem.get_long(KEY_RESERVED_OFFSET_VALUE_MEM_SIZE) as u64;
        let value_path = value_file_path(&dir, name);
        let value_mem = AppendOnlyFile::open_rw(ff, &value_path, config.file_page_size)?;
        if value_mem.append_offset() != value_mem_size {
            error!(
                path = %value_path.display(),
                expected = value_mem_size,
                actual = value_mem.append_offset(),
                "incorrect file size [corrupt]"
            );
            return Err(StorageError::corruption(
                &value_path,
                Corruption::ValueFileSize {
                    expected: value_mem_size,
                    actual: value_mem.append_offset(),
                },
            ));
        }

        let raw_block_value_count = key_mem.get_int(KEY_RESERVED_OFFSET_BLOCK_VALUE_COUNT);
        let Some(block_value_count) = u32::try_from(raw_block_value_count)
            .ok()
            .filter(|n| n.is_power_of_two())
        else {
            error!(
                path = %key_path.display(),
                block_value_count = raw_block_value_count,
                "invalid block value count [corrupt]"
            );
            return Err(StorageError::corruption(
                &key_path,
                Corruption::BlockValueCount(raw_block_value_count),
            ));
        };
        let block_value_count = u64::from(block_value_count);

        info!(
            path = %key_path.display(),
            key_count,
            value_mem_size,
            block_value_count,
            "opened index writer"
        );
        Ok(Self {
            key_mem,
            value_mem,
            block_value_count_mod: block_value_count - 1,
            block_capacity: block_capacity(block_value_count),
            key_count,
            value_mem_size,
        })
    }

    /// Number of key entries, including sparse ones.
    pub const fn key_count(&self) -> u64 {
        self.key_count
    }

    /// Logical size of the value file.
    pub const fn value_mem_size(&self) -> u64 {
        self.value_mem_size
    }

    /// Row ids per value block.
    pub const fn block_value_count(&self) -> u64 {
        self.block_value_count_mod + 1
    }

    /// Append `value` to the list of `key`.
    ///
    /// Keys need not be dense: adding key 5 to an empty index creates empty
    /// entries for keys 0 to 4.
    pub fn add(&mut self, key: u32, value: i64) -> Result<()> {
        let offset = key_entry_offset(key);
        if u64::from(key) < self.key_count {
            let block = self.key_long(offset + KEY_ENTRY_OFFSET_LAST_VALUE_BLOCK_OFFSET);
            let count = self.key_long(offset + KEY_ENTRY_OFFSET_VALUE_COUNT);
            let cell = count & self.block_value_count_mod;
            if cell > 0 {
                debug_assert!(block + self.block_capacity <= self.value_mem_size);
                self.append_value(offset, block, count, cell, value)
            } else if count == 0 {
                // entry left empty by a sparse add
                self.init_value_block_and_store_value(offset, value)
            } else {
                debug_assert!(block + self.block_capacity <= self.value_mem_size);
                self.add_value_block_and_store_value(offset, block, count, value)
            }
        } else {
            self.init_value_block_and_store_value(offset, value)?;
            self.update_key_count(key)
        }
    }

    /// Cursor over the values of `key`, newest first. Empty for unknown keys.
    pub fn get_cursor(&self, key: u32) -> Cursor<'_, PagedMemory<FilePages>> {
        if u64::from(key) >= self.key_count {
            return Cursor::empty(&*self.value_mem);
        }
        let offset = key_entry_offset(key);
        Cursor::new(
            &*self.value_mem,
            self.key_long(offset + KEY_ENTRY_OFFSET_VALUE_COUNT),
            self.key_long(offset + KEY_ENTRY_OFFSET_LAST_VALUE_BLOCK_OFFSET),
            self.block_value_count_mod,
            self.block_capacity,
        )
    }

    /// Drop every value greater than `max_value`.
    ///
    /// Each key's values must be ascending. Value blocks past the last
    /// retained one are released from the logical size of the value file.
    /// Must not run concurrently with [`add`](Self::add).
    pub fn rollback_values(&mut self, max_value: i64) -> Result<()> {
        let mut value_mem_size = 0;
        for key in 0..self.key_count {
            let offset = KEY_FILE_RESERVED + key * KEY_ENTRY_SIZE;
            let count = self.key_long(offset + KEY_ENTRY_OFFSET_VALUE_COUNT);
            if count == 0 {
                continue;
            }

            let block = self.key_long(offset + KEY_ENTRY_OFFSET_LAST_VALUE_BLOCK_OFFSET);
            let (seek_count, seek_block) = seek_value_block(
                &*self.value_mem,
                count,
                block,
                max_value,
                self.block_value_count_mod,
                self.block_capacity,
            );

            if seek_count != count || seek_block != block {
                self.publish_key_long(offset + KEY_ENTRY_OFFSET_VALUE_COUNT, seek_count)?;
                if seek_block != block {
                    fence(Ordering::Release);
                    self.put_key_long(offset + KEY_ENTRY_OFFSET_LAST_VALUE_BLOCK_OFFSET, seek_block)?;
                }
                self.publish_key_long(offset + KEY_ENTRY_OFFSET_COUNT_CHECK, seek_count)?;
            }

            if seek_count > 0 {
                value_mem_size = value_mem_size.max(seek_block + self.block_capacity);
            }
        }

        debug!(
            path = %self.value_mem.path().display(),
            max_value,
            from = self.value_mem_size,
            to = value_mem_size,
            "rolled back values"
        );
        self.value_mem_size = value_mem_size;
        self.update_value_mem_size()
    }

    /// Set both files to their logical sizes and close them.
    pub fn close(&mut self) {
        if self.key_mem.is_closed() {
            return;
        }
        let key_mem_size = self.key_mem_size();
        if let Err(err) = self.key_mem.set_size(key_mem_size) {
            warn!(path = %self.key_mem.path().display(), error = %err, "cannot set key file size");
        }
        self.key_mem.close(true);

        if let Err(err) = self.value_mem.set_size(self.value_mem_size) {
            warn!(path = %self.value_mem.path().display(), error = %err, "cannot set value file size");
        }
        self.value_mem.close(true);
    }

    const fn key_mem_size(&self) -> u64 {
        KEY_FILE_RESERVED + self.key_count * KEY_ENTRY_SIZE
    }

    fn key_long(&self, offset: u64) -> u64 {
        self.key_mem.get_long(offset) as u64
    }

    fn put_key_long(&mut self, offset: u64, value: u64) -> Result<()> {
        self.key_mem.put_long_at(offset, value as i64)
    }

    fn publish_key_long(&mut self, offset: u64, value: u64) -> Result<()> {
        self.key_mem.put_long_release(offset, value as i64)
    }

    /// A free cell remains in the last block.
    fn append_value(&mut self, offset: u64, block: u64, count: u64, cell: u64, value: i64) -> Result<()> {
        self.value_mem.put_long_at(block + cell * 8, value)?;
        self.publish_key_long(offset + KEY_ENTRY_OFFSET_VALUE_COUNT, count + 1)?;
        self.publish_key_long(offset + KEY_ENTRY_OFFSET_COUNT_CHECK, count + 1)
    }

    /// First value of a key; first and last block are the same.
    fn init_value_block_and_store_value(&mut self, offset: u64, value: i64) -> Result<()> {
        let block = self.allocate_value_block_and_store(value)?;

        self.publish_key_long(offset + KEY_ENTRY_OFFSET_VALUE_COUNT, 1)?;
        // pointers must not become visible before the count
        fence(Ordering::Release);
        self.put_key_long(offset + KEY_ENTRY_OFFSET_FIRST_VALUE_BLOCK_OFFSET, block)?;
        self.put_key_long(offset + KEY_ENTRY_OFFSET_LAST_VALUE_BLOCK_OFFSET, block)?;
        self.publish_key_long(offset + KEY_ENTRY_OFFSET_COUNT_CHECK, 1)
    }

    /// Last block is full: chain a new one after it.
    fn add_value_block_and_store_value(&mut self, offset: u64, block: u64, count: u64, value: i64) -> Result<()> {
        let new_block = self.allocate_value_block_and_store(value)?;

        // link both ways before the count makes the block reachable
        let trailer = self.block_capacity - VALUE_BLOCK_FILE_RESERVED;
        self.value_mem.put_long_at(new_block + trailer, block as i64)?;
        self.value_mem.put_long_at(block + trailer + 8, new_block as i64)?;

        self.publish_key_long(offset + KEY_ENTRY_OFFSET_VALUE_COUNT, count + 1)?;
        fence(Ordering::Release);
        self.put_key_long(offset + KEY_ENTRY_OFFSET_LAST_VALUE_BLOCK_OFFSET, new_block)?;
        self.publish_key_long(offset + KEY_ENTRY_OFFSET_COUNT_CHECK, count + 1)
    }

    fn allocate_value_block_and_store(&mut self, value: i64) -> Result<u64> {
        let block = self.value_mem_size;
        self.value_mem.put_long_at(block, value)?;
        self.value_mem_size += self.block_capacity;
        debug!(path = %self.value_mem.path().display(), block, "allocated value block");
        self.update_value_mem_size()?;
        Ok(block)
    }

    fn update_key_count(&mut self, key: u32) -> Result<()> {
        self.key_count = u64::from(key) + 1;
        let key_count = self.key_count;
        self.update_header_field(KEY_RESERVED_OFFSET_KEY_COUNT, key_count)
    }

    fn update_value_mem_size(&mut self) -> Result<()> {
        let size = self.value_mem_size;
        self.update_header_field(KEY_RESERVED_OFFSET_VALUE_MEM_SIZE, size)
    }

    fn update_header_field(&mut self, field: u64, value: u64) -> Result<()> {
        let sequence = self.key_long(KEY_RESERVED_OFFSET_SEQUENCE) + 1;
        self.put_key_long(KEY_RESERVED_OFFSET_SEQUENCE, sequence)?;
        fence(Ordering::Release);
        self.put_key_long(field, value)?;
        fence(Ordering::Release);
        self.put_key_long(KEY_RESERVED_OFFSET_SEQUENCE_CHECK, sequence)
    }
}

impl Drop for BitmapIndexWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Write the header of an empty index with the cursor left at the first
/// key entry.
fn init_key_memory(key_mem: &mut AppendOnlyFile, block_value_count: u32) -> Result<()> {
    key_mem.put_byte(SIGNATURE as i8)?;
    key_mem.put_long(1)?; // sequence
    fence(Ordering::Release);
    key_mem.put_long(0)?; // value mem size
    key_mem.put_int(block_value_count as i32)?;
    key_mem.put_long(0)?; // key count
    fence(Ordering::Release);
    key_mem.put_long(1)?; // sequence check
    let pad = KEY_FILE_RESERVED - key_mem.append_offset();
    key_mem.skip(pad)
}
