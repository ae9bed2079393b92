//! Lock-free reader of a bitmap index.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};
use std::time::{Duration, Instant};

use tracing::{error, info};

use super::{
    Cursor, KEY_ENTRY_OFFSET_COUNT_CHECK, KEY_ENTRY_OFFSET_LAST_VALUE_BLOCK_OFFSET,
    KEY_ENTRY_OFFSET_VALUE_COUNT, KEY_ENTRY_SIZE, KEY_FILE_RESERVED,
    KEY_RESERVED_OFFSET_BLOCK_VALUE_COUNT, KEY_RESERVED_OFFSET_KEY_COUNT,
    KEY_RESERVED_OFFSET_SEQUENCE, KEY_RESERVED_OFFSET_SEQUENCE_CHECK,
    KEY_RESERVED_OFFSET_SIGNATURE, KEY_RESERVED_OFFSET_VALUE_MEM_SIZE, SIGNATURE, block_capacity,
    key_entry_offset, key_file_path, value_file_path,
};
use crate::config::StorageConfig;
use crate::ff::FilesFacade;
use crate::memory::ReadOnlyFile;
use crate::{Corruption, Result, StorageError};

/// Header fields read under one consistent sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    key_count: u64,
    value_mem_size: u64,
}

/// Reads a bitmap index while a writer may be appending to it.
///
/// Each call to [`get_cursor`](Self::get_cursor) picks up keys and values
/// published since the previous call. A reader is owned by one thread;
/// open one reader per thread.
#[derive(Debug)]
pub struct BitmapIndexReader {
    key_mem: ReadOnlyFile,
    value_mem: ReadOnlyFile,
    block_value_count_mod: u64,
    block_capacity: u64,
    spin_lock_timeout: Duration,
}

impl BitmapIndexReader {
    /// Open the index `name` in `dir` for reading.
    ///
    /// Fails with [`StorageError::Timeout`] if the header stays torn for
    /// longer than the configured spin timeout.
    pub fn open(
        ff: Arc<dyn FilesFacade>,
        config: &StorageConfig,
        dir: impl AsRef<Path>,
        name: &str,
    ) -> Result<Self> {
        let key_path = key_file_path(&dir, name);
        let key_mem = ReadOnlyFile::open(ff.clone(), &key_path)?;

        if key_mem.size() < KEY_FILE_RESERVED {
            error!(path = %key_path.display(), length = key_mem.size(), "file too short [corrupt]");
            return Err(StorageError::corruption(
                &key_path,
                Corruption::TooShort {
                    length: key_mem.size(),
                    required: KEY_FILE_RESERVED,
                },
            ));
        }

        let signature = key_mem.get_byte(KEY_RESERVED_OFFSET_SIGNATURE);
        if signature != SIGNATURE {
            error!(path = %key_path.display(), signature, "unknown format [corrupt]");
            return Err(StorageError::corruption(
                &key_path,
                Corruption::UnknownSignature { found: signature },
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

        let value_mem = ReadOnlyFile::open(ff, value_file_path(&dir, name))?;
        let mut reader = Self {
            key_mem,
            value_mem,
            block_value_count_mod: block_value_count - 1,
            block_capacity: block_capacity(block_value_count),
            spin_lock_timeout: config.spin_lock_timeout,
        };
        let header = reader.refresh()?;
        info!(
            path = %key_path.display(),
            key_count = header.key_count,
            value_mem_size = header.value_mem_size,
            "opened index reader"
        );
        Ok(reader)
    }

    /// Number of keys currently published by the writer.
    pub fn key_count(&mut self) -> Result<u64> {
        self.refresh().map(|h| h.key_count)
    }

    /// Cursor over the values of `key`, newest first. Empty for keys the
    /// writer has not published.
    pub fn get_cursor(&mut self, key: u32) -> Result<Cursor<'_, ReadOnlyFile>> {
        let header = self.refresh()?;
        if u64::from(key) >= header.key_count {
            return Ok(Cursor::empty(&self.value_mem));
        }

        let offset = key_entry_offset(key);
        let deadline = Instant::now() + self.spin_lock_timeout;
        let (count, last_block) = loop {
            let check = self.key_mem.get_long_acquire(offset + KEY_ENTRY_OFFSET_COUNT_CHECK);
            let last_block = self.key_mem.get_long(offset + KEY_ENTRY_OFFSET_LAST_VALUE_BLOCK_OFFSET);
            fence(Ordering::Acquire);
            let count = self.key_mem.get_long_acquire(offset + KEY_ENTRY_OFFSET_VALUE_COUNT);
            if count == check {
                break (count as u64, last_block as u64);
            }
            if Instant::now() > deadline {
                return Err(StorageError::Timeout(format!(
                    "key entry {key} of {} stayed inconsistent for {:?}",
                    self.key_mem.path().display(),
                    self.spin_lock_timeout
                )));
            }
            std::hint::spin_loop();
        };

        if count > 0 && last_block + self.block_capacity > self.value_mem.size() {
            let length = self.value_mem.file_length()?;
            self.value_mem.grow_to(length)?;
        }

        Ok(Cursor::new(
            &self.value_mem,
            count,
            last_block,
            self.block_value_count_mod,
            self.block_capacity,
        ))
    }

    /// Read a consistent header and remap both files if they grew past it.
    fn refresh(&mut self) -> Result<Header> {
        let header = self.read_header()?;

        let key_mem_size = KEY_FILE_RESERVED + header.key_count * KEY_ENTRY_SIZE;
        if key_mem_size > self.key_mem.size() {
            let length = self.key_mem.file_length()?;
            self.key_mem.grow_to(length)?;
        }
        if header.value_mem_size > self.value_mem.size() {
            let length = self.value_mem.file_length()?;
            self.value_mem.grow_to(length)?;
        }
        Ok(header)
    }

    /// Spin until the sequence and its check agree.
    fn read_header(&self) -> Result<Header> {
        let deadline = Instant::now() + self.spin_lock_timeout;
        loop {
            let check = self.key_mem.get_long(KEY_RESERVED_OFFSET_SEQUENCE_CHECK);
            fence(Ordering::Acquire);
            let header = Header {
                key_count: self.key_mem.get_long(KEY_RESERVED_OFFSET_KEY_COUNT) as u64,
                value_mem_size: self.key_mem.get_long(KEY_RESERVED_OFFSET_VALUE_MEM_SIZE) as u64,
            };
            fence(Ordering::Acquire);
            let sequence = self.key_mem.get_long(KEY_RESERVED_OFFSET_SEQUENCE);
            if sequence == check {
                return Ok(header);
            }
            if Instant::now() > deadline {
                error!(
                    path = %self.key_mem.path().display(),
                    sequence,
                    check,
                    "header sequence did not settle"
                );
                return Err(StorageError::Timeout(format!(
                    "header of {} stayed inconsistent for {:?}",
                    self.key_mem.path().display(),
                    self.spin_lock_timeout
                )));
            }
            std::hint::spin_loop();
        }
    }
}
