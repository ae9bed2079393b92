//! Read-only whole-file mapping for concurrent readers.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering, fence};

use memmap2::Mmap;
use tracing::debug;

use crate::ff::FilesFacade;
use crate::{FileOp, Result, StorageError};

/// Read-only view of a file that another handle may be appending to.
///
/// The mapping covers the file length observed at the last
/// [`grow_to`](Self::grow_to); reads past it return zero.
pub struct ReadOnlyFile {
    ff: Arc<dyn FilesFacade>,
    file: File,
    map: Option<Mmap>,
    path: PathBuf,
}

impl ReadOnlyFile {
    /// Open an existing file and map its current length.
    pub fn open(ff: Arc<dyn FilesFacade>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = ff
            .open_ro(&path)
            .map_err(|e| StorageError::file_op(FileOp::Open, &path, 0, 0, e))?;
        let mut this = Self {
            ff,
            file,
            map: None,
            path,
        };
        let length = this.file_length()?;
        this.grow_to(length)?;
        Ok(this)
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Length of the file on disk right now.
    pub fn file_length(&self) -> Result<u64> {
        self.ff
            .length(&self.file)
            .map_err(|e| StorageError::file_op(FileOp::Length, &self.path, 0, 0, e))
    }

    /// Number of mapped bytes.
    pub fn size(&self) -> u64 {
        self.map.as_ref().map_or(0, |m| m.len() as u64)
    }

    /// Remap if `size` exceeds the mapped length.
    pub fn grow_to(&mut self, size: u64) -> Result<()> {
        if size <= self.size() {
            return Ok(());
        }
        let len = usize::try_from(size).map_err(|_| {
            StorageError::Config(format!("mapping of {size} bytes exceeds the address space"))
        })?;
        let map = self
            .ff
            .mmap_ro(&self.file, len)
            .map_err(|e| StorageError::file_op(FileOp::Map, &self.path, 0, size, e))?;
        debug!(path = %self.path.display(), size, "remapped");
        self.map = Some(map);
        Ok(())
    }

    /// Read one byte, 0 past the mapped length.
    pub fn get_byte(&self, offset: u64) -> u8 {
        self.read_array::<1>(offset)[0]
    }

    /// Read a 4-byte integer, 0 past the mapped length.
    pub fn get_int(&self, offset: u64) -> i32 {
        i32::from_le_bytes(self.read_array(offset))
    }

    /// Read an 8-byte integer, 0 past the mapped length.
    pub fn get_long(&self, offset: u64) -> i64 {
        i64::from_le_bytes(self.read_array(offset))
    }

    /// Read an 8-byte integer published with release ordering, 0 past the
    /// mapped length.
    ///
    /// Aligned fields are loaded through an `AtomicI64`; either way an
    /// acquire fence follows the load.
    #[allow(clippy::cast_ptr_alignment)]
    pub fn get_long_acquire(&self, offset: u64) -> i64 {
        let cell = self
            .map
            .as_ref()
            .zip(usize::try_from(offset).ok())
            .and_then(|(map, start)| map.get(start..start.checked_add(8)?))
            .map(|bytes| bytes.as_ptr().cast::<i64>().cast_mut())
            .filter(|cell| cell.is_aligned());
        let value = match cell {
            // SAFETY: `cell` is aligned and inside the live mapping, which
            // `&self` keeps alive. An 8-byte relaxed load is permitted on
            // read-only memory.
            #[allow(unsafe_code)]
            Some(cell) => i64::from_le(unsafe { AtomicI64::from_ptr(cell) }.load(Ordering::Relaxed)),
            None => self.get_long(offset),
        };
        fence(Ordering::Acquire);
        value
    }

    fn read_array<const N: usize>(&self, offset: u64) -> [u8; N] {
        let mut buf = [0u8; N];
        if let Some(map) = &self.map
            && let Ok(start) = usize::try_from(offset)
            && let Some(bytes) = map.get(start..start.saturating_add(N))
        {
            buf.copy_from_slice(bytes);
        }
        buf
    }
}

impl std::fmt::Debug for ReadOnlyFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadOnlyFile")
            .field("path", &self.path)
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ff::DefaultFilesFacade;
    use std::io::Write;

    #[test]
    fn test_reads_and_grows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.v");
        let mut out = std::fs::File::create(&path).unwrap();
        out.write_all(&7i64.to_le_bytes()).unwrap();
        out.flush().unwrap();

        let mut file = ReadOnlyFile::open(Arc::new(DefaultFilesFacade), &path).unwrap();
        assert_eq!(file.size(), 8);
        assert_eq!(file.get_long(0), 7);
        assert_eq!(file.get_long(8), 0);

        out.write_all(&(-3i32).to_le_bytes()).unwrap();
        out.flush().unwrap();
        assert_eq!(file.get_int(8), 0);

        let length = file.file_length().unwrap();
        file.grow_to(length).unwrap();
        assert_eq!(file.size(), 12);
        assert_eq!(file.get_int(8), -3);
        assert_eq!(file.get_byte(8), 0xfd);
    }

    #[test]
    fn test_acquire_reads_match_plain_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.k");
        let mut out = std::fs::File::create(&path).unwrap();
        for v in [11i64, -22, i64::MIN, 44] {
            out.write_all(&v.to_le_bytes()).unwrap();
        }
        out.write_all(&[0x5a; 4]).unwrap();
        out.flush().unwrap();

        let file = ReadOnlyFile::open(Arc::new(DefaultFilesFacade), &path).unwrap();
        for offset in [0, 8, 16, 24] {
            assert_eq!(file.get_long_acquire(offset), file.get_long(offset));
        }
        assert_eq!(file.get_long_acquire(16), i64::MIN);
        // unaligned and past the end
        assert_eq!(file.get_long_acquire(4), file.get_long(4));
        assert_eq!(file.get_long_acquire(32), 0);
        assert_eq!(file.get_long_acquire(1 << 20), 0);
    }

    #[test]
    fn test_empty_file_has_no_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.v");
        std::fs::File::create(&path).unwrap();

        let file = ReadOnlyFile::open(Arc::new(DefaultFilesFacade), &path).unwrap();
        assert_eq!(file.size(), 0);
        assert_eq!(file.get_long(0), 0);
    }

    #[test]
    fn test_missing_file_is_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ReadOnlyFile::open(Arc::new(DefaultFilesFacade), dir.path().join("none.k")).unwrap_err();
        assert!(matches!(err, StorageError::FileOp { op: FileOp::Open, .. }));
    }
}
