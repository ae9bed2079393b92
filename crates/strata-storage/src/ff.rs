//! File system facade.
//!
//! Everything this crate needs from the operating system goes through
//! [`FilesFacade`]: open, length, truncate and memory-map. Table-level code
//! injects its own implementation (for example to count open files or to
//! simulate failures); [`DefaultFilesFacade`] is the plain `std::fs` +
//! `memmap2` implementation.
//!
//! ## Platform support
//!
//! - Unix: page size from `sysconf(_SC_PAGESIZE)`, truncation of mapped
//!   files is unrestricted
//! - Windows: 64 KiB allocation granularity; a file with live views cannot
//!   be shrunk below the mapped range, so the facade reports a restricted
//!   file system

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use memmap2::{Mmap, MmapMut, MmapOptions};

/// Mapping granularity used where the OS cannot be asked.
const FALLBACK_PAGE_SIZE: usize = 64 * 1024;

/// Narrow file system capability consumed by the storage layer.
pub trait FilesFacade: Send + Sync {
    /// Open a file for reading and writing, creating it if missing.
    fn open_rw(&self, path: &Path) -> io::Result<File>;

    /// Open an existing file for reading.
    fn open_ro(&self, path: &Path) -> io::Result<File>;

    /// Check whether a file exists.
    fn exists(&self, path: &Path) -> bool;

    /// Current file length in bytes.
    fn length(&self, file: &File) -> io::Result<u64>;

    /// Grow or shrink a file to `size` bytes. Growth zero-fills.
    fn truncate(&self, file: &File, size: u64) -> io::Result<()>;

    /// Map `len` bytes at `offset` for reading and writing.
    fn mmap_rw(&self, file: &File, offset: u64, len: usize) -> io::Result<MmapMut>;

    /// Map the first `len` bytes of a file for reading.
    fn mmap_ro(&self, file: &File, len: usize) -> io::Result<Mmap>;

    /// Granularity that mapping offsets must be aligned to.
    fn map_page_size(&self) -> usize {
        os_page_size()
    }

    /// Whether the OS refuses to shrink a file that is mapped elsewhere.
    fn is_restricted_file_system(&self) -> bool {
        cfg!(windows)
    }
}

/// [`FilesFacade`] over `std::fs` and `memmap2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFilesFacade;

impl FilesFacade for DefaultFilesFacade {
    fn open_rw(&self, path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
    }

    fn open_ro(&self, path: &Path) -> io::Result<File> {
        File::open(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn length(&self, file: &File) -> io::Result<u64> {
        file.metadata().map(|m| m.len())
    }

    fn truncate(&self, file: &File, size: u64) -> io::Result<()> {
        file.set_len(size)
    }

    #[allow(unsafe_code)]
    fn mmap_rw(&self, file: &File, offset: u64, len: usize) -> io::Result<MmapMut> {
        // SAFETY: the mapped range lies within the file (callers grow the
        // file first). Other processes may write the same file; readers of
        // this crate tolerate that through the fenced publish protocol.
        unsafe { MmapOptions::new().offset(offset).len(len).map_mut(file) }
    }

    #[allow(unsafe_code)]
    fn mmap_ro(&self, file: &File, len: usize) -> io::Result<Mmap> {
        // SAFETY: read-only view; the single writer only appends or
        // overwrites fields that readers re-validate.
        unsafe { MmapOptions::new().len(len).map(file) }
    }
}

/// OS page size (mapping granularity).
#[cfg(unix)]
#[allow(unsafe_code)]
pub fn os_page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size)
        .ok()
        .filter(|s| s.is_power_of_two())
        .unwrap_or(FALLBACK_PAGE_SIZE)
}

/// OS page size (mapping granularity).
#[cfg(not(unix))]
pub fn os_page_size() -> usize {
    FALLBACK_PAGE_SIZE
}
