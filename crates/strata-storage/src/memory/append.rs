//! File-backed paged memory.
//!
//! [`AppendOnlyFile`] is a [`PagedMemory`] whose pages are read/write
//! mappings of consecutive windows of one file. The file is grown to the end
//! of a page before the page is mapped, so it is always a whole number of
//! pages long while open; [`AppendOnlyFile::close`] truncates it back to the
//! logical append offset.

use std::fmt;
use std::fs::File;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use super::page::{Page, PageProvider};
use super::paged::PagedMemory;
use crate::ff::FilesFacade;
use crate::{FileOp, Result, StorageError};

/// Page source mapping windows of a file.
pub struct FilePages {
    ff: Arc<dyn FilesFacade>,
    file: Option<File>,
    path: PathBuf,
}

impl FilePages {
    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&self) -> Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| StorageError::Closed(self.path.clone()))
    }

    fn length(&self) -> Result<u64> {
        let file = self.file()?;
        self.ff
            .length(file)
            .map_err(|e| StorageError::file_op(FileOp::Length, &self.path, 0, 0, e))
    }

    /// Resize the file to `size`. `offset` is where the write that needs
    /// the new size starts and is reported on failure.
    fn truncate_to(&self, offset: u64, size: u64) -> Result<()> {
        let file = self.file()?;
        self.ff
            .truncate(file, size)
            .map_err(|e| StorageError::file_op(FileOp::Truncate, &self.path, offset, size, e))
    }
}

impl PageProvider for FilePages {
    type Error = StorageError;

    fn map_page(&mut self, index: usize, page_size: usize) -> Result<Page> {
        let offset = (index * page_size) as u64;
        let target = offset + page_size as u64;
        if self.length()? < target {
            self.truncate_to(offset, target)?;
        }
        let file = self.file()?;
        let map = self
            .ff
            .mmap_rw(file, offset, page_size)
            .map_err(|e| StorageError::file_op(FileOp::Map, &self.path, offset, page_size as u64, e))?;
        Ok(Page::Mapped(map))
    }
}

impl fmt::Debug for FilePages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilePages")
            .field("path", &self.path)
            .field("open", &self.file.is_some())
            .finish_non_exhaustive()
    }
}

/// Paged memory backed by a memory-mapped file.
///
/// Dereferences to [`PagedMemory<FilePages>`] for typed reads and writes.
/// Dropping the file closes it with truncation.
#[derive(Debug)]
pub struct AppendOnlyFile {
    mem: PagedMemory<FilePages>,
}

impl AppendOnlyFile {
    /// Open or create `path` with the append cursor at 0.
    ///
    /// The page size is rounded up to a power of two no smaller than the
    /// facade's mapping granularity.
    pub fn open(ff: Arc<dyn FilesFacade>, path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = ff
            .open_rw(&path)
            .map_err(|e| StorageError::file_op(FileOp::Open, &path, 0, 0, e))?;
        let page_size = page_size.max(ff.map_page_size()).next_power_of_two();
        info!(path = %path.display(), page_size, "open");

        let pages = FilePages {
            ff,
            file: Some(file),
            path,
        };
        Ok(Self {
            mem: PagedMemory::with_provider(pages, page_size),
        })
    }

    /// Open or create `path`, map its existing content and position the
    /// append cursor at the current file length.
    pub fn open_rw(ff: Arc<dyn FilesFacade>, path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        let mut this = Self::open(ff, path, page_size)?;
        let length = this.mem.provider().length()?;
        this.mem.map_range(length)?;
        this.mem.jump_to(length)?;
        Ok(this)
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        self.mem.provider().path()
    }

    /// Whether the backing file has been closed.
    pub fn is_closed(&self) -> bool {
        self.mem.provider().file.is_none()
    }

    /// Current length of the backing file, which is page-aligned while open.
    pub fn file_length(&self) -> Result<u64> {
        self.mem.provider().length()
    }

    /// Set the logical size; equivalent to [`PagedMemory::jump_to`].
    pub fn set_size(&mut self, size: u64) -> Result<()> {
        self.mem.jump_to(size)
    }

    /// Discard all content: shrink the file to one page and restart at 0.
    pub fn truncate(&mut self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let page_size = self.mem.page_size() as u64;
        self.mem.close();
        self.mem.provider().truncate_to(0, page_size)?;
        self.mem.jump_to(0)
    }

    /// Unmap every page and close the file.
    ///
    /// With `truncate`, the file is cut to the logical append offset. If
    /// that fails on a restricted file system the size is rounded up to the
    /// next page boundary and tried once more; after that the file is
    /// closed untruncated. Closing never fails.
    pub fn close(&mut self, truncate: bool) {
        let size = self.mem.append_offset();
        let page_size = self.mem.page_size() as u64;
        self.mem.close();

        let pages = self.mem.provider_mut();
        let Some(file) = pages.file.take() else {
            return;
        };
        let path = pages.path.display();

        if !truncate {
            info!(path = %path, "closed");
            return;
        }
        match pages.ff.truncate(&file, size) {
            Ok(()) => info!(path = %path, size, "truncated and closed"),
            Err(err) => {
                if pages.ff.is_restricted_file_system() {
                    let rounded = (size / page_size + 1) * page_size;
                    if pages.ff.truncate(&file, rounded).is_ok() {
                        info!(path = %path, size = rounded, "truncated and closed, second attempt");
                        return;
                    }
                }
                warn!(
                    path = %path,
                    errno = err.raw_os_error().unwrap_or(0),
                    error = %err,
                    "closed without truncate"
                );
            }
        }
    }
}

impl Deref for AppendOnlyFile {
    type Target = PagedMemory<FilePages>;

    fn deref(&self) -> &Self::Target {
        &self.mem
    }
}

impl DerefMut for AppendOnlyFile {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.mem
    }
}

impl Drop for AppendOnlyFile {
    fn drop(&mut self) {
        self.close(true);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::ff::DefaultFilesFacade;
    use std::io;
    use tempfile::TempDir;

    /// Refuses to shrink files; optionally accepts page-aligned sizes the
    /// way a restricted file system does.
    struct ShrinkRefusingFacade {
        restricted: bool,
    }

    impl FilesFacade for ShrinkRefusingFacade {
        fn open_rw(&self, path: &Path) -> io::Result<File> {
            DefaultFilesFacade.open_rw(path)
        }
        fn open_ro(&self, path: &Path) -> io::Result<File> {
            DefaultFilesFacade.open_ro(path)
        }
        fn exists(&self, path: &Path) -> bool {
            DefaultFilesFacade.exists(path)
        }
        fn length(&self, file: &File) -> io::Result<u64> {
            DefaultFilesFacade.length(file)
        }
        fn truncate(&self, file: &File, size: u64) -> io::Result<()> {
            let shrinking = size < DefaultFilesFacade.length(file)?;
            let aligned = size % self.map_page_size() as u64 == 0;
            if shrinking && !(self.restricted && aligned) {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "mapped elsewhere"));
            }
            DefaultFilesFacade.truncate(file, size)
        }
        fn mmap_rw(&self, file: &File, offset: u64, len: usize) -> io::Result<memmap2::MmapMut> {
            DefaultFilesFacade.mmap_rw(file, offset, len)
        }
        fn mmap_ro(&self, file: &File, len: usize) -> io::Result<memmap2::Mmap> {
            DefaultFilesFacade.mmap_ro(file, len)
        }
        fn is_restricted_file_system(&self) -> bool {
            self.restricted
        }
    }

    /// Fails to grow files past `limit` bytes, or to map pages at or past
    /// `limit` when `fail_map` is set.
    struct BoundedFacade {
        limit: u64,
        fail_map: bool,
    }

    const ENOSPC: i32 = 28;
    const ENOMEM: i32 = 12;

    impl FilesFacade for BoundedFacade {
        fn open_rw(&self, path: &Path) -> io::Result<File> {
            DefaultFilesFacade.open_rw(path)
        }
        fn open_ro(&self, path: &Path) -> io::Result<File> {
            DefaultFilesFacade.open_ro(path)
        }
        fn exists(&self, path: &Path) -> bool {
            DefaultFilesFacade.exists(path)
        }
        fn length(&self, file: &File) -> io::Result<u64> {
            DefaultFilesFacade.length(file)
        }
        fn truncate(&self, file: &File, size: u64) -> io::Result<()> {
            if !self.fail_map && size > self.limit {
                return Err(io::Error::from_raw_os_error(ENOSPC));
            }
            DefaultFilesFacade.truncate(file, size)
        }
        fn mmap_rw(&self, file: &File, offset: u64, len: usize) -> io::Result<memmap2::MmapMut> {
            if self.fail_map && offset >= self.limit {
                return Err(io::Error::from_raw_os_error(ENOMEM));
            }
            DefaultFilesFacade.mmap_rw(file, offset, len)
        }
        fn mmap_ro(&self, file: &File, len: usize) -> io::Result<memmap2::Mmap> {
            DefaultFilesFacade.mmap_ro(file, len)
        }
    }

    fn setup() -> (TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("col.d");
        (dir, path)
    }

    fn page() -> usize {
        DefaultFilesFacade.map_page_size()
    }

    #[test]
    fn test_close_truncates_to_append_offset() {
        let (_dir, path) = setup();
        let mut file = AppendOnlyFile::open(Arc::new(DefaultFilesFacade), &path, page()).unwrap();
        for v in 0..100i64 {
            file.put_long(v).unwrap();
        }
        assert_eq!(file.file_length().unwrap(), page() as u64);
        file.close(true);
        assert!(file.is_closed());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 800);
    }

    #[test]
    fn test_close_without_truncate_keeps_pages() {
        let (_dir, path) = setup();
        let mut file = AppendOnlyFile::open(Arc::new(DefaultFilesFacade), &path, page()).unwrap();
        file.put_int(1).unwrap();
        file.close(false);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), page() as u64);
    }

    #[test]
    fn test_drop_closes_with_truncate() {
        let (_dir, path) = setup();
        {
            let mut file = AppendOnlyFile::open(Arc::new(DefaultFilesFacade), &path, page()).unwrap();
            file.put_str(Some("abc")).unwrap();
        }
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 10);
    }

    #[test]
    fn test_open_rw_maps_existing_content() {
        let (_dir, path) = setup();
        let ff: Arc<dyn FilesFacade> = Arc::new(DefaultFilesFacade);
        {
            let mut file = AppendOnlyFile::open(ff.clone(), &path, page()).unwrap();
            for v in 0..1000i64 {
                file.put_long(v * 3).unwrap();
            }
        }

        let mut file = AppendOnlyFile::open_rw(ff, &path, page()).unwrap();
        assert_eq!(file.append_offset(), 8000);
        assert_eq!(file.get_long(0), 0);
        assert_eq!(file.get_long(8 * 999), 2997);
        file.put_long(-1).unwrap();
        file.close(true);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8008);
    }

    #[test]
    fn test_page_size_is_at_least_mapping_granularity() {
        let (_dir, path) = setup();
        let file = AppendOnlyFile::open(Arc::new(DefaultFilesFacade), &path, 64).unwrap();
        assert_eq!(file.page_size(), page());
    }

    #[test]
    fn test_truncate_restarts_at_zero() {
        let (_dir, path) = setup();
        let mut file = AppendOnlyFile::open(Arc::new(DefaultFilesFacade), &path, page()).unwrap();
        for v in 0..2000i64 {
            file.put_long(v).unwrap();
        }
        file.truncate().unwrap();
        assert_eq!(file.append_offset(), 0);
        assert_eq!(file.file_length().unwrap(), page() as u64);
        file.put_long(42).unwrap();
        assert_eq!(file.get_long(0), 42);
    }

    #[test]
    fn test_restricted_file_system_rounds_up_to_page() {
        let (_dir, path) = setup();
        let ff = Arc::new(ShrinkRefusingFacade { restricted: true });
        let mut file = AppendOnlyFile::open(ff, &path, page()).unwrap();
        file.skip(page() as u64 + 10).unwrap();
        file.put_long(5).unwrap();
        assert_eq!(file.file_length().unwrap(), 2 * page() as u64);

        // offset is page + 18: the exact size is refused, 2 pages accepted
        file.close(true);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 2 * page() as u64);
    }

    #[test]
    fn test_failed_truncate_closes_anyway() {
        let (_dir, path) = setup();
        let ff = Arc::new(ShrinkRefusingFacade { restricted: false });
        let mut file = AppendOnlyFile::open(ff, &path, page()).unwrap();
        file.put_long(5).unwrap();
        file.close(true);
        assert!(file.is_closed());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), page() as u64);
    }

    #[cfg(unix)]
    #[test]
    fn test_open_missing_directory_reports_errno() {
        let (dir, _) = setup();
        let path = dir.path().join("missing").join("col.d");
        let err = AppendOnlyFile::open(Arc::new(DefaultFilesFacade), &path, page()).unwrap_err();
        assert!(matches!(err, StorageError::FileOp { op: FileOp::Open, .. }));
        assert_eq!(err.errno(), Some(libc::ENOENT));
    }

    #[test]
    fn test_failed_grow_reports_page_offset() {
        let (_dir, path) = setup();
        let page = page() as u64;
        let ff = Arc::new(BoundedFacade { limit: page, fail_map: false });
        let mut file = AppendOnlyFile::open(ff, &path, page as usize).unwrap();
        for v in 0..page as i64 / 8 {
            file.put_long(v + 1).unwrap();
        }

        let err = file.put_long(-1).unwrap_err();
        match err {
            StorageError::FileOp { op, offset, size, errno, .. } => {
                assert_eq!(op, FileOp::Truncate);
                assert_eq!(offset, page);
                assert_eq!(size, 2 * page);
                assert_eq!(errno, ENOSPC);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(file.get_long(0), 1);
        assert_eq!(file.get_long(page - 8), page as i64 / 8);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), page);
    }

    #[test]
    fn test_failed_map_reports_page_range() {
        let (_dir, path) = setup();
        let page = page() as u64;
        let ff = Arc::new(BoundedFacade { limit: page, fail_map: true });
        let mut file = AppendOnlyFile::open(ff, &path, page as usize).unwrap();

        let err = file.put_long_at(page + 16, 3).unwrap_err();
        assert_eq!(err.errno(), Some(ENOMEM));
        assert!(matches!(
            err,
            StorageError::FileOp { op: FileOp::Map, offset, size, .. } if offset == page && size == page
        ));
        file.put_long_at(8, 4).unwrap();
        assert_eq!(file.get_long(8), 4);
    }

    #[test]
    fn test_write_after_close_fails() {
        let (_dir, path) = setup();
        let mut file = AppendOnlyFile::open(Arc::new(DefaultFilesFacade), &path, page()).unwrap();
        file.close(true);
        assert!(matches!(file.put_long(1), Err(StorageError::Closed(_))));
    }
}
