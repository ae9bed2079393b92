//! Pages and the sources that produce them.

use std::convert::Infallible;
use std::ops::{Deref, DerefMut};

use memmap2::MmapMut;

/// A fixed-size block of addressable memory owned by a
/// [`PagedMemory`](super::PagedMemory).
pub enum Page {
    /// Zero-initialised heap allocation.
    Heap(Box<[u8]>),
    /// Writable window of a memory-mapped file.
    Mapped(MmapMut),
}

impl Page {
    /// Allocate a zero-filled heap page.
    pub fn zeroed(size: usize) -> Self {
        Self::Heap(vec![0u8; size].into_boxed_slice())
    }
}

impl Deref for Page {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Heap(bytes) => bytes,
            Self::Mapped(map) => map,
        }
    }
}

impl DerefMut for Page {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self {
            Self::Heap(bytes) => bytes,
            Self::Mapped(map) => map,
        }
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Heap(bytes) => f.debug_tuple("Heap").field(&bytes.len()).finish(),
            Self::Mapped(map) => f.debug_tuple("Mapped").field(&map.len()).finish(),
        }
    }
}

/// Capability to materialise pages for a paged memory region.
///
/// The memory asks for a page the first time an offset inside it is
/// written, and hands every page back through [`release_page`] when the
/// region is closed.
///
/// [`release_page`]: PageProvider::release_page
pub trait PageProvider {
    /// Error raised when a page cannot be produced.
    type Error;

    /// Produce page `index` of `page_size` bytes.
    fn map_page(&mut self, index: usize, page_size: usize) -> Result<Page, Self::Error>;

    /// Take back a page. Dropping the page releases its memory.
    fn release_page(&mut self, _index: usize, page: Page) {
        drop(page);
    }
}

/// Pure in-memory page source.
///
/// Allocation failure aborts the process; there is no partial page state
/// to fall back to.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapPages;

impl PageProvider for HeapPages {
    type Error = Infallible;

    fn map_page(&mut self, _index: usize, page_size: usize) -> Result<Page, Infallible> {
        Ok(Page::zeroed(page_size))
    }
}
