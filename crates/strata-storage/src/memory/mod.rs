//! Paged virtual memory.
//!
//! [`PagedMemory`] is a logical byte space made of power-of-two pages.
//! Pages come from a [`PageProvider`]:
//!
//! - [`HeapPages`]: zero-filled heap allocations (map regions, scratch)
//! - [`FilePages`]: memory-mapped windows of a file, used through
//!   [`AppendOnlyFile`]
//!
//! Readers that must not mutate a file use [`ReadOnlyFile`], a whole-file
//! read-only mapping that is remapped as the writer grows the file.
//!
//! Offsets are plain `u64` positions in the logical space; page index is
//! `offset >> bits` and position in page is `offset & (page_size - 1)`.

pub mod append;
pub mod page;
pub mod paged;
pub mod read_only;

pub use append::{AppendOnlyFile, FilePages};
pub use page::{HeapPages, Page, PageProvider};
pub use paged::{BinView, PagedMemory, StrView};
pub use read_only::ReadOnlyFile;
