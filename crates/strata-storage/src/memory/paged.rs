//! Paged memory with an append cursor and random-access typed I/O.
//!
//! Values are little-endian. Strings are stored as a 4-byte length in
//! UTF-16 code units followed by the code units; binary values as an
//! 8-byte length followed by the bytes. A length of [`NULL_LEN`] marks a
//! null value and has no payload.
//!
//! A multi-byte value whose byte range crosses a page boundary is written
//! and read byte by byte across the two pages; variable-length payloads are
//! copied page by page. Reads of pages that were never written return
//! zeroes.

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering, fence};

use super::page::{HeapPages, Page, PageProvider};
use crate::NULL_LEN;

/// Seed of the rolling hash computed by [`PagedMemory::hash`].
pub const HASH_SEED: i64 = 179_426_491;

const STRING_LENGTH_BYTES: u64 = 4;
const BIN_LENGTH_BYTES: u64 = 8;

/// Window of the page most recently touched by a random read or write.
#[derive(Debug, Clone, Copy, Default)]
struct HotPage {
    index: usize,
    lo: u64,
    hi: u64,
}

/// Growable sequence of power-of-two pages.
///
/// The append cursor writes sequentially and maps pages as it crosses
/// them; `*_at` methods write at arbitrary offsets; `get_*` methods read at
/// arbitrary offsets through a cached hot page.
#[derive(Debug)]
pub struct PagedMemory<P: PageProvider = HeapPages> {
    provider: P,
    pages: Vec<Option<Page>>,
    page_size: usize,
    bits: u32,
    mask: u64,
    append_offset: u64,
    // logical bounds of the page the append cursor writes into
    write_page: usize,
    write_lo: u64,
    write_hi: u64,
    hot: Cell<HotPage>,
}

impl PagedMemory<HeapPages> {
    /// Create heap-backed memory. `page_size` is rounded up to a power of two.
    pub fn new(page_size: usize) -> Self {
        Self::with_provider(HeapPages, page_size)
    }
}

impl<P: PageProvider> PagedMemory<P> {
    /// Create memory whose pages come from `provider`.
    ///
    /// `page_size` is rounded up to a power of two.
    pub fn with_provider(provider: P, page_size: usize) -> Self {
        let page_size = page_size.max(1).next_power_of_two();
        Self {
            provider,
            pages: Vec::new(),
            page_size,
            bits: page_size.trailing_zeros(),
            mask: page_size as u64 - 1,
            append_offset: 0,
            write_page: 0,
            write_lo: 0,
            write_hi: 0,
            hot: Cell::new(HotPage::default()),
        }
    }

    /// Bytes a string occupies: length prefix plus UTF-16 payload.
    pub fn storage_length(value: Option<&str>) -> u64 {
        value.map_or(STRING_LENGTH_BYTES, |s| {
            STRING_LENGTH_BYTES + 2 * s.encode_utf16().count() as u64
        })
    }

    /// Bytes a binary value occupies: length prefix plus payload.
    pub fn bin_storage_length(value: Option<&[u8]>) -> u64 {
        BIN_LENGTH_BYTES + value.map_or(0, |b| b.len() as u64)
    }

    /// Page source.
    pub const fn provider(&self) -> &P {
        &self.provider
    }

    /// Mutable page source.
    pub fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    /// Page size in bytes (a power of two).
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of page slots, mapped or not, below the highest touched page.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Logical offset of the next sequential write.
    pub const fn append_offset(&self) -> u64 {
        self.append_offset
    }

    /// Bytes left in the page containing `offset`.
    pub fn page_remaining(&self, offset: u64) -> u64 {
        self.page_size as u64 - (offset & self.mask)
    }

    /// Forget the hot page so the next read resolves its page again.
    pub fn clear_hot_page(&self) {
        self.hot.set(HotPage::default());
    }

    /// Release every page and reset the cursor to 0.
    pub fn close(&mut self) {
        for (index, page) in self.pages.drain(..).enumerate() {
            if let Some(page) = page {
                self.provider.release_page(index, page);
            }
        }
        self.append_offset = 0;
        self.write_page = 0;
        self.write_lo = 0;
        self.write_hi = 0;
        self.clear_hot_page();
    }

    /// Reposition the append cursor.
    ///
    /// Subsequent `put_*` calls overwrite from `offset` onwards. Inside the
    /// current write page this only moves the cursor; otherwise the target
    /// page is mapped.
    pub fn jump_to(&mut self, offset: u64) -> Result<(), P::Error> {
        if offset < self.write_lo || offset >= self.write_hi {
            self.page_at(offset)?;
        }
        self.append_offset = offset;
        Ok(())
    }

    /// Advance the cursor by `bytes` without writing, as if zeroes were
    /// appended.
    pub fn skip(&mut self, bytes: u64) -> Result<(), P::Error> {
        let target = self.append_offset + bytes;
        if target < self.write_hi {
            self.append_offset = target;
            Ok(())
        } else {
            self.jump_to(target)
        }
    }

    /// Map every page overlapping `[0, size)` without moving the cursor.
    pub fn map_range(&mut self, size: u64) -> Result<(), P::Error> {
        let count = size.div_ceil(self.page_size as u64) as usize;
        for index in 0..count {
            self.map_write_page(index)?;
        }
        Ok(())
    }

    /// Allocate every page up to the highest touched one and zero-fill all
    /// of them.
    pub fn zero(&mut self) -> Result<(), P::Error> {
        for index in 0..self.pages.len() {
            self.map_write_page(index)?;
            self.page_mut(index).fill(0);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Sequential writes
    // ---------------------------------------------------------------------

    /// Append one byte.
    pub fn put_byte(&mut self, value: i8) -> Result<(), P::Error> {
        if self.append_offset == self.write_hi {
            self.page_at(self.append_offset)?;
        }
        let pos = (self.append_offset - self.write_lo) as usize;
        let write_page = self.write_page;
        self.page_mut(write_page)[pos] = value as u8;
        self.append_offset += 1;
        Ok(())
    }

    /// Append a boolean as one byte (`1` or `0`).
    pub fn put_bool(&mut self, value: bool) -> Result<(), P::Error> {
        self.put_byte(i8::from(value))
    }

    /// Append a 2-byte integer.
    pub fn put_short(&mut self, value: i16) -> Result<(), P::Error> {
        self.append_array(value.to_le_bytes())
    }

    /// Append a UTF-16 code unit.
    pub fn put_char(&mut self, value: u16) -> Result<(), P::Error> {
        self.append_array(value.to_le_bytes())
    }

    /// Append a 4-byte integer.
    pub fn put_int(&mut self, value: i32) -> Result<(), P::Error> {
        self.append_array(value.to_le_bytes())
    }

    /// Append an 8-byte integer.
    pub fn put_long(&mut self, value: i64) -> Result<(), P::Error> {
        self.append_array(value.to_le_bytes())
    }

    /// Append a 4-byte float.
    pub fn put_float(&mut self, value: f32) -> Result<(), P::Error> {
        self.append_array(value.to_le_bytes())
    }

    /// Append an 8-byte float.
    pub fn put_double(&mut self, value: f64) -> Result<(), P::Error> {
        self.append_array(value.to_le_bytes())
    }

    /// Append a length-prefixed string and return the offset it starts at.
    pub fn put_str(&mut self, value: Option<&str>) -> Result<u64, P::Error> {
        self.put_str_range(value, 0, usize::MAX)
    }

    /// Append `len` UTF-16 code units of `value` starting at unit `pos`,
    /// clamped to the string, and return the offset it starts at.
    pub fn put_str_range(
        &mut self,
        value: Option<&str>,
        pos: usize,
        len: usize,
    ) -> Result<u64, P::Error> {
        let offset = self.append_offset;
        match value {
            None => self.put_int(NULL_LEN)?,
            Some(s) => {
                let payload = encode_utf16(s, pos, len);
                self.put_int((payload.len() / 2) as i32)?;
                self.append_bytes(&payload)?;
            }
        }
        Ok(offset)
    }

    /// Append a null string and return its offset.
    pub fn put_null_str(&mut self) -> Result<u64, P::Error> {
        self.put_str(None)
    }

    /// Append a length-prefixed binary value and return its offset.
    pub fn put_bin(&mut self, value: Option<&[u8]>) -> Result<u64, P::Error> {
        let offset = self.append_offset;
        match value {
            None => self.put_long(i64::from(NULL_LEN))?,
            Some(bytes) => {
                self.put_long(bytes.len() as i64)?;
                self.append_bytes(bytes)?;
            }
        }
        Ok(offset)
    }

    /// Append a null binary value and return its offset.
    pub fn put_null_bin(&mut self) -> Result<u64, P::Error> {
        self.put_bin(None)
    }

    /// Append a raw byte range as a binary value and return its offset. An
    /// empty range is stored as null.
    pub fn put_raw_bin(&mut self, bytes: &[u8]) -> Result<u64, P::Error> {
        self.put_bin((!bytes.is_empty()).then_some(bytes))
    }

    // ---------------------------------------------------------------------
    // Random writes
    // ---------------------------------------------------------------------

    /// Write one byte at `offset`.
    pub fn put_byte_at(&mut self, offset: u64, value: i8) -> Result<(), P::Error> {
        if let Some((index, pos)) = self.hot_range(offset, 1) {
            self.page_mut(index)[pos] = value as u8;
            return Ok(());
        }
        let index = self.page_index(offset);
        self.map_random_write_page(index)?;
        let pos = self.offset_in_page(offset);
        self.page_mut(index)[pos] = value as u8;
        Ok(())
    }

    /// Write a boolean at `offset`.
    pub fn put_bool_at(&mut self, offset: u64, value: bool) -> Result<(), P::Error> {
        self.put_byte_at(offset, i8::from(value))
    }

    /// Write a 2-byte integer at `offset`.
    pub fn put_short_at(&mut self, offset: u64, value: i16) -> Result<(), P::Error> {
        self.write_array_at(offset, value.to_le_bytes())
    }

    /// Write a UTF-16 code unit at `offset`.
    pub fn put_char_at(&mut self, offset: u64, value: u16) -> Result<(), P::Error> {
        self.write_array_at(offset, value.to_le_bytes())
    }

    /// Write a 4-byte integer at `offset`.
    pub fn put_int_at(&mut self, offset: u64, value: i32) -> Result<(), P::Error> {
        self.write_array_at(offset, value.to_le_bytes())
    }

    /// Write an 8-byte integer at `offset`.
    pub fn put_long_at(&mut self, offset: u64, value: i64) -> Result<(), P::Error> {
        self.write_array_at(offset, value.to_le_bytes())
    }

    /// Publish an 8-byte integer at `offset` with release ordering.
    ///
    /// Aligned fields inside one page are stored through an `AtomicI64`.
    /// Anything else is a plain write behind a release fence.
    #[allow(clippy::cast_ptr_alignment)]
    pub fn put_long_release(&mut self, offset: u64, value: i64) -> Result<(), P::Error> {
        let index = self.page_index(offset);
        let pos = self.offset_in_page(offset);
        if pos + 8 > self.page_size {
            fence(Ordering::Release);
            return self.put_long_at(offset, value);
        }
        self.map_random_write_page(index)?;
        let cell = self.page_mut(index)[pos..pos + 8].as_mut_ptr().cast::<i64>();
        if !cell.is_aligned() {
            fence(Ordering::Release);
            return self.put_long_at(offset, value);
        }
        // SAFETY: `cell` is aligned and points at 8 bytes of a page this
        // memory owns exclusively through `&mut self`.
        #[allow(unsafe_code)]
        let atomic = unsafe { AtomicI64::from_ptr(cell) };
        atomic.store(value.to_le(), Ordering::Release);
        Ok(())
    }

    /// Write a 4-byte float at `offset`.
    pub fn put_float_at(&mut self, offset: u64, value: f32) -> Result<(), P::Error> {
        self.write_array_at(offset, value.to_le_bytes())
    }

    /// Write an 8-byte float at `offset`.
    pub fn put_double_at(&mut self, offset: u64, value: f64) -> Result<(), P::Error> {
        self.write_array_at(offset, value.to_le_bytes())
    }

    /// Write a length-prefixed string at `offset`.
    pub fn put_str_at(&mut self, offset: u64, value: Option<&str>) -> Result<(), P::Error> {
        self.put_str_range_at(offset, value, 0, usize::MAX)
    }

    /// Write `len` UTF-16 code units of `value` starting at unit `pos`,
    /// clamped to the string, at `offset`.
    pub fn put_str_range_at(
        &mut self,
        offset: u64,
        value: Option<&str>,
        pos: usize,
        len: usize,
    ) -> Result<(), P::Error> {
        match value {
            None => self.put_null_str_at(offset),
            Some(s) => {
                let payload = encode_utf16(s, pos, len);
                self.put_int_at(offset, (payload.len() / 2) as i32)?;
                self.write_bytes_at(offset + STRING_LENGTH_BYTES, &payload)
            }
        }
    }

    /// Write a null string at `offset`.
    pub fn put_null_str_at(&mut self, offset: u64) -> Result<(), P::Error> {
        self.put_int_at(offset, NULL_LEN)
    }

    /// Write a length-prefixed binary value at `offset`.
    pub fn put_bin_at(&mut self, offset: u64, value: Option<&[u8]>) -> Result<(), P::Error> {
        match value {
            None => self.put_long_at(offset, i64::from(NULL_LEN)),
            Some(bytes) => {
                self.put_long_at(offset, bytes.len() as i64)?;
                self.write_bytes_at(offset + BIN_LENGTH_BYTES, bytes)
            }
        }
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Read one byte.
    pub fn get_byte(&self, offset: u64) -> i8 {
        i8::from_le_bytes(self.read_array(offset))
    }

    /// Read a boolean (`true` iff the byte is 1).
    pub fn get_bool(&self, offset: u64) -> bool {
        self.get_byte(offset) == 1
    }

    /// Read a 2-byte integer.
    pub fn get_short(&self, offset: u64) -> i16 {
        i16::from_le_bytes(self.read_array(offset))
    }

    /// Read a UTF-16 code unit.
    pub fn get_char(&self, offset: u64) -> u16 {
        u16::from_le_bytes(self.read_array(offset))
    }

    /// Read a 4-byte integer.
    pub fn get_int(&self, offset: u64) -> i32 {
        i32::from_le_bytes(self.read_array(offset))
    }

    /// Read an 8-byte integer.
    pub fn get_long(&self, offset: u64) -> i64 {
        i64::from_le_bytes(self.read_array(offset))
    }

    /// Read a 4-byte float.
    pub fn get_float(&self, offset: u64) -> f32 {
        f32::from_le_bytes(self.read_array(offset))
    }

    /// Read an 8-byte float.
    pub fn get_double(&self, offset: u64) -> f64 {
        f64::from_le_bytes(self.read_array(offset))
    }

    /// Length prefix of the string at `offset` ([`NULL_LEN`] for null).
    pub fn get_str_len(&self, offset: u64) -> i32 {
        self.get_int(offset)
    }

    /// View of the string at `offset`, `None` if it is null.
    pub fn get_str(&self, offset: u64) -> Option<StrView<'_, P>> {
        let len = usize::try_from(self.get_str_len(offset)).ok()?;
        Some(StrView {
            mem: self,
            offset: offset + STRING_LENGTH_BYTES,
            len,
        })
    }

    /// Length prefix of the binary value at `offset` (-1 for null).
    pub fn get_bin_len(&self, offset: u64) -> i64 {
        self.get_long(offset)
    }

    /// View of the binary value at `offset`, `None` if it is null.
    pub fn get_bin(&self, offset: u64) -> Option<BinView<'_, P>> {
        let len = u64::try_from(self.get_bin_len(offset)).ok()?;
        Some(BinView {
            mem: self,
            offset: offset + BIN_LENGTH_BYTES,
            len,
        })
    }

    /// Rolling hash over `size` bytes starting at `offset`.
    ///
    /// `h = h * 31 + x` over 8-byte little-endian words, then over the
    /// remaining bytes sign-extended, starting from [`HASH_SEED`].
    pub fn hash(&self, offset: u64, size: u64) -> i64 {
        if let Some((index, pos)) = self.hot_range(offset, size as usize)
            && let Some(page) = self.page(index)
        {
            return hash_bytes(&page[pos..pos + size as usize]);
        }

        let words = size - (size & 7);
        let mut h = HASH_SEED;
        let mut i = 0;
        while i < words {
            h = h.wrapping_mul(31).wrapping_add(self.get_long(offset + i));
            i += 8;
        }
        for i in words..size {
            h = h.wrapping_mul(31).wrapping_add(i64::from(self.get_byte(offset + i)));
        }
        h
    }

    // ---------------------------------------------------------------------
    // Page plumbing
    // ---------------------------------------------------------------------

    fn page_index(&self, offset: u64) -> usize {
        (offset >> self.bits) as usize
    }

    fn offset_in_page(&self, offset: u64) -> usize {
        (offset & self.mask) as usize
    }

    fn page_offset(&self, index: usize) -> u64 {
        (index as u64) << self.bits
    }

    fn page(&self, index: usize) -> Option<&[u8]> {
        self.pages.get(index).and_then(|p| p.as_deref())
    }

    // only called for pages that map_write_page has produced
    fn page_mut(&mut self, index: usize) -> &mut [u8] {
        self.pages
            .get_mut(index)
            .and_then(|p| p.as_deref_mut())
            .unwrap_or_default()
    }

    fn map_write_page(&mut self, index: usize) -> Result<(), P::Error> {
        if index >= self.pages.len() {
            self.pages.resize_with(index + 1, || None);
        }
        if self.pages[index].is_none() {
            let page = self.provider.map_page(index, self.page_size)?;
            self.pages[index] = Some(page);
        }
        Ok(())
    }

    fn map_random_write_page(&mut self, index: usize) -> Result<(), P::Error> {
        self.map_write_page(index)?;
        self.set_hot_page(index);
        Ok(())
    }

    /// Make the page containing `offset` the append page.
    fn page_at(&mut self, offset: u64) -> Result<(), P::Error> {
        let index = self.page_index(offset);
        self.map_write_page(index)?;
        self.write_page = index;
        self.write_lo = self.page_offset(index);
        self.write_hi = self.write_lo + self.page_size as u64;
        Ok(())
    }

    fn set_hot_page(&self, index: usize) {
        let lo = self.page_offset(index);
        self.hot.set(HotPage {
            index,
            lo,
            hi: lo + self.page_size as u64,
        });
    }

    /// Page index and in-page position if `[offset, offset + len)` lies in
    /// the hot page.
    fn hot_range(&self, offset: u64, len: usize) -> Option<(usize, usize)> {
        let hot = self.hot.get();
        (offset >= hot.lo && offset + len as u64 <= hot.hi)
            .then(|| (hot.index, (offset - hot.lo) as usize))
    }

    fn read_array<const N: usize>(&self, offset: u64) -> [u8; N] {
        let mut buf = [0u8; N];
        if let Some((index, pos)) = self.hot_range(offset, N) {
            if let Some(page) = self.page(index) {
                buf.copy_from_slice(&page[pos..pos + N]);
            }
            return buf;
        }

        let index = self.page_index(offset);
        let pos = self.offset_in_page(offset);
        if pos + N <= self.page_size {
            if let Some(page) = self.page(index) {
                self.set_hot_page(index);
                buf.copy_from_slice(&page[pos..pos + N]);
            }
        } else {
            self.read_split(offset, &mut buf);
        }
        buf
    }

    /// Reassemble bytes from consecutive pages.
    fn read_split(&self, offset: u64, dst: &mut [u8]) {
        let mut index = self.page_index(offset);
        let mut pos = self.offset_in_page(offset);
        let mut page = self.page(index);
        for byte in dst {
            if pos == self.page_size {
                index += 1;
                pos = 0;
                page = self.page(index);
            }
            *byte = page.map_or(0, |p| p[pos]);
            pos += 1;
        }
    }

    fn append_array<const N: usize>(&mut self, bytes: [u8; N]) -> Result<(), P::Error> {
        if self.write_hi - self.append_offset >= N as u64 && self.write_hi > self.write_lo {
            let pos = (self.append_offset - self.write_lo) as usize;
            let write_page = self.write_page;
            self.page_mut(write_page)[pos..pos + N].copy_from_slice(&bytes);
            self.append_offset += N as u64;
            return Ok(());
        }
        for byte in bytes {
            self.put_byte(byte as i8)?;
        }
        Ok(())
    }

    fn append_bytes(&mut self, mut bytes: &[u8]) -> Result<(), P::Error> {
        while !bytes.is_empty() {
            if self.append_offset == self.write_hi {
                self.page_at(self.append_offset)?;
            }
            let pos = (self.append_offset - self.write_lo) as usize;
            let n = bytes.len().min(self.page_size - pos);
            let write_page = self.write_page;
            self.page_mut(write_page)[pos..pos + n].copy_from_slice(&bytes[..n]);
            self.append_offset += n as u64;
            bytes = &bytes[n..];
        }
        Ok(())
    }

    fn write_array_at<const N: usize>(&mut self, offset: u64, bytes: [u8; N]) -> Result<(), P::Error> {
        if let Some((index, pos)) = self.hot_range(offset, N) {
            self.page_mut(index)[pos..pos + N].copy_from_slice(&bytes);
            return Ok(());
        }
        let pos = self.offset_in_page(offset);
        if pos + N <= self.page_size {
            let index = self.page_index(offset);
            self.map_random_write_page(index)?;
            self.page_mut(index)[pos..pos + N].copy_from_slice(&bytes);
            return Ok(());
        }
        for (i, byte) in bytes.into_iter().enumerate() {
            self.put_byte_at(offset + i as u64, byte as i8)?;
        }
        Ok(())
    }

    fn write_bytes_at(&mut self, mut offset: u64, mut bytes: &[u8]) -> Result<(), P::Error> {
        while !bytes.is_empty() {
            let index = self.page_index(offset);
            let pos = self.offset_in_page(offset);
            let n = bytes.len().min(self.page_size - pos);
            self.map_random_write_page(index)?;
            self.page_mut(index)[pos..pos + n].copy_from_slice(&bytes[..n]);
            offset += n as u64;
            bytes = &bytes[n..];
        }
        Ok(())
    }
}

fn encode_utf16(s: &str, pos: usize, len: usize) -> Vec<u8> {
    s.encode_utf16().skip(pos).take(len).flat_map(u16::to_le_bytes).collect()
}

fn hash_bytes(bytes: &[u8]) -> i64 {
    let mut h = HASH_SEED;
    let mut words = bytes.chunks_exact(8);
    for word in &mut words {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(word);
        h = h.wrapping_mul(31).wrapping_add(i64::from_le_bytes(buf));
    }
    for &byte in words.remainder() {
        h = h.wrapping_mul(31).wrapping_add(i64::from(byte as i8));
    }
    h
}

/// Lazy view of a string stored in paged memory.
pub struct StrView<'a, P: PageProvider> {
    mem: &'a PagedMemory<P>,
    offset: u64,
    len: usize,
}

impl<P: PageProvider> StrView<'_, P> {
    /// Length in UTF-16 code units.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the string is empty.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Code unit at `index`.
    pub fn char_at(&self, index: usize) -> u16 {
        self.mem.get_char(self.offset + 2 * index as u64)
    }

    /// UTF-16 code units.
    pub fn units(&self) -> impl Iterator<Item = u16> + '_ {
        (0..self.len).map(|i| self.char_at(i))
    }

    /// Decoded characters; unpaired surrogates become U+FFFD.
    pub fn chars(&self) -> impl Iterator<Item = char> + '_ {
        char::decode_utf16(self.units()).map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
    }
}

impl<P: PageProvider> fmt::Display for StrView<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.chars().try_for_each(|c| fmt::Write::write_char(f, c))
    }
}

impl<P: PageProvider> fmt::Debug for StrView<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_string())
    }
}

impl<P: PageProvider> PartialEq<str> for StrView<'_, P> {
    fn eq(&self, other: &str) -> bool {
        self.units().eq(other.encode_utf16())
    }
}

impl<P: PageProvider> PartialEq<&str> for StrView<'_, P> {
    fn eq(&self, other: &&str) -> bool {
        *self == **other
    }
}

/// Lazy view of a binary value stored in paged memory.
pub struct BinView<'a, P: PageProvider> {
    mem: &'a PagedMemory<P>,
    offset: u64,
    len: u64,
}

impl<P: PageProvider> BinView<'_, P> {
    /// Length in bytes.
    pub const fn len(&self) -> u64 {
        self.len
    }

    /// Whether the value is empty.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Byte at `index`.
    pub fn byte_at(&self, index: u64) -> u8 {
        self.mem.get_byte(self.offset + index) as u8
    }

    /// Copy bytes starting at `start` into `dst`, stopping at the end of the
    /// value, the end of `dst` or the end of the current page. Returns the
    /// number of bytes copied.
    pub fn copy_to(&self, dst: &mut [u8], start: u64) -> usize {
        let offset = self.offset + start;
        let available = self.len.saturating_sub(start).min(self.mem.page_remaining(offset));
        let n = dst.len().min(available as usize);
        match self.mem.page(self.mem.page_index(offset)) {
            Some(page) => {
                let pos = self.mem.offset_in_page(offset);
                dst[..n].copy_from_slice(&page[pos..pos + n]);
            }
            None => dst[..n].fill(0),
        }
        n
    }

    /// Copy the whole value out.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len as usize];
        let mut copied = 0;
        while copied < out.len() {
            copied += self.copy_to(&mut out[copied..], copied as u64);
        }
        out
    }
}

impl<P: PageProvider> fmt::Debug for BinView<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinView")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    fn mem(page_size: usize) -> PagedMemory {
        PagedMemory::new(page_size)
    }

    #[test]
    fn test_page_size_rounds_to_power_of_two() {
        assert_eq!(mem(100).page_size(), 128);
        assert_eq!(mem(64).page_size(), 64);
        assert_eq!(mem(0).page_size(), 1);
    }

    #[test]
    fn test_sequential_longs_across_64_byte_pages() {
        let mut m = mem(64);
        for v in 1..=20i64 {
            let Ok(()) = m.put_long(v);
        }
        assert_eq!(m.append_offset(), 160);
        let Ok(()) = m.jump_to(0);

        let values: Vec<i64> = (0..20).map(|i| m.get_long(i * 8)).collect();
        assert_eq!(values, (1..=20).collect::<Vec<_>>());
    }

    #[test]
    fn test_long_straddling_page_boundary() {
        let mut split = mem(64);
        let mut flat = mem(4096);
        let value = 0x0102_0304_0506_0708_i64;

        let Ok(()) = split.jump_to(60);
        let Ok(()) = split.put_long(value);
        let Ok(()) = flat.jump_to(60);
        let Ok(()) = flat.put_long(value);

        assert_eq!(split.get_long(60), value);
        assert_eq!(split.get_long(60), flat.get_long(60));
        assert_eq!(split.page_count(), 2);
        // bytes landed on both pages
        assert_eq!(split.get_int(64), 0x0102_0304);
    }

    #[test]
    fn test_random_writes_straddling_boundary() {
        let mut m = mem(16);
        let Ok(()) = m.put_long_at(13, -42);
        let Ok(()) = m.put_int_at(30, 0x1122_3344);
        let Ok(()) = m.put_short_at(47, -2);
        let Ok(()) = m.put_double_at(59, 2.5);
        let Ok(()) = m.put_float_at(78, -0.75);
        let Ok(()) = m.put_char_at(95, 0x263a);

        assert_eq!(m.get_long(13), -42);
        assert_eq!(m.get_int(30), 0x1122_3344);
        assert_eq!(m.get_short(47), -2);
        assert_eq!(m.get_double(59), 2.5);
        assert_eq!(m.get_float(78), -0.75);
        assert_eq!(m.get_char(95), 0x263a);
    }

    #[test]
    fn test_release_stores() {
        let mut m = mem(64);
        let Ok(()) = m.put_long_release(8, 5);
        let Ok(()) = m.put_long_release(120, -9);
        // straddles the boundary
        let Ok(()) = m.put_long_release(60, 0x0a0b_0c0d_0e0f_1011);
        // unaligned inside a page
        let Ok(()) = m.put_long_release(19, i64::MIN);

        assert_eq!(m.get_long(8), 5);
        assert_eq!(m.get_long(120), -9);
        assert_eq!(m.get_long(60), 0x0a0b_0c0d_0e0f_1011);
        assert_eq!(m.get_long(19), i64::MIN);
        assert_eq!(m.get_byte(120), -9);
        assert_eq!(m.append_offset(), 0);

        // pages smaller than a long
        let mut tiny = mem(4);
        let Ok(()) = tiny.put_long_release(8, 77);
        assert_eq!(tiny.get_long(8), 77);
    }

    #[test]
    fn test_str_straddling_page_boundary() {
        let text = "abcdefghijklmnopqrstuvwxyz0123456789!";
        assert_eq!(text.len(), 37);

        let mut split = mem(64);
        let Ok(()) = split.jump_to(50);
        let Ok(offset) = split.put_str(Some(text));
        assert_eq!(offset, 50);
        assert_eq!(split.append_offset(), 50 + 4 + 74);

        let view = split.get_str(50).unwrap();
        assert_eq!(view.len(), 37);
        assert_eq!(view, text);
        assert_eq!(view.to_string(), text);
    }

    #[test]
    fn test_put_str_at_straddling_boundary() {
        let mut m = mem(32);
        let Ok(()) = m.put_str_at(27, Some("héllo wörld"));
        assert_eq!(m.get_str(27).unwrap().to_string(), "héllo wörld");
        assert_eq!(m.get_str_len(27), 11);
    }

    #[test]
    fn test_null_and_empty_values() {
        let mut m = mem(64);
        let Ok(null_str) = m.put_null_str();
        let Ok(empty_str) = m.put_str(Some(""));
        let Ok(null_bin) = m.put_null_bin();
        let Ok(()) = m.put_bin_at(400, Some(&b"tail"[..]));
        let Ok(empty_bin) = m.put_bin(Some(&[][..]));

        assert!(m.get_str(null_str).is_none());
        assert_eq!(m.get_str_len(null_str), NULL_LEN);
        assert!(m.get_str(empty_str).unwrap().is_empty());
        assert!(m.get_bin(null_bin).is_none());
        assert_eq!(m.get_bin_len(null_bin), -1);
        assert!(m.get_bin(empty_bin).unwrap().is_empty());
        assert_eq!(m.get_bin(400).unwrap().to_vec(), b"tail");
        assert_eq!(PagedMemory::<HeapPages>::bin_storage_length(Some(&b"tail"[..])), 12);
        assert_eq!(PagedMemory::<HeapPages>::storage_length(None), 4);
        assert_eq!(PagedMemory::<HeapPages>::storage_length(Some("ab")), 8);
    }

    #[test]
    fn test_bin_larger_than_page() {
        let mut m = mem(64);
        let payload: Vec<u8> = (0..300u32).map(|i| (i * 7) as u8).collect();
        let Ok(()) = m.put_long(99);
        let Ok(offset) = m.put_bin(Some(payload.as_slice()));
        assert_eq!(offset, 8);

        let view = m.get_bin(offset).unwrap();
        assert_eq!(view.len(), 300);
        assert_eq!(view.byte_at(299), payload[299]);
        assert_eq!(view.to_vec(), payload);

        // payload starts at 16; first chunk stops at the page end
        let mut buf = [0u8; 100];
        assert_eq!(view.copy_to(&mut buf, 0), 48);
        assert_eq!(&buf[..48], &payload[..48]);
    }

    #[test]
    fn test_str_range_across_page() {
        let mut m = mem(64);
        let Ok(()) = m.skip(54);
        let Ok(offset) = m.put_str_range(Some("xxhello worldxx"), 2, 11);
        assert_eq!(offset, 54);
        // 4-byte length then 22 bytes straddling the 64-byte boundary
        assert_eq!(m.append_offset(), 54 + 4 + 22);
        assert_eq!(m.get_str(offset).unwrap(), "hello world");

        // ranges clamp to the string
        let Ok(tail) = m.put_str_range(Some("abc"), 1, 100);
        assert_eq!(m.get_str(tail).unwrap(), "bc");
        let Ok(past) = m.put_str_range(Some("abc"), 5, 2);
        assert_eq!(m.get_str_len(past), 0);
        let Ok(null) = m.put_str_range(None, 0, 3);
        assert!(m.get_str(null).is_none());
    }

    #[test]
    fn test_str_range_counts_utf16_units() {
        let mut m = mem(64);
        // the clef is a surrogate pair, two units
        let Ok(offset) = m.put_str_range(Some("a\u{1D11E}b"), 1, 2);
        assert_eq!(m.get_str_len(offset), 2);
        assert_eq!(m.get_str(offset).unwrap(), "\u{1D11E}");

        let Ok(()) = m.put_str_range_at(100, Some("-timestamp-"), 1, 9);
        assert_eq!(m.get_str(100).unwrap(), "timestamp");
        let Ok(()) = m.put_str_range_at(100, None, 0, 1);
        assert_eq!(m.get_str_len(100), NULL_LEN);
    }

    #[test]
    fn test_raw_bin() {
        let mut m = mem(64);
        let frame: Vec<u8> = (0..200u8).collect();
        let Ok(()) = m.put_int(1);
        let Ok(offset) = m.put_raw_bin(&frame[10..90]);
        assert_eq!(offset, 4);
        assert_eq!(m.get_bin(offset).unwrap().to_vec(), &frame[10..90]);
        assert_eq!(m.append_offset(), 4 + 8 + 80);

        let Ok(empty) = m.put_raw_bin(&frame[..0]);
        assert!(m.get_bin(empty).is_none());
        assert_eq!(m.get_bin_len(empty), -1);
    }

    #[test]
    fn test_jump_to_overwrites_in_place() {
        let mut m = mem(64);
        for v in 0..4i64 {
            let Ok(()) = m.put_long(v);
        }
        let Ok(()) = m.jump_to(8);
        let Ok(()) = m.put_long(100);
        assert_eq!(m.get_long(0), 0);
        assert_eq!(m.get_long(8), 100);
        assert_eq!(m.get_long(16), 2);
        assert_eq!(m.append_offset(), 16);
    }

    #[test]
    fn test_skip_crosses_pages() {
        let mut m = mem(64);
        let Ok(()) = m.put_byte(1);
        let Ok(()) = m.skip(130);
        let Ok(()) = m.put_byte(2);
        assert_eq!(m.append_offset(), 132);
        assert_eq!(m.get_byte(0), 1);
        assert_eq!(m.get_byte(1), 0);
        assert_eq!(m.get_byte(131), 2);
    }

    #[test]
    fn test_unwritten_pages_read_as_zero() {
        let mut m = mem(64);
        let Ok(()) = m.put_long_at(640, 5);
        assert_eq!(m.get_long(320), 0);
        assert_eq!(m.get_long(632), 0);
        assert_eq!(m.get_long(640), 5);
    }

    #[test]
    fn test_hash_fast_and_slow_paths_agree() {
        let mut split = mem(16);
        let mut flat = mem(1024);
        let bytes: Vec<u8> = (0..29u8).map(|b| b.wrapping_mul(37)).collect();
        let Ok(_) = split.put_bin(Some(bytes.as_slice()));
        let Ok(_) = flat.put_bin(Some(bytes.as_slice()));

        // range crosses two page boundaries in `split`
        let slow = split.hash(8, 29);
        // warm the hot page so the fast path is taken
        flat.get_byte(8);
        let fast = flat.hash(8, 29);
        assert_eq!(slow, fast);

        split.clear_hot_page();
        assert_eq!(split.hash(8, 29), fast);
        assert_ne!(flat.hash(8, 28), fast);
    }

    #[test]
    fn test_zero_clears_every_page() {
        let mut m = mem(64);
        for v in 0..40i64 {
            let Ok(()) = m.put_long(v + 1);
        }
        let Ok(()) = m.jump_to(64 * 8);
        let Ok(()) = m.zero();
        assert_eq!(m.page_count(), 9);
        assert!((0..72).all(|i| m.get_long(i * 8) == 0));
    }

    #[test]
    fn test_close_releases_pages() {
        let mut m = mem(64);
        let Ok(()) = m.put_long(7);
        m.close();
        assert_eq!(m.page_count(), 0);
        assert_eq!(m.append_offset(), 0);
        assert_eq!(m.get_long(0), 0);

        let Ok(()) = m.put_long(8);
        assert_eq!(m.get_long(0), 8);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Values written at any offset read back regardless of page size
            #[test]
            fn random_offsets_round_trip(
                writes in prop::collection::vec((0u64..2048, any::<i64>()), 1..64),
                page_bits in 3u32..8
            ) {
                let mut m = PagedMemory::new(1 << page_bits);
                let mut flat = PagedMemory::new(4096);
                for &(offset, value) in &writes {
                    let Ok(()) = m.put_long_at(offset, value);
                    let Ok(()) = flat.put_long_at(offset, value);
                }
                for &(offset, _) in &writes {
                    prop_assert_eq!(m.get_long(offset), flat.get_long(offset));
                }
            }

            /// Strings appended back to back survive any page size
            #[test]
            fn appended_strings_round_trip(
                strings in prop::collection::vec(".{0,40}", 1..20),
                page_bits in 3u32..8
            ) {
                let mut m = PagedMemory::new(1 << page_bits);
                let mut offsets = Vec::new();
                for s in &strings {
                    let Ok(offset) = m.put_str(Some(s));
                    offsets.push(offset);
                }
                for (s, offset) in strings.iter().zip(offsets) {
                    let view = m.get_str(offset).unwrap();
                    prop_assert_eq!(view.to_string(), s.clone());
                }
            }
        }
    }
}
