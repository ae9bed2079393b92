//! Access to the values and keys of map entries.

use crate::memory::{BinView, HeapPages, PagedMemory, StrView};

use super::{CompositeKeyMap, ENTRY_HEADER_SIZE};

/// Value columns of the entry returned by
/// [`create_value`](super::KeyBuilder::create_value) or
/// [`find_value`](super::KeyBuilder::find_value).
///
/// Value columns are 8-byte slots addressed by index; narrower types are
/// stored widened to 8 bytes. Columns past the map's value column count
/// read as zero and writes to them are ignored.
#[derive(Debug)]
pub struct MapValue<'a> {
    entries: &'a mut PagedMemory,
    offset: u64,
    columns: usize,
    is_new: bool,
}

impl<'a> MapValue<'a> {
    pub(super) const fn new(entries: &'a mut PagedMemory, offset: u64, columns: usize, is_new: bool) -> Self {
        Self {
            entries,
            offset,
            columns,
            is_new,
        }
    }

    /// Whether the entry was created by this call. New entries start with
    /// every value column zeroed.
    pub const fn is_new(&self) -> bool {
        self.is_new
    }

    /// Offset of the first value column in entry memory.
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    fn column_offset(&self, column: usize) -> Option<u64> {
        (column < self.columns).then(|| self.offset + column as u64 * 8)
    }

    /// Read value column `column` as an 8-byte integer.
    pub fn get_long(&self, column: usize) -> i64 {
        self.column_offset(column).map_or(0, |o| self.entries.get_long(o))
    }

    /// Read value column `column` as a 4-byte integer.
    pub fn get_int(&self, column: usize) -> i32 {
        self.get_long(column) as i32
    }

    /// Read value column `column` as a 2-byte integer.
    pub fn get_short(&self, column: usize) -> i16 {
        self.get_long(column) as i16
    }

    /// Read value column `column` as a byte.
    pub fn get_byte(&self, column: usize) -> i8 {
        self.get_long(column) as i8
    }

    /// Read value column `column` as an 8-byte float.
    pub fn get_double(&self, column: usize) -> f64 {
        self.column_offset(column).map_or(0.0, |o| self.entries.get_double(o))
    }

    /// Read value column `column` as a boolean.
    pub fn get_bool(&self, column: usize) -> bool {
        self.get_long(column) != 0
    }

    /// Write value column `column`.
    pub fn put_long(&mut self, column: usize, value: i64) -> &mut Self {
        if let Some(offset) = self.column_offset(column) {
            let Ok(()) = self.entries.put_long_at(offset, value);
        }
        self
    }

    /// Write value column `column`.
    pub fn put_int(&mut self, column: usize, value: i32) -> &mut Self {
        self.put_long(column, i64::from(value))
    }

    /// Write value column `column`.
    pub fn put_double(&mut self, column: usize, value: f64) -> &mut Self {
        if let Some(offset) = self.column_offset(column) {
            let Ok(()) = self.entries.put_double_at(offset, value);
        }
        self
    }

    /// Write value column `column`.
    pub fn put_bool(&mut self, column: usize, value: bool) -> &mut Self {
        self.put_long(column, i64::from(value))
    }

    /// Add `delta` to value column `column`.
    pub fn add_long(&mut self, column: usize, delta: i64) -> &mut Self {
        let value = self.get_long(column).wrapping_add(delta);
        self.put_long(column, value)
    }
}

/// Read-only view of one map entry.
///
/// Out-of-range columns read as zero, or `None` for string and binary keys.
#[derive(Debug, Clone, Copy)]
pub struct MapRecord<'a> {
    entries: &'a PagedMemory,
    offset: u64,
    key_offset: u64,
    value_columns: usize,
    key_columns: usize,
}

impl<'a> MapRecord<'a> {
    /// Offset of the entry in entry memory.
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    fn value_offset(&self, column: usize) -> Option<u64> {
        (column < self.value_columns).then(|| self.offset + ENTRY_HEADER_SIZE + column as u64 * 8)
    }

    fn key_slot(&self, column: usize) -> Option<u64> {
        (column < self.key_columns).then(|| self.offset + self.key_offset + column as u64 * 8)
    }

    /// Value column as an 8-byte integer.
    pub fn get_long(&self, column: usize) -> i64 {
        self.value_offset(column).map_or(0, |o| self.entries.get_long(o))
    }

    /// Value column as an 8-byte float.
    pub fn get_double(&self, column: usize) -> f64 {
        self.value_offset(column).map_or(0.0, |o| self.entries.get_double(o))
    }

    /// Key column as an 8-byte integer.
    pub fn key_long(&self, column: usize) -> i64 {
        self.key_slot(column).map_or(0, |o| self.entries.get_long(o))
    }

    /// Key column as a 4-byte integer.
    pub fn key_int(&self, column: usize) -> i32 {
        self.key_long(column) as i32
    }

    /// Key column as an 8-byte float.
    pub fn key_double(&self, column: usize) -> f64 {
        self.key_slot(column).map_or(0.0, |o| self.entries.get_double(o))
    }

    /// Key column as a boolean.
    pub fn key_bool(&self, column: usize) -> bool {
        self.key_long(column) != 0
    }

    /// String key column, `None` if it was null.
    pub fn key_str(&self, column: usize) -> Option<StrView<'a, HeapPages>> {
        let relative = self.entries.get_long(self.key_slot(column)?) as u64;
        self.entries.get_str(self.offset + relative)
    }

    /// Binary key column, `None` if it was null.
    pub fn key_bin(&self, column: usize) -> Option<BinView<'a, HeapPages>> {
        let relative = self.entries.get_long(self.key_slot(column)?) as u64;
        self.entries.get_bin(self.offset + relative)
    }
}

/// Iterator over map entries in insertion order.
#[derive(Debug)]
pub struct Records<'a> {
    map: &'a CompositeKeyMap,
    offset: u64,
    remaining: u64,
}

impl<'a> Records<'a> {
    pub(super) const fn new(map: &'a CompositeKeyMap) -> Self {
        Self {
            map,
            offset: 0,
            remaining: map.size,
        }
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = MapRecord<'a>;

    fn next(&mut self) -> Option<MapRecord<'a>> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let record = MapRecord {
            entries: &self.map.entries,
            offset: self.offset,
            key_offset: self.map.entry_key_offset,
            value_columns: self.map.value_columns,
            key_columns: self.map.key_columns,
        };
        self.offset += self.map.entry_size(self.offset);
        Some(record)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        (n, Some(n))
    }
}

impl ExactSizeIterator for Records<'_> {}
