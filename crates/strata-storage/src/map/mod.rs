//! Composite-key hash map for aggregation and distinct.
//!
//! Entries live back to back in one [`PagedMemory`] region; a second region
//! holds the slot directory, a power-of-two array of `entry_offset + 1`
//! (0 = empty slot).
//!
//! ## Entry layout
//!
//! | Offset          | Size | Field                                        |
//! |-----------------|------|----------------------------------------------|
//! | 0               | 1    | flag: bit 7 direct hit, bits 0-6 jump code   |
//! | 1               | 8    | entry size                                   |
//! | 9               | 8×V  | value columns                                |
//! | 9 + 8×V         | 8×K  | key columns                                  |
//! | 9 + 8×(V+K)     | var  | string and binary key payloads               |
//!
//! A fixed-width key column holds the value itself; a string or binary key
//! column holds the payload offset relative to the entry start.
//!
//! ## Probing
//!
//! An entry whose key hashes to slot `s` is a *direct hit* if it occupies
//! `s`. Further entries with the same hash form a chain starting at the
//! direct hit: each entry's jump code selects a distance from
//! [`JUMP_DISTANCES`] to the slot of the next chain element. When a new key
//! hashes to a slot held by another chain, that chain is moved away so the
//! direct hit can take its own slot. If no free slot is reachable through
//! the jump table the map doubles and rehashes.

use tracing::debug;

use crate::config::StorageConfig;
use crate::memory::PagedMemory;
use crate::{Result, StorageError};

mod record;

pub use record::{MapRecord, MapValue, Records};

/// Flag bit marking an entry that occupies its own hash slot.
pub const BITS_DIRECT_HIT: u8 = 0x80;

/// Flag bits holding the jump code to the next chain element.
pub const BITS_DISTANCE: u8 = 0x7f;

/// Number of jump codes; code 0 ends a chain.
pub const JUMP_DISTANCES_LEN: usize = 126;

/// Slot distance for each jump code.
pub const JUMP_DISTANCES: [u64; JUMP_DISTANCES_LEN] = [
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 21, 28, 36, 45, 55, 66, 78, 91, 105,
    120, 136, 153, 171, 190, 210, 231, 253, 276, 300, 325, 351, 378, 406, 435, 465, 496, 528,
    561, 595, 630, 666, 703, 741, 780, 820, 861, 903, 946, 990, 1035, 1081, 1128, 1176, 1225,
    1275, 1326, 1378, 1431, 1485, 1540, 1596, 1653, 1711, 1770, 1830, 1891, 1953, 2016, 2080,
    2145, 2211, 2278, 2346, 2415, 2485, 2556, 3741, 8385, 18_915, 42_486, 95_703, 215_496,
    485_605, 1_091_503, 2_456_436, 5_529_475, 12_437_578, 27_986_421, 62_972_253, 141_700_195,
    318_819_126, 717_314_626, 1_614_000_520, 3_631_437_253, 8_170_829_695, 18_384_318_876,
    41_364_501_751, 93_070_021_080, 209_407_709_220, 471_167_588_430, 1_060_127_437_995,
    2_385_287_281_530, 5_366_895_564_381, 12_075_513_791_265, 27_169_907_873_235,
    61_132_301_007_778, 137_547_673_121_001, 309_482_258_302_503, 696_335_090_510_256,
    1_566_753_939_653_640, 3_525_196_427_195_653, 7_931_691_866_727_775, 17_846_306_747_368_716,
    40_154_190_394_120_111, 90_346_928_493_040_500, 203_280_588_949_935_750,
    457_381_324_898_247_375, 1_029_107_980_662_394_500, 2_315_492_957_028_380_766,
    5_209_859_150_892_887_590,
];

/// Flag byte plus entry size.
const ENTRY_HEADER_SIZE: u64 = 9;

/// Hash of `size` key bytes at `offset` in entry memory.
pub type MapHasher = fn(&PagedMemory, u64, u64) -> i64;

fn default_hash(mem: &PagedMemory, offset: u64, size: u64) -> i64 {
    mem.hash(offset, size)
}

/// Open-addressing hash map with composite keys and fixed-width values.
///
/// Keys are built column by column through [`begin_key`](Self::begin_key);
/// the finished key is then looked up or inserted. Single-threaded.
///
/// ```
/// use strata_storage::map::CompositeKeyMap;
///
/// let mut map = CompositeKeyMap::new(4096, 2, 1, 16, 0.5).unwrap();
/// let mut value = map.begin_key().put_long(7).put_str(Some("EURUSD")).create_value();
/// assert!(value.is_new());
/// value.add_long(0, 1);
///
/// let value = map.begin_key().put_long(7).put_str(Some("EURUSD")).find_value().unwrap();
/// assert_eq!(value.get_long(0), 1);
/// ```
#[derive(Debug)]
pub struct CompositeKeyMap {
    entries: PagedMemory,
    slots: PagedMemory,
    hasher: MapHasher,
    load_factor: f64,
    key_columns: usize,
    value_columns: usize,
    entry_key_offset: u64,
    entry_fixed_size: u64,
    key_capacity: u64,
    mask: u64,
    size: u64,
    grow_count: u64,
    // end of the last committed entry; the candidate key is built here
    entries_end: u64,
    candidate_size: u64,
}

impl CompositeKeyMap {
    /// Create a map of `key_columns` key and `value_columns` value columns.
    ///
    /// The slot directory holds `key_capacity / load_factor` slots rounded
    /// up to a power of two; the map doubles once it holds `key_capacity`
    /// keys.
    pub fn new(
        page_size: usize,
        key_columns: usize,
        value_columns: usize,
        key_capacity: u64,
        load_factor: f64,
    ) -> Result<Self> {
        Self::with_hasher(page_size, key_columns, value_columns, key_capacity, load_factor, default_hash)
    }

    /// Create a map sized by `config`.
    pub fn with_config(config: &StorageConfig, key_columns: usize, value_columns: usize) -> Result<Self> {
        config.validate()?;
        Self::new(
            config.map_page_size,
            key_columns,
            value_columns,
            config.map_key_capacity,
            config.map_load_factor,
        )
    }

    /// Create a map that hashes keys with `hasher`.
    pub fn with_hasher(
        page_size: usize,
        key_columns: usize,
        value_columns: usize,
        key_capacity: u64,
        load_factor: f64,
        hasher: MapHasher,
    ) -> Result<Self> {
        if !(load_factor > 0.0 && load_factor < 1.0) {
            return Err(StorageError::Config(format!(
                "map load factor must be in (0, 1), got {load_factor}"
            )));
        }
        if key_capacity == 0 {
            return Err(StorageError::Config("map key capacity must be positive".to_string()));
        }

        let entry_key_offset = ENTRY_HEADER_SIZE + value_columns as u64 * 8;
        let mut map = Self {
            entries: PagedMemory::new(page_size),
            slots: PagedMemory::new(page_size),
            hasher,
            load_factor,
            key_columns,
            value_columns,
            entry_key_offset,
            entry_fixed_size: entry_key_offset + key_columns as u64 * 8,
            key_capacity,
            mask: 0,
            size: 0,
            grow_count: 0,
            entries_end: 0,
            candidate_size: 0,
        };
        map.configure_capacity();
        Ok(map)
    }

    /// Start building a key.
    pub fn begin_key(&mut self) -> KeyBuilder<'_> {
        let Ok(()) = self.entries.jump_to(self.entries_end + self.entry_key_offset);
        self.candidate_size = self.entry_fixed_size;
        let remaining = self.key_columns;
        KeyBuilder { map: self, remaining }
    }

    /// Number of distinct keys.
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Whether the map holds no keys.
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Key count that triggers the next doubling.
    pub const fn key_capacity(&self) -> u64 {
        self.key_capacity
    }

    /// Number of slots in the slot directory.
    pub const fn slot_capacity(&self) -> u64 {
        self.mask + 1
    }

    /// Number of doublings since creation.
    pub const fn grow_count(&self) -> u64 {
        self.grow_count
    }

    /// Entries in insertion order.
    pub const fn records(&self) -> Records<'_> {
        Records::new(self)
    }

    /// Remove every entry, keeping the current capacity.
    pub fn clear(&mut self) {
        self.size = 0;
        self.entries_end = 0;
        self.candidate_size = 0;
        let Ok(()) = self.slots.zero();
    }

    /// Release all memory. The map is empty afterwards.
    pub fn close(&mut self) {
        self.entries.close();
        self.slots.close();
        self.size = 0;
        self.entries_end = 0;
        self.candidate_size = 0;
        self.configure_capacity();
    }

    fn configure_capacity(&mut self) {
        let slots = ((self.key_capacity as f64 / self.load_factor) as u64)
            .max(2)
            .next_power_of_two();
        self.mask = slots - 1;
        let Ok(()) = self.slots.jump_to(slots * 8);
        let Ok(()) = self.slots.zero();
    }

    // ---------------------------------------------------------------------
    // Slot directory and entry fields
    // ---------------------------------------------------------------------

    fn offset_at(&self, slot: u64) -> Option<u64> {
        let stored = self.slots.get_long(slot * 8);
        (stored != 0).then(|| (stored - 1) as u64)
    }

    /// Offset of a slot known to be part of a chain.
    fn chain_offset(&self, slot: u64) -> u64 {
        let offset = self.offset_at(slot);
        debug_assert!(offset.is_some(), "empty slot {slot} inside a chain");
        offset.unwrap_or_default()
    }

    fn set_offset_at(&mut self, slot: u64, offset: u64) {
        let Ok(()) = self.slots.put_long_at(slot * 8, offset as i64 + 1);
    }

    fn clear_slot(&mut self, slot: u64) {
        let Ok(()) = self.slots.put_long_at(slot * 8, 0);
    }

    fn flag(&self, offset: u64) -> u8 {
        self.entries.get_byte(offset) as u8
    }

    fn set_flag(&mut self, offset: u64, flag: u8) {
        let Ok(()) = self.entries.put_byte_at(offset, flag as i8);
    }

    fn entry_size(&self, offset: u64) -> u64 {
        self.entries.get_long(offset + 1) as u64
    }

    const fn next_slot(&self, slot: u64, distance: u8) -> u64 {
        slot.wrapping_add(JUMP_DISTANCES[distance as usize]) & self.mask
    }

    fn entry_slot(&self, offset: u64, size: u64) -> u64 {
        let key_offset = offset + self.entry_key_offset;
        (self.hasher)(&self.entries, key_offset, size - self.entry_key_offset) as u64 & self.mask
    }

    /// Whether the entry at `offset` has the same key as the candidate.
    fn matches(&self, offset: u64) -> bool {
        if self.entry_size(offset) != self.candidate_size {
            return false;
        }
        let a = self.entries_end + self.entry_key_offset;
        let b = offset + self.entry_key_offset;
        let size = self.candidate_size - self.entry_key_offset;

        let words = size - size % 8;
        let mut i = 0;
        while i < words {
            if self.entries.get_long(a + i) != self.entries.get_long(b + i) {
                return false;
            }
            i += 8;
        }
        (words..size).all(|i| self.entries.get_byte(a + i) == self.entries.get_byte(b + i))
    }

    /// First jump code from `slot` that reaches an empty slot, 0 if none.
    fn find_free_slot(&self, slot: u64) -> u8 {
        (1..JUMP_DISTANCES_LEN as u8)
            .find(|&d| self.slots.get_long(self.next_slot(slot, d) * 8) == 0)
            .unwrap_or(0)
    }

    /// Slot of the chain element that points at `target_slot`.
    fn find_parent_slot(&self, offset: u64, target_slot: u64) -> u64 {
        let mut parent = self.entry_slot(offset, self.entry_size(offset));
        loop {
            let distance = self.flag(self.chain_offset(parent)) & BITS_DISTANCE;
            debug_assert_ne!(distance, 0, "slot {target_slot} not found in its chain");
            let next = self.next_slot(parent, distance);
            if next == target_slot || distance == 0 {
                return parent;
            }
            parent = next;
        }
    }

    // ---------------------------------------------------------------------
    // Insertion
    // ---------------------------------------------------------------------

    /// Slot the candidate key hashes to.
    fn candidate_slot(&self) -> u64 {
        self.entry_slot(self.entries_end, self.candidate_size)
    }

    /// Find the candidate key, inserting it if missing. Returns the entry
    /// offset and whether it was inserted.
    fn create_entry(&mut self) -> (u64, bool) {
        loop {
            let slot = self.candidate_slot();
            let Some(head) = self.offset_at(slot) else {
                return (self.put_new_entry(slot, BITS_DIRECT_HIT), true);
            };

            let flag = self.flag(head);
            if flag & BITS_DIRECT_HIT == 0 {
                // slot belongs to another chain
                if self.move_foreign_entries(slot, head) {
                    return (self.put_new_entry(slot, BITS_DIRECT_HIT), true);
                }
                self.grow();
                continue;
            }

            if self.matches(head) {
                return (head, false);
            }

            let (tail_slot, tail, found) = self.walk_chain(slot, head, flag);
            if found {
                return (tail, false);
            }

            let distance = self.find_free_slot(tail_slot);
            if distance == 0 {
                self.grow();
                continue;
            }
            let new_slot = self.next_slot(tail_slot, distance);
            let tail_flag = if tail == head { distance | BITS_DIRECT_HIT } else { distance };
            self.set_flag(tail, tail_flag);
            return (self.put_new_entry(new_slot, 0), true);
        }
    }

    /// Follow a chain from its head comparing keys. Returns the slot and
    /// offset of the matching entry, or of the chain tail if none matches.
    fn walk_chain(&self, mut slot: u64, mut offset: u64, flag: u8) -> (u64, u64, bool) {
        let mut distance = flag & BITS_DISTANCE;
        while distance > 0 {
            slot = self.next_slot(slot, distance);
            offset = self.chain_offset(slot);
            if self.matches(offset) {
                return (slot, offset, true);
            }
            distance = self.flag(offset) & BITS_DISTANCE;
        }
        (slot, offset, false)
    }

    /// Look the candidate key up without inserting it.
    fn find_entry(&self) -> Option<u64> {
        let slot = self.candidate_slot();
        let head = self.offset_at(slot)?;
        let flag = self.flag(head);
        if flag & BITS_DIRECT_HIT == 0 {
            return None;
        }
        if self.matches(head) {
            return Some(head);
        }
        let (_, offset, found) = self.walk_chain(slot, head, flag);
        found.then_some(offset)
    }

    /// Commit the candidate as a new entry in `slot`.
    fn put_new_entry(&mut self, slot: u64, flag: u8) -> u64 {
        let offset = self.entries_end;
        self.set_flag(offset, flag);
        let Ok(()) = self.entries.put_long_at(offset + 1, self.candidate_size as i64);
        for column in 0..self.value_columns as u64 {
            let Ok(()) = self.entries.put_long_at(offset + ENTRY_HEADER_SIZE + column * 8, 0);
        }
        self.entries_end = offset + self.candidate_size;

        self.size += 1;
        if self.size == self.key_capacity {
            // the rehash places the new entry too
            self.grow();
        } else {
            self.set_offset_at(slot, offset);
        }
        offset
    }

    /// Move the chain tail that runs through `slot` to other free slots so
    /// `slot` can be reused. `offset` is the entry in `slot`. Returns false
    /// if some element has no reachable free slot.
    fn move_foreign_entries(&mut self, slot: u64, offset: u64) -> bool {
        let mut parent_slot = self.find_parent_slot(offset, slot);
        let mut parent_offset = self.chain_offset(parent_slot);
        let mut current_slot = slot;
        let mut current_offset = offset;

        loop {
            let distance = self.find_free_slot(parent_slot);
            if distance == 0 {
                return false;
            }

            let parent_flag = self.flag(parent_offset) & BITS_DIRECT_HIT;
            self.set_flag(parent_offset, distance | parent_flag);

            let next_slot = self.next_slot(parent_slot, distance);
            self.set_offset_at(next_slot, current_offset);

            let child = self.flag(current_offset) & BITS_DISTANCE;
            if current_slot != slot {
                self.clear_slot(current_slot);
            }
            if child == 0 {
                return true;
            }

            parent_slot = next_slot;
            parent_offset = current_offset;
            current_slot = self.next_slot(current_slot, child);
            current_offset = self.chain_offset(current_slot);
        }
    }

    // ---------------------------------------------------------------------
    // Growth
    // ---------------------------------------------------------------------

    /// Double the key capacity and rehash every entry, doubling again while
    /// some entry cannot be placed.
    fn grow(&mut self) {
        loop {
            self.key_capacity *= 2;
            self.grow_count += 1;
            self.configure_capacity();
            if self.rehash() {
                break;
            }
            debug!(key_capacity = self.key_capacity, "rehash could not place an entry");
        }
        debug!(
            key_capacity = self.key_capacity,
            slot_capacity = self.slot_capacity(),
            size = self.size,
            "map grown"
        );
    }

    fn rehash(&mut self) -> bool {
        let mut offset = 0;
        for _ in 0..self.size {
            let size = self.entry_size(offset);
            if !self.rehash_entry(offset, size) {
                return false;
            }
            offset += size;
        }
        true
    }

    /// Place a key known to be unique into the fresh slot directory.
    fn rehash_entry(&mut self, offset: u64, size: u64) -> bool {
        let slot = self.entry_slot(offset, size);
        let Some(head) = self.offset_at(slot) else {
            self.put_entry_at(offset, slot, BITS_DIRECT_HIT);
            return true;
        };

        let flag = self.flag(head);
        if flag & BITS_DIRECT_HIT == 0 {
            if !self.move_foreign_entries(slot, head) {
                return false;
            }
            self.put_entry_at(offset, slot, BITS_DIRECT_HIT);
            return true;
        }

        let mut tail_slot = slot;
        let mut tail = head;
        let mut distance = flag & BITS_DISTANCE;
        while distance > 0 {
            tail_slot = self.next_slot(tail_slot, distance);
            tail = self.chain_offset(tail_slot);
            distance = self.flag(tail) & BITS_DISTANCE;
        }

        let distance = self.find_free_slot(tail_slot);
        if distance == 0 {
            return false;
        }
        let tail_flag = if tail == head { distance | BITS_DIRECT_HIT } else { distance };
        self.set_flag(tail, tail_flag);
        let new_slot = self.next_slot(tail_slot, distance);
        self.put_entry_at(offset, new_slot, 0);
        true
    }

    fn put_entry_at(&mut self, offset: u64, slot: u64, flag: u8) {
        self.set_offset_at(slot, offset);
        self.set_flag(offset, flag);
    }
}

/// Builder of the candidate key, one column at a time.
///
/// Each `put_*` fills the next key column. Finish with
/// [`create_value`](Self::create_value) or [`find_value`](Self::find_value).
/// Puts past the map's key column count are ignored and columns left unset
/// are zero.
#[must_use]
#[derive(Debug)]
pub struct KeyBuilder<'a> {
    map: &'a mut CompositeKeyMap,
    remaining: usize,
}

impl<'a> KeyBuilder<'a> {
    /// Claim the next key column, `false` once every column is set.
    fn next_column(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    /// Append an 8-byte integer key column.
    pub fn put_long(mut self, value: i64) -> Self {
        if self.next_column() {
            let Ok(()) = self.map.entries.put_long(value);
        }
        self
    }

    /// Append a 4-byte integer key column.
    pub fn put_int(self, value: i32) -> Self {
        self.put_long(i64::from(value))
    }

    /// Append a boolean key column.
    pub fn put_bool(self, value: bool) -> Self {
        self.put_long(i64::from(value))
    }

    /// Append an 8-byte float key column.
    pub fn put_double(mut self, value: f64) -> Self {
        if self.next_column() {
            let Ok(()) = self.map.entries.put_double(value);
        }
        self
    }

    /// Append a string key column. The payload goes to the entry tail.
    pub fn put_str(mut self, value: Option<&str>) -> Self {
        if self.next_column() {
            let map = &mut *self.map;
            let tail = map.entries_end + map.candidate_size;
            let Ok(()) = map.entries.put_long(map.candidate_size as i64);
            let Ok(()) = map.entries.put_str_at(tail, value);
            map.candidate_size += <PagedMemory>::storage_length(value);
        }
        self
    }

    /// Append a binary key column. The payload goes to the entry tail.
    pub fn put_bin(mut self, value: Option<&[u8]>) -> Self {
        if self.next_column() {
            let map = &mut *self.map;
            let tail = map.entries_end + map.candidate_size;
            let Ok(()) = map.entries.put_long(map.candidate_size as i64);
            let Ok(()) = map.entries.put_bin_at(tail, value);
            map.candidate_size += <PagedMemory>::bin_storage_length(value);
        }
        self
    }

    /// Zero the columns that were not set and hand back the map.
    fn finish(mut self) -> &'a mut CompositeKeyMap {
        while self.next_column() {
            let Ok(()) = self.map.entries.put_long(0);
        }
        self.map
    }

    /// Value of the finished key, inserting the key if it is missing.
    pub fn create_value(self) -> MapValue<'a> {
        let map = self.finish();
        let (offset, is_new) = map.create_entry();
        let columns = map.value_columns;
        MapValue::new(&mut map.entries, offset + ENTRY_HEADER_SIZE, columns, is_new)
    }

    /// Value of the finished key, `None` if the map does not hold it.
    pub fn find_value(self) -> Option<MapValue<'a>> {
        let map = self.finish();
        let offset = map.find_entry()?;
        let columns = map.value_columns;
        Some(MapValue::new(&mut map.entries, offset + ENTRY_HEADER_SIZE, columns, false))
    }
}
