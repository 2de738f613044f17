//! Static identifier hash table.
//!
//! The table maps identifier spellings to the set of modules declaring them.
//! It is laid out once at build time as a flat array of fixed-size slots and
//! is queried in place, directly against the mapped index file.
//!
//! ## Layout
//!
//! The table block starts with a 12-byte header (`bucket_count u32`,
//! `entry_count u32`, `probe_scheme u8`, 3 reserved bytes) followed by
//! `bucket_count` slots of [`SLOT_SIZE`] bytes:
//!
//! | offset | field |
//! |--------|-------|
//! | 0  | upper 32 bits of the spelling hash |
//! | 4  | spelling offset into the strings block |
//! | 8  | spelling length |
//! | 12 | kind: empty / inline / bitmap / spilled |
//! | 13 | number of module ids (saturating) |
//! | 16 | payload a |
//! | 20 | payload b |
//!
//! Inline slots hold up to two ids in the payload words. Bitmap slots hold a
//! 64-bit set when every id is below 64. Larger sets spill into the sets
//! block as delta-coded varints; the payload is then `(offset, length)`.
//!
//! ## Probing
//!
//! `bucket_count` is a power of two and the home bucket is the low bits of
//! the 64-bit xxh3 hash. Collisions are resolved with triangular probing
//! (`home + i*(i+1)/2`), which visits every bucket exactly once, so a probe
//! ends at the first empty slot or after `bucket_count` steps.

use crate::error::FormatError;
use crate::format::{RecordCursor, RecordWriter};
use crate::index::types::ModuleId;
use crate::utils::{delta_decode, delta_encode};
use ahash::AHashMap;
use roaring::RoaringBitmap;
use xxhash_rust::xxh3::xxh3_64;

/// Size of a slot record in bytes
pub const SLOT_SIZE: usize = 4 + 4 + 4 + 1 + 1 + 2 + 4 + 4; // 24 bytes

/// Size of the table block header in bytes
pub const TABLE_HEADER_SIZE: usize = 4 + 4 + 1 + 3; // 12 bytes

/// Probe scheme tag for triangular probing
pub const PROBE_TRIANGULAR: u8 = 1;

/// Smallest table ever written
const MIN_BUCKETS: usize = 8;

const KIND_EMPTY: u8 = 0;
const KIND_INLINE: u8 = 1;
const KIND_BITMAP: u8 = 2;
const KIND_SPILLED: u8 = 3;

/// Hash an identifier spelling. Case-sensitive, byte-wise and stable across
/// processes, since it is persisted.
#[inline]
pub fn hash_identifier(name: &[u8]) -> u64 {
    xxh3_64(name)
}

/// Buckets visited for a given hash, in order
fn probe_sequence(hash: u64, bucket_count: usize) -> impl Iterator<Item = usize> {
    let mask = bucket_count - 1;
    let home = hash as usize & mask;
    (0..bucket_count).scan(home, move |index, step| {
        let current = *index;
        *index = (current + step + 1) & mask;
        Some(current)
    })
}

/// Number of buckets needed for `entries` at the given load factor
pub fn bucket_count_for(entries: usize, max_load_factor: f64) -> usize {
    let needed = (entries as f64 / max_load_factor).ceil() as usize;
    needed.max(entries + 1).max(MIN_BUCKETS).next_power_of_two()
}

/// An identifier together with the modules declaring it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifierEntry {
    pub name: String,
    /// Sorted, deduplicated
    pub modules: Vec<ModuleId>,
}

/// Groups (identifier, module) pairs during a build
#[derive(Debug, Default)]
pub struct IdentifierSetBuilder {
    entries: AHashMap<String, Vec<ModuleId>>,
}

impl IdentifierSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, module: ModuleId) {
        match self.entries.get_mut(name) {
            Some(modules) => modules.push(module),
            None => {
                self.entries.insert(name.to_owned(), vec![module]);
            }
        }
    }

    pub fn extend(&mut self, name: &str, modules: impl IntoIterator<Item = ModuleId>) {
        for module in modules {
            self.insert(name, module);
        }
    }

    /// Number of distinct spellings seen so far
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries sorted by spelling, each with a sorted, deduplicated module set.
    /// Sorting makes the written table independent of scan order.
    pub fn finish(self) -> Vec<IdentifierEntry> {
        let mut entries: Vec<IdentifierEntry> = self
            .entries
            .into_iter()
            .map(|(name, mut modules)| {
                modules.sort_unstable();
                modules.dedup();
                IdentifierEntry { name, modules }
            })
            .filter(|entry| !entry.modules.is_empty())
            .collect();
        entries.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        entries
    }
}

/// Serialized table, ready to be placed into three container blocks
#[derive(Debug)]
pub struct SerializedTable {
    pub table: Vec<u8>,
    pub strings: Vec<u8>,
    pub sets: Vec<u8>,
    pub bucket_count: usize,
    pub entry_count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Slot {
    hash_tag: u32,
    spelling_offset: u32,
    spelling_len: u32,
    kind: u8,
    count: u8,
    a: u32,
    b: u32,
}

impl Slot {
    fn write_to(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.hash_tag.to_le_bytes());
        out[4..8].copy_from_slice(&self.spelling_offset.to_le_bytes());
        out[8..12].copy_from_slice(&self.spelling_len.to_le_bytes());
        out[12] = self.kind;
        out[13] = self.count;
        out[14..16].copy_from_slice(&[0, 0]);
        out[16..20].copy_from_slice(&self.a.to_le_bytes());
        out[20..24].copy_from_slice(&self.b.to_le_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        Self {
            hash_tag: word(0),
            spelling_offset: word(4),
            spelling_len: word(8),
            kind: bytes[12],
            count: bytes[13],
            a: word(16),
            b: word(20),
        }
    }
}

/// Choose the payload encoding for a sorted, non-empty module set
fn encode_modules(modules: &[ModuleId], sets: &mut Vec<u8>) -> (u8, u32, u32) {
    match modules {
        [only] => (KIND_INLINE, *only, 0),
        [first, second] => (KIND_INLINE, *first, *second),
        _ if modules.iter().all(|&id| id < 64) => {
            let bits = modules.iter().fold(0u64, |bits, &id| bits | (1u64 << id));
            (KIND_BITMAP, bits as u32, (bits >> 32) as u32)
        }
        _ => {
            let offset = sets.len() as u32;
            delta_encode(modules, sets);
            (KIND_SPILLED, offset, sets.len() as u32 - offset)
        }
    }
}

/// Lay out `entries` into a static table.
///
/// Entries are placed in the order given; duplicate spellings are allowed and
/// occupy separate slots (lookups union them).
pub fn write_table(entries: &[IdentifierEntry], max_load_factor: f64) -> SerializedTable {
    let bucket_count = bucket_count_for(entries.len(), max_load_factor);
    let mut slots = vec![0u8; bucket_count * SLOT_SIZE];
    let mut strings = Vec::new();
    let mut sets = Vec::new();
    let mut written = 0usize;

    for entry in entries {
        if entry.modules.is_empty() {
            continue;
        }
        let hash = hash_identifier(entry.name.as_bytes());
        let (kind, a, b) = encode_modules(&entry.modules, &mut sets);
        let slot = Slot {
            hash_tag: (hash >> 32) as u32,
            spelling_offset: strings.len() as u32,
            spelling_len: entry.name.len() as u32,
            kind,
            count: entry.modules.len().min(u8::MAX as usize) as u8,
            a,
            b,
        };
        strings.extend_from_slice(entry.name.as_bytes());

        // The load factor guarantees an empty bucket on every probe sequence.
        if let Some(index) = probe_sequence(hash, bucket_count)
            .find(|&index| slots[index * SLOT_SIZE + 12] == KIND_EMPTY)
        {
            slot.write_to(&mut slots[index * SLOT_SIZE..(index + 1) * SLOT_SIZE]);
            written += 1;
        }
    }

    let mut table = RecordWriter::with_capacity(TABLE_HEADER_SIZE + slots.len());
    table.put_u32(bucket_count as u32);
    table.put_u32(written as u32);
    table.put_u8(PROBE_TRIANGULAR);
    table.put_bytes(&[0, 0, 0]);
    table.put_bytes(&slots);

    SerializedTable {
        table: table.into_inner(),
        strings,
        sets,
        bucket_count,
        entry_count: written,
    }
}

/// Occupancy and probe-length figures for diagnostics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableStats {
    pub bucket_count: usize,
    pub entry_count: usize,
    pub inline_sets: usize,
    pub bitmap_sets: usize,
    pub spilled_sets: usize,
    /// Longest probe sequence needed to reach an entry (1 = home bucket)
    pub max_probe_len: usize,
    pub mean_probe_len: f64,
}

impl TableStats {
    pub fn load_factor(&self) -> f64 {
        if self.bucket_count == 0 {
            0.0
        } else {
            self.entry_count as f64 / self.bucket_count as f64
        }
    }
}

/// Read-only view of a serialized table, typically over a memory map
#[derive(Debug, Clone, Copy)]
pub struct IdentifierTable<'a> {
    slots: &'a [u8],
    strings: &'a [u8],
    sets: &'a [u8],
    bucket_count: usize,
    entry_count: usize,
}

impl<'a> IdentifierTable<'a> {
    /// Validate the table geometry. Slots themselves are not inspected.
    pub fn new(table: &'a [u8], strings: &'a [u8], sets: &'a [u8]) -> Result<Self, FormatError> {
        let mut header = RecordCursor::new(table);
        let bucket_count = header.get_u32()? as usize;
        let entry_count = header.get_u32()? as usize;
        let probe_scheme = header.get_u8()?;
        header.get_bytes(3)?;

        if !bucket_count.is_power_of_two() {
            return Err(FormatError::corrupt(format!(
                "identifier table has {bucket_count} buckets, not a power of two"
            )));
        }
        if entry_count >= bucket_count {
            return Err(FormatError::corrupt("identifier table has no empty bucket"));
        }
        if probe_scheme != PROBE_TRIANGULAR {
            return Err(FormatError::corrupt(format!(
                "unknown probe scheme {probe_scheme}"
            )));
        }
        let slots = &table[TABLE_HEADER_SIZE..];
        if slots.len() < bucket_count * SLOT_SIZE {
            return Err(FormatError::Truncated);
        }
        if slots.len() > bucket_count * SLOT_SIZE {
            return Err(FormatError::corrupt("trailing bytes in identifier table"));
        }

        Ok(Self {
            slots,
            strings,
            sets,
            bucket_count,
            entry_count,
        })
    }

    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    #[inline]
    fn slot(&self, index: usize) -> Slot {
        Slot::read_from(&self.slots[index * SLOT_SIZE..(index + 1) * SLOT_SIZE])
    }

    fn spelling(&self, slot: &Slot) -> Option<&'a [u8]> {
        let start = slot.spelling_offset as usize;
        let end = start.checked_add(slot.spelling_len as usize)?;
        self.strings.get(start..end)
    }

    fn modules(&self, slot: &Slot) -> Option<Vec<ModuleId>> {
        match slot.kind {
            KIND_INLINE => match slot.count {
                1 => Some(vec![slot.a]),
                2 => Some(vec![slot.a, slot.b]),
                _ => None,
            },
            KIND_BITMAP => {
                let mut bits = (slot.a as u64) | ((slot.b as u64) << 32);
                let mut ids = Vec::with_capacity(bits.count_ones() as usize);
                while bits != 0 {
                    ids.push(bits.trailing_zeros());
                    bits &= bits - 1;
                }
                Some(ids)
            }
            KIND_SPILLED => {
                let start = slot.a as usize;
                let end = start.checked_add(slot.b as usize)?;
                delta_decode(self.sets.get(start..end)?)
            }
            _ => None,
        }
    }

    /// Modules declaring `name`. Every slot on the probe chain whose spelling
    /// matches contributes; slots that fail to decode are skipped.
    pub fn lookup(&self, name: &str) -> RoaringBitmap {
        let mut result = RoaringBitmap::new();
        let hash = hash_identifier(name.as_bytes());
        let tag = (hash >> 32) as u32;

        for index in probe_sequence(hash, self.bucket_count) {
            let slot = self.slot(index);
            if slot.kind == KIND_EMPTY {
                break;
            }
            if slot.hash_tag != tag || self.spelling(&slot) != Some(name.as_bytes()) {
                continue;
            }
            if let Some(ids) = self.modules(&slot) {
                result.extend(ids);
            }
        }
        result
    }

    /// Every decodable entry, in bucket order
    pub fn iter(self) -> impl Iterator<Item = (&'a str, Vec<ModuleId>)> + 'a {
        (0..self.bucket_count).filter_map(move |index| {
            let slot = self.slot(index);
            if slot.kind == KIND_EMPTY {
                return None;
            }
            let name = std::str::from_utf8(self.spelling(&slot)?).ok()?;
            Some((name, self.modules(&slot)?))
        })
    }

    /// Walk the whole table to measure occupancy and probe lengths
    pub fn stats(&self) -> TableStats {
        let mut stats = TableStats {
            bucket_count: self.bucket_count,
            ..TableStats::default()
        };
        let mut total_probe = 0usize;

        for index in 0..self.bucket_count {
            let slot = self.slot(index);
            match slot.kind {
                KIND_EMPTY => continue,
                KIND_INLINE => stats.inline_sets += 1,
                KIND_BITMAP => stats.bitmap_sets += 1,
                _ => stats.spilled_sets += 1,
            }
            stats.entry_count += 1;

            let Some(spelling) = self.spelling(&slot) else {
                continue;
            };
            let probe_len = probe_sequence(hash_identifier(spelling), self.bucket_count)
                .position(|candidate| candidate == index)
                .map_or(self.bucket_count, |steps| steps + 1);
            total_probe += probe_len;
            stats.max_probe_len = stats.max_probe_len.max(probe_len);
        }

        if stats.entry_count > 0 {
            stats.mean_probe_len = total_probe as f64 / stats.entry_count as f64;
        }
        stats
    }
}
