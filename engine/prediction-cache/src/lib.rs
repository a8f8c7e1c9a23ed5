//! Fixed-capacity prediction cache.
//!
//! Amortises batched network calls by remembering `(value, priors)` for
//! recently evaluated positions, keyed by the 64-bit Zobrist key. Storage is
//! a sequence of tables of 512-byte chunks; each chunk is 7-way
//! set-associative with per-entry age counters for eviction. Chunks are
//! individually locked, so concurrent workers either see an entry fully
//! before or fully after an update, never torn.
//!
//! A probe that misses hands back a [`CacheReservation`] naming the slot the
//! caller should fill once the network results arrive; the oldest entry in
//! the chunk is chosen at probe time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use thiserror::Error;

/// Positions with more legal moves than this don't fit in an entry and are
/// not cacheable.
pub const MAX_CACHE_MOVES: usize = 52;

const ENTRIES_PER_CHUNK: usize = 7;
const CHUNK_BYTES: u64 = 512;
const TABLE_BYTES: u64 = 1024 * 1024 * 1024;
const CHUNKS_PER_TABLE: u64 = TABLE_BYTES / CHUNK_BYTES;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cannot allocate {requested_mib} MiB for the prediction cache: {reason}")]
    Unavailable { requested_mib: u64, reason: String },
}

/// One cached prediction: position key, value in [0, 1], and the priors for
/// the legal moves in generation order, quantised to 8 bits.
///
/// The key alone identifies the entry: a given position always generates
/// the same legal moves, so the prober's move count tells it how many of
/// the stored priors are live.
#[derive(Clone, Copy)]
#[repr(align(64))]
struct CacheEntry {
    key: u64,
    value: f32,
    priors: [u8; MAX_CACHE_MOVES],
}

const EMPTY: CacheEntry = CacheEntry {
    key: 0,
    value: 0.0,
    priors: [0; MAX_CACHE_MOVES],
};

#[repr(align(512))]
struct Chunk {
    entries: [CacheEntry; ENTRIES_PER_CHUNK],
    ages: [u8; ENTRIES_PER_CHUNK],
}

// The addressing math and the `Hash` option both assume this exact
// geometry: 64-byte entries, seven to a 512-byte chunk.
const _: () = assert!(core::mem::size_of::<CacheEntry>() == 64);
const _: () = assert!(core::mem::size_of::<Chunk>() == CHUNK_BYTES as usize);

impl Chunk {
    fn new() -> Self {
        Self {
            entries: [EMPTY; ENTRIES_PER_CHUNK],
            ages: [0; ENTRIES_PER_CHUNK],
        }
    }

    fn clear(&mut self) {
        *self = Self::new();
    }

    /// Index of the oldest entry, the insertion slot on a miss.
    fn oldest(&self) -> usize {
        let mut slot = 0;
        for i in 1..ENTRIES_PER_CHUNK {
            if self.ages[i] > self.ages[slot] {
                slot = i;
            }
        }
        slot
    }
}

/// Result of a probe.
pub enum CacheProbe {
    /// Key matched; priors are dequantised into the caller's buffer.
    Hit { value: f32 },
    /// No match; fill the reserved slot via [`PredictionCache::store`] after
    /// evaluation.
    Miss(CacheReservation),
    /// Cache not allocated, or the position is not cacheable.
    Disabled,
}

/// A slot reserved at probe time for a later store.
#[derive(Debug, Clone, Copy)]
pub struct CacheReservation {
    table: u32,
    chunk: u32,
    slot: u8,
    generation: u64,
}

struct Tables {
    tables: Vec<Vec<Mutex<Chunk>>>,
    /// Bumped on every allocate/free/clear so stale reservations are ignored.
    generation: u64,
}

/// Process-wide prediction cache. Binaries create exactly one and share it
/// (`Arc`) between the UCI thread and all search workers.
pub struct PredictionCache {
    inner: RwLock<Tables>,
    probe_count: AtomicU64,
    hit_count: AtomicU64,
    eviction_count: AtomicU64,
    entry_count: AtomicU64,
    entry_capacity: AtomicU64,
}

impl Default for PredictionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PredictionCache {
    /// An unallocated cache: every probe reports `Disabled` until
    /// [`allocate`](Self::allocate) is called.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Tables {
                tables: Vec::new(),
                generation: 0,
            }),
            probe_count: AtomicU64::new(0),
            hit_count: AtomicU64::new(0),
            eviction_count: AtomicU64::new(0),
            entry_count: AtomicU64::new(0),
            entry_capacity: AtomicU64::new(0),
        }
    }

    /// Allocate `size_mib` MiB of chunks, split into tables of at most 1 GiB.
    /// Rounds down to whole chunks; 0 MiB disables the cache.
    pub fn allocate(&self, size_mib: u64) -> Result<(), CacheError> {
        let total_chunks = size_mib * 1024 * 1024 / CHUNK_BYTES;

        let mut tables: Vec<Vec<Mutex<Chunk>>> = Vec::new();
        let mut remaining = total_chunks;
        while remaining > 0 {
            let chunk_count = remaining.min(CHUNKS_PER_TABLE) as usize;
            let mut table = Vec::new();
            table
                .try_reserve_exact(chunk_count)
                .map_err(|e| CacheError::Unavailable {
                    requested_mib: size_mib,
                    reason: e.to_string(),
                })?;
            for _ in 0..chunk_count {
                table.push(Mutex::new(Chunk::new()));
            }
            tables.push(table);
            remaining -= chunk_count as u64;
        }

        let mut inner = self.inner.write().expect("cache lock poisoned");
        inner.tables = tables;
        inner.generation += 1;
        self.entry_capacity
            .store(total_chunks * ENTRIES_PER_CHUNK as u64, Ordering::Relaxed);
        self.entry_count.store(0, Ordering::Relaxed);
        self.reset_probe_metrics();
        Ok(())
    }

    /// Drop all tables.
    pub fn free(&self) {
        let mut inner = self.inner.write().expect("cache lock poisoned");
        inner.tables.clear();
        inner.generation += 1;
        self.entry_capacity.store(0, Ordering::Relaxed);
        self.entry_count.store(0, Ordering::Relaxed);
    }

    /// Zero every entry, keeping the allocation.
    pub fn clear(&self) {
        let mut inner = self.inner.write().expect("cache lock poisoned");
        for table in &inner.tables {
            for chunk in table {
                chunk.lock().expect("chunk lock poisoned").clear();
            }
        }
        inner.generation += 1;
        self.entry_count.store(0, Ordering::Relaxed);
        self.reset_probe_metrics();
    }

    pub fn is_allocated(&self) -> bool {
        !self.inner.read().expect("cache lock poisoned").tables.is_empty()
    }

    /// Look up `key` for a position with `move_count` legal moves. On a hit
    /// the dequantised priors are written to `priors_out[..move_count]`.
    pub fn probe(&self, key: u64, move_count: usize, priors_out: &mut [f32]) -> CacheProbe {
        if move_count == 0 || move_count > MAX_CACHE_MOVES {
            return CacheProbe::Disabled;
        }

        let inner = self.inner.read().expect("cache lock poisoned");
        if inner.tables.is_empty() {
            return CacheProbe::Disabled;
        }
        self.probe_count.fetch_add(1, Ordering::Relaxed);

        let (table_index, chunk_index) = self.address(&inner, key);
        let chunk = inner.tables[table_index][chunk_index]
            .lock()
            .expect("chunk lock poisoned");

        for entry in chunk.entries.iter() {
            if entry.key == key {
                self.hit_count.fetch_add(1, Ordering::Relaxed);
                for (out, &q) in priors_out[..move_count].iter_mut().zip(&entry.priors) {
                    *out = f32::from(q) / 255.0;
                }
                return CacheProbe::Hit { value: entry.value };
            }
        }

        let slot = chunk.oldest() as u8;
        CacheProbe::Miss(CacheReservation {
            table: table_index as u32,
            chunk: chunk_index as u32,
            slot,
            generation: inner.generation,
        })
    }

    /// Fill a slot reserved by an earlier probe. `priors[..move_count]` are
    /// quantised to 8 bits. Stale reservations (from before an
    /// allocate/free/clear) are ignored.
    pub fn store(
        &self,
        reservation: CacheReservation,
        key: u64,
        value: f32,
        move_count: usize,
        priors: &[f32],
    ) {
        if move_count == 0 || move_count > MAX_CACHE_MOVES {
            return;
        }

        let inner = self.inner.read().expect("cache lock poisoned");
        if reservation.generation != inner.generation {
            return;
        }
        let mut chunk = inner.tables[reservation.table as usize][reservation.chunk as usize]
            .lock()
            .expect("chunk lock poisoned");

        let slot = reservation.slot as usize;
        let previous_key = chunk.entries[slot].key;
        if previous_key == 0 {
            self.entry_count.fetch_add(1, Ordering::Relaxed);
        } else if previous_key != key {
            self.eviction_count.fetch_add(1, Ordering::Relaxed);
        }

        let entry = &mut chunk.entries[slot];
        entry.key = key;
        entry.value = value;
        for (q, &p) in entry.priors.iter_mut().zip(&priors[..move_count]) {
            *q = (p * 255.0).round().clamp(0.0, 255.0) as u8;
        }
        entry.priors[move_count..].fill(0);

        chunk.ages[slot] = 0;
        for i in 0..ENTRIES_PER_CHUNK {
            if i != slot {
                chunk.ages[i] = chunk.ages[i].saturating_add(1);
            }
        }
    }

    /// Reset per-search probe metrics (not occupancy).
    pub fn reset_probe_metrics(&self) {
        self.probe_count.store(0, Ordering::Relaxed);
        self.hit_count.store(0, Ordering::Relaxed);
        self.eviction_count.store(0, Ordering::Relaxed);
    }

    pub fn permille_full(&self) -> u32 {
        let capacity = self.entry_capacity.load(Ordering::Relaxed);
        if capacity == 0 {
            return 0;
        }
        (self.entry_count.load(Ordering::Relaxed) * 1000 / capacity) as u32
    }

    pub fn permille_hits(&self) -> u32 {
        let probes = self.probe_count.load(Ordering::Relaxed);
        if probes == 0 {
            return 0;
        }
        (self.hit_count.load(Ordering::Relaxed) * 1000 / probes) as u32
    }

    pub fn permille_evictions(&self) -> u32 {
        let probes = self.probe_count.load(Ordering::Relaxed);
        if probes == 0 {
            return 0;
        }
        (self.eviction_count.load(Ordering::Relaxed) * 1000 / probes) as u32
    }

    /// Table and chunk index for a key, by multiplicative mixing.
    fn address(&self, inner: &Tables, key: u64) -> (usize, usize) {
        let mixed = key.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        let table_index = ((mixed >> 48) as usize) % inner.tables.len();
        let chunk_index = (mixed as usize) % inner.tables[table_index].len();
        (table_index, chunk_index)
    }
}
