/*
 * Created on Mon Feb 12 2024
 *
 * This file is a part of Stormcache
 * Stormcache is a free and open-source in-memory key/value cache engine that
 * aims to deliver predictable latency under heavy multi-core concurrency
 * without compromising on correctness or memory safety.
 *
 * Copyright (c) 2024, the Stormcache authors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

/*
    mtcht: the multi-threaded chunked hash table.

    A generation (HtData) is one contiguous, page-aligned, zeroed mapping
    holding two parallel arrays: `chunks_count` probe chunks (14 half-hash
    words + metadata each, one cache line per chunk) and
    `buckets_count_real` entry records. `buckets_count` (a power of two)
    addresses anchors; the pad up to a whole chunk plus SEARCH_MAX trailing
    chunks exist purely to host overflow chains that start near the tail,
    so a search window never wraps.

    Writers serialize per chunk through the metadata spinlock; readers are
    lock-free and rely on the publication protocol spelled out in access.rs.
    Keys are copied into engine-owned padded buffers before any lock is
    taken; buffers retired by delete are handed to the epoch GC because a
    lock-free reader may still be comparing against them.
*/

mod access;
pub(crate) mod iter;
pub(crate) mod meta;
mod probe;
#[cfg(test)]
mod tests;

use {
    self::{
        access::{search_locked, search_only, search_or_create, SearchOutcome},
        iter::Iter,
        meta::{Chunk, Entry, CHUNK_SLOTS, FLAG_DELETED, FLAG_FILLED, SEARCH_MAX},
    },
    crate::{
        config::EngineConfig,
        error::{EngineError, EngineResult},
        gc::{EpochGc, ObjectKind, Participant},
        hash,
        mem::{cmp::PreparedKey, os, unsafe_apis},
    },
    core::sync::atomic::{
        AtomicBool, AtomicPtr,
        Ordering::{Acquire, Relaxed, Release},
    },
    std::sync::Arc,
};

/// One immutable-after-construction table generation
pub(crate) struct HtData {
    buckets_count: usize,
    buckets_count_real: usize,
    chunks_count: usize,
    chunks: *mut Chunk,
    entries: *mut Entry,
    base: *mut u8,
    map_len: usize,
}

// the raw pointers target the owned mapping
unsafe impl Send for HtData {}
unsafe impl Sync for HtData {}

impl HtData {
    /// Build a zeroed generation for exactly `buckets_count` addressable
    /// buckets. The count must already be a power of two
    fn new(buckets_count: usize, config: &EngineConfig) -> EngineResult<Box<Self>> {
        if buckets_count == 0 || !buckets_count.is_power_of_two() {
            return Err(EngineError::InvalidCapacity);
        }
        // pad to a whole chunk, then reserve the trailing overflow window
        let buckets_padded = (buckets_count + CHUNK_SLOTS - 1) / CHUNK_SLOTS * CHUNK_SLOTS;
        let buckets_count_real = buckets_padded + SEARCH_MAX * CHUNK_SLOTS;
        let chunks_count = buckets_count_real / CHUNK_SLOTS;
        let chunks_bytes = chunks_count * core::mem::size_of::<Chunk>();
        let total_bytes = chunks_bytes + buckets_count_real * core::mem::size_of::<Entry>();

        let mut mapping: Option<(*mut u8, usize)> = None;
        #[cfg(target_os = "linux")]
        {
            if config.use_huge_pages_2m {
                if os::hugepages_2mb_available(0) {
                    mapping = os::mmap_alloc_2mb(total_bytes);
                }
                if mapping.is_none() {
                    log::warn!(
                        "2 MiB huge pages requested but unavailable; using regular pages"
                    );
                }
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            if config.use_huge_pages_2m {
                log::warn!("huge pages are only supported on linux; using regular pages");
            }
        }
        let (base, map_len) = mapping.unwrap_or_else(|| (os::mmap_alloc(total_bytes), total_bytes));

        #[cfg(target_os = "linux")]
        {
            if config.numa_aware && config.numa_mask != 0 {
                if os::numa_interleave(base, map_len, config.numa_mask) {
                    log::debug!(
                        "backing store interleaved over node mask {:#b} ({} nodes configured)",
                        config.numa_mask,
                        os::numa_node_count()
                    );
                }
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            if config.numa_aware {
                log::warn!("NUMA interleaving is only supported on linux");
            }
        }

        log::debug!(
            "new table generation: {buckets_count} buckets ({buckets_count_real} real, \
             {chunks_count} chunks, {total_bytes}B mapped)"
        );
        Ok(Box::new(Self {
            buckets_count,
            buckets_count_real,
            chunks_count,
            chunks: base as *mut Chunk,
            entries: unsafe {
                // UNSAFE(@stormcache): in-bounds; the chunk region is a
                // multiple of the entry alignment
                base.add(chunks_bytes) as *mut Entry
            },
            base,
            map_len,
        }))
    }
    #[inline(always)]
    fn chunk(&self, index: usize) -> &Chunk {
        debug_assert!(index < self.chunks_count);
        unsafe {
            // UNSAFE(@stormcache): bounds asserted above; the mapping lives
            // as long as self
            &*self.chunks.add(index)
        }
    }
    #[inline(always)]
    fn entry(&self, bucket_index: usize) -> &Entry {
        debug_assert!(bucket_index < self.buckets_count_real);
        unsafe {
            // UNSAFE(@stormcache): bounds asserted above
            &*self.entries.add(bucket_index)
        }
    }
    #[inline(always)]
    fn bucket_index(&self, hash: u64) -> usize {
        hash as usize & (self.buckets_count - 1)
    }
    #[inline(always)]
    fn anchor_chunk(&self, hash: u64) -> usize {
        self.bucket_index(hash) / CHUNK_SLOTS
    }
    /// Free every key buffer still owned by FILLED entries. Only legal once
    /// no concurrent access is possible
    fn free_keys(&mut self) {
        for index in 0..self.buckets_count_real {
            let entry = self.entry(index);
            if Entry::is_filled(entry.flags.load(Relaxed)) {
                let ptr = entry.key_ptr.load(Relaxed);
                let len = entry.key_len.load(Relaxed) as usize;
                unsafe {
                    // UNSAFE(@stormcache): FILLED entries own their buffer;
                    // flags cleared below so this cannot run twice
                    unsafe_apis::dealloc_key_buffer(ptr, len);
                }
                entry.flags.store(0, Relaxed);
            }
        }
    }
}

impl Drop for HtData {
    fn drop(&mut self) {
        os::mmap_free(self.base, self.map_len);
    }
}

/// The concurrent hash table: opaque byte keys mapping to pointer-sized
/// opaque value handles.
///
/// All operations take the calling thread's GC [`Participant`] (from
/// [`Hashtable::enter`]): lock-free readers may hold references into key
/// buffers that a concurrent delete retires, so every participating thread
/// must be registered, and should [`Participant::advance`] between
/// operations to let reclamation proceed. Participants borrow the table and
/// so must be dropped before it
pub struct Hashtable {
    current: Box<HtData>,
    /// Previous generation, only consulted while a migration is running.
    /// The migration algorithm itself lives outside the engine; the read
    /// paths here honor the flag
    old: AtomicPtr<HtData>,
    is_resizing: AtomicBool,
    max_key_length: u32,
    gc: Arc<EpochGc>,
}

impl Hashtable {
    /// Create a table with the given bucket count (rounded up to the next
    /// power of two) and defaults for everything else
    pub fn new(initial_buckets: usize) -> EngineResult<Self> {
        Self::with_config(&EngineConfig {
            initial_buckets,
            ..EngineConfig::default()
        })
    }
    pub fn with_config(config: &EngineConfig) -> EngineResult<Self> {
        let config = config.validated();
        if config.initial_buckets == 0 {
            return Err(EngineError::InvalidCapacity);
        }
        let buckets_count = config.initial_buckets.next_power_of_two();
        let current = HtData::new(buckets_count, &config)?;
        let gc = EpochGc::new(
            ObjectKind::KeyBuffer,
            config.gc.staging_capacity,
            config.gc.loop_wait_ms,
        );
        Ok(Self {
            current,
            old: AtomicPtr::new(core::ptr::null_mut()),
            is_resizing: AtomicBool::new(false),
            max_key_length: config.max_key_length,
            gc,
        })
    }
    /// Register the calling thread with this table's GC. One participant per
    /// thread; operations debug-check that the participant they are handed
    /// came from this table
    pub fn enter(&self) -> Participant<'_> {
        self.gc.enter()
    }
    pub fn gc(&self) -> &Arc<EpochGc> {
        &self.gc
    }
    pub fn bucket_count(&self) -> usize {
        self.current.buckets_count
    }

    fn check_key(&self, key: &[u8]) -> EngineResult<()> {
        if key.is_empty() {
            return Err(EngineError::EmptyKey);
        }
        if key.len() > self.max_key_length as usize {
            return Err(EngineError::KeyTooLong);
        }
        Ok(())
    }

    /// The generations a read must consult: the current one, plus the old
    /// one while a migration is in flight
    fn generations(&self) -> impl Iterator<Item = &HtData> {
        let old = if self.is_resizing.load(Acquire) {
            unsafe {
                // UNSAFE(@stormcache): non-null while is_resizing holds
                self.old.load(Acquire).as_ref()
            }
        } else {
            None
        };
        core::iter::once(&*self.current).chain(old)
    }

    /// Look the key up without taking any lock
    pub fn get(&self, key: &[u8], px: &Participant) -> Option<usize> {
        debug_assert!(px.belongs_to(&self.gc));
        if self.check_key(key).is_err() {
            return None;
        }
        let hash = hash::hash(key);
        let probe_key = PreparedKey::new(key);
        for generation in self.generations() {
            if let Some((chunk_index, slot_index)) = search_only(generation, &probe_key, hash) {
                let entry = generation.entry(chunk_index * CHUNK_SLOTS + slot_index);
                return Some(entry.value.load(Acquire));
            }
        }
        None
    }

    /// Insert or overwrite. Returns the previous value for an overwrite,
    /// `None` for a fresh insert, or [`EngineError::OutOfSpace`] when the
    /// key's search window is exhausted (the caller may react by triggering
    /// a migration; the engine does not retry)
    pub fn set(&self, key: &[u8], value: usize, px: &Participant) -> EngineResult<Option<usize>> {
        debug_assert!(px.belongs_to(&self.gc));
        self.check_key(key)?;
        let hash = hash::hash(key);
        let probe_key = PreparedKey::new(key);
        // the key copy is made before any chunk lock is taken
        let key_buffer = unsafe_apis::alloc_key_buffer(key);
        match search_or_create(&self.current, &probe_key, hash, true) {
            SearchOutcome::Created(slot) => {
                slot.entry.key_len.store(key.len() as u16, Relaxed);
                slot.entry.key_ptr.store(key_buffer, Relaxed);
                slot.entry.value.store(value, Relaxed);
                // publishes the entry to lock-free readers
                slot.entry.flags.store(FLAG_FILLED, Release);
                slot.chunk.meta.slots_occupied.fetch_add(1, Relaxed);
                drop(slot);
                Ok(None)
            }
            SearchOutcome::Existing(slot) => {
                let previous = slot.entry.value.load(Relaxed);
                slot.entry.value.store(value, Release);
                drop(slot);
                unsafe {
                    // UNSAFE(@stormcache): our duplicate copy was never
                    // published, no reader can hold it
                    unsafe_apis::dealloc_key_buffer(key_buffer, key.len());
                }
                Ok(Some(previous))
            }
            SearchOutcome::OutOfSpace => {
                unsafe {
                    // UNSAFE(@stormcache): never published
                    unsafe_apis::dealloc_key_buffer(key_buffer, key.len());
                }
                Err(EngineError::OutOfSpace)
            }
            SearchOutcome::Missing => unreachable!("missing outcome in create mode"),
        }
    }

    /// Remove the key, returning its value. The key buffer is staged on the
    /// caller's participant for epoch-deferred reclamation: a lock-free
    /// reader may still be comparing against it
    pub fn delete(&self, key: &[u8], px: &Participant) -> Option<usize> {
        debug_assert!(px.belongs_to(&self.gc));
        if self.check_key(key).is_err() {
            return None;
        }
        let hash = hash::hash(key);
        let probe_key = PreparedKey::new(key);
        for generation in self.generations() {
            let Some(slot) = search_locked(generation, &probe_key, hash) else {
                continue;
            };
            // flag first, then clear the half hash: a racing reader either
            // still sees the half hash and skips on the DELETED flag, or
            // stops at the zeroed word
            slot.entry.flags.store(FLAG_DELETED, Release);
            slot.chunk.half_hashes[slot.slot_index].store(0, Release);
            slot.chunk.meta.is_full.store(0, Relaxed);
            slot.chunk.meta.slots_occupied.fetch_sub(1, Relaxed);
            let previous = slot.entry.value.load(Relaxed);
            let key_ptr = slot.entry.key_ptr.load(Relaxed);
            let key_len = slot.entry.key_len.load(Relaxed) as usize;
            drop(slot);
            px.stage(key_ptr, key_len);
            return Some(previous);
        }
        None
    }

    /// Best-effort per-bucket iteration over the current generation. Takes
    /// no locks; concurrent updates may or may not be reflected
    pub fn iter(&self) -> Iter<'_> {
        Iter::new(&self.current)
    }
}

impl Drop for Hashtable {
    fn drop(&mut self) {
        // drain the collector first: staged buffers of deleted keys are
        // freed there, surviving FILLED entries below
        self.gc.shutdown();
        let old = self.old.swap(core::ptr::null_mut(), Relaxed);
        if !old.is_null() {
            let mut old = unsafe {
                // UNSAFE(@stormcache): exclusive at drop time
                Box::from_raw(old)
            };
            old.free_keys();
        }
        self.current.free_keys();
    }
}
