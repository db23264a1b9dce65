/*
 * Created on Sun Feb 11 2024
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
    The three search procedures every table operation funnels through:

    - search_only: lock-free reads. Relies on half-hash words being single
      32-bit atomic stores ordered before the entry flags, and on deletes
      flagging DELETED before clearing the half hash.
    - search_locked: the same walk with the write locks held, for delete.
    - search_or_create: the write path. Two passes over a bounded window of
      chunks, acquiring every examined chunk's lock in strictly increasing
      index order and releasing the whole set only at the end of the call;
      since every writer acquires in the same order and the window is
      bounded by SEARCH_MAX, lock cycles cannot form.

    A LockWindow tracks the contiguous locked range and guarantees release
    on every exit path; the one lock that must outlive the call (the chunk
    of a matched or created slot doubles as the publish fence for the
    caller's entry writes) is moved out through transfer() into the
    returned SlotRef.
*/

use {
    super::{
        meta::{Chunk, Entry, CHUNK_SLOTS, SEARCH_MAX},
        probe::{probe, PROBE_NOT_FOUND},
        HtData,
    },
    crate::{hash::half_hash, mem::cmp::PreparedKey},
    core::sync::atomic::Ordering::{Acquire, Relaxed, Release},
};

pub(super) enum SearchOutcome<'a> {
    /// The key is present; the slot's chunk lock is still held
    Existing(SlotRef<'a>),
    /// A fresh slot was claimed (half hash installed); the caller finalizes
    /// the entry and drops the ref to publish
    Created(SlotRef<'a>),
    /// Key absent (search-only mode)
    Missing,
    /// The search window around the anchor is exhausted
    OutOfSpace,
}

/// A slot plus the still-held write lock of its chunk. Dropping releases the
/// lock; every mutation the holder performs before that is published to
/// lock-free readers by the release store in the unlock
pub(super) struct SlotRef<'a> {
    pub chunk: &'a Chunk,
    pub entry: &'a Entry,
    pub slot_index: usize,
}

impl Drop for SlotRef<'_> {
    fn drop(&mut self) {
        self.chunk.meta.write_lock.unlock();
    }
}

/// The contiguous range of chunk locks held by a write operation. Locks are
/// only ever acquired at the high end (increasing chunk index) and the whole
/// range is released together on drop
struct LockWindow<'a> {
    data: &'a HtData,
    start: usize,
    locked_up_to: usize,
}

impl<'a> LockWindow<'a> {
    fn new(data: &'a HtData, start: usize) -> Self {
        data.chunk(start).meta.write_lock.lock();
        Self {
            data,
            start,
            locked_up_to: start,
        }
    }
    /// Extend the locked range to cover `chunk_index`
    fn extend_to(&mut self, chunk_index: usize) {
        debug_assert!(chunk_index >= self.start);
        while self.locked_up_to < chunk_index {
            self.locked_up_to += 1;
            self.data.chunk(self.locked_up_to).meta.write_lock.lock();
        }
    }
    /// Release every lock except `keep_chunk`'s, which moves into the
    /// returned [`SlotRef`]
    fn transfer(self, keep_chunk: usize, slot_index: usize) -> SlotRef<'a> {
        debug_assert!((self.start..=self.locked_up_to).contains(&keep_chunk));
        for index in self.start..=self.locked_up_to {
            if index != keep_chunk {
                self.data.chunk(index).meta.write_lock.unlock();
            }
        }
        let slot = SlotRef {
            chunk: self.data.chunk(keep_chunk),
            entry: self.data.entry(keep_chunk * CHUNK_SLOTS + slot_index),
            slot_index,
        };
        core::mem::forget(self);
        slot
    }
}

impl Drop for LockWindow<'_> {
    fn drop(&mut self) {
        for index in self.start..=self.locked_up_to {
            self.data.chunk(index).meta.write_lock.unlock();
        }
    }
}

/// Lock-free search. Returns the `(chunk_index, slot_index)` of a FILLED
/// entry matching the key, or `None`
pub(super) fn search_only(data: &HtData, key: &PreparedKey, hash: u64) -> Option<(usize, usize)> {
    let anchor = data.anchor_chunk(hash);
    let needle = half_hash(hash);
    let overflow = data
        .chunk(anchor)
        .meta
        .overflowed_chunks_counter
        .load(Acquire) as usize;
    for chunk_index in anchor..=anchor + overflow {
        let chunk = data.chunk(chunk_index);
        let mut skip_mask = 0u32;
        loop {
            let slot = unsafe {
                // UNSAFE(@stormcache): a chunk row is 14 words
                probe(needle, chunk.half_hashes.as_ptr() as *const u32, skip_mask)
            };
            if slot == PROBE_NOT_FOUND {
                break;
            }
            skip_mask |= 1 << slot;
            let entry = data.entry(chunk_index * CHUNK_SLOTS + slot as usize);
            let flags = entry.flags.load(Acquire);
            if flags == 0 {
                // matching half hash but the entry is still being filled (or
                // never was); nothing further in this chunk can be older
                break;
            }
            if Entry::is_deleted(flags) {
                continue;
            }
            let len = entry.key_len.load(Acquire) as usize;
            if len != key.len() {
                continue;
            }
            let ptr = entry.key_ptr.load(Acquire);
            if unsafe {
                // UNSAFE(@stormcache): FILLED entries point at live key
                // buffers; reclamation is epoch-deferred
                key.eq_stored(ptr, len)
            } {
                return Some((chunk_index, slot as usize));
            }
        }
    }
    None
}

/// The locked twin of [`search_only`], used by delete: the walk holds the
/// write lock of every chunk it has examined so the caller may mutate the
/// matched slot under its chunk's lock
pub(super) fn search_locked<'a>(
    data: &'a HtData,
    key: &PreparedKey,
    hash: u64,
) -> Option<SlotRef<'a>> {
    let anchor = data.anchor_chunk(hash);
    let needle = half_hash(hash);
    let mut window = LockWindow::new(data, anchor);
    let overflow = data
        .chunk(anchor)
        .meta
        .overflowed_chunks_counter
        .load(Acquire) as usize;
    for chunk_index in anchor..=anchor + overflow {
        window.extend_to(chunk_index);
        if let Some(slot) = probe_chunk_for_key(data, chunk_index, key, needle) {
            return Some(window.transfer(chunk_index, slot));
        }
    }
    None
}

/// Probe one locked chunk for an exact key match
fn probe_chunk_for_key(
    data: &HtData,
    chunk_index: usize,
    key: &PreparedKey,
    needle: u32,
) -> Option<usize> {
    let chunk = data.chunk(chunk_index);
    let mut skip_mask = 0u32;
    loop {
        let slot = unsafe {
            // UNSAFE(@stormcache): a chunk row is 14 words
            probe(needle, chunk.half_hashes.as_ptr() as *const u32, skip_mask)
        };
        if slot == PROBE_NOT_FOUND {
            return None;
        }
        skip_mask |= 1 << slot;
        let entry = data.entry(chunk_index * CHUNK_SLOTS + slot as usize);
        let flags = entry.flags.load(Relaxed);
        if !Entry::is_filled(flags) {
            continue;
        }
        let len = entry.key_len.load(Relaxed) as usize;
        if len != key.len() {
            continue;
        }
        let ptr = entry.key_ptr.load(Relaxed);
        if unsafe {
            // UNSAFE(@stormcache): FILLED entry under this chunk's lock
            key.eq_stored(ptr, len)
        } {
            return Some(slot as usize);
        }
    }
}

/// The write path: locate the key or claim a fresh slot for it.
///
/// Pass 1 walks the overflow window looking for the key. Pass 2 (create
/// mode only) re-walks from the first chunk that had free space, probing for
/// an empty half-hash word, extending the window up to
/// `anchor + SEARCH_MAX - 1`. On a claim the half hash is installed and the
/// anchor's overflow counter raised before the slot is handed back; the
/// caller writes the entry and publishes by dropping the [`SlotRef`]
pub(super) fn search_or_create<'a>(
    data: &'a HtData,
    key: &PreparedKey,
    hash: u64,
    create: bool,
) -> SearchOutcome<'a> {
    let anchor = data.anchor_chunk(hash);
    let needle = half_hash(hash);
    let mut window = LockWindow::new(data, anchor);
    let overflow = data
        .chunk(anchor)
        .meta
        .overflowed_chunks_counter
        .load(Acquire) as usize;

    // pass 1: locate an existing entry, remembering where free space starts
    let mut first_free = anchor;
    let mut saw_free = false;
    for chunk_index in anchor..=anchor + overflow {
        window.extend_to(chunk_index);
        if !saw_free {
            first_free = chunk_index;
            if data.chunk(chunk_index).meta.is_full.load(Relaxed) == 0 {
                saw_free = true;
            }
        }
        if let Some(slot) = probe_chunk_for_key(data, chunk_index, key, needle) {
            let chunk = data.chunk(chunk_index);
            chunk.meta.changes_counter.fetch_add(1, Relaxed);
            return SearchOutcome::Existing(window.transfer(chunk_index, slot));
        }
    }
    if !create {
        return SearchOutcome::Missing;
    }

    // pass 2: claim the first empty slot in the window
    for chunk_index in first_free..anchor + SEARCH_MAX {
        window.extend_to(chunk_index);
        let chunk = data.chunk(chunk_index);
        let slot = unsafe {
            // UNSAFE(@stormcache): a chunk row is 14 words
            probe(0, chunk.half_hashes.as_ptr() as *const u32, 0)
        };
        if slot == PROBE_NOT_FOUND {
            chunk.meta.is_full.store(1, Relaxed);
            continue;
        }
        chunk.half_hashes[slot as usize].store(needle, Relaxed);
        if chunk_index > anchor {
            let counter = &data.chunk(anchor).meta.overflowed_chunks_counter;
            let grown = (chunk_index - anchor) as u8;
            debug_assert!((grown as usize) < SEARCH_MAX);
            if counter.load(Relaxed) < grown {
                // paired with the acquire load in search_only
                counter.store(grown, Release);
            }
        }
        chunk.meta.changes_counter.fetch_add(1, Relaxed);
        return SearchOutcome::Created(window.transfer(chunk_index, slot as usize));
    }
    SearchOutcome::OutOfSpace
}
