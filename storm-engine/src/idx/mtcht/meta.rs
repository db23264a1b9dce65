/*
 * Created on Fri Feb 09 2024
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

use {
    crate::sync::spinlock::Spinlock,
    core::sync::atomic::{AtomicPtr, AtomicU16, AtomicU32, AtomicU8, AtomicUsize},
};

/// Slots per chunk: 14 half-hash words plus the metadata word share one
/// 64-byte line
pub const CHUNK_SLOTS: usize = 14;
/// Upper bound on the chunk window a write may examine past its anchor. The
/// trailing `SEARCH_MAX` chunks of every generation exist so that windows
/// starting at the last anchor never wrap
pub const SEARCH_MAX: usize = 32;
/// Hard ceiling on key length (64 KiB - 1); `key_len` is a 16-bit field
pub const MAX_KEY_LENGTH: u32 = u16::MAX as u32;

pub const FLAG_FILLED: u8 = 1 << 0;
pub const FLAG_DELETED: u8 = 1 << 1;

#[repr(C)]
#[derive(Debug)]
pub struct ChunkMetadata {
    /// Guards every mutation of this chunk (half hashes, entries, the
    /// counters below)
    pub write_lock: Spinlock,
    /// How many chunks past this one host entries anchored here. Only ever
    /// written on the anchor chunk, under its lock; read lock-free with
    /// acquire ordering. Monotonic under concurrent writes
    pub overflowed_chunks_counter: AtomicU8,
    /// Set when a placement pass found no free slot here; cleared by delete
    pub is_full: AtomicU8,
    /// Wrapping mutation counter, diagnostics only
    pub changes_counter: AtomicU8,
    /// Number of FILLED entries in this chunk
    pub slots_occupied: AtomicU8,
}

/// One probe group: the metadata word followed by 14 half-hash words, all in
/// a single cache line. Chunks are never constructed by value; they live in
/// the zero-initialized backing mapping of a generation (all-zeroes is the
/// valid empty state: unlocked, no overflow, every slot empty)
#[repr(C, align(64))]
#[derive(Debug)]
pub struct Chunk {
    pub meta: ChunkMetadata,
    pub half_hashes: [AtomicU32; CHUNK_SLOTS],
}

assertions!(
    core::mem::size_of::<ChunkMetadata>() == 8,
    core::mem::size_of::<Chunk>() == 64,
    core::mem::align_of::<Chunk>() == 64,
);

/// The entry record backing one slot. `flags` publishes the entry: readers
/// trust `key_len`/`key_ptr`/`value` only after observing FILLED with
/// acquire ordering (paired with the release store in the write path).
/// `FILLED` and `DELETED` are mutually exclusive; both clear means the slot
/// was never used
#[repr(C)]
#[derive(Debug)]
pub struct Entry {
    pub flags: AtomicU8,
    pub key_len: AtomicU16,
    pub key_ptr: AtomicPtr<u8>,
    pub value: AtomicUsize,
}

assertions!(!cfg!(target_pointer_width = "64") || core::mem::size_of::<Entry>() == 24);

impl Entry {
    #[inline(always)]
    pub fn is_filled(flags: u8) -> bool {
        flags & FLAG_FILLED != 0
    }
    #[inline(always)]
    pub fn is_deleted(flags: u8) -> bool {
        flags & FLAG_DELETED != 0
    }
}
