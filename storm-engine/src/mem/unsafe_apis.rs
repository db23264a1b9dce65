/*
 * Created on Mon Feb 05 2024
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

/*!
    # Unsafe APIs

    This module provides abstractions (unsafe, still) over unsafe allocator and related APIs.
    Out of memory is not recoverable mid-operation, so allocation failure asserts.
*/

use std::{
    alloc::{self, Layout},
    ptr,
};

/// Key buffers are padded to a multiple of this and aligned to it, so the
/// 32-byte vectorized compare in [`super::cmp`] may always issue a full-width
/// load against a stored key
pub const KEY_BUFFER_ALIGN: usize = 32;

/// Allocate the given layout. This will panic if the allocator returns an error
#[inline(always)]
pub unsafe fn alloc_layout<T>(layout: Layout) -> *mut T {
    let ptr = alloc::alloc(layout);
    assert!(!ptr.is_null(), "malloc failed");
    ptr as _
}

/// Deallocate the given layout
#[inline(always)]
pub unsafe fn dealloc_layout(ptr: *mut u8, layout: Layout) {
    alloc::dealloc(ptr, layout)
}

#[inline(always)]
fn key_buffer_layout(len: usize) -> Layout {
    debug_assert!(len != 0);
    let size = (len + KEY_BUFFER_ALIGN - 1) & !(KEY_BUFFER_ALIGN - 1);
    unsafe {
        // UNSAFE(@stormcache): size is a nonzero multiple of the (power of two) align
        Layout::from_size_align_unchecked(size, KEY_BUFFER_ALIGN)
    }
}

/// Copy `key` into a fresh engine-owned buffer, padded with zeroes up to the
/// next multiple of [`KEY_BUFFER_ALIGN`]
pub fn alloc_key_buffer(key: &[u8]) -> *mut u8 {
    let layout = key_buffer_layout(key.len());
    unsafe {
        // UNSAFE(@stormcache): layout is nonzero; bounds below match it
        let ptr = alloc_layout::<u8>(layout);
        ptr::copy_nonoverlapping(key.as_ptr(), ptr, key.len());
        ptr::write_bytes(ptr.add(key.len()), 0, layout.size() - key.len());
        ptr
    }
}

/// Free a buffer previously returned by [`alloc_key_buffer`] for a key of
/// length `len`.
///
/// ## Safety
/// `ptr` must come from [`alloc_key_buffer`] called with a key of exactly
/// `len` bytes, and must not be freed twice
pub unsafe fn dealloc_key_buffer(ptr: *mut u8, len: usize) {
    dealloc_layout(ptr, key_buffer_layout(len))
}

#[cfg(test)]
mod tests {
    use super::{alloc_key_buffer, dealloc_key_buffer, KEY_BUFFER_ALIGN};

    #[test]
    fn key_buffer_padding() {
        for len in 1..100usize {
            let key: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let ptr = alloc_key_buffer(&key);
            assert_eq!(ptr as usize % KEY_BUFFER_ALIGN, 0);
            unsafe {
                assert_eq!(std::slice::from_raw_parts(ptr, len), &key[..]);
                // the pad tail is zeroed
                let padded = (len + KEY_BUFFER_ALIGN - 1) & !(KEY_BUFFER_ALIGN - 1);
                for i in len..padded {
                    assert_eq!(*ptr.add(i), 0);
                }
                dealloc_key_buffer(ptr, len);
            }
        }
    }
}
