/*
 * Created on Tue Feb 06 2024
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
    OS-level allocation for the table backing store: anonymous mappings
    (optionally backed by 2 MiB huge pages) and NUMA interleaving. Mapping
    failure for a table generation is fatal; the degraded paths (no huge
    pages, no NUMA policy) log and fall back instead.
*/

pub const HUGEPAGE_2MB: usize = 2 * 1024 * 1024;

#[cfg(unix)]
pub fn page_size() -> usize {
    unsafe {
        // UNSAFE(@stormcache): plain sysconf query
        libc::sysconf(libc::_SC_PAGESIZE) as usize
    }
}

#[cfg(not(unix))]
pub fn page_size() -> usize {
    4096
}

/// Map a zeroed, page-aligned anonymous region. Aborts if the OS refuses
#[cfg(unix)]
pub fn mmap_alloc(size: usize) -> *mut u8 {
    unsafe {
        // UNSAFE(@stormcache): anonymous private mapping, checked below
        let ptr = libc::mmap(
            core::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            fatal!("mmap of {size}B failed: {}", std::io::Error::last_os_error());
        }
        ptr as *mut u8
    }
}

#[cfg(unix)]
pub fn mmap_free(ptr: *mut u8, size: usize) {
    unsafe {
        // UNSAFE(@stormcache): ptr/size come from a successful mmap_alloc
        if libc::munmap(ptr as *mut libc::c_void, size) != 0 {
            fatal!(
                "munmap of {size}B at {ptr:p} failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(not(unix))]
pub fn mmap_alloc(size: usize) -> *mut u8 {
    let Ok(layout) = std::alloc::Layout::from_size_align(size, page_size()) else {
        fatal!("bad backing store layout ({size}B)");
    };
    let ptr = unsafe {
        // UNSAFE(@stormcache): nonzero layout
        std::alloc::alloc_zeroed(layout)
    };
    if ptr.is_null() {
        fatal!("allocation of {size}B for the backing store failed");
    }
    ptr
}

#[cfg(not(unix))]
pub fn mmap_free(ptr: *mut u8, size: usize) {
    unsafe {
        // UNSAFE(@stormcache): same layout as mmap_alloc
        std::alloc::dealloc(
            ptr,
            std::alloc::Layout::from_size_align(size, page_size()).unwrap(),
        )
    }
}

/// Round `size` up to the 2 MiB huge page granule
pub const fn round_to_2mb(size: usize) -> usize {
    (size + HUGEPAGE_2MB - 1) & !(HUGEPAGE_2MB - 1)
}

/// Try to map `size` bytes (rounded up to the huge page granule) backed by
/// 2 MiB pages. Returns the mapping and its true length, or `None` if the
/// kernel cannot satisfy it right now
#[cfg(target_os = "linux")]
pub fn mmap_alloc_2mb(size: usize) -> Option<(*mut u8, usize)> {
    let size = round_to_2mb(size);
    unsafe {
        // UNSAFE(@stormcache): anonymous private mapping, checked below
        let ptr = libc::mmap(
            core::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_HUGETLB | libc::MAP_HUGE_2MB,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return None;
        }
        Some((ptr as *mut u8, size))
    }
}

#[cfg(target_os = "linux")]
fn read_sysfs_u64(path: &str) -> Option<u64> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Check whether more than `min_free` 2 MiB huge pages are free and not
/// already reserved
#[cfg(target_os = "linux")]
pub fn hugepages_2mb_available(min_free: u64) -> bool {
    const SYSFS_2MB: &str = "/sys/kernel/mm/hugepages/hugepages-2048kB";
    let free = read_sysfs_u64(&format!("{SYSFS_2MB}/free_hugepages")).unwrap_or(0);
    let resv = read_sysfs_u64(&format!("{SYSFS_2MB}/resv_hugepages")).unwrap_or(0);
    free.saturating_sub(resv) > min_free
}

/// Number of configured NUMA nodes (1 when the topology cannot be read)
#[cfg(target_os = "linux")]
pub fn numa_node_count() -> usize {
    let Ok(possible) = std::fs::read_to_string("/sys/devices/system/node/possible") else {
        return 1;
    };
    // the file reads like "0" or "0-3"
    possible
        .trim()
        .rsplit('-')
        .next()
        .and_then(|max| max.parse::<usize>().ok())
        .map(|max| max + 1)
        .unwrap_or(1)
}

#[cfg(target_os = "linux")]
const MPOL_INTERLEAVE: libc::c_long = 3;

/// Interleave the pages of `[ptr, ptr + size)` across the NUMA nodes in
/// `mask`. Failure is a degraded state, not an error: the mapping stays
/// usable with the default policy
#[cfg(target_os = "linux")]
pub fn numa_interleave(ptr: *mut u8, size: usize, mask: u64) -> bool {
    // maxnode must cover the highest set bit; hand the kernel two words
    let nodemask = [mask, 0u64];
    let rc = unsafe {
        // UNSAFE(@stormcache): mbind over a mapping we own
        libc::syscall(
            libc::SYS_mbind,
            ptr as *mut libc::c_void,
            size,
            MPOL_INTERLEAVE,
            nodemask.as_ptr(),
            (nodemask.len() * 64) as libc::c_ulong,
            0 as libc::c_uint,
        )
    };
    if rc != 0 {
        log::warn!(
            "mbind(MPOL_INTERLEAVE, {mask:#b}) failed: {}; continuing with the default policy",
            std::io::Error::last_os_error()
        );
        return false;
    }
    true
}
