/*
 * Created on Sat Feb 10 2024
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
    The innermost operation of every lookup: match a 32-bit half hash
    against the 14 half-hash words of a chunk and return the lowest matching
    slot not excluded by the caller's skip mask. The vector path compares
    all 14 lanes with two overlapping 256-bit loads (lanes 0..8 and 6..14)
    and reduces through movemask; the scalar path is an exact behavioral
    twin, and the probe equivalence tests in tests.rs hold them together.

    Half-hash words are only ever mutated through aligned 32-bit atomic
    stores, so a racing vector load cannot observe a torn lane; observing a
    mix of old and new lanes is fine, the entry flags and the key compare
    decide after the probe.
*/

use {super::meta::CHUNK_SLOTS, std::sync::OnceLock};

/// The no-match sentinel: `trailing_zeros` of an empty match mask
pub const PROBE_NOT_FOUND: u32 = u32::BITS;

type ProbeFn = fn(u32, *const u32, u32) -> u32;

static PROBE_FN: OnceLock<ProbeFn> = OnceLock::new();

/// Find the lowest slot in `half_hashes` (a chunk's 14 words) equal to
/// `needle` and not masked off by `skip_mask`, or [`PROBE_NOT_FOUND`].
///
/// ## Safety
/// `half_hashes` must point at 14 consecutive, 4-byte-aligned half-hash
/// words (a chunk row)
#[inline(always)]
pub unsafe fn probe(needle: u32, half_hashes: *const u32, skip_mask: u32) -> u32 {
    PROBE_FN.get_or_init(resolve)(needle, half_hashes, skip_mask)
}

fn resolve() -> ProbeFn {
    #[cfg(target_arch = "x86_64")]
    {
        if std::is_x86_feature_detected!("avx2") {
            log::debug!("probe: selected the avx2 implementation");
            return probe_avx2_dispatch;
        }
    }
    log::debug!("probe: selected the scalar implementation");
    probe_scalar
}

#[cfg(target_arch = "x86_64")]
fn probe_avx2_dispatch(needle: u32, half_hashes: *const u32, skip_mask: u32) -> u32 {
    unsafe {
        // UNSAFE(@stormcache): only resolved after the cpuid check; pointer
        // contract is forwarded from probe()
        probe_avx2(needle, half_hashes, skip_mask)
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn probe_avx2(needle: u32, half_hashes: *const u32, skip_mask: u32) -> u32 {
    use core::arch::x86_64 as x86;
    let needle_vector = x86::_mm256_set1_epi32(needle as i32);
    // lanes 0..8, then lanes 6..14; the two duplicated lanes OR out
    let lo = x86::_mm256_loadu_si256(half_hashes.cast());
    let hi = x86::_mm256_loadu_si256(half_hashes.add(6).cast());
    let mut matches = x86::_mm256_movemask_ps(x86::_mm256_castsi256_ps(
        x86::_mm256_cmpeq_epi32(lo, needle_vector),
    )) as u32;
    matches |= (x86::_mm256_movemask_ps(x86::_mm256_castsi256_ps(x86::_mm256_cmpeq_epi32(
        hi,
        needle_vector,
    ))) as u32)
        << 6;
    (matches & !skip_mask).trailing_zeros()
}

fn probe_scalar(needle: u32, half_hashes: *const u32, skip_mask: u32) -> u32 {
    use core::sync::atomic::{AtomicU32, Ordering::Relaxed};
    for slot in 0..CHUNK_SLOTS as u32 {
        if skip_mask & (1 << slot) != 0 {
            continue;
        }
        let word = unsafe {
            // UNSAFE(@stormcache): in-bounds per the probe() contract;
            // AtomicU32 is layout-compatible with u32
            (*(half_hashes.add(slot as usize) as *const AtomicU32)).load(Relaxed)
        };
        if word == needle {
            return slot;
        }
    }
    PROBE_NOT_FOUND
}

#[cfg(test)]
pub(super) fn probe_scalar_for_tests(needle: u32, half_hashes: *const u32, skip_mask: u32) -> u32 {
    probe_scalar(needle, half_hashes, skip_mask)
}
