/*
 * Created on Thu Feb 08 2024
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
    This module implements the key hash: seedable CRC32C (Castagnoli), run
    twice to fill 64 bits. The hardware path uses the SSE4.2 crc32
    instruction; the software path is a slice-by-8 table walk with identical
    output for every input. Whichever is selected, the derived half hash has
    bit 31 forced, so a half-hash word of 0 always means an empty slot; any
    substitute hash function must preserve that property.
*/

use std::sync::OnceLock;

/// Seed of the first CRC32C pass; the second pass is seeded with the first
/// pass' output
pub const HASH_SEED: u32 = 42;

const CRC32C_POLY: u32 = 0x82f6_3b78;
const CRC32C_XOR: u32 = 0xffff_ffff;

type Crc32Fn = fn(&[u8], u32) -> u32;

static CRC32C_FN: OnceLock<Crc32Fn> = OnceLock::new();

/// 64-bit hash of a key: CRC32C with [`HASH_SEED`] in the low word, CRC32C
/// seeded with the low word in the high word
pub fn hash(key: &[u8]) -> u64 {
    let crc32c = *CRC32C_FN.get_or_init(resolve);
    let lo = crc32c(key, HASH_SEED);
    let hi = crc32c(key, lo);
    ((hi as u64) << 32) | lo as u64
}

/// Seedable CRC32C over `data`, using the best implementation this CPU has
pub fn crc32c(data: &[u8], seed: u32) -> u32 {
    CRC32C_FN.get_or_init(resolve)(data, seed)
}

/// Upper half of the hash with bit 31 forced, so it can never collide with
/// the empty slot marker
#[inline(always)]
pub const fn half_hash(hash: u64) -> u32 {
    ((hash >> 32) as u32) | 0x8000_0000
}

/// Low 16 bits of the half hash; diagnostics only
#[inline(always)]
pub const fn quarter_hash(half_hash: u32) -> u16 {
    half_hash as u16
}

fn resolve() -> Crc32Fn {
    #[cfg(target_arch = "x86_64")]
    {
        if std::is_x86_feature_detected!("sse4.2") {
            log::debug!("crc32c: selected the sse4.2 implementation");
            return crc32c_hw;
        }
    }
    log::debug!("crc32c: selected the software implementation");
    crc32c_sw
}

#[cfg(target_arch = "x86_64")]
fn crc32c_hw(data: &[u8], seed: u32) -> u32 {
    unsafe {
        // UNSAFE(@stormcache): only resolved after the cpuid check
        crc32c_sse42(data, seed)
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse4.2")]
unsafe fn crc32c_sse42(data: &[u8], seed: u32) -> u32 {
    use core::arch::x86_64::{_mm_crc32_u64, _mm_crc32_u8};
    let mut ptr = data.as_ptr();
    let mut len = data.len();
    let mut crc64 = (seed ^ CRC32C_XOR) as u64;
    while len >= 8 {
        crc64 = _mm_crc32_u64(crc64, (ptr as *const u64).read_unaligned());
        ptr = ptr.add(8);
        len -= 8;
    }
    let mut crc = crc64 as u32;
    while len > 0 {
        crc = _mm_crc32_u8(crc, ptr.read());
        ptr = ptr.add(1);
        len -= 1;
    }
    crc ^ CRC32C_XOR
}

const fn crc32c_table() -> [[u32; 256]; 8] {
    let mut table = [[0u32; 256]; 8];
    let mut n = 0;
    while n < 256 {
        let mut crc = n as u32;
        let mut k = 0;
        while k < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC32C_POLY
            } else {
                crc >> 1
            };
            k += 1;
        }
        table[0][n] = crc;
        n += 1;
    }
    let mut n = 0;
    while n < 256 {
        let mut crc = table[0][n];
        let mut k = 1;
        while k < 8 {
            crc = table[0][(crc & 0xff) as usize] ^ (crc >> 8);
            table[k][n] = crc;
            k += 1;
        }
        n += 1;
    }
    table
}

static CRC32C_TABLE: [[u32; 256]; 8] = crc32c_table();

/// Software CRC32C: one qword per step through the 8x256 table, bit-identical
/// to the hardware path
fn crc32c_sw(data: &[u8], seed: u32) -> u32 {
    let t = &CRC32C_TABLE;
    let mut crc: u64 = (seed ^ CRC32C_XOR) as u64;
    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        crc ^= u64::from_le_bytes([
            chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
        ]);
        crc = (t[7][(crc & 0xff) as usize]
            ^ t[6][((crc >> 8) & 0xff) as usize]
            ^ t[5][((crc >> 16) & 0xff) as usize]
            ^ t[4][((crc >> 24) & 0xff) as usize]
            ^ t[3][((crc >> 32) & 0xff) as usize]
            ^ t[2][((crc >> 40) & 0xff) as usize]
            ^ t[1][((crc >> 48) & 0xff) as usize]
            ^ t[0][(crc >> 56) as usize]) as u64;
    }
    for byte in chunks.remainder() {
        crc = t[0][((crc ^ *byte as u64) & 0xff) as usize] as u64 ^ (crc >> 8);
    }
    (crc as u32) ^ CRC32C_XOR
}
