/*
 * Created on Mon Feb 19 2024
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
    Most of these assertions are only meaningful at quiescence: metadata
    counters and slot states are atomically correct at a point in time, not
    across one. Concurrent tests therefore join every writer before looking
    at the table's insides.
*/

use {
    super::{
        meta::{Entry, CHUNK_SLOTS, SEARCH_MAX},
        probe::{probe, probe_scalar_for_tests, PROBE_NOT_FOUND},
        Hashtable,
    },
    crate::{
        config::{EngineConfig, GcConfig},
        error::EngineError,
        hash,
    },
    core::sync::atomic::Ordering::Relaxed,
    rand::{rngs::StdRng, Rng, SeedableRng},
    std::{collections::HashMap, thread},
};

fn table(buckets: usize) -> Hashtable {
    Hashtable::with_config(&EngineConfig {
        initial_buckets: buckets,
        gc: GcConfig {
            loop_wait_ms: 5,
            ..GcConfig::default()
        },
        ..EngineConfig::default()
    })
    .unwrap()
}

/// Generate `count` keys whose anchor chunk in a `buckets`-bucket table is
/// `anchor`, by prefix enumeration
fn colliding_keys(buckets: usize, anchor: usize, count: usize) -> Vec<Vec<u8>> {
    assert!(buckets.is_power_of_two());
    let mut keys = Vec::with_capacity(count);
    let mut seq = 0usize;
    while keys.len() < count {
        let key = format!("collide-{seq}").into_bytes();
        if (hash::hash(&key) as usize & (buckets - 1)) / CHUNK_SLOTS == anchor {
            keys.push(key);
        }
        seq += 1;
    }
    keys
}

/// Walk every chunk of the current generation and check the structural
/// invariants: stored half hashes match their keys, `slots_occupied` counts
/// FILLED slots, and every entry sits inside its anchor's overflow window
fn check_invariants(t: &Hashtable) -> usize {
    let data = &t.current;
    let mut filled_total = 0;
    for chunk_index in 0..data.chunks_count {
        let chunk = data.chunk(chunk_index);
        let mut filled_in_chunk = 0;
        for slot in 0..CHUNK_SLOTS {
            let entry = data.entry(chunk_index * CHUNK_SLOTS + slot);
            let flags = entry.flags.load(Relaxed);
            if !Entry::is_filled(flags) {
                continue;
            }
            filled_in_chunk += 1;
            let len = entry.key_len.load(Relaxed) as usize;
            let key = unsafe {
                // UNSAFE(@stormcache): quiescent table, entry owns the buffer
                std::slice::from_raw_parts(entry.key_ptr.load(Relaxed), len)
            };
            let h = hash::hash(key);
            assert_eq!(
                chunk.half_hashes[slot].load(Relaxed),
                hash::half_hash(h),
                "stored half hash diverges from the stored key"
            );
            let anchor = data.anchor_chunk(h);
            let overflow = data
                .chunk(anchor)
                .meta
                .overflowed_chunks_counter
                .load(Relaxed) as usize;
            assert!(
                chunk_index - anchor <= overflow,
                "entry at chunk {chunk_index} outside its anchor {anchor} window of {overflow}"
            );
        }
        assert_eq!(
            chunk.meta.slots_occupied.load(Relaxed) as usize,
            filled_in_chunk,
            "slots_occupied diverges in chunk {chunk_index}"
        );
        filled_total += filled_in_chunk;
    }
    assert_eq!(t.iter().count(), filled_total);
    filled_total
}

#[test]
fn empty_table() {
    let t = table(128);
    let px = t.enter();
    assert_eq!(t.get(b"nothing", &px), None);
    assert_eq!(t.delete(b"nothing", &px), None);
    assert_eq!(t.iter().count(), 0);
}

#[test]
fn set_get_update_delete() {
    let t = table(128);
    let px = t.enter();
    assert_eq!(t.set(b"k1", 123, &px), Ok(None));
    assert_eq!(t.get(b"k1", &px), Some(123));
    // overwrite returns the supplanted value
    assert_eq!(t.set(b"k1", 456, &px), Ok(Some(123)));
    assert_eq!(t.get(b"k1", &px), Some(456));
    assert_eq!(t.delete(b"k1", &px), Some(456));
    assert_eq!(t.get(b"k1", &px), None);
    assert_eq!(t.delete(b"k1", &px), None);
}

#[test]
fn rejects_bad_keys() {
    let t = table(128);
    let px = t.enter();
    assert_eq!(t.set(b"", 1, &px), Err(EngineError::EmptyKey));
    let oversized = vec![b'x'; 65536];
    assert_eq!(t.set(&oversized, 1, &px), Err(EngineError::KeyTooLong));
    assert_eq!(t.get(&oversized, &px), None);
    assert_eq!(t.delete(&oversized, &px), None);
    // the maximum length itself is accepted
    let max = vec![b'y'; 65535];
    assert_eq!(t.set(&max, 2, &px), Ok(None));
    assert_eq!(t.get(&max, &px), Some(2));
}

#[test]
fn rejects_zero_capacity() {
    assert_eq!(
        Hashtable::new(0).err(),
        Some(EngineError::InvalidCapacity)
    );
}

#[test]
fn capacity_rounds_up_to_power_of_two() {
    let t = table(100);
    assert_eq!(t.bucket_count(), 128);
    let t = table(128);
    assert_eq!(t.bucket_count(), 128);
}

#[test]
fn long_keys_roundtrip() {
    let t = table(128);
    let px = t.enter();
    // around and past the 32B vectorized compare boundary
    for len in [31usize, 32, 33, 64, 100, 1000] {
        let key: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        assert_eq!(t.set(&key, len, &px), Ok(None));
        assert_eq!(t.get(&key, &px), Some(len));
        // a same-length key differing only in the last byte
        let mut other = key.clone();
        *other.last_mut().unwrap() ^= 1;
        assert_eq!(t.get(&other, &px), None);
    }
}

#[test]
fn chunk_fill_then_first_overflow() {
    let t = table(128);
    let px = t.enter();
    let keys = colliding_keys(128, 0, 15);
    // 14 colliding keys pack the anchor chunk without overflowing
    for (i, key) in keys[..14].iter().enumerate() {
        assert_eq!(t.set(key, i + 1, &px), Ok(None));
    }
    let chunk0 = t.current.chunk(0);
    assert_eq!(chunk0.meta.overflowed_chunks_counter.load(Relaxed), 0);
    assert_eq!(chunk0.meta.slots_occupied.load(Relaxed) as usize, CHUNK_SLOTS);
    // the 15th lands in the next chunk and raises the overflow counter
    assert_eq!(t.set(&keys[14], 15, &px), Ok(None));
    assert_eq!(chunk0.meta.overflowed_chunks_counter.load(Relaxed), 1);
    assert_eq!(t.current.chunk(1).meta.slots_occupied.load(Relaxed), 1);
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(t.get(key, &px), Some(i + 1), "key {i}");
    }
    check_invariants(&t);
}

#[test]
fn overflow_walk_across_three_chunks() {
    let t = table(128);
    let px = t.enter();
    let keys = colliding_keys(128, 0, 45);
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(t.set(key, i + 1, &px), Ok(None));
    }
    assert_eq!(
        t.current
            .chunk(0)
            .meta
            .overflowed_chunks_counter
            .load(Relaxed),
        3
    );
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(t.get(key, &px), Some(i + 1), "key {i}");
    }
    assert_eq!(t.iter().count(), 45);
    check_invariants(&t);
}

#[test]
fn delete_frees_the_slot_for_reuse() {
    let t = table(128);
    let px = t.enter();
    assert_eq!(t.set(b"k1", 123, &px), Ok(None));
    let position = t.iter().find(|(_, v)| *v == 123).unwrap().0;
    assert_eq!(t.delete(b"k1", &px), Some(123));
    assert_eq!(t.get(b"k1", &px), None);
    assert_eq!(t.iter().count(), 0);
    // the re-insert reuses the freed slot
    assert_eq!(t.set(b"k1", 456, &px), Ok(None));
    assert_eq!(t.iter().find(|(_, v)| *v == 456).unwrap().0, position);
    assert_eq!(t.get(b"k1", &px), Some(456));
    check_invariants(&t);
}

#[test]
fn full_search_window_rejects_then_recovers() {
    let t = table(128);
    let px = t.enter();
    let window_slots = SEARCH_MAX * CHUNK_SLOTS;
    let keys = colliding_keys(128, 0, window_slots + 1);
    let mut inserted = 0;
    for key in &keys {
        match t.set(key, inserted + 1, &px) {
            Ok(None) => inserted += 1,
            Err(EngineError::OutOfSpace) => break,
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    // every slot of the anchor's window holds one of our keys
    assert_eq!(inserted, window_slots);
    for (i, key) in keys[..inserted].iter().enumerate() {
        assert_eq!(t.get(key, &px), Some(i + 1), "key {i}");
    }
    check_invariants(&t);
    // freeing any one slot lets the rejected key in
    assert_eq!(t.delete(&keys[0], &px), Some(1));
    assert_eq!(t.set(&keys[window_slots], 99999, &px), Ok(None));
    assert_eq!(t.get(&keys[window_slots], &px), Some(99999));
    check_invariants(&t);
}

#[test]
fn randomized_against_model() {
    let mut rng = StdRng::seed_from_u64(0x5701_11ab);
    let t = table(4096);
    let px = t.enter();
    let mut model: HashMap<Vec<u8>, usize> = HashMap::new();
    for round in 0..20_000usize {
        let key = format!("k{}", rng.gen_range(0..2000usize)).into_bytes();
        match rng.gen_range(0..4u8) {
            0 | 1 => {
                let previous = t.set(&key, round + 1, &px).unwrap();
                assert_eq!(previous, model.insert(key, round + 1));
            }
            2 => assert_eq!(t.get(&key, &px), model.get(&key).copied()),
            _ => assert_eq!(t.delete(&key, &px), model.remove(&key)),
        }
        if round % 256 == 0 {
            px.advance();
        }
    }
    for (key, value) in &model {
        assert_eq!(t.get(key, &px), Some(*value));
    }
    assert_eq!(check_invariants(&t), model.len());
}

#[test]
fn concurrent_disjoint_writers() {
    const THREADS: usize = 8;
    const KEYS_PER_THREAD: usize = 4096;
    let t = table(1 << 17);
    thread::scope(|s| {
        for tid in 0..THREADS {
            let t = &t;
            s.spawn(move || {
                let px = t.enter();
                for i in 0..KEYS_PER_THREAD {
                    let key = format!("t{tid}-key-{i}").into_bytes();
                    let value = tid * 10_000_000 + i + 1;
                    assert_eq!(t.set(&key, value, &px), Ok(None));
                    if i % 3 == 0 {
                        assert_eq!(t.delete(&key, &px), Some(value));
                    }
                    if i % 64 == 0 {
                        px.advance();
                    }
                }
                // re-read our own key space while the others keep writing
                for i in 0..KEYS_PER_THREAD {
                    let key = format!("t{tid}-key-{i}").into_bytes();
                    let expected = tid * 10_000_000 + i + 1;
                    match t.get(&key, &px) {
                        Some(value) => assert_eq!(value, expected),
                        None => assert_eq!(i % 3, 0),
                    }
                }
            });
        }
    });
    let deleted_per_thread = (KEYS_PER_THREAD + 2) / 3;
    let live = THREADS * (KEYS_PER_THREAD - deleted_per_thread);
    assert_eq!(check_invariants(&t), live);
}

#[test]
fn concurrent_same_key_last_write_wins() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 2000;
    let t = table(1024);
    thread::scope(|s| {
        for tid in 1..=THREADS {
            let t = &t;
            s.spawn(move || {
                let px = t.enter();
                for i in 0..ROUNDS {
                    t.set(b"contended", tid * 100_000 + i, &px).unwrap();
                    // any concurrent read must observe a value some thread wrote
                    let got = t.get(b"contended", &px).unwrap();
                    assert!((1..=THREADS).contains(&(got / 100_000)));
                }
            });
        }
    });
    assert_eq!(check_invariants(&t), 1);
}

#[test]
fn probe_vector_and_scalar_agree() {
    let mut rng = StdRng::seed_from_u64(0x9e3779b9);
    for _ in 0..1000 {
        let mut row = [0u32; CHUNK_SLOTS];
        for word in &mut row {
            *word = if rng.gen_bool(0.3) {
                0
            } else {
                rng.gen::<u32>() | 0x8000_0000
            };
        }
        let mut needles: Vec<u32> = row.to_vec();
        needles.push(0);
        needles.push(rng.gen::<u32>() | 0x8000_0000);
        let mut skip_masks = vec![0u32];
        for slot in 0..CHUNK_SLOTS {
            skip_masks.push(1 << slot);
            skip_masks.push(!(1u32 << slot));
        }
        for &needle in &needles {
            for &skip in &skip_masks {
                let vectorized = unsafe { probe(needle, row.as_ptr(), skip) };
                let scalar = probe_scalar_for_tests(needle, row.as_ptr(), skip);
                assert_eq!(
                    vectorized, scalar,
                    "needle {needle:#x} skip {skip:#x} row {row:?}"
                );
            }
        }
    }
}

#[test]
fn probe_not_found_sentinel() {
    let row = [0u32; CHUNK_SLOTS];
    assert_eq!(
        unsafe { probe(0x8000_0001, row.as_ptr(), 0) },
        PROBE_NOT_FOUND
    );
    // a full skip mask hides every match
    assert_eq!(unsafe { probe(0, row.as_ptr(), (1 << CHUNK_SLOTS) - 1) }, PROBE_NOT_FOUND);
}
