/*
 * Created on Fri Feb 23 2024
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
    super::{EpochGc, ObjectKind},
    crate::{
        config::{EngineConfig, GcConfig},
        idx::Hashtable,
        mem::unsafe_apis::alloc_key_buffer,
    },
    std::{
        sync::Arc,
        thread,
        time::{Duration, Instant},
    },
};

fn fast_gc() -> Arc<EpochGc> {
    // surface collector logs when a test run wants them (STORM_LOG=trace)
    let _ = env_logger::builder()
        .is_test(true)
        .parse_filters(&std::env::var("STORM_LOG").unwrap_or_default())
        .try_init();
    EpochGc::new(ObjectKind::KeyBuffer, 1024, 2)
}

fn wait_for(what: &str, timeout: Duration, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < timeout, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn stage_then_advance_reclaims() {
    let gc = fast_gc();
    {
        let px = gc.enter();
        let buffer = alloc_key_buffer(b"retired");
        px.stage(buffer, 7);
        // our published epoch predates the staging; nothing may be freed yet
        thread::sleep(Duration::from_millis(20));
        assert_eq!(gc.collected_objects(), 0);
        px.advance();
        wait_for("the staged buffer to be reclaimed", Duration::from_secs(2), || {
            gc.collected_objects() == 1
        });
    }
    gc.shutdown();
    assert_eq!(gc.collected_objects(), 1);
}

#[test]
fn observer_pins_the_safe_epoch() {
    let gc = fast_gc();
    {
        // the observer registers first and never advances
        let observer = gc.enter();
        let worker = gc.enter();
        let buffer = alloc_key_buffer(b"pinned");
        worker.stage(buffer, 6);
        worker.advance();
        thread::sleep(Duration::from_millis(50));
        // the observer has not advanced past the staging epoch
        assert_eq!(gc.collected_objects(), 0);
        observer.advance();
        wait_for("reclamation after the observer advanced", Duration::from_secs(2), || {
            gc.collected_objects() == 1
        });
        drop(worker);
        drop(observer);
    }
    gc.shutdown();
}

#[test]
fn observer_leave_unblocks_reclamation() {
    let gc = fast_gc();
    {
        let observer = gc.enter();
        let worker = gc.enter();
        let buffer = alloc_key_buffer(b"blocked");
        worker.stage(buffer, 7);
        worker.advance();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(gc.collected_objects(), 0);
        // leaving has the same effect as advancing: the thread no longer
        // holds anything back
        drop(observer);
        wait_for("reclamation after the observer left", Duration::from_secs(2), || {
            gc.collected_objects() == 1
        });
        drop(worker);
    }
    gc.shutdown();
}

#[test]
fn backpressure_on_a_tiny_ring() {
    // ring of 4: staging 100 objects forces synchronous drains
    let gc = EpochGc::new(ObjectKind::KeyBuffer, 4, 2);
    {
        let px = gc.enter();
        for i in 0..100usize {
            let key = format!("spill-{i}");
            let buffer = alloc_key_buffer(key.as_bytes());
            px.stage(buffer, key.len());
        }
    }
    gc.shutdown();
    assert_eq!(gc.collected_objects(), 100);
}

#[test]
fn shutdown_drains_everything() {
    let gc = fast_gc();
    {
        let px = gc.enter();
        for i in 0..64usize {
            let key = format!("leftover-{i}");
            let buffer = alloc_key_buffer(key.as_bytes());
            px.stage(buffer, key.len());
        }
        // no advance: nothing is reclaimable while we are registered
    }
    gc.shutdown();
    assert_eq!(gc.collected_objects(), 64);
}

#[test]
fn deleted_table_keys_flow_through_the_collector() {
    const WORKERS: usize = 3;
    const CYCLES: usize = 10_000;
    let table = Hashtable::with_config(&EngineConfig {
        initial_buckets: 1 << 14,
        gc: GcConfig {
            staging_capacity: 16384,
            loop_wait_ms: 5,
        },
        ..EngineConfig::default()
    })
    .unwrap();
    // registers before any staging and never advances
    let observer = table.enter();
    thread::scope(|s| {
        for worker in 0..WORKERS {
            let table = &table;
            s.spawn(move || {
                let px = table.enter();
                for i in 0..CYCLES {
                    let key = format!("w{worker}-{i}").into_bytes();
                    table.set(&key, i + 1, &px).unwrap();
                    assert_eq!(table.delete(&key, &px), Some(i + 1));
                    px.advance();
                }
            });
        }
    });
    // every retirement happened after the observer's epoch
    assert_eq!(table.gc().collected_objects(), 0);
    drop(observer);
    wait_for(
        "the collector to drain all retired keys",
        Duration::from_secs(5),
        || table.gc().collected_objects() == (WORKERS * CYCLES) as u64,
    );
}

#[test]
fn table_drop_reclaims_outstanding_state() {
    let table = Hashtable::with_config(&EngineConfig {
        initial_buckets: 256,
        gc: GcConfig {
            loop_wait_ms: 2,
            ..GcConfig::default()
        },
        ..EngineConfig::default()
    })
    .unwrap();
    {
        let px = table.enter();
        for i in 0..100usize {
            let key = format!("key-{i}").into_bytes();
            table.set(&key, i + 1, &px).unwrap();
        }
        for i in (0..100usize).step_by(2) {
            let key = format!("key-{i}").into_bytes();
            assert_eq!(table.delete(&key, &px), Some(i + 1));
        }
    }
    // dropping shuts the collector down, drains the staged half and frees
    // the still-filled half; nothing to assert beyond not crashing under
    // the allocator's checks
    drop(table);
}
