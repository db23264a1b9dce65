/*
 * Created on Sat Feb 17 2024
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
    super::{reclaim, EpochGc, ThreadCtx},
    crate::sync::queue::CircularQueue,
    core::sync::atomic::Ordering::{Acquire, Relaxed, Release},
    std::{sync::Arc, thread, time::Duration},
};

/// Reclamations batched per drain-lock acquisition; destructors run with
/// the lock released
const COLLECT_BATCH: usize = 64;

/// The collector loop. Runs on the dedicated `storm-gc` thread until
/// [`EpochGc::shutdown`] raises the terminate flag, then waits for global
/// quiescence, force-drains everything and exits
pub(crate) fn collector_main(gc: Arc<EpochGc>) {
    log::debug!("gc collector started (period {}ms)", gc.loop_wait_ms);
    let mut cache: Vec<Arc<ThreadCtx>> = Vec::new();
    let mut cache_epoch = u64::MAX;
    loop {
        thread::sleep(Duration::from_millis(gc.loop_wait_ms));
        if gc.terminate.load(Acquire) {
            break;
        }
        // rebuild the cached participant snapshot if the registry moved
        let change_epoch = gc.change_epoch.load(Acquire);
        if change_epoch != cache_epoch {
            cache = gc.registry.lock().clone();
            cache_epoch = change_epoch;
        }
        // publish the reclamation horizon: the minimum epoch any live
        // participant has announced
        let mut safe_epoch = u64::MAX;
        for ctx in &cache {
            if !ctx.terminated.load(Acquire) {
                safe_epoch = safe_epoch.min(ctx.epoch.load(Acquire));
            }
        }
        gc.safe_epoch.store(safe_epoch, Release);
        let collected = collect_staged(&gc, &cache, safe_epoch);
        if collected > 0 {
            log::trace!("gc pass reclaimed {collected} objects");
        }
        // retire contexts whose thread left and whose ring is drained
        let retired = {
            let mut registry = gc.registry.lock();
            let before = registry.len();
            registry.retain(|ctx| !(ctx.terminated.load(Acquire) && ctx.ring.is_empty()));
            before - registry.len()
        };
        if retired > 0 {
            gc.change_epoch.fetch_add(1, Release);
        }
    }

    // termination: every participant must have left before the final drain
    loop {
        let all_terminated = gc
            .registry
            .lock()
            .iter()
            .all(|ctx| ctx.terminated.load(Acquire));
        if all_terminated {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    gc.safe_epoch.store(u64::MAX, Release);
    let cache: Vec<Arc<ThreadCtx>> = gc.registry.lock().clone();
    let collected = collect_staged(&gc, &cache, u64::MAX);
    gc.registry.lock().clear();
    gc.change_epoch.fetch_add(1, Release);
    log::debug!(
        "gc collector stopped ({collected} objects in the final drain, {} total)",
        gc.collected.load(Relaxed)
    );
}

/// Drain every cached ring up to `safe_epoch`, batching through a circular
/// queue so destructors never run under a drain lock
fn collect_staged(gc: &EpochGc, cache: &[Arc<ThreadCtx>], safe_epoch: u64) -> u64 {
    let mut total = 0u64;
    let mut batch = CircularQueue::new(COLLECT_BATCH);
    for ctx in cache {
        loop {
            {
                let _drain = ctx.drain_lock.lock();
                while !batch.is_full() {
                    let Some(object) = (unsafe {
                        // UNSAFE(@stormcache): consumer side is ours while
                        // the drain lock is held
                        ctx.ring.peek()
                    }) else {
                        break;
                    };
                    if object.epoch >= safe_epoch {
                        break;
                    }
                    unsafe {
                        // UNSAFE(@stormcache): as above
                        ctx.ring.pop();
                    }
                    let _ = batch.enqueue(object);
                }
            }
            if batch.is_empty() {
                break;
            }
            while let Some(object) = batch.dequeue() {
                reclaim(gc.kind(), object);
                total += 1;
            }
        }
    }
    if total > 0 {
        gc.collected.fetch_add(total, Relaxed);
    }
    total
}
