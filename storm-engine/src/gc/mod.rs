/*
 * Created on Thu Feb 15 2024
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
    Epoch-based deferred reclamation.

    Lock-free readers may dereference a key buffer while a writer retires
    it, so freed memory must outlive every reader that could have observed
    it. Each participating thread registers a context carrying a bounded
    SPSC staging ring and a published epoch: the monotonic timestamp of its
    last quiescent point (enter() or advance()). Retiring stages
    `{epoch: now, ptr, len}` into the caller's ring; a staged object is
    reclaimable once every live participant has published an epoch past it,
    i.e. every thread has passed through a quiescent point after the
    retirement.

    The collector thread periodically snapshots the participant registry
    (rebuilt only when the change counter moves, under the registry
    spinlock, which participants' hot paths never take), publishes the
    minimum live epoch and drains every ring up to it. Ring consumption is
    serialized by a per-context ticket lock because a producer under
    back-pressure drains its own ring inline; destructor batches run
    outside that lock through a small circular queue.
*/

pub(crate) mod worker;
#[cfg(test)]
mod tests;

use {
    crate::{
        mem::unsafe_apis,
        sync::{
            queue::RingBuffer,
            spinlock::{SpinMutex, TicketLock},
            Backoff,
        },
        time::monotonic_ns,
    },
    core::{
        cell::Cell,
        marker::PhantomData,
        sync::atomic::{
            AtomicBool, AtomicU64,
            Ordering::{Acquire, Relaxed, Release},
        },
    },
    std::{sync::Arc, thread},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What the staged pointers of a GC instance point at; selects the
/// destructor the collector runs
pub enum ObjectKind {
    /// Padded key buffers from [`unsafe_apis::alloc_key_buffer`]
    KeyBuffer,
}

/// A retired object: the staging epoch plus enough to reconstruct the
/// allocation
#[derive(Debug, Clone, Copy)]
pub(crate) struct Staged {
    pub(crate) epoch: u64,
    pub(crate) ptr: *mut u8,
    pub(crate) len: u32,
}

// staged pointers are owned allocations in flight between threads
unsafe impl Send for Staged {}

pub(crate) fn reclaim(kind: ObjectKind, object: Staged) {
    match kind {
        ObjectKind::KeyBuffer => unsafe {
            // UNSAFE(@stormcache): the staging thread owned the buffer and
            // every reader that could hold it has quiesced since
            unsafe_apis::dealloc_key_buffer(object.ptr, object.len as usize)
        },
    }
}

/// Per-thread GC state. Producer side of `ring` belongs to the owning
/// thread; the consumer side to whoever holds `drain_lock`
pub(crate) struct ThreadCtx {
    pub(crate) epoch: AtomicU64,
    pub(crate) terminated: AtomicBool,
    pub(crate) drain_lock: TicketLock,
    pub(crate) ring: RingBuffer<Staged>,
}

/// One garbage collector instance: a participant registry plus a background
/// collector thread.
///
/// The collector keeps a clone of the owning `Arc`, so an instance that is
/// simply dropped without [`EpochGc::shutdown`] leaks the thread; the
/// [`Hashtable`](crate::Hashtable) calls shutdown from its own drop
pub struct EpochGc {
    kind: ObjectKind,
    registry: SpinMutex<Vec<Arc<ThreadCtx>>>,
    /// Bumped on every registry mutation; tells the collector to rebuild
    /// its cached snapshot
    change_epoch: AtomicU64,
    /// The minimum live epoch as of the last collector pass. Objects staged
    /// strictly before it are reclaimable; producers use it for inline
    /// drains without touching the registry
    safe_epoch: AtomicU64,
    terminate: AtomicBool,
    collected: AtomicU64,
    staging_capacity: usize,
    pub(crate) loop_wait_ms: u64,
    handle: parking_lot::Mutex<Option<thread::JoinHandle<()>>>,
}

impl EpochGc {
    pub fn new(kind: ObjectKind, staging_capacity: usize, loop_wait_ms: u64) -> Arc<Self> {
        let gc = Arc::new(Self {
            kind,
            registry: SpinMutex::new(Vec::new()),
            change_epoch: AtomicU64::new(0),
            safe_epoch: AtomicU64::new(0),
            terminate: AtomicBool::new(false),
            collected: AtomicU64::new(0),
            staging_capacity,
            loop_wait_ms,
            handle: parking_lot::Mutex::new(None),
        });
        let worker_gc = Arc::clone(&gc);
        let handle = thread::Builder::new()
            .name("storm-gc".to_owned())
            .spawn(move || worker::collector_main(worker_gc))
            .expect("failed to spawn the gc collector thread");
        *gc.handle.lock() = Some(handle);
        gc
    }
    pub(crate) fn kind(&self) -> ObjectKind {
        self.kind
    }
    /// Register the calling thread. The participant must stay on that
    /// thread and be dropped (or explicitly left) before the instance is
    /// shut down
    pub fn enter(&self) -> Participant<'_> {
        let ctx = Arc::new(ThreadCtx {
            epoch: AtomicU64::new(monotonic_ns()),
            terminated: AtomicBool::new(false),
            drain_lock: TicketLock::new(),
            ring: RingBuffer::new(self.staging_capacity),
        });
        self.registry.lock().push(Arc::clone(&ctx));
        self.change_epoch.fetch_add(1, Release);
        Participant {
            gc: self,
            ctx,
            _single_thread: PhantomData,
        }
    }
    /// Objects reclaimed since this instance started
    pub fn collected_objects(&self) -> u64 {
        self.collected.load(Acquire)
    }
    /// Stop the collector: waits for every participant to terminate, drains
    /// every staging ring and joins the thread. Idempotent
    pub fn shutdown(&self) {
        self.terminate.store(true, Release);
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                log::error!("the gc collector thread panicked");
            }
        }
    }
}

impl Drop for EpochGc {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A thread's registration with an [`EpochGc`]. Not `Sync`: the staging
/// ring's producer side is single-threaded by construction. Dropping marks
/// the thread terminated; whatever is still staged is reclaimed by the
/// collector once it is safe
pub struct Participant<'a> {
    gc: &'a EpochGc,
    ctx: Arc<ThreadCtx>,
    _single_thread: PhantomData<Cell<()>>,
}

impl Participant<'_> {
    /// How many failed staging attempts before the back-pressure loop
    /// complains
    const STAGE_PRESSURE_WARN: u32 = 1000;

    /// Publish a quiescent point: this thread holds no references into the
    /// table. Eligible staged objects are reclaimed inline on the way out
    pub fn advance(&self) {
        self.ctx.epoch.store(monotonic_ns(), Release);
        self.collect_local();
    }
    /// Stage an object for deferred reclamation. If the ring is full, the
    /// thread advances and drains synchronously until a slot opens
    /// (back-pressure)
    pub(crate) fn stage(&self, ptr: *mut u8, len: usize) {
        let mut object = Staged {
            epoch: monotonic_ns(),
            ptr,
            len: len as u32,
        };
        let backoff = Backoff::new();
        let mut attempts = 0u32;
        loop {
            match unsafe {
                // UNSAFE(@stormcache): !Sync makes this thread the only
                // producer
                self.ctx.ring.push(object)
            } {
                Ok(()) => return,
                Err(back) => object = back,
            }
            self.advance();
            attempts += 1;
            if attempts == Self::STAGE_PRESSURE_WARN {
                log::warn!(
                    "staging ring full for {attempts} attempts; a participant is \
                     holding the safe epoch back"
                );
            }
            backoff.snooze();
        }
    }
    /// Drain this thread's own ring up to the last published safe epoch
    fn collect_local(&self) -> u64 {
        let safe_epoch = self.gc.safe_epoch.load(Acquire);
        let mut freed = 0;
        {
            let _drain = self.ctx.drain_lock.lock();
            loop {
                let Some(object) = (unsafe {
                    // UNSAFE(@stormcache): consumer side is ours while the
                    // drain lock is held
                    self.ctx.ring.peek()
                }) else {
                    break;
                };
                if object.epoch >= safe_epoch {
                    break;
                }
                unsafe {
                    // UNSAFE(@stormcache): as above
                    self.ctx.ring.pop();
                }
                reclaim(self.gc.kind, object);
                freed += 1;
            }
        }
        if freed > 0 {
            self.gc.collected.fetch_add(freed, Relaxed);
        }
        freed
    }
    pub(crate) fn belongs_to(&self, gc: &EpochGc) -> bool {
        core::ptr::eq(self.gc, gc)
    }
}

impl Drop for Participant<'_> {
    fn drop(&mut self) {
        self.ctx.terminated.store(true, Release);
        self.gc.change_epoch.fetch_add(1, Release);
    }
}
