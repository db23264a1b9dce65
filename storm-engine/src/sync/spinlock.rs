/*
 * Created on Sat Feb 03 2024
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
    The write side of every chunk is guarded by a 4-byte spinlock that is
    embedded directly in the chunk metadata word, so the layout here is part
    of the on-memory format: one lock byte (stamped with a per-thread id in
    debug builds so unlock can verify the caller is the recorded holder),
    one flags byte and a 16-bit field recording what the last contended
    acquisition paid in spins. Critical sections guarded by these locks do
    O(chunks touched) work and never block on external events, so spinning
    (with a scheduler yield once the backoff saturates) is the right trade.
    A lock observed spinning for an absurd amount of iterations is flagged
    POTENTIALLY_STUCK and reported; that is a diagnostic, not a recovery
    mechanism.
*/

use {
    super::Backoff,
    core::{
        cell::UnsafeCell,
        marker::PhantomData,
        ops::{Deref, DerefMut},
        sync::atomic::{
            AtomicU16, AtomicU8,
            Ordering::{Acquire, Relaxed, Release},
        },
    },
};

const UNLOCKED: u8 = 0;
#[cfg(not(debug_assertions))]
const LOCKED: u8 = 1;

/// Set on a lock that a waiter has spun on for [`Spinlock::STUCK_THRESHOLD`]
/// iterations without observing a release
pub const FLAG_POTENTIALLY_STUCK: u8 = 1 << 0;

#[cfg(debug_assertions)]
mod holder {
    /*
        Debug builds acquire with a small nonzero per-thread id in the lock
        byte instead of a bare 1, so that unlock can check the caller is the
        thread that locked. Ids recycle after 255 live threads, the same
        imprecision a truncated tid would have.
    */
    use std::sync::atomic::{AtomicU8, Ordering::Relaxed};

    static NEXT: AtomicU8 = AtomicU8::new(0);
    thread_local! {
        static ID: u8 = NEXT.fetch_add(1, Relaxed) % 255 + 1;
    }

    pub(super) fn current() -> u8 {
        ID.with(|id| *id)
    }
}

#[derive(Debug)]
#[repr(C, align(4))]
pub struct Spinlock {
    lock: AtomicU8,
    flags: AtomicU8,
    /// Spins the last contended acquisition paid before it got the lock
    predicted_spins: AtomicU16,
}

assertions!(
    core::mem::size_of::<Spinlock>() == 4,
    core::mem::align_of::<Spinlock>() == 4,
);

impl Spinlock {
    /// Spins on a held lock before the waiter flags it as potentially stuck
    const STUCK_THRESHOLD: u64 = 1 << 28;

    pub const fn new() -> Self {
        Self {
            lock: AtomicU8::new(UNLOCKED),
            flags: AtomicU8::new(0),
            predicted_spins: AtomicU16::new(0),
        }
    }
    #[cfg(debug_assertions)]
    #[inline(always)]
    fn lock_value() -> u8 {
        holder::current()
    }
    #[cfg(not(debug_assertions))]
    #[inline(always)]
    fn lock_value() -> u8 {
        LOCKED
    }
    #[inline(always)]
    pub fn try_lock(&self) -> bool {
        self.lock
            .compare_exchange(UNLOCKED, Self::lock_value(), Acquire, Relaxed)
            .is_ok()
    }
    /// Acquire the lock, retrying forever. Acquisition is infallible; the
    /// stuck detection below only reports
    pub fn lock(&self) {
        let mut spins: u64 = 0;
        while !self.try_lock() {
            let backoff = Backoff::new();
            while self.is_locked() {
                backoff.snooze();
                spins += 1;
                if spins == Self::STUCK_THRESHOLD {
                    self.set_flag(FLAG_POTENTIALLY_STUCK);
                    log::error!(
                        "possible stuck spinlock detected at {:p} (thread {:?})",
                        self,
                        std::thread::current().id()
                    );
                }
            }
        }
        if spins != 0 {
            // what the next contended waiter should expect to pay
            self.predicted_spins
                .store(spins.min(u16::MAX as u64) as u16, Relaxed);
        }
    }
    #[inline(always)]
    pub fn unlock(&self) {
        #[cfg(debug_assertions)]
        {
            debug_assert_eq!(
                self.lock.load(Relaxed),
                holder::current(),
                "unlock of a spinlock not held by this thread"
            );
        }
        self.flags.store(0, Relaxed);
        self.lock.store(UNLOCKED, Release);
    }
    #[inline(always)]
    pub fn is_locked(&self) -> bool {
        self.lock.load(Acquire) != UNLOCKED
    }
    /// Spin count paid by the most recent contended acquisition
    pub fn predicted_spins(&self) -> u16 {
        self.predicted_spins.load(Relaxed)
    }
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags.load(Acquire) & flag == flag
    }
    fn set_flag(&self, flag: u8) {
        self.flags.fetch_or(flag, Release);
    }
}

/// A value guarded by a [`Spinlock`]. The guard releases on every exit path,
/// including panics
pub struct SpinMutex<T> {
    lock: Spinlock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            lock: Spinlock::new(),
            data: UnsafeCell::new(data),
        }
    }
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        self.lock.lock();
        SpinMutexGuard {
            m: self,
            _stay_on_thread: PhantomData,
        }
    }
}

/// Not `Send`: the holder check ties release to the acquiring thread
pub struct SpinMutexGuard<'a, T> {
    m: &'a SpinMutex<T>,
    _stay_on_thread: PhantomData<*mut ()>,
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe {
            // UNSAFE(@stormcache): exclusion is guaranteed by the held lock
            &*self.m.data.get()
        }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe {
            // UNSAFE(@stormcache): exclusion is guaranteed by the held lock
            &mut *self.m.data.get()
        }
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.m.lock.unlock()
    }
}

/// A FIFO ticket lock: 16-bit `available`/`serving` counters. Waiters are
/// served strictly in arrival order, which is what the GC draining paths
/// want (a producer doing an inline drain must not be starved by the
/// collector)
#[derive(Debug)]
#[repr(C, align(4))]
pub struct TicketLock {
    available: AtomicU16,
    serving: AtomicU16,
}

assertions!(core::mem::size_of::<TicketLock>() == 4);

impl TicketLock {
    const STUCK_THRESHOLD: u64 = 1 << 28;

    pub const fn new() -> Self {
        Self {
            available: AtomicU16::new(0),
            serving: AtomicU16::new(0),
        }
    }
    pub fn lock(&self) -> TicketGuard<'_> {
        let ticket = self.available.fetch_add(1, Relaxed);
        let backoff = Backoff::new();
        let mut spins: u64 = 0;
        while self.serving.load(Acquire) != ticket {
            backoff.snooze();
            spins += 1;
            if spins == Self::STUCK_THRESHOLD {
                log::error!(
                    "possible stuck ticket lock detected at {:p} (thread {:?})",
                    self,
                    std::thread::current().id()
                );
            }
        }
        TicketGuard { l: self }
    }
}

pub struct TicketGuard<'a> {
    l: &'a TicketLock,
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        // wraps with the 16-bit ticket space
        self.l.serving.fetch_add(1, Release);
    }
}

#[cfg(test)]
mod tests {
    use {
        super::{SpinMutex, Spinlock, TicketLock},
        std::thread,
    };

    #[test]
    fn uncontended() {
        let l = Spinlock::new();
        assert!(!l.is_locked());
        l.lock();
        assert!(l.is_locked());
        assert!(!l.try_lock());
        l.unlock();
        assert!(l.try_lock());
        l.unlock();
    }

    #[test]
    fn contended_acquire_records_spins() {
        use std::{
            sync::atomic::{AtomicBool, Ordering::SeqCst},
            time::Duration,
        };
        let l = Spinlock::new();
        let waiting = AtomicBool::new(false);
        l.lock();
        thread::scope(|s| {
            let waiter = s.spawn(|| {
                waiting.store(true, SeqCst);
                l.lock();
                let spins = l.predicted_spins();
                l.unlock();
                spins
            });
            while !waiting.load(SeqCst) {
                std::hint::spin_loop();
            }
            // hold the lock long enough that the waiter definitely spins
            thread::sleep(Duration::from_millis(50));
            l.unlock();
            assert!(waiter.join().unwrap() > 0);
        });
    }

    #[test]
    fn mutual_exclusion() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 10_000;
        let m = SpinMutex::new(0u64);
        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    for _ in 0..ROUNDS {
                        *m.lock() += 1;
                    }
                });
            }
        });
        assert_eq!(*m.lock(), (THREADS * ROUNDS) as u64);
    }

    #[test]
    fn ticket_mutual_exclusion() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 10_000;
        struct Cell(core::cell::UnsafeCell<u64>);
        unsafe impl Sync for Cell {}
        let l = TicketLock::new();
        let v = Cell(core::cell::UnsafeCell::new(0));
        thread::scope(|s| {
            for _ in 0..THREADS {
                let v = &v;
                let l = &l;
                s.spawn(move || {
                    for _ in 0..ROUNDS {
                        let _g = l.lock();
                        unsafe {
                            // UNSAFE(@stormcache): serialized by the ticket lock
                            *v.0.get() += 1;
                        }
                    }
                });
            }
        });
        assert_eq!(unsafe { *v.0.get() }, (THREADS * ROUNDS) as u64);
    }
}
