/*
 * Created on Sun Feb 04 2024
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
    crate::mem::CachePadded,
    core::{
        cell::UnsafeCell,
        mem::MaybeUninit,
        sync::atomic::{
            AtomicUsize,
            Ordering::{Acquire, Relaxed, Release},
        },
    },
};

/// A plain bounded circular queue. Not thread-safe; callers use it from one
/// thread context at a time (the GC collector batches reclamations through
/// one of these so that destructors never run under a drain lock)
#[derive(Debug)]
pub struct CircularQueue<T> {
    items: Box<[Option<T>]>,
    head: usize,
    tail: usize,
    count: usize,
}

impl<T> CircularQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity != 0, "zero-capacity circular queue");
        let mut items = Vec::with_capacity(capacity);
        items.resize_with(capacity, || None);
        Self {
            items: items.into_boxed_slice(),
            head: 0,
            tail: 0,
            count: 0,
        }
    }
    pub fn capacity(&self) -> usize {
        self.items.len()
    }
    pub fn len(&self) -> usize {
        self.count
    }
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
    pub fn is_full(&self) -> bool {
        self.count == self.items.len()
    }
    /// Enqueue `item`, returning it back if the queue is full
    pub fn enqueue(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        self.items[self.tail] = Some(item);
        self.tail = (self.tail + 1) % self.items.len();
        self.count += 1;
        Ok(())
    }
    pub fn dequeue(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let item = self.items[self.head].take();
        self.head = (self.head + 1) % self.items.len();
        self.count -= 1;
        item
    }
    pub fn peek(&self) -> Option<&T> {
        self.items[self.head].as_ref()
    }
}

/// A bounded single-producer single-consumer ring. The producer side belongs
/// to exactly one thread; the consumer side belongs to whoever holds the
/// owning context's drain lock. `T: Copy` keeps slot hand-off trivial (the
/// GC stages plain `{epoch, ptr, len}` records)
#[derive(Debug)]
pub struct RingBuffer<T: Copy> {
    buf: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

unsafe impl<T: Copy + Send> Send for RingBuffer<T> {}
unsafe impl<T: Copy + Send> Sync for RingBuffer<T> {}

impl<T: Copy> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let mut buf = Vec::with_capacity(capacity);
        buf.resize_with(capacity, || UnsafeCell::new(MaybeUninit::uninit()));
        Self {
            buf: buf.into_boxed_slice(),
            mask: capacity - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }
    pub fn len(&self) -> usize {
        self.tail.load(Acquire).wrapping_sub(self.head.load(Acquire))
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn is_full(&self) -> bool {
        self.len() == self.buf.len()
    }
    /// Push an item, handing it back if the ring is full.
    ///
    /// ## Safety
    /// Only one thread may act as the producer
    pub unsafe fn push(&self, item: T) -> Result<(), T> {
        let tail = self.tail.load(Relaxed);
        if tail.wrapping_sub(self.head.load(Acquire)) == self.buf.len() {
            return Err(item);
        }
        (*self.buf[tail & self.mask].get()).write(item);
        self.tail.store(tail.wrapping_add(1), Release);
        Ok(())
    }
    /// Copy out the oldest item without consuming it.
    ///
    /// ## Safety
    /// Only one thread may act as the consumer at a time
    pub unsafe fn peek(&self) -> Option<T> {
        let head = self.head.load(Relaxed);
        if self.tail.load(Acquire) == head {
            return None;
        }
        Some((*self.buf[head & self.mask].get()).assume_init())
    }
    /// Consume the oldest item.
    ///
    /// ## Safety
    /// Only one thread may act as the consumer at a time
    pub unsafe fn pop(&self) -> Option<T> {
        let head = self.head.load(Relaxed);
        if self.tail.load(Acquire) == head {
            return None;
        }
        let item = (*self.buf[head & self.mask].get()).assume_init();
        self.head.store(head.wrapping_add(1), Release);
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::{CircularQueue, RingBuffer},
        std::thread,
    };

    #[test]
    fn circular_queue_wraps() {
        let mut q = CircularQueue::new(4);
        assert!(q.is_empty());
        assert!(q.dequeue().is_none());
        for i in 0..4 {
            q.enqueue(i).unwrap();
        }
        assert!(q.is_full());
        assert_eq!(q.enqueue(99), Err(99));
        assert_eq!(q.peek(), Some(&0));
        assert_eq!(q.dequeue(), Some(0));
        q.enqueue(4).unwrap();
        for i in 1..5 {
            assert_eq!(q.dequeue(), Some(i));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn ring_fills_and_drains() {
        let r = RingBuffer::new(8);
        unsafe {
            for i in 0..8usize {
                r.push(i).unwrap();
            }
            assert!(r.is_full());
            assert_eq!(r.push(8), Err(8));
            assert_eq!(r.peek(), Some(0));
            for i in 0..8usize {
                assert_eq!(r.pop(), Some(i));
            }
            assert!(r.pop().is_none());
        }
    }

    #[test]
    fn ring_spsc_threads() {
        const N: usize = 1 << 16;
        let r = RingBuffer::new(1024);
        thread::scope(|s| {
            s.spawn(|| {
                for i in 0..N {
                    loop {
                        if unsafe { r.push(i) }.is_ok() {
                            break;
                        }
                        std::hint::spin_loop();
                    }
                }
            });
            s.spawn(|| {
                let mut expected = 0;
                while expected < N {
                    if let Some(v) = unsafe { r.pop() } {
                        assert_eq!(v, expected);
                        expected += 1;
                    } else {
                        std::hint::spin_loop();
                    }
                }
            });
        });
        assert!(r.is_empty());
    }
}
