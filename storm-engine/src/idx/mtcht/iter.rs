/*
 * Created on Tue Feb 13 2024
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
    super::{meta::Entry, HtData},
    core::sync::atomic::Ordering::Acquire,
};

/// A per-bucket cursor over the FILLED entries of the current generation,
/// yielding `(bucket_index, value)` pairs. Reads follow the same lock-free
/// rules as `get`: snapshotting is best-effort, and an iteration running
/// concurrently with writers may observe a mix of pre- and post-update
/// state
pub struct Iter<'a> {
    data: &'a HtData,
    cursor: usize,
}

impl<'a> Iter<'a> {
    pub(super) fn new(data: &'a HtData) -> Self {
        Self { data, cursor: 0 }
    }
    /// The bucket the next call to [`Iterator::next`] will start scanning at
    pub fn cursor(&self) -> usize {
        self.cursor
    }
}

impl Iterator for Iter<'_> {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        while self.cursor < self.data.buckets_count_real {
            let bucket_index = self.cursor;
            self.cursor += 1;
            let entry = self.data.entry(bucket_index);
            if Entry::is_filled(entry.flags.load(Acquire)) {
                return Some((bucket_index, entry.value.load(Acquire)));
            }
        }
        None
    }
}
