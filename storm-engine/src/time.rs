/*
 * Created on Fri Feb 02 2024
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

use std::{sync::OnceLock, time::Instant};

static ANCHOR: OnceLock<Instant> = OnceLock::new();

/// Monotonic nanoseconds since the first call in this process. The epoch GC
/// tags retired objects and participant quiescence points with this clock;
/// only the relative order of readings matters
pub fn monotonic_ns() -> u64 {
    ANCHOR.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::monotonic_ns;

    #[test]
    fn monotonicity() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }
}
