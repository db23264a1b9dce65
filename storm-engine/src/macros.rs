/*
 * Created on Thu Feb 01 2024
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

macro_rules! assertions {
    ($($assert:expr),*$(,)?) => {$(const _:()=::core::assert!($assert);)*}
}

/// An unrecoverable condition: the engine's invariants do not survive partial
/// failure of a mid-operation mutation, so we log, capture a backtrace and
/// abort instead of unwinding through the data structures.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        ::log::error!($($arg)*);
        ::log::error!("{}", ::std::backtrace::Backtrace::force_capture());
        ::std::process::abort();
    }}
}
