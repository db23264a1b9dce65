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

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
/// Engine errors. These are the *recoverable* failures; anything that would
/// leave a table generation half-mutated goes through `fatal!` instead and
/// never surfaces as a value
pub enum EngineError {
    /// The write path exhausted the search window around the anchor chunk.
    /// The enclosing server maps this to an out of memory reply
    OutOfSpace,
    /// Capacity passed to the raw generation constructor was not a power of
    /// two (the public constructor rounds up before ever reaching this)
    InvalidCapacity,
    /// Zero-length keys are not addressable
    EmptyKey,
    /// Key length exceeds the configured maximum
    KeyTooLong,
    /// The configuration document could not be decoded
    BadConfiguration,
}
