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

//! # Stormcache engine
//!
//! The storage engine of the Stormcache server: a fixed-capacity,
//! open-addressed concurrent hash table with chunked metadata,
//! SIMD-accelerated in-chunk probing, a stripe-locked write path and
//! epoch-deferred reclamation of retired key memory. Every read and write
//! path of the enclosing server funnels through [`Hashtable`]; networking,
//! protocol parsing and persistence live in their own crates.
//!
//! ```
//! use storm_engine::Hashtable;
//!
//! let table = Hashtable::new(1024).unwrap();
//! let px = table.enter();
//! assert_eq!(table.set(b"hello", 0xcafe, &px), Ok(None));
//! assert_eq!(table.get(b"hello", &px), Some(0xcafe));
//! assert_eq!(table.delete(b"hello", &px), Some(0xcafe));
//! assert_eq!(table.get(b"hello", &px), None);
//! # drop(px);
//! ```

#![deny(unreachable_patterns)]

#[macro_use]
mod macros;
pub mod config;
pub mod error;
pub mod gc;
pub mod hash;
pub mod idx;
pub mod mem;
pub mod sync;
mod time;

// re-exports
pub use {
    config::{EngineConfig, GcConfig},
    error::{EngineError, EngineResult},
    gc::{EpochGc, Participant},
    idx::{Hashtable, Iter, Value},
};
