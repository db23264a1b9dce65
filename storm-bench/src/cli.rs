/*
 * Created on Mon Mar 04 2024
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

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Workload {
    /// Unique inserts over the whole key space
    Set,
    /// Point reads over a pre-populated key space
    Get,
    /// Interleaved set/get/delete traffic
    Mixed,
}

#[derive(Parser, Debug)]
#[command(
    name = "storm-bench",
    about = "Benchmark the Stormcache storage engine in-process"
)]
pub struct Cli {
    #[arg(
        short = 't',
        long = "threads",
        help = "Sets the number of worker threads",
        value_name = "COUNT",
        default_value_t = 8
    )]
    pub threads: usize,

    #[arg(
        short = 'k',
        long = "keys",
        help = "Sets the number of distinct keys per thread",
        value_name = "COUNT",
        default_value_t = 100_000
    )]
    pub keys_per_thread: usize,

    #[arg(
        short = 's',
        long = "keysize",
        help = "Sets the size of the generated keys",
        value_name = "BYTES",
        default_value_t = 16
    )]
    pub key_size: usize,

    #[arg(
        short = 'b',
        long = "buckets",
        help = "Sets the table capacity in buckets",
        value_name = "COUNT",
        default_value_t = 1 << 21
    )]
    pub buckets: usize,

    #[arg(
        short = 'w',
        long = "workload",
        help = "Selects the workloads to run (defaults to all of them)",
        value_enum
    )]
    pub workloads: Vec<Workload>,

    #[arg(
        long = "huge-pages",
        help = "Backs the table with 2 MiB pages when available",
        default_value_t = false
    )]
    pub huge_pages: bool,
}
