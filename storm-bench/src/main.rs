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

use {
    crate::cli::Cli,
    clap::Parser,
    env_logger::Builder,
    std::{env, process},
};

#[macro_use]
extern crate log;

mod bench;
mod cli;
mod error;

fn main() {
    Builder::new()
        .parse_filters(&env::var("STORMBENCH_LOG").unwrap_or_else(|_| "info".to_owned()))
        .init();
    if let Err(e) = run() {
        error!("storm-bench exited with error: {}", e);
        process::exit(0x01);
    }
}

fn run() -> error::BResult<()> {
    let cli = Cli::parse();
    bench::run_bench(&cli)
}
