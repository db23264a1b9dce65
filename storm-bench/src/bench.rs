/*
 * Created on Fri Mar 08 2024
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
    crate::{
        cli::{Cli, Workload},
        error::{BResult, Error},
    },
    rand::{rngs::StdRng, Rng, SeedableRng},
    std::{hint::black_box, thread, time::Instant},
    storm_engine::{EngineConfig, EngineResult, Hashtable},
};

/// Count of decimal digits
fn cdig(n: usize) -> usize {
    if n == 0 {
        1
    } else {
        (n as f64).log10().floor() as usize + 1
    }
}

fn key_for(id: usize, key_size: usize) -> Vec<u8> {
    format!("{:0>width$}", id, width = key_size).into_bytes()
}

pub fn run_bench(cli: &Cli) -> BResult<()> {
    if cli.threads == 0 || cli.keys_per_thread == 0 {
        return Err(Error::Config("need at least one thread and one key".into()));
    }
    let total_keys = cli.threads * cli.keys_per_thread;
    if cdig(total_keys) > cli.key_size {
        return Err(Error::Config(format!(
            "{} keys do not fit in {} byte keys",
            total_keys, cli.key_size
        )));
    }
    if total_keys * 2 > cli.buckets {
        return Err(Error::Config(format!(
            "{} keys need headroom; raise --buckets past {}",
            total_keys,
            total_keys * 2
        )));
    }
    let table = Hashtable::with_config(&EngineConfig {
        initial_buckets: cli.buckets,
        use_huge_pages_2m: cli.huge_pages,
        ..EngineConfig::default()
    })?;
    info!(
        "table ready: {} buckets; running {} threads x {} keys of {}B",
        table.bucket_count(),
        cli.threads,
        cli.keys_per_thread,
        cli.key_size
    );
    let workloads = if cli.workloads.is_empty() {
        vec![Workload::Set, Workload::Get, Workload::Mixed]
    } else {
        cli.workloads.clone()
    };
    for workload in workloads {
        run_workload(&table, cli, workload)?;
    }
    Ok(())
}

fn run_workload(table: &Hashtable, cli: &Cli, workload: Workload) -> BResult<()> {
    // reads and mixed traffic run over a populated key space
    if workload != Workload::Set {
        run_phase(table, cli, Workload::Set, false)?;
    }
    run_phase(table, cli, workload, true)
}

fn run_phase(table: &Hashtable, cli: &Cli, workload: Workload, report: bool) -> BResult<()> {
    let start = Instant::now();
    let mut results: Vec<EngineResult<()>> = Vec::new();
    thread::scope(|s| {
        let handles: Vec<_> = (0..cli.threads)
            .map(|tid| s.spawn(move || worker(table, cli, workload, tid)))
            .collect();
        results = handles
            .into_iter()
            .map(|handle| handle.join().expect("bench worker panicked"))
            .collect();
    });
    for result in results {
        result?;
    }
    if report {
        let elapsed = start.elapsed();
        let ops = cli.threads * cli.keys_per_thread;
        info!(
            "{:?}: {} ops in {:.2?} ({:.0} ops/sec)",
            workload,
            ops,
            elapsed,
            ops as f64 / elapsed.as_secs_f64()
        );
    }
    Ok(())
}

fn worker(table: &Hashtable, cli: &Cli, workload: Workload, tid: usize) -> EngineResult<()> {
    let px = table.enter();
    let base = tid * cli.keys_per_thread;
    let mut rng = StdRng::seed_from_u64(0x5704_b3c4 ^ tid as u64);
    for i in 0..cli.keys_per_thread {
        match workload {
            Workload::Set => {
                let key = key_for(base + i, cli.key_size);
                table.set(&key, base + i + 1, &px)?;
            }
            Workload::Get => {
                let id = base + rng.gen_range(0..cli.keys_per_thread);
                let key = key_for(id, cli.key_size);
                black_box(table.get(&key, &px));
            }
            Workload::Mixed => {
                let id = base + rng.gen_range(0..cli.keys_per_thread);
                let key = key_for(id, cli.key_size);
                match i % 4 {
                    0 | 1 => {
                        table.set(&key, id + 1, &px)?;
                    }
                    2 => {
                        black_box(table.get(&key, &px));
                    }
                    _ => {
                        black_box(table.delete(&key, &px));
                    }
                }
            }
        }
        if i % 1024 == 0 {
            px.advance();
        }
    }
    // one final quiescent point so the collector can drain what we retired
    px.advance();
    Ok(())
}
