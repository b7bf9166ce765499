//! Collision-log generators.
//!
//! Each subcommand writes a `collision_log_*` file of `<key>\t<seed>`
//! lines for the harness's collision thread:
//!
//! - `random` — random keys whose seeded hash maps to bucket 0.
//! - `sequential` — sequential keys, each paired with the first seed in a
//!   small range that maps it to bucket 0.
//! - `sequential-split` — `(b * i, i mod b)` pairs for the split-ordered
//!   variant.
//!
//! Generated keys start above the range the harness's writer threads own,
//! so the adversarial traffic never collides with scenario bookkeeping.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::process::exit;

use clap::{Parser, Subcommand};
use rand::Rng;

use rehash::table::seeded_hash;

/// Keys below this belong to harness writer threads.
const WRITER_KEY_CEILING: u64 = 10_000_000 * 48;

#[derive(Parser, Debug)]
#[command(name = "collision-gen", about = "Generate collision logs for hashbench")]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Random keys hashing to bucket 0 under seed 0.
    Random {
        /// How many candidate keys to draw.
        size: usize,
        /// Bucket count of the table under attack (power of two).
        bucket_size: u64,
    },
    /// Sequential keys plus the seed within 1..=seed_range mapping them to
    /// bucket 0.
    Sequential {
        /// How many keys to emit.
        size: usize,
        /// Seeds to try per key (1..=16).
        seed_range: u32,
        /// Bucket count of the table under attack (power of two).
        bucket_size: u64,
    },
    /// `(b * i, i mod b)` pairs for the split-ordered variant.
    SequentialSplit {
        /// How many pairs to emit.
        size: usize,
        /// Bucket count of the table under attack.
        bucket_size: u64,
    },
}

fn run(mode: &Mode) -> std::io::Result<String> {
    match mode {
        Mode::Random { size, bucket_size } => {
            let name = format!("collision_log_random_{size}_{bucket_size}");
            let mut out = BufWriter::new(File::create(&name)?);
            let mut seen = HashSet::new();
            let mut rng = rand::thread_rng();

            for _ in 0..*size {
                let key: u64 = rng.gen();
                if key < WRITER_KEY_CEILING || !seen.insert(key) {
                    continue;
                }
                if seeded_hash(key, 0) & (bucket_size - 1) == 0 {
                    writeln!(out, "{key}\t0")?;
                }
            }
            Ok(name)
        }
        Mode::Sequential {
            size,
            seed_range,
            bucket_size,
        } => {
            if !(1..=16).contains(seed_range) {
                eprintln!("collision-gen: seed_range must be in 1..=16");
                exit(255);
            }
            let name = format!("collision_log_sequential_{size}_{bucket_size}");
            let mut out = BufWriter::new(File::create(&name)?);

            for i in 0..*size as u64 {
                let key = WRITER_KEY_CEILING + i;
                for seed in 0..*seed_range {
                    if seeded_hash(key, seed) & (bucket_size - 1) == 0 {
                        writeln!(out, "{key}\t{seed}")?;
                        break;
                    }
                }
            }
            Ok(name)
        }
        Mode::SequentialSplit { size, bucket_size } => {
            let name = format!("collision_log_sequential_split_{size}_{bucket_size}");
            let mut out = BufWriter::new(File::create(&name)?);

            for i in 1..=*size as u64 {
                let key = bucket_size * i;
                writeln!(out, "{key}\t{}", i % bucket_size)?;
            }
            Ok(name)
        }
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match run(&cli.mode) {
        Ok(name) => println!("wrote {name}"),
        Err(e) => {
            eprintln!("collision-gen: {e}");
            exit(255);
        }
    }
}
