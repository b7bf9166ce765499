//! Torture/performance harness for the rebuildable hash tables.
//!
//! ```text
//! hashbench --perftest --variant lf-dcss --nbuckets 1024 --nreaders 8 \
//!     --nupdaters 8 --resizemult 2 --resizediv 1 --duration 5000
//! hashbench --pcttest --variant rht --nworkers 16 --percentage 5 5 90
//! ```

use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use clap::Parser;

use rehash::harness::{self, HarnessConfig, TestKind, Variant};

#[derive(Parser, Debug)]
#[command(name = "hashbench", about = "Concurrent rebuildable-hash-table torture harness")]
struct Cli {
    /// Run the reader/updater performance scenario.
    #[arg(long, conflicts_with = "pcttest")]
    perftest: bool,

    /// Run the percentage-mix scenario.
    #[arg(long)]
    pcttest: bool,

    /// Table variant: lf-dcss, wf, rht or split.
    #[arg(long, default_value = "lf-dcss")]
    variant: String,

    /// Initial number of buckets.
    #[arg(long, default_value_t = 1024)]
    nbuckets: usize,

    /// Maximum number of buckets (must be >= 1024).
    #[arg(long = "max-nbuckets", default_value_t = 1024 * 64)]
    max_nbuckets: usize,

    /// Reader threads (perftest).
    #[arg(long, default_value_t = 1)]
    nreaders: usize,

    /// Updater threads (perftest, must be >= 1).
    #[arg(long, default_value_t = 1)]
    nupdaters: usize,

    /// Worker threads (pcttest, must be >= 1).
    #[arg(long, default_value_t = 1)]
    nworkers: usize,

    /// Insert, delete and lookup percentages; must sum to 100 (pcttest).
    #[arg(long, num_args = 3, value_names = ["INSERT", "DELETE", "LOOKUP"])]
    percentage: Option<Vec<u32>>,

    /// Hash-table elements per writer thread.
    #[arg(long = "elems/writer", default_value_t = 2048)]
    elems_per_writer: u64,

    /// Elements inserted before the measured run begins.
    #[arg(long, default_value_t = 1024)]
    preinsert: u64,

    /// Stride when spreading threads across CPUs.
    #[arg(long, default_value_t = 1)]
    cpustride: usize,

    /// Divisor for the resized table (0: no resize thread).
    #[arg(long, default_value_t = 0)]
    resizediv: usize,

    /// Multiplier for the resized table (0: no resize thread).
    #[arg(long, default_value_t = 0)]
    resizemult: usize,

    /// Milliseconds to wait between resizes.
    #[arg(long, default_value_t = 1)]
    resizewait: u64,

    /// Resize only on load signals instead of continuously.
    #[arg(long = "dont-repeatedly-resize")]
    dont_repeatedly_resize: bool,

    /// Raise an enlarge request when a bucket exceeds this length
    /// (signal-driven mode only).
    #[arg(long = "max-list-length", default_value_t = 64)]
    max_list_length: isize,

    /// Raise a shrink request when the average load drops below this
    /// (signal-driven mode only).
    #[arg(long = "min_avg_load_factor", default_value_t = 4)]
    min_avg_load_factor: isize,

    /// Hash keys with the seeded hash instead of identity.
    #[arg(long)]
    jhash: bool,

    /// Bump the hash seed on every resize (requires --jhash).
    #[arg(long)]
    rebuild: bool,

    /// Replay adversarial keys from this collision log.
    #[arg(long, value_name = "FILE")]
    collision: Option<PathBuf>,

    /// Duration of the measured run, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    duration: u64,

    /// Record up to this many latency samples per thread (must be >= 1024).
    #[arg(long = "measure-latency", value_name = "N")]
    measure_latency: Option<usize>,

    /// Number of rebuild worker threads (1..=32; lf-dcss only).
    #[arg(long = "rebuild-threads", default_value_t = 1)]
    rebuild_threads: usize,
}

fn config_from(cli: Cli) -> Result<HarnessConfig, String> {
    let test = match (cli.perftest, cli.pcttest) {
        (true, false) => TestKind::Perf,
        (false, true) => TestKind::Pct,
        _ => return Err("specify exactly one of --perftest and --pcttest".into()),
    };

    let variant = match cli.variant.as_str() {
        "lf-dcss" => Variant::LfDcss,
        "wf" => Variant::Wf,
        "rht" => Variant::Rht,
        "split" => Variant::Split,
        other => return Err(format!("unknown variant: {other}")),
    };

    let pct = match &cli.percentage {
        None => (5, 5, 90),
        Some(v) => {
            if v.len() != 3 || v[0] + v[1] + v[2] != 100 {
                return Err("--percentage values must sum to 100".into());
            }
            if test != TestKind::Pct {
                return Err("--percentage only makes sense with --pcttest".into());
            }
            (v[0], v[1], v[2])
        }
    };

    if cli.max_nbuckets < 1024 {
        return Err("--max-nbuckets must be >= 1024".into());
    }
    if cli.nupdaters < 1 {
        return Err("--nupdaters must be >= 1".into());
    }
    if test == TestKind::Pct && cli.nworkers < 1 {
        return Err("--nworkers must be >= 1".into());
    }
    if cli.elems_per_writer < 1 {
        return Err("--elems/writer must be > 0".into());
    }
    if cli.rebuild && !cli.jhash {
        return Err("--rebuild requires --jhash".into());
    }
    if cli.rebuild_threads < 1 || cli.rebuild_threads > 32 {
        return Err("--rebuild-threads must be in 1..=32".into());
    }
    if let Some(n) = cli.measure_latency {
        if n < 1024 {
            return Err("--measure-latency must be >= 1024".into());
        }
    }
    if variant == Variant::Split && !cli.nbuckets.is_power_of_two() {
        return Err("the split variant needs a power-of-two --nbuckets".into());
    }

    // A divisor without a multiplier (or vice versa) means "resize with
    // the other leg fixed".
    let (mut resizemult, mut resizediv) = (cli.resizemult, cli.resizediv);
    if resizediv != 0 && resizemult == 0 {
        resizemult = 1;
    }
    if resizemult != 0 && resizediv == 0 {
        resizediv = 1;
    }

    Ok(HarnessConfig {
        test,
        variant,
        nbuckets: cli.nbuckets,
        max_nbuckets: cli.max_nbuckets,
        nreaders: cli.nreaders,
        nupdaters: cli.nupdaters,
        nworkers: cli.nworkers,
        pct,
        elems_per_writer: cli.elems_per_writer,
        preinsert: cli.preinsert,
        cpustride: cli.cpustride,
        resizemult,
        resizediv,
        resizewait: cli.resizewait,
        repeatedly_resize: !cli.dont_repeatedly_resize,
        max_list_length: cli.max_list_length,
        min_avg_load_factor: cli.min_avg_load_factor,
        jhash: cli.jhash,
        rebuild: cli.rebuild,
        collision_file: cli.collision,
        duration: Duration::from_millis(cli.duration),
        measure_latency: cli.measure_latency,
        rebuild_threads: cli.rebuild_threads,
        progname: "hashbench".to_string(),
    })
}

fn main() {
    env_logger::init();

    let cfg = match config_from(Cli::parse()) {
        Ok(cfg) => cfg,
        Err(msg) => {
            eprintln!("hashbench: {msg}");
            exit(255);
        }
    };

    log::info!(
        "running {:?} on variant {} for {:?}",
        cfg.test,
        cfg.variant.name(),
        cfg.duration
    );

    match harness::run(&cfg) {
        Ok(report) => harness::print_report(&cfg, &report),
        Err(e) => {
            eprintln!("hashbench: {e}");
            exit(255);
        }
    }
}
