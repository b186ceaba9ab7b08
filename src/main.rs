// gedf-testbed binary: spawn one worker per simulated CPU plus the
// validator, run the configured number of cycles, report per-CPU stats.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gedf_testbed::config::SimConfig;
use gedf_testbed::ctx::SchedCtx;
use gedf_testbed::signal;
use gedf_testbed::summary::SummaryKind;
use gedf_testbed::validator::run_validator;
use gedf_testbed::worker::run_worker;

#[derive(Parser, Debug)]
#[command(
    name = "gedf-testbed",
    about = "Contention testbed for global-EDF deadline summary structures"
)]
struct Args {
    /// Summary structure implementation to exercise.
    #[arg(short = 'd', long, value_enum)]
    data_structure: SummaryKind,

    /// Number of simulated CPUs (one worker thread each).
    #[arg(long, default_value_t = 4)]
    cpus: usize,

    /// Simulation cycles per CPU.
    #[arg(long, default_value_t = 1000)]
    cycles: u64,

    /// Length of one simulated tick, in microseconds.
    #[arg(long, default_value_t = 10_000)]
    tick_us: u64,

    /// Minimum relative deadline for arriving tasks, in ticks.
    #[arg(long, default_value_t = 10)]
    dmin: u64,

    /// Maximum relative deadline for arriving tasks, in ticks.
    #[arg(long, default_value_t = 100)]
    dmax: u64,

    /// Workload seed; random when omitted.
    #[arg(long)]
    seed: Option<u64>,

    /// Skip the background invariant checker.
    #[arg(long)]
    no_validator: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    ensure!(args.cpus >= 1, "need at least one simulated cpu");
    ensure!(args.dmin < args.dmax, "--dmin must be below --dmax");
    if args.data_structure == SummaryKind::BmFcSkiplist {
        ensure!(args.cpus <= 64, "the bitmap flavor handles at most 64 cpus");
    }

    let cfg = SimConfig {
        structure: args.data_structure,
        nprocessors: args.cpus,
        ncycles: args.cycles,
        tick: Duration::from_micros(args.tick_us),
        dmin: args.dmin,
        dmax: args.dmax,
        seed: args.seed.unwrap_or_else(rand::random),
        validate: !args.no_validator,
        ..SimConfig::default()
    };

    info!(
        structure = cfg.structure.label(),
        cpus = cfg.nprocessors,
        cycles = cfg.ncycles,
        seed = cfg.seed,
        "initializing"
    );
    println!("Initializing the {}", cfg.structure.label());

    let ctx = SchedCtx::new(cfg);
    signal::install(Arc::clone(&ctx));

    let validator = if ctx.cfg.validate {
        println!("Creating Checker");
        let vctx = Arc::clone(&ctx);
        Some(
            thread::Builder::new()
                .name("checker".into())
                .spawn(move || run_validator(vctx))
                .context("spawning the checker thread")?,
        )
    } else {
        None
    };

    println!("Creating processors");
    let start = Arc::new(Barrier::new(ctx.cfg.nprocessors));
    let end = Arc::new(Barrier::new(ctx.cfg.nprocessors));
    let mut workers = Vec::with_capacity(ctx.cfg.nprocessors);
    for cpu in 0..ctx.cfg.nprocessors {
        let wctx = Arc::clone(&ctx);
        let start = Arc::clone(&start);
        let end = Arc::clone(&end);
        workers.push(
            thread::Builder::new()
                .name(format!("cpu-{cpu}"))
                .spawn(move || run_worker(wctx, cpu, start, end))
                .with_context(|| format!("spawning worker {cpu}"))?,
        );
    }

    println!("Waiting for the end");
    let mut failed = false;
    for (cpu, handle) in workers.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(())) => {
                let s = &ctx.stats[cpu];
                use std::sync::atomic::Ordering::Relaxed;
                println!("+++++++++++++++++++++++++++++++++");
                println!("Num Arrivals [{cpu}]: {}", s.arrivals.load(Relaxed));
                println!("Num Preemptions [{cpu}]: {}", s.preemptions.load(Relaxed));
                println!("Num Finishings [{cpu}]: {}", s.finishes.load(Relaxed));
                println!(
                    "Num Early Finishings [{cpu}]: {}",
                    s.early_finishes.load(Relaxed)
                );
                println!("Num queue empty events [{cpu}]: {}", s.empty.load(Relaxed));
                println!("Num Push from runqueue [{cpu}]: {}", s.pushes.load(Relaxed));
                println!("Num Pull to runqueue [{cpu}]: {}", s.pulls.load(Relaxed));
            }
            Ok(Err(e)) => {
                eprintln!("worker {cpu} failed: {e}");
                failed = true;
            }
            Err(_) => {
                eprintln!("worker {cpu} panicked");
                failed = true;
            }
        }
    }

    ctx.request_shutdown();
    if let Some(handle) = validator {
        if handle.join().is_err() {
            bail!("validator found an invariant violation (see error_log.txt)");
        }
    }
    if failed {
        bail!("one or more workers failed");
    }

    ctx.push.flush_pending();
    ctx.pull.flush_pending();
    println!("--------------EVERYTHING OK!---------------------");
    Ok(())
}
