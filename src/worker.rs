//! Simulation worker: one thread per simulated CPU.
//!
//! Every tick the worker locks its runqueue, pulls, retires the current
//! task if its deadline passed, draws a random event (20% task arrival,
//! 10% early finish, 70% nothing), pushes, unlocks and sleeps to the
//! absolute end of the tick. Arrival deadlines land `dmin..dmax` ticks
//! ahead of the local clock.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::ctx::SchedCtx;
use crate::deadline::Deadline;
use crate::migrate::{rq_pull_tasks, rq_push_tasks};
use crate::rq_heap::Task;
use crate::runqueue::Runqueue;

const ARRIVAL_PROB: f64 = 0.2;
const EARLY_FINISH_PROB: f64 = 0.1;

enum Op {
    Arrival,
    Finish,
    Nothing,
}

fn select_operation(rng: &mut StdRng) -> Op {
    let p: f64 = rng.gen();
    if p < ARRIVAL_PROB {
        Op::Arrival
    } else if p < ARRIVAL_PROB + EARLY_FINISH_PROB {
        Op::Finish
    } else {
        Op::Nothing
    }
}

fn arrival_deadline(rng: &mut StdRng, curr_clock: u64, dmin: u64, dmax: u64) -> Deadline {
    Deadline(curr_clock.wrapping_add(rng.gen_range(dmin..dmax)))
}

pub fn run_worker(
    ctx: Arc<SchedCtx>,
    cpu: usize,
    start: Arc<Barrier>,
    end: Arc<Barrier>,
) -> io::Result<()> {
    let mut log = BufWriter::new(File::create(format!("log-{cpu}"))?);
    writeln!(log, "*****SIMULATION START*****\n")?;

    let rq = Arc::new(Runqueue::new(cpu));
    ctx.register_rq(cpu, Arc::clone(&rq));

    let mut rng = StdRng::seed_from_u64(
        ctx.cfg
            .seed
            .wrapping_add((cpu as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15)),
    );
    let stats = &ctx.stats[cpu];
    let tick = ctx.cfg.tick;

    info!(cpu, "worker ready");
    start.wait();
    let t0 = Instant::now();

    let mut curr_clock: u64 = 0;
    for cycle in 0..ctx.cfg.ncycles {
        curr_clock += 1;

        let mut g = rq.lock();

        // Pre-schedule: try to pull work in.
        let (g2, pulled) = rq_pull_tasks(&ctx, &rq, g);
        g = g2;
        if pulled {
            stats.pulls.fetch_add(1, Ordering::Relaxed);
            writeln!(log, "[{curr_clock}] pull")?;
        }

        let mut min_dl = g.heap.peek().map(|t| t.deadline).unwrap_or(Deadline::INVALID);

        // Retire the current task once its deadline has passed.
        if min_dl.is_valid() && min_dl.before(Deadline(curr_clock)) {
            let done = rq.take(&mut g, &ctx);
            writeln!(log, "[{curr_clock}] finish pid {} dl {}", done.pid, done.deadline)?;
            min_dl = g.heap.peek().map(|t| t.deadline).unwrap_or(Deadline::INVALID);
            if !min_dl.is_valid() {
                stats.empty.fetch_add(1, Ordering::Relaxed);
            }
            stats.finishes.fetch_add(1, Ordering::Relaxed);
        }

        match select_operation(&mut rng) {
            Op::Arrival => {
                stats.arrivals.fetch_add(1, Ordering::Relaxed);
                let new_dl = arrival_deadline(&mut rng, curr_clock, ctx.cfg.dmin, ctx.cfg.dmax);
                let task = Task {
                    pid: ctx.next_pid(),
                    deadline: new_dl,
                };
                writeln!(log, "[{curr_clock}] arrival pid {} dl {new_dl}", task.pid)?;
                rq.add(&mut g, &ctx, task);
                if min_dl.is_valid() && new_dl.before(min_dl) {
                    debug!(cpu, dl = new_dl.0, "preemption");
                    stats.preemptions.fetch_add(1, Ordering::Relaxed);
                }
            }
            Op::Finish => {
                if g.heap.peek().is_some() {
                    let done = rq.take(&mut g, &ctx);
                    writeln!(
                        log,
                        "[{curr_clock}] early finish pid {} dl {}",
                        done.pid, done.deadline
                    )?;
                    stats.early_finishes.fetch_add(1, Ordering::Relaxed);
                    if g.heap.peek().is_none() {
                        stats.empty.fetch_add(1, Ordering::Relaxed);
                    }
                    stats.finishes.fetch_add(1, Ordering::Relaxed);
                }
            }
            Op::Nothing => {}
        }

        // Post-schedule: offload anything another CPU should run.
        let (g2, pushed) = rq_push_tasks(&ctx, &rq, g);
        g = g2;
        if pushed > 0 {
            stats.pushes.fetch_add(pushed, Ordering::Relaxed);
            writeln!(log, "[{curr_clock}] push x{pushed}")?;
        }

        drop(g);

        // Sleep to the absolute end of this tick.
        let target = t0 + tick.saturating_mul(cycle as u32 + 1);
        if let Some(remaining) = target.checked_duration_since(Instant::now()) {
            thread::sleep(remaining);
        }
    }

    // This CPU is done. Drain through take() so the caches and both
    // summaries stay in agreement at every step, then withdraw.
    {
        let mut g = rq.lock();
        while g.nrunning > 0 {
            let _ = rq.take(&mut g, &ctx);
        }
    }
    ctx.pull.set(cpu, Deadline::INVALID, false);
    ctx.push.set(cpu, Deadline::INVALID, false);

    end.wait();

    // Past the barrier no CPU migrates anymore; clear anything a stale
    // best-CPU hint pushed here during the shutdown window.
    ctx.unregister_rq(cpu);
    {
        let mut g = rq.lock();
        while g.nrunning > 0 {
            let _ = rq.take(&mut g, &ctx);
        }
    }
    ctx.pull.set(cpu, Deadline::INVALID, false);
    ctx.push.set(cpu, Deadline::INVALID, false);

    writeln!(log, "\n*****SIMULATION END*****")?;
    log.flush()?;
    info!(cpu, "worker done");
    Ok(())
}
