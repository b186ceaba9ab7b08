//! Background invariant checker.
//!
//! Periodically freezes the whole system by taking every runqueue lock in
//! ascending CPU order, then cross-checks runqueue caches, binomial heap
//! ordering, summary-internal invariants and runqueue↔summary agreement.
//! While all runqueue locks are held no thread can be inside a summary
//! operation, so the summary checks see a quiescent structure.
//!
//! A failed check dumps everything to `error_log.txt` and panics; an
//! invariant violation is a bug, never recovered.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{error, trace};

use crate::ctx::SchedCtx;
use crate::runqueue::{RqState, Runqueue};
use crate::spinlock::SpinGuard;

const CHECK_PERIOD: Duration = Duration::from_millis(50);

fn dump_everything(
    ctx: &SchedCtx,
    rqs: &[Arc<Runqueue>],
    guards: &mut [SpinGuard<'_, RqState>],
    w: &mut dyn Write,
) -> io::Result<()> {
    for (rq, g) in rqs.iter().zip(guards.iter_mut()) {
        rq.dump(g, w)?;
    }
    writeln!(w, "*****PUSH DATA STRUCTURE*****")?;
    ctx.push.save(w)?;
    writeln!(w, "*****PULL DATA STRUCTURE*****")?;
    ctx.pull.save(w)?;
    Ok(())
}

fn run_checks(
    ctx: &SchedCtx,
    rqs: &[Arc<Runqueue>],
    guards: &mut [SpinGuard<'_, RqState>],
) -> Result<(), String> {
    for (rq, g) in rqs.iter().zip(guards.iter_mut()) {
        rq.check(g).map_err(|e| e.to_string())?;
    }
    ctx.push
        .check()
        .map_err(|e| format!("push structure: {e}"))?;
    ctx.pull
        .check()
        .map_err(|e| format!("pull structure: {e}"))?;
    for (rq, g) in rqs.iter().zip(guards.iter()) {
        ctx.push
            .check_cpu(rq.cpu, g.earliest)
            .map_err(|e| format!("push structure: {e}"))?;
        ctx.pull
            .check_cpu(rq.cpu, g.next)
            .map_err(|e| format!("pull structure: {e}"))?;
    }
    Ok(())
}

/// One full validation pass. Returns `Ok(false)` when some CPU has not
/// published (or has already torn down) its runqueue.
pub fn validate_once(ctx: &SchedCtx) -> Result<bool, String> {
    let n = ctx.nprocessors();
    let mut rqs: Vec<Arc<Runqueue>> = Vec::with_capacity(n);
    for cpu in 0..n {
        match ctx.runqueue(cpu) {
            Some(rq) => rqs.push(rq),
            None => return Ok(false),
        }
    }
    // Ascending CPU order, the same total order migration uses.
    let mut guards: Vec<SpinGuard<'_, RqState>> = rqs.iter().map(|rq| rq.lock()).collect();
    match run_checks(ctx, &rqs, &mut guards) {
        Ok(()) => Ok(true),
        Err(msg) => {
            if let Ok(f) = File::create("error_log.txt") {
                let mut w = BufWriter::new(f);
                let _ = writeln!(w, "***** validator found an invariant violation *****");
                let _ = writeln!(w, "{msg}\n");
                let _ = dump_everything(ctx, &rqs, &mut guards, &mut w);
                let _ = w.flush();
            }
            Err(msg)
        }
    }
}

pub fn run_validator(ctx: Arc<SchedCtx>) {
    let mut passes: u64 = 0;
    while !ctx.shutting_down() {
        thread::sleep(CHECK_PERIOD);
        match validate_once(&ctx) {
            Ok(true) => {
                passes += 1;
                trace!(passes, "checker ok");
            }
            Ok(false) => continue,
            Err(msg) => {
                error!("validator: {msg}");
                panic!("validator: {msg}");
            }
        }
    }
}
