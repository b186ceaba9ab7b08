//! Task migration between runqueues.
//!
//! Push offloads the second task of an overloaded runqueue onto the CPU
//! whose current deadline is the latest; pull steals the globally
//! earliest second task. Both consult a summary for a candidate, then
//! double-lock the two runqueues and re-verify before moving anything:
//! the summaries are allowed to be stale, the re-check under both locks
//! is what makes the migration sound.
//!
//! Double-lock rule: the lower CPU id is always locked first. When the
//! candidate has a lower id than the held runqueue, the held lock is
//! released and both are reacquired in order; callers re-validate
//! everything they peeked before that gap.

use tracing::{debug, trace};

use crate::ctx::SchedCtx;
use crate::deadline::Deadline;
use crate::rq_heap::Task;
use crate::runqueue::{RqState, Runqueue};
use crate::spinlock::SpinGuard;

/// Acquire `other`'s lock while holding `this`'s, in global CPU order.
/// `this` and `other` must be different runqueues.
pub fn double_lock<'t, 'o>(
    this: &'t Runqueue,
    this_guard: SpinGuard<'t, RqState>,
    other: &'o Runqueue,
) -> (SpinGuard<'t, RqState>, SpinGuard<'o, RqState>) {
    if other.cpu > this.cpu {
        let other_guard = other.lock();
        (this_guard, other_guard)
    } else {
        drop(this_guard);
        let other_guard = other.lock();
        let this_guard = this.lock();
        (this_guard, other_guard)
    }
}

fn fingerprint(t: &Task) -> (u64, Deadline) {
    (t.pid, t.deadline)
}

/// Double-lock `dst` and migrate `this`'s second task onto it, provided
/// the situation still looks the way the caller saw it: the second task
/// is unchanged and the destination is either idle or running something
/// later. Returns the possibly reacquired source guard and whether a
/// task moved.
pub fn push_to<'t>(
    ctx: &SchedCtx,
    this: &'t Runqueue,
    this_guard: SpinGuard<'t, RqState>,
    dst: &Runqueue,
    expected: (u64, Deadline),
) -> (SpinGuard<'t, RqState>, bool) {
    let (mut g, mut dst_g) = double_lock(this, this_guard, dst);

    if g.heap.peek_next().map(fingerprint) != Some(expected) {
        drop(dst_g);
        return (g, false);
    }
    let pushable = !dst_g.earliest.is_valid() || expected.1.before(dst_g.earliest);
    if !pushable {
        drop(dst_g);
        return (g, false);
    }

    let task = this.take_next(&mut g, ctx);
    debug!(from = this.cpu, to = dst.cpu, pid = task.pid, dl = task.deadline.0, "push");
    dst.add(&mut dst_g, ctx, task);
    drop(dst_g);
    (g, true)
}

/// One push attempt. Returns `(guard, keep_going, migrated)`.
fn rq_push_task<'t>(
    ctx: &SchedCtx,
    this: &'t Runqueue,
    mut g: SpinGuard<'t, RqState>,
) -> (SpinGuard<'t, RqState>, bool, bool) {
    if !g.overloaded {
        return (g, false, false);
    }
    let mut next_task = match g.heap.peek_next().map(fingerprint) {
        Some(fp) => fp,
        None => return (g, false, false),
    };

    loop {
        // An overloaded queue whose second task equals its first has an
        // inconsistent cache; do not touch it.
        match g.heap.peek().map(|t| t.pid) {
            Some(min_pid) if min_pid == next_task.0 => return (g, false, false),
            Some(_) => {}
            None => return (g, false, false),
        }
        // Never push a task that would preempt the local current one.
        if next_task.1.before(g.earliest) {
            return (g, false, false);
        }

        let mut tries = 0;
        while tries < ctx.cfg.push_max_tries {
            tries += 1;
            let Some(cpu) = ctx.push.find_best() else { break };
            if cpu == this.cpu {
                break;
            }
            let Some(later_rq) = ctx.runqueue(cpu) else { break };
            trace!(from = this.cpu, candidate = cpu, "push candidate");
            let (g2, migrated) = push_to(ctx, this, g, &later_rq, next_task);
            g = g2;
            if migrated {
                return (g, true, true);
            }
        }

        // No target found. The double-lock gap may have let the queue
        // change under us; re-read the second task.
        match g.heap.peek_next().map(fingerprint) {
            Some(fp) if fp == next_task => return (g, false, false),
            None => return (g, true, false),
            Some(fp) => next_task = fp,
        }
    }
}

/// Push until an attempt fails to move a task. Returns the number of
/// migrations.
pub fn rq_push_tasks<'t>(
    ctx: &SchedCtx,
    this: &'t Runqueue,
    mut g: SpinGuard<'t, RqState>,
) -> (SpinGuard<'t, RqState>, u64) {
    let mut count = 0;
    loop {
        let (g2, keep_going, migrated) = rq_push_task(ctx, this, g);
        g = g2;
        if migrated {
            count += 1;
        }
        if !keep_going {
            return (g, count);
        }
    }
}

/// Try to pull one task from the runqueue whose second deadline is the
/// globally earliest. Returns whether a task arrived.
pub fn rq_pull_tasks<'t>(
    ctx: &SchedCtx,
    this: &'t Runqueue,
    mut g: SpinGuard<'t, RqState>,
) -> (SpinGuard<'t, RqState>, bool) {
    let mut tries = 0;
    while tries < ctx.cfg.pull_max_tries {
        tries += 1;
        let Some(cpu) = ctx.pull.find_best() else { break };
        if cpu == this.cpu {
            break;
        }
        // The candidate may have finished its run and torn down already.
        let Some(src_rq) = ctx.runqueue(cpu) else { break };
        trace!(to = this.cpu, candidate = cpu, "pull candidate");

        let (g2, mut src_g) = double_lock(this, g, &src_rq);
        g = g2;

        // Re-verify under both locks: the source must still have a task
        // to spare.
        if src_g.heap.peek_next().is_some() {
            let task = src_rq.take_next(&mut src_g, ctx);
            debug!(from = src_rq.cpu, to = this.cpu, pid = task.pid, dl = task.deadline.0, "pull");
            this.add(&mut g, ctx, task);
            drop(src_g);
            return (g, true);
        }
        drop(src_g);
    }
    (g, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::summary::SummaryKind;
    use std::sync::Arc;

    fn ctx(kind: SummaryKind) -> Arc<SchedCtx> {
        SchedCtx::new(SimConfig {
            structure: kind,
            ..SimConfig::default()
        })
    }

    fn task(pid: u64, dl: u64) -> Task {
        Task {
            pid,
            deadline: Deadline(dl),
        }
    }

    #[test]
    fn push_moves_the_second_task_to_an_empty_queue() {
        let ctx = ctx(SummaryKind::ArrayHeap);
        let rq0 = Arc::new(Runqueue::new(0));
        let rq1 = Arc::new(Runqueue::new(1));
        ctx.register_rq(0, rq0.clone());
        ctx.register_rq(1, rq1.clone());

        let mut g0 = rq0.lock();
        rq0.add(&mut g0, &ctx, task(1, 50));
        rq0.add(&mut g0, &ctx, task(2, 40));

        let expected = g0.heap.peek_next().map(|t| (t.pid, t.deadline)).unwrap();
        assert_eq!(expected, (1, Deadline(50)));
        let (mut g0, moved) = push_to(&ctx, &rq0, g0, &rq1, expected);
        assert!(moved);

        assert_eq!(g0.earliest, Deadline(40));
        assert_eq!(g0.next, Deadline::INVALID);
        assert!(!g0.overloaded);
        rq0.check(&mut g0).unwrap();
        drop(g0);

        let mut g1 = rq1.lock();
        assert_eq!(g1.earliest, Deadline(50));
        assert_eq!(g1.nrunning, 1);
        rq1.check(&mut g1).unwrap();

        ctx.push.check_cpu(0, Deadline(40)).unwrap();
        ctx.push.check_cpu(1, Deadline(50)).unwrap();
        ctx.pull.check_cpu(0, Deadline::INVALID).unwrap();
        ctx.pull.check_cpu(1, Deadline::INVALID).unwrap();
    }

    #[test]
    fn push_refuses_a_destination_running_something_earlier() {
        let ctx = ctx(SummaryKind::ArrayHeap);
        let rq0 = Arc::new(Runqueue::new(0));
        let rq1 = Arc::new(Runqueue::new(1));
        ctx.register_rq(0, rq0.clone());
        ctx.register_rq(1, rq1.clone());

        {
            let mut g1 = rq1.lock();
            rq1.add(&mut g1, &ctx, task(9, 10));
        }
        let mut g0 = rq0.lock();
        rq0.add(&mut g0, &ctx, task(1, 20));
        rq0.add(&mut g0, &ctx, task(2, 30));
        let expected = g0.heap.peek_next().map(|t| (t.pid, t.deadline)).unwrap();
        let (g0, moved) = push_to(&ctx, &rq0, g0, &rq1, expected);
        assert!(!moved);
        assert_eq!(g0.nrunning, 2);
    }

    #[test]
    fn push_coordinator_offloads_via_the_summary() {
        let ctx = ctx(SummaryKind::ArrayHeap);
        let rq0 = Arc::new(Runqueue::new(0));
        let rq1 = Arc::new(Runqueue::new(1));
        ctx.register_rq(0, rq0.clone());
        ctx.register_rq(1, rq1.clone());

        // CPU 1 runs a late task, so the push summary points at it.
        {
            let mut g1 = rq1.lock();
            rq1.add(&mut g1, &ctx, task(9, 500));
        }
        let mut g0 = rq0.lock();
        rq0.add(&mut g0, &ctx, task(1, 20));
        rq0.add(&mut g0, &ctx, task(2, 30));

        let (mut g0, pushed) = rq_push_tasks(&ctx, &rq0, g0);
        assert_eq!(pushed, 1);
        assert_eq!(g0.nrunning, 1);
        rq0.check(&mut g0).unwrap();
        drop(g0);

        let mut g1 = rq1.lock();
        assert_eq!(g1.nrunning, 2);
        assert_eq!(g1.earliest, Deadline(30));
        rq1.check(&mut g1).unwrap();
    }

    #[test]
    fn pull_steals_the_earliest_second_task() {
        let ctx = ctx(SummaryKind::ArrayHeap);
        let rq0 = Arc::new(Runqueue::new(0));
        let rq1 = Arc::new(Runqueue::new(1));
        let rq2 = Arc::new(Runqueue::new(2));
        for (cpu, rq) in [(0, &rq0), (1, &rq1), (2, &rq2)] {
            ctx.register_rq(cpu, Arc::clone(rq));
        }

        {
            let mut g1 = rq1.lock();
            rq1.add(&mut g1, &ctx, task(1, 10));
            rq1.add(&mut g1, &ctx, task(2, 25));
        }
        {
            let mut g2 = rq2.lock();
            rq2.add(&mut g2, &ctx, task(3, 10));
            rq2.add(&mut g2, &ctx, task(4, 90));
        }

        let g0 = rq0.lock();
        let (mut g0, pulled) = rq_pull_tasks(&ctx, &rq0, g0);
        assert!(pulled);
        // CPU 1 had the earliest second deadline (25).
        assert_eq!(g0.earliest, Deadline(25));
        rq0.check(&mut g0).unwrap();
        drop(g0);

        let mut g1 = rq1.lock();
        assert_eq!(g1.nrunning, 1);
        assert!(!g1.overloaded);
        rq1.check(&mut g1).unwrap();
    }

    #[test]
    fn pull_gives_up_when_nothing_is_overloaded() {
        let ctx = ctx(SummaryKind::ArrayHeap);
        let rq0 = Arc::new(Runqueue::new(0));
        let rq1 = Arc::new(Runqueue::new(1));
        ctx.register_rq(0, rq0.clone());
        ctx.register_rq(1, rq1.clone());
        {
            let mut g1 = rq1.lock();
            rq1.add(&mut g1, &ctx, task(1, 10));
        }
        let g0 = rq0.lock();
        let (g0, pulled) = rq_pull_tasks(&ctx, &rq0, g0);
        assert!(!pulled);
        assert_eq!(g0.nrunning, 0);
    }

    #[test]
    fn double_lock_from_the_higher_cpu_reacquires_in_order() {
        let ctx = ctx(SummaryKind::ArrayHeap);
        let rq0 = Arc::new(Runqueue::new(0));
        let rq3 = Arc::new(Runqueue::new(3));
        ctx.register_rq(0, rq0.clone());
        ctx.register_rq(3, rq3.clone());

        let g3 = rq3.lock();
        let (g3, g0) = double_lock(&rq3, g3, &rq0);
        assert_eq!(g3.nrunning, 0);
        assert_eq!(g0.nrunning, 0);
        drop(g0);
        drop(g3);

        // And both orders leave the locks free afterwards.
        let g0 = rq0.lock();
        let (g0, g3) = double_lock(&rq0, g0, &rq3);
        drop(g3);
        drop(g0);
    }

    #[test]
    fn concurrent_pushers_and_pullers_do_not_deadlock() {
        use std::thread;

        let ctx = ctx(SummaryKind::ArrayHeap);
        let rqs: Vec<Arc<Runqueue>> = (0..4).map(|c| Arc::new(Runqueue::new(c))).collect();
        for (cpu, rq) in rqs.iter().enumerate() {
            ctx.register_rq(cpu, Arc::clone(rq));
        }

        let mut handles = vec![];
        for (cpu, rq) in rqs.iter().enumerate() {
            let ctx = Arc::clone(&ctx);
            let rq = Arc::clone(rq);
            handles.push(thread::spawn(move || {
                let mut pid = cpu as u64 * 1_000_000;
                for i in 0..2_000u64 {
                    let mut g = rq.lock();
                    let (g2, _) = rq_pull_tasks(&ctx, &rq, g);
                    g = g2;
                    if i % 3 == 0 {
                        pid += 1;
                        let dl = (cpu as u64 * 131 + i * 17) % 997 + 1;
                        rq.add(&mut g, &ctx, Task { pid, deadline: Deadline(dl) });
                    } else if i % 7 == 0 && g.nrunning > 0 {
                        let t = rq.take(&mut g, &ctx);
                        drop(t);
                    }
                    let (g2, _) = rq_push_tasks(&ctx, &rq, g);
                    g = g2;
                    drop(g);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for rq in &rqs {
            let mut g = rq.lock();
            rq.check(&mut g).unwrap();
        }
        ctx.push.check().unwrap();
        ctx.pull.check().unwrap();
    }
}
