//! Per-CPU runqueue.
//!
//! A binomial heap of runnable tasks behind a spinlock, with cached
//! `earliest` and `next` deadlines mirrored into the global push and pull
//! summaries on every change. The spinlock covers the heap, the caches
//! and the summary publication; everything a runqueue does is linearized
//! by it.
//!
//! Cache invariants (checked by the validator):
//! - `earliest` is the min task's deadline, 0 when empty;
//! - `next` is the second-min task's deadline, 0 when fewer than two;
//! - `overloaded ⇔ nrunning ≥ 2`.

use std::fs::File;
use std::io::{self, BufWriter, Write};

use crossbeam_utils::CachePadded;
use thiserror::Error;

use crate::ctx::SchedCtx;
use crate::deadline::Deadline;
use crate::rq_heap::{RqHeap, Task};
use crate::spinlock::{SpinGuard, SpinLock};

#[derive(Debug, Error)]
pub enum RqCheckError {
    #[error("rq {cpu}: next cached ({next}) with no earliest")]
    NextWithoutEarliest { cpu: usize, next: u64 },
    #[error("rq {cpu}: cached next {next} precedes cached earliest {earliest}")]
    CacheOrder {
        cpu: usize,
        earliest: u64,
        next: u64,
    },
    #[error("rq {cpu}: overloaded flag is {overloaded} with nrunning = {nrunning}")]
    OverloadFlag {
        cpu: usize,
        nrunning: usize,
        overloaded: bool,
    },
    #[error("rq {cpu}: caches empty but the heap holds tasks")]
    EmptyCacheNonEmptyHeap { cpu: usize },
    #[error("rq {cpu}: cached earliest {cached} but heap min is {found}")]
    EarliestMismatch { cpu: usize, cached: u64, found: u64 },
    #[error("rq {cpu}: cached next {cached} but heap second-min is {found}")]
    NextMismatch { cpu: usize, cached: u64, found: u64 },
    #[error("rq {cpu}: heap yielded a task earlier than the reported minimum")]
    HeapOrder { cpu: usize },
    #[error("rq {cpu}: heap holds {found} tasks but nrunning = {nrunning}")]
    CountMismatch {
        cpu: usize,
        found: usize,
        nrunning: usize,
    },
}

pub struct RqState {
    pub heap: RqHeap,
    pub earliest: Deadline,
    pub next: Deadline,
    pub nrunning: usize,
    pub overloaded: bool,
}

pub struct Runqueue {
    pub cpu: usize,
    state: CachePadded<SpinLock<RqState>>,
}

impl Runqueue {
    pub fn new(cpu: usize) -> Runqueue {
        Runqueue {
            cpu,
            state: CachePadded::new(SpinLock::new(RqState {
                heap: RqHeap::new(),
                earliest: Deadline::INVALID,
                next: Deadline::INVALID,
                nrunning: 0,
                overloaded: false,
            })),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_, RqState> {
        self.state.lock()
    }

    fn publish_earliest(&self, st: &RqState, ctx: &SchedCtx) {
        ctx.push.set(self.cpu, st.earliest, st.earliest.is_valid());
    }

    fn publish_next(&self, st: &RqState, ctx: &SchedCtx) {
        ctx.pull.set(self.cpu, st.next, st.next.is_valid());
    }

    fn underflow(&self, st: &RqState, what: &str) -> ! {
        if let Ok(f) = File::create("error_heap.txt") {
            let mut w = BufWriter::new(f);
            let _ = self.dump(st, &mut w);
            let _ = w.flush();
        }
        panic!("rq {}: {what} on a queue with {} tasks", self.cpu, st.nrunning);
    }

    /// Remove the earliest-deadline task. Fatal on an empty queue.
    pub fn take(&self, st: &mut RqState, ctx: &SchedCtx) -> Task {
        if st.nrunning < 1 {
            self.underflow(st, "dequeue");
        }
        st.nrunning -= 1;
        if st.nrunning < 2 {
            st.overloaded = false;
        }
        let task = match st.heap.take() {
            Some(t) => t,
            None => self.underflow(st, "dequeue"),
        };

        st.earliest = st.next;
        self.publish_earliest(st, ctx);

        st.next = st
            .heap
            .peek_next()
            .map(|t| t.deadline)
            .unwrap_or(Deadline::INVALID);
        self.publish_next(st, ctx);

        task
    }

    /// Remove the second-earliest task (push donates it). Fatal unless
    /// the queue is overloaded.
    pub fn take_next(&self, st: &mut RqState, ctx: &SchedCtx) -> Task {
        if st.nrunning < 2 {
            self.underflow(st, "dequeue next");
        }
        st.nrunning -= 1;
        if st.nrunning < 2 {
            st.overloaded = false;
        }
        let task = match st.heap.take_next() {
            Some(t) => t,
            None => self.underflow(st, "dequeue next"),
        };

        st.next = st
            .heap
            .peek_next()
            .map(|t| t.deadline)
            .unwrap_or(Deadline::INVALID);
        self.publish_next(st, ctx);

        task
    }

    /// Enqueue a task, updating whichever cache slots it displaces.
    pub fn add(&self, st: &mut RqState, ctx: &SchedCtx, task: Task) {
        let task_dl = task.deadline;
        let old_earliest = st.earliest;
        let old_next = st.next;
        st.heap.insert(task);

        if st.nrunning == 0 || task_dl.before(old_earliest) {
            st.next = old_earliest;
            st.earliest = task_dl;
            self.publish_earliest(st, ctx);
            self.publish_next(st, ctx);
        } else if !st.overloaded || task_dl.before(old_next) {
            st.next = task_dl;
            self.publish_next(st, ctx);
        }

        st.nrunning += 1;
        if st.nrunning > 1 {
            st.overloaded = true;
        }
    }

    /// Structural self-check: cache consistency, then full
    /// extract-and-reinsert to verify heap ordering and the task count.
    pub fn check(&self, st: &mut RqState) -> Result<(), RqCheckError> {
        let cpu = self.cpu;
        if !st.earliest.is_valid() && st.next.is_valid() {
            return Err(RqCheckError::NextWithoutEarliest {
                cpu,
                next: st.next.0,
            });
        }
        if st.earliest.is_valid() && st.next.is_valid() && st.next.before(st.earliest) {
            return Err(RqCheckError::CacheOrder {
                cpu,
                earliest: st.earliest.0,
                next: st.next.0,
            });
        }
        if st.overloaded != (st.nrunning >= 2) {
            return Err(RqCheckError::OverloadFlag {
                cpu,
                nrunning: st.nrunning,
                overloaded: st.overloaded,
            });
        }
        if !st.earliest.is_valid() && !st.next.is_valid() && !st.heap.is_empty() {
            return Err(RqCheckError::EmptyCacheNonEmptyHeap { cpu });
        }

        let mut backup = RqHeap::new();
        let mut result = Ok(());
        let mut count = 0usize;

        let min = st.heap.take();
        if let Some(m) = &min {
            count += 1;
            if st.earliest != m.deadline {
                result = Err(RqCheckError::EarliestMismatch {
                    cpu,
                    cached: st.earliest.0,
                    found: m.deadline.0,
                });
            }
        } else if st.earliest.is_valid() {
            result = Err(RqCheckError::EarliestMismatch {
                cpu,
                cached: st.earliest.0,
                found: 0,
            });
        }

        let second = st.heap.take();
        if let Some(s) = &second {
            count += 1;
            if result.is_ok() {
                if let Some(m) = &min {
                    if s.deadline.before(m.deadline) {
                        result = Err(RqCheckError::HeapOrder { cpu });
                    }
                }
                if st.next != s.deadline {
                    result = Err(RqCheckError::NextMismatch {
                        cpu,
                        cached: st.next.0,
                        found: s.deadline.0,
                    });
                }
            }
        } else if st.next.is_valid() && result.is_ok() {
            result = Err(RqCheckError::NextMismatch {
                cpu,
                cached: st.next.0,
                found: 0,
            });
        }

        let mut last = second.as_ref().or(min.as_ref()).map(|t| t.deadline);
        if let Some(m) = min {
            backup.insert(m);
        }
        if let Some(s) = second {
            backup.insert(s);
        }
        while let Some(t) = st.heap.take() {
            count += 1;
            if result.is_ok() {
                if let Some(prev) = last {
                    if t.deadline.before(prev) {
                        result = Err(RqCheckError::HeapOrder { cpu });
                    }
                }
            }
            last = Some(t.deadline);
            backup.insert(t);
        }

        if result.is_ok() && count != st.nrunning {
            result = Err(RqCheckError::CountMismatch {
                cpu,
                found: count,
                nrunning: st.nrunning,
            });
        }

        // Restore the checked queue.
        while let Some(t) = backup.take() {
            st.heap.insert(t);
        }
        result
    }

    pub fn dump(&self, st: &RqState, w: &mut dyn Write) -> io::Result<()> {
        writeln!(w, "\n----runqueue {}----", self.cpu)?;
        writeln!(
            w,
            "nrunning: {}, overloaded: {}",
            st.nrunning, st.overloaded as u8
        )?;
        writeln!(
            w,
            "cached value --> earliest: {}, next: {}",
            st.earliest, st.next
        )?;
        writeln!(w, "tasks:")?;
        for t in st.heap.tasks() {
            writeln!(w, "\tpid: {} deadline: {}", t.pid, t.deadline)?;
        }
        writeln!(w, "----end runqueue {}----\n", self.cpu)
    }
}
