//! Shared simulation context.
//!
//! Everything the original testbed kept in globals lives here and is
//! passed explicitly: the push and pull summary instances, the CPU→
//! runqueue registry, the pid source and the per-CPU counters.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::SimConfig;
use crate::deadline::DlOrder;
use crate::runqueue::Runqueue;
use crate::summary::DeadlineSummary;

#[derive(Debug, Default)]
pub struct CpuStats {
    pub arrivals: AtomicU64,
    pub preemptions: AtomicU64,
    pub finishes: AtomicU64,
    pub early_finishes: AtomicU64,
    pub empty: AtomicU64,
    pub pushes: AtomicU64,
    pub pulls: AtomicU64,
}

pub struct SchedCtx {
    pub cfg: SimConfig,
    /// Summary ordered by latest current deadline: push target search.
    pub push: Box<dyn DeadlineSummary>,
    /// Summary ordered by earliest second deadline: pull source search.
    pub pull: Box<dyn DeadlineSummary>,
    rqs: Box<[RwLock<Option<Arc<Runqueue>>>]>,
    pub last_pid: AtomicU64,
    pub stats: Box<[CpuStats]>,
    pub shutdown: AtomicBool,
}

impl SchedCtx {
    pub fn new(cfg: SimConfig) -> Arc<SchedCtx> {
        let n = cfg.nprocessors;
        let push = cfg
            .structure
            .build(n, DlOrder::Latest, cfg.seed, cfg.records_per_cpu);
        let pull = cfg.structure.build(
            n,
            DlOrder::Earliest,
            cfg.seed.wrapping_add(0x9e37_79b9_7f4a_7c15),
            cfg.records_per_cpu,
        );
        Arc::new(SchedCtx {
            cfg,
            push,
            pull,
            rqs: (0..n).map(|_| RwLock::new(None)).collect(),
            last_pid: AtomicU64::new(0),
            stats: (0..n).map(|_| CpuStats::default()).collect(),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn nprocessors(&self) -> usize {
        self.rqs.len()
    }

    pub fn next_pid(&self) -> u64 {
        self.last_pid.fetch_add(1, Ordering::Relaxed)
    }

    /// Publish a worker's runqueue; the validator skips CPUs that have
    /// not registered yet.
    pub fn register_rq(&self, cpu: usize, rq: Arc<Runqueue>) {
        *self.rqs[cpu].write() = Some(rq);
    }

    pub fn unregister_rq(&self, cpu: usize) {
        *self.rqs[cpu].write() = None;
    }

    pub fn runqueue(&self, cpu: usize) -> Option<Arc<Runqueue>> {
        self.rqs[cpu].read().clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}
