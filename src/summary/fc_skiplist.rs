//! Flat-combining skiplist summary.
//!
//! Wraps [`SkipCore`] behind a publication queue and a combining lock.
//! `set` publishes a record and opportunistically becomes the combiner;
//! it never waits for its own operation to land. `find_best` consults a
//! CAS-maintained best-CPU hint first, then merges the best in-flight
//! record with the structure's bottom-level head. Callers that double-lock
//! and re-verify are immune to the staleness this allows.

use std::io::{self, Write};

use crate::deadline::{Deadline, DlOrder};
use crate::spinlock::SpinLock;
use crate::summary::fc::{BitmapPubList, LinkedPubList, PubQueue};
use crate::summary::skiplist::SkipCore;
use crate::summary::{CheckError, DeadlineSummary};

use std::sync::atomic::{AtomicI64, Ordering};

const NO_CACHED_CPU: i64 = -1;

pub struct FcSkiplist<P: PubQueue> {
    core: SkipCore,
    combining: SpinLock<()>,
    pubs: P,
    cached_best: AtomicI64,
}

/// Linked publication-list flavor.
pub type FcLinkedSkiplist = FcSkiplist<LinkedPubList>;
/// Bitmap publication-array flavor.
pub type FcBitmapSkiplist = FcSkiplist<BitmapPubList>;

impl<P: PubQueue> FcSkiplist<P> {
    pub fn new(nproc: usize, order: DlOrder, seed: u64, pubs: P) -> FcSkiplist<P> {
        FcSkiplist {
            core: SkipCore::new(nproc, order, seed),
            combining: SpinLock::new(()),
            pubs,
            cached_best: AtomicI64::new(NO_CACHED_CPU),
        }
    }

    fn apply(core: &SkipCore, cpu: usize, dl: Deadline, valid: bool) {
        core.detach(cpu);
        if valid {
            core.insert(cpu, dl);
        }
    }

    /// Become the combiner if the lock is free; otherwise return at once.
    fn try_combine(&self) {
        if let Some(_g) = self.combining.try_lock() {
            self.pubs
                .drain(&mut |cpu, dl, valid| Self::apply(&self.core, cpu, dl, valid));
        }
    }

    /// Wait for the combining lock and drain everything pending.
    pub fn flush(&self) {
        let _g = self.combining.lock();
        self.pubs
            .drain(&mut |cpu, dl, valid| Self::apply(&self.core, cpu, dl, valid));
    }

    fn update_cache(&self, cpu: usize, dl: Deadline, valid: bool) {
        if valid {
            let cached = self.cached_best.load(Ordering::SeqCst);
            let better = cached == NO_CACHED_CPU
                || self
                    .core
                    .order()
                    .prefers(dl, self.core.node_dl(cached as usize));
            if better {
                let mut cur = cached;
                loop {
                    match self.cached_best.compare_exchange(
                        cur,
                        cpu as i64,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    ) {
                        Ok(_) => break,
                        Err(c) => cur = c,
                    }
                }
            }
        } else {
            let cur = self.cached_best.load(Ordering::SeqCst);
            if cur == cpu as i64 {
                let _ = self.cached_best.compare_exchange(
                    cur,
                    NO_CACHED_CPU,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }
        }
    }
}

impl<P: PubQueue> DeadlineSummary for FcSkiplist<P> {
    fn order(&self) -> DlOrder {
        self.core.order()
    }

    fn set(&self, cpu: usize, dl: Deadline, valid: bool) {
        self.update_cache(cpu, dl, valid);
        self.pubs
            .publish(cpu, dl, valid, &mut || self.try_combine());
        self.try_combine();
    }

    fn find_best(&self) -> Option<usize> {
        let cached = self.cached_best.load(Ordering::SeqCst);
        if cached != NO_CACHED_CPU {
            return Some(cached as usize);
        }

        // No hint: merge the best in-flight publication with the
        // structure's current head.
        let order = self.core.order();
        let mut pending: Option<(usize, Deadline)> = None;
        self.pubs.scan_pending(&mut |cpu, dl, valid| {
            if valid && dl.is_valid() {
                let replace = match pending {
                    None => true,
                    Some((_, best)) => order.prefers(dl, best),
                };
                if replace {
                    pending = Some((cpu, dl));
                }
            }
        });
        let structural = self.core.best().map(|cpu| (cpu, self.core.node_dl(cpu)));

        match (pending, structural) {
            (Some((pc, pd)), Some((sc, sd))) => {
                Some(if order.prefers(pd, sd) { pc } else { sc })
            }
            (Some((pc, _)), None) => Some(pc),
            (None, s) => s.map(|(cpu, _)| cpu),
        }
    }

    fn check(&self) -> Result<(), CheckError> {
        let _g = self.combining.lock();
        self.core.check()
    }

    // check_cpu stays the default: updates are deferred, so the slot may
    // legitimately lag the runqueue cache.

    fn save(&self, w: &mut dyn Write) -> io::Result<()> {
        let _g = self.combining.lock();
        self.core.save(w)
    }

    fn dump_raw(&self, w: &mut dyn Write) -> io::Result<()> {
        self.core.save(w)
    }

    fn flush_pending(&self) {
        self.flush();
    }
}

impl<P: PubQueue> Drop for FcSkiplist<P> {
    fn drop(&mut self) {
        self.flush();
    }
}
