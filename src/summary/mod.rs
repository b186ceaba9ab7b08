//! Per-CPU deadline summary structures.
//!
//! A summary maps each CPU to (is_valid, deadline) and answers "which CPU
//! is best" under a configured orientation. One instance ordered by
//! `DlOrder::Latest` serves push decisions, one ordered by
//! `DlOrder::Earliest` serves pull decisions; the implementations are
//! interchangeable behind [`DeadlineSummary`].

pub mod array_heap;
pub mod fc;
pub mod fc_skiplist;
pub mod locked_heap;
pub mod skiplist;

use std::io::{self, Write};

use clap::ValueEnum;
use thiserror::Error;

use crate::deadline::{Deadline, DlOrder};

pub use array_heap::ArrayHeap;
pub use fc::{BitmapPubList, LinkedPubList, PubQueue};
pub use fc_skiplist::{FcBitmapSkiplist, FcLinkedSkiplist, FcSkiplist};
pub use locked_heap::LockedHeap;
pub use skiplist::SkiplistSummary;

/// Structural invariant violation found by a self-check.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("slot {index} holds cpu {cpu} whose registered position is {position}")]
    PositionMap {
        index: usize,
        cpu: usize,
        position: usize,
    },
    #[error("cpu {cpu} is registered at index {index} but that slot holds cpu {found}")]
    InverseMap {
        cpu: usize,
        index: usize,
        found: usize,
    },
    #[error("slot {parent} ({parent_key}) is outranked by its child {child} ({child_key})")]
    HeapOrder {
        parent: usize,
        child: usize,
        parent_key: String,
        child_key: String,
    },
    #[error("slot occupancy sum {sum} does not match {expected} for {nproc} cpus")]
    SlotSum {
        sum: usize,
        expected: usize,
        nproc: usize,
    },
    #[error("skiplist level is {level} but the highest populated level is {found}")]
    LevelCount { level: usize, found: usize },
    #[error("forward chain out of order at level {level}: {prev} then {next}")]
    ForwardOrder { level: usize, prev: u64, next: u64 },
    #[error("backward chain out of order at level {level}: {prev} before {next}")]
    BackwardOrder { level: usize, prev: u64, next: u64 },
    #[error("prev link at level {level} of node {node} points to {found}, expected {expected}")]
    PrevLink {
        level: usize,
        node: usize,
        found: usize,
        expected: usize,
    },
    #[error("cpu {cpu}: summary holds {found}, runqueue cache holds {expected}")]
    SlotMismatch {
        cpu: usize,
        found: String,
        expected: String,
    },
}

/// Uniform interface over the five summary implementations.
///
/// `set` installs, updates or (with `valid == false`) withdraws one CPU's
/// slot; callers always update their own CPU under the runqueue lock.
/// `find_best` may be called by any thread at any time.
pub trait DeadlineSummary: Send + Sync {
    fn order(&self) -> DlOrder;

    fn set(&self, cpu: usize, dl: Deadline, valid: bool);

    /// CPU holding the best slot under this instance's orientation, or
    /// `None` when no CPU has a valid entry.
    fn find_best(&self) -> Option<usize>;

    fn check(&self) -> Result<(), CheckError>;

    /// Verify one CPU's slot against the value the runqueue believes it
    /// published. `dl == Deadline::INVALID` means "withdrawn". Deferred
    /// implementations may accept anything.
    fn check_cpu(&self, _cpu: usize, _dl: Deadline) -> Result<(), CheckError> {
        Ok(())
    }

    fn save(&self, w: &mut dyn Write) -> io::Result<()>;

    fn print(&self) {
        let mut out = io::stdout();
        let _ = self.save(&mut out);
    }

    /// Best-effort dump that takes no locks; only the SIGINT handler uses
    /// it, so torn values are acceptable.
    fn dump_raw(&self, w: &mut dyn Write) -> io::Result<()>;

    /// Force any deferred updates into the structure. No-op for the
    /// synchronous implementations.
    fn flush_pending(&self) {}
}

/// Selectable summary implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SummaryKind {
    /// Binary heap with one mutex per slot and hand-over-hand sifting.
    LockedHeap,
    /// Array-backed heap behind a single spinlock.
    ArrayHeap,
    /// Doubly-linked skiplist with a read/write lock.
    Skiplist,
    /// Flat-combining skiplist, linked publication list.
    FcSkiplist,
    /// Flat-combining skiplist, bitmap publication array.
    BmFcSkiplist,
}

impl SummaryKind {
    pub fn label(self) -> &'static str {
        match self {
            SummaryKind::LockedHeap => "locked heap",
            SummaryKind::ArrayHeap => "array heap",
            SummaryKind::Skiplist => "skiplist",
            SummaryKind::FcSkiplist => "flat-combining skiplist",
            SummaryKind::BmFcSkiplist => "bitmap flat-combining skiplist",
        }
    }

    /// Build one summary instance for `nproc` CPUs under `order`.
    pub fn build(
        self,
        nproc: usize,
        order: DlOrder,
        seed: u64,
        records_per_cpu: usize,
    ) -> Box<dyn DeadlineSummary> {
        match self {
            SummaryKind::LockedHeap => Box::new(LockedHeap::new(nproc, order)),
            SummaryKind::ArrayHeap => Box::new(ArrayHeap::new(nproc, order)),
            SummaryKind::Skiplist => Box::new(SkiplistSummary::new(nproc, order, seed)),
            SummaryKind::FcSkiplist => Box::new(FcSkiplist::new(
                nproc,
                order,
                seed,
                LinkedPubList::new(nproc, records_per_cpu),
            )),
            SummaryKind::BmFcSkiplist => Box::new(FcSkiplist::new(
                nproc,
                order,
                seed,
                BitmapPubList::new(nproc, records_per_cpu),
            )),
        }
    }
}
