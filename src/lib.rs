// gedf-testbed: concurrent data structures for global-EDF push/pull
// scheduling, exercised under adversarial multi-core contention.

#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! # gedf-testbed
//!
//! A testbed for the per-CPU deadline summary structures of a global
//! Earliest-Deadline-First multiprocessor scheduler. N worker threads
//! simulate CPUs: each owns a runqueue (binomial heap + spinlock with
//! cached earliest/second deadlines) and mirrors those caches into two
//! global summary structures — one answering "which CPU should receive a
//! pushed task" (latest current deadline), one answering "which CPU
//! should be pulled from" (earliest second deadline).
//!
//! ## Key Components
//!
//! - **Deadline**: modular 64-bit deadline comparison with sentinel keys
//! - **RqHeap / Runqueue**: binomial heap with cached min and second-min
//! - **DeadlineSummary**: one trait over five interchangeable structures
//!   (locked binary heap, array heap, skiplist, two flat-combining
//!   skiplist flavors)
//! - **migrate**: push/pull coordination with CPU-ordered double-locking
//! - **validator**: background thread asserting cross-structure
//!   invariants
//!
//! ## Concurrency contract
//!
//! Per-runqueue operations are linearized by the runqueue spinlock,
//! which also covers summary publication. Summary `find_best` may be
//! stale for every implementation; migration re-verifies under both
//! runqueue locks before moving a task, so staleness costs retries, not
//! correctness.

pub mod config;
pub mod ctx;
pub mod deadline;
pub mod migrate;
pub mod rq_heap;
pub mod runqueue;
pub mod signal;
pub mod spinlock;
pub mod summary;
pub mod validator;
pub mod worker;

pub use config::SimConfig;
pub use ctx::{CpuStats, SchedCtx};
pub use deadline::{Deadline, DlOrder, Key};
pub use rq_heap::{RqHeap, Task};
pub use runqueue::{RqState, Runqueue};
pub use summary::{DeadlineSummary, SummaryKind};
