//! Runtime simulation parameters.

use std::time::Duration;

use crate::summary::SummaryKind;

/// Tunables for one simulation run. Defaults match the classic testbed
/// configuration: 4 CPUs, 1000 cycles of 10 ms, deadlines drawn 10..100
/// ticks ahead, 3 retries per migration attempt.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub structure: SummaryKind,
    pub nprocessors: usize,
    pub ncycles: u64,
    pub tick: Duration,
    pub dmin: u64,
    pub dmax: u64,
    pub push_max_tries: u32,
    pub pull_max_tries: u32,
    /// Publication records preallocated per CPU for the flat-combining
    /// flavors; the bitmap flavor caps this at 32.
    pub records_per_cpu: usize,
    pub seed: u64,
    pub validate: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            structure: SummaryKind::ArrayHeap,
            nprocessors: 4,
            ncycles: 1000,
            tick: Duration::from_millis(10),
            dmin: 10,
            dmax: 100,
            push_max_tries: 3,
            pull_max_tries: 3,
            records_per_cpu: 10,
            seed: 1,
            validate: true,
        }
    }
}
