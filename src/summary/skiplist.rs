//! Doubly-linked skiplist summary.
//!
//! One node per CPU, allocated at init and reused for the lifetime of the
//! structure; a detached node keeps its identity (`level == -1`) and is
//! respliced on the next insert. Links are atomic indices into the node
//! slab, which is what makes the lock-free `find` read of
//! `head.next[0]` safe: nodes are never freed and a node's CPU index
//! never changes.
//!
//! [`SkipCore`] contains the unsynchronized list machinery; writers must
//! be serialized externally (rwlock here, the combining lock in the
//! flat-combining front-end). [`SkiplistSummary`] is the rwlock variant.

use std::io::{self, Write};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::deadline::{Deadline, DlOrder};
use crate::summary::{CheckError, DeadlineSummary};

pub const MAX_LEVEL: usize = 8;
const LEVEL_PROB_DIVISOR: u64 = 5; // promotion probability 1/5
const NIL: usize = usize::MAX;
const DETACHED: i64 = -1;

pub struct SkipNode {
    dl: AtomicU64,
    /// Level of the node, or -1 while detached.
    level: AtomicI64,
    next: [AtomicUsize; MAX_LEVEL],
    prev: [AtomicUsize; MAX_LEVEL],
    cpu: usize,
}

impl SkipNode {
    fn new(cpu: usize) -> SkipNode {
        SkipNode {
            dl: AtomicU64::new(0),
            level: AtomicI64::new(DETACHED),
            next: std::array::from_fn(|_| AtomicUsize::new(NIL)),
            prev: std::array::from_fn(|_| AtomicUsize::new(NIL)),
            cpu,
        }
    }
}

pub struct SkipCore {
    order: DlOrder,
    /// Per-CPU nodes in slots `0..nproc`, head sentinel in slot `nproc`.
    nodes: Box<[SkipNode]>,
    head: usize,
    level: AtomicUsize,
    seed: AtomicU64,
}

impl SkipCore {
    pub fn new(nproc: usize, order: DlOrder, seed: u64) -> SkipCore {
        let mut nodes: Vec<SkipNode> = (0..nproc).map(SkipNode::new).collect();
        nodes.push(SkipNode::new(NIL));
        SkipCore {
            order,
            nodes: nodes.into_boxed_slice(),
            head: nproc,
            level: AtomicUsize::new(0),
            seed: AtomicU64::new(seed | 1),
        }
    }

    pub fn nproc(&self) -> usize {
        self.head
    }

    pub fn order(&self) -> DlOrder {
        self.order
    }

    pub fn node_dl(&self, cpu: usize) -> Deadline {
        Deadline(self.nodes[cpu].dl.load(Ordering::Acquire))
    }

    pub fn is_attached(&self, cpu: usize) -> bool {
        self.nodes[cpu].level.load(Ordering::Acquire) != DETACHED
    }

    fn next_rand(&self) -> u64 {
        let mut x = self.seed.load(Ordering::Relaxed);
        loop {
            let mut y = x;
            y ^= y << 13;
            y ^= y >> 7;
            y ^= y << 17;
            match self
                .seed
                .compare_exchange_weak(x, y, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return y,
                Err(c) => x = c,
            }
        }
    }

    /// Geometric level draw, capped at `max` and at `MAX_LEVEL - 1`.
    fn rand_level(&self, max: usize) -> usize {
        let cap = max.min(MAX_LEVEL - 1);
        let mut level = 0;
        while level < cap && self.next_rand() % LEVEL_PROB_DIVISOR == 0 {
            level += 1;
        }
        level
    }

    /// Unsplice the CPU's node. Caller holds the writer side.
    pub fn detach(&self, cpu: usize) -> bool {
        let node = &self.nodes[cpu];
        let lvl = node.level.load(Ordering::Relaxed);
        if lvl == DETACHED {
            return false;
        }
        for i in 0..=(lvl as usize) {
            let prev = node.prev[i].load(Ordering::Relaxed);
            let next = node.next[i].load(Ordering::Relaxed);
            self.nodes[prev].next[i].store(next, Ordering::Release);
            if next != NIL {
                self.nodes[next].prev[i].store(prev, Ordering::Release);
            }
        }
        // If this was the only node on the top levels, shrink.
        let mut top = self.level.load(Ordering::Relaxed);
        while top > 0 && self.nodes[self.head].next[top].load(Ordering::Relaxed) == NIL {
            top -= 1;
        }
        self.level.store(top, Ordering::Relaxed);
        node.level.store(DETACHED, Ordering::Release);
        true
    }

    /// Splice the CPU's node back in with the given deadline. Caller
    /// holds the writer side; the node must be detached.
    pub fn insert(&self, cpu: usize, dl: Deadline) {
        let node = &self.nodes[cpu];
        node.dl.store(dl.0, Ordering::Release);

        let mut update = [self.head; MAX_LEVEL];
        let mut p = self.head;
        let mut lvl = self.level.load(Ordering::Relaxed) as i64;
        while lvl >= 0 {
            update[lvl as usize] = p;
            let nxt = self.nodes[p].next[lvl as usize].load(Ordering::Relaxed);
            if nxt == NIL {
                lvl -= 1;
                continue;
            }
            let nxt_dl = Deadline(self.nodes[nxt].dl.load(Ordering::Relaxed));
            if self.order.prefers(nxt_dl, dl) {
                p = nxt;
            } else {
                lvl -= 1;
            }
        }

        let top = self.level.load(Ordering::Relaxed);
        let rand_level = self.rand_level(top + 1);
        node.level.store(rand_level as i64, Ordering::Release);
        if rand_level > top {
            update[rand_level] = self.head;
            self.level.store(rand_level, Ordering::Relaxed);
        }

        for i in 0..=rand_level {
            let succ = self.nodes[update[i]].next[i].load(Ordering::Relaxed);
            node.next[i].store(succ, Ordering::Relaxed);
            node.prev[i].store(update[i], Ordering::Relaxed);
            if succ != NIL {
                self.nodes[succ].prev[i].store(cpu, Ordering::Relaxed);
            }
            // Publish last so a lock-free reader only ever follows links
            // to fully initialized nodes.
            self.nodes[update[i]].next[i].store(cpu, Ordering::Release);
        }
    }

    /// First node on the bottom level; safe without any lock.
    pub fn best(&self) -> Option<usize> {
        let nxt = self.nodes[self.head].next[0].load(Ordering::Acquire);
        if nxt == NIL {
            None
        } else {
            Some(self.nodes[nxt].cpu)
        }
    }

    pub fn save(&self, w: &mut dyn Write) -> io::Result<()> {
        let nproc = self.nproc();
        writeln!(w, "\n----Skiplist----")?;
        let top = self.level.load(Ordering::Relaxed).min(MAX_LEVEL - 1);
        for i in (0..=top).rev() {
            write!(w, "{i}:\t")?;
            let mut node = self.nodes[self.head].next[i].load(Ordering::Relaxed);
            let mut hops = 0;
            while node != NIL && hops <= nproc {
                write!(w, "{} ", self.nodes[node].dl.load(Ordering::Relaxed))?;
                node = self.nodes[node].next[i].load(Ordering::Relaxed);
                hops += 1;
            }
            writeln!(w)?;
        }
        for cpu in 0..nproc {
            if self.nodes[cpu].level.load(Ordering::Relaxed) == DETACHED {
                writeln!(w, "[{cpu}]:\tout of list")?;
            } else {
                writeln!(w, "[{cpu}]:\t{}", self.nodes[cpu].dl.load(Ordering::Relaxed))?;
            }
        }
        writeln!(w, "----End Skiplist----")
    }

    pub fn check(&self) -> Result<(), CheckError> {
        let nproc = self.nproc();
        let top = self.level.load(Ordering::Relaxed);
        let mut found = 0;
        for i in 0..MAX_LEVEL {
            if self.nodes[self.head].next[i].load(Ordering::Relaxed) != NIL {
                found = i;
            }
        }
        if found != top {
            return Err(CheckError::LevelCount { level: top, found });
        }

        for i in 0..=top {
            let mut cur = self.head;
            let mut node = self.nodes[cur].next[i].load(Ordering::Relaxed);
            let mut hops = 0;
            while node != NIL {
                if hops > nproc {
                    return Err(CheckError::LevelCount {
                        level: top,
                        found: i,
                    });
                }
                let back = self.nodes[node].prev[i].load(Ordering::Relaxed);
                if back != cur {
                    return Err(CheckError::PrevLink {
                        level: i,
                        node: self.nodes[node].cpu,
                        found: back,
                        expected: cur,
                    });
                }
                if cur != self.head {
                    let prev_dl = Deadline(self.nodes[cur].dl.load(Ordering::Relaxed));
                    let node_dl = Deadline(self.nodes[node].dl.load(Ordering::Relaxed));
                    if self.order.prefers(node_dl, prev_dl) {
                        return Err(CheckError::ForwardOrder {
                            level: i,
                            prev: prev_dl.0,
                            next: node_dl.0,
                        });
                    }
                }
                cur = node;
                node = self.nodes[node].next[i].load(Ordering::Relaxed);
                hops += 1;
            }
        }

        // Backward pass: walk to the tail and come back on prev links.
        for i in 0..=top {
            let mut node = self.nodes[self.head].next[i].load(Ordering::Relaxed);
            if node == NIL {
                continue;
            }
            let mut hops = 0;
            while self.nodes[node].next[i].load(Ordering::Relaxed) != NIL && hops <= nproc {
                node = self.nodes[node].next[i].load(Ordering::Relaxed);
                hops += 1;
            }
            let mut prev = self.nodes[node].prev[i].load(Ordering::Relaxed);
            while prev != self.head && prev != NIL {
                let prev_dl = Deadline(self.nodes[prev].dl.load(Ordering::Relaxed));
                let node_dl = Deadline(self.nodes[node].dl.load(Ordering::Relaxed));
                if self.order.prefers(node_dl, prev_dl) {
                    return Err(CheckError::BackwardOrder {
                        level: i,
                        prev: prev_dl.0,
                        next: node_dl.0,
                    });
                }
                node = prev;
                prev = self.nodes[node].prev[i].load(Ordering::Relaxed);
            }
        }
        Ok(())
    }

    pub fn check_cpu(&self, cpu: usize, dl: Deadline) -> Result<(), CheckError> {
        let attached = self.is_attached(cpu);
        let found = self.node_dl(cpu);
        let ok = if dl.is_valid() {
            attached && found == dl
        } else {
            !attached
        };
        if ok {
            Ok(())
        } else {
            Err(CheckError::SlotMismatch {
                cpu,
                found: if attached {
                    found.to_string()
                } else {
                    "detached".into()
                },
                expected: if dl.is_valid() {
                    dl.to_string()
                } else {
                    "detached".into()
                },
            })
        }
    }
}

pub struct SkiplistSummary {
    core: SkipCore,
    lock: RwLock<()>,
}

impl SkiplistSummary {
    pub fn new(nproc: usize, order: DlOrder, seed: u64) -> SkiplistSummary {
        SkiplistSummary {
            core: SkipCore::new(nproc, order, seed),
            lock: RwLock::new(()),
        }
    }
}

impl DeadlineSummary for SkiplistSummary {
    fn order(&self) -> DlOrder {
        self.core.order()
    }

    fn set(&self, cpu: usize, dl: Deadline, valid: bool) {
        let _g = self.lock.write();
        self.core.detach(cpu);
        if valid {
            self.core.insert(cpu, dl);
        }
    }

    fn find_best(&self) -> Option<usize> {
        // Lock-free: a stale head successor is still a live, never-freed
        // node whose cpu index is immutable.
        self.core.best()
    }

    fn check(&self) -> Result<(), CheckError> {
        let _g = self.lock.read();
        self.core.check()
    }

    fn check_cpu(&self, cpu: usize, dl: Deadline) -> Result<(), CheckError> {
        let _g = self.lock.read();
        self.core.check_cpu(cpu, dl)
    }

    fn save(&self, w: &mut dyn Write) -> io::Result<()> {
        let _g = self.lock.read();
        self.core.save(w)
    }

    fn dump_raw(&self, w: &mut dyn Write) -> io::Result<()> {
        self.core.save(w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(order: DlOrder) -> SkiplistSummary {
        let s = SkiplistSummary::new(4, order, 42);
        for (cpu, dl) in [(0, 10), (1, 20), (2, 5), (3, 30)] {
            s.set(cpu, Deadline(dl), true);
        }
        s
    }

    #[test]
    fn orientations_pick_opposite_extremes() {
        assert_eq!(filled(DlOrder::Latest).find_best(), Some(3));
        assert_eq!(filled(DlOrder::Earliest).find_best(), Some(2));
    }

    #[test]
    fn withdraw_reroutes_to_next_best() {
        let pull = filled(DlOrder::Earliest);
        pull.set(2, Deadline::INVALID, false);
        assert_eq!(pull.find_best(), Some(0));
        pull.check().unwrap();
    }

    #[test]
    fn update_reuses_the_preallocated_node() {
        let push = filled(DlOrder::Latest);
        push.set(1, Deadline(100), true);
        assert_eq!(push.find_best(), Some(1));
        push.check().unwrap();
        push.check_cpu(1, Deadline(100)).unwrap();
    }

    #[test]
    fn set_then_withdraw_restores_structure() {
        let s = SkiplistSummary::new(4, DlOrder::Earliest, 7);
        s.set(2, Deadline(9), true);
        s.set(2, Deadline(9), false);
        assert_eq!(s.find_best(), None);
        s.check().unwrap();
        s.check_cpu(2, Deadline::INVALID).unwrap();
    }

    #[test]
    fn duplicate_set_keeps_a_single_node() {
        let s = SkiplistSummary::new(4, DlOrder::Earliest, 7);
        s.set(1, Deadline(40), true);
        s.set(1, Deadline(15), true);
        assert_eq!(s.find_best(), Some(1));
        s.check().unwrap();
        s.check_cpu(1, Deadline(15)).unwrap();
    }

    #[test]
    fn chains_stay_ordered_with_many_nodes() {
        let s = SkiplistSummary::new(32, DlOrder::Earliest, 1234);
        for cpu in 0..32usize {
            s.set(cpu, Deadline((cpu as u64 * 37) % 101 + 1), true);
        }
        s.check().unwrap();
        for cpu in (0..32usize).step_by(3) {
            s.set(cpu, Deadline::INVALID, false);
        }
        s.check().unwrap();
        for cpu in (0..32usize).step_by(3) {
            s.set(cpu, Deadline((cpu as u64 * 53) % 89 + 1), true);
        }
        s.check().unwrap();
    }

    #[test]
    fn save_uses_the_bracketed_dump_format() {
        let s = filled(DlOrder::Earliest);
        let mut out = Vec::new();
        s.save(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("----Skiplist----"));
        assert!(text.contains("----End Skiplist----"));
        assert!(text.contains("[2]:\t5"));
        assert!(text.contains("0:\t5 10 20 30 "));
    }

    #[test]
    fn concurrent_writers_and_lock_free_readers() {
        use std::sync::Arc;
        use std::thread;

        let s = Arc::new(SkiplistSummary::new(8, DlOrder::Earliest, 99));
        let mut handles = vec![];
        for cpu in 0..8usize {
            let s = Arc::clone(&s);
            handles.push(thread::spawn(move || {
                for i in 0..2_000u64 {
                    let dl = (cpu as u64 * 131 + i * 17) % 997 + 1;
                    s.set(cpu, Deadline(dl), i % 13 != 0);
                }
            }));
        }
        for _ in 0..2 {
            let s = Arc::clone(&s);
            handles.push(thread::spawn(move || {
                for _ in 0..20_000 {
                    if let Some(cpu) = s.find_best() {
                        assert!(cpu < 8);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        s.check().unwrap();
    }
}
