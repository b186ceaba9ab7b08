//! Binary heap summary with one mutex per slot.
//!
//! Slots form an implicit binary tree; each slot's mutex protects the
//! slot, not the node resident in it. Every locking sequence walks a
//! root-to-leaf path in index order, which is the whole deadlock-freedom
//! argument.
//!
//! A key change toward the leaves runs the hand-over-hand sift-down. A
//! key change toward the root runs the finish protocol: lock the root,
//! chase the node's (unlocked) position reading down the tree, verify the
//! direction assumption under the locked path, release the prefix that
//! stays put, then rotate the suffix one step down.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::deadline::{Deadline, DlOrder, Key};
use crate::summary::{CheckError, DeadlineSummary};

const TAG_MIN: u8 = 0;
const TAG_NORMAL: u8 = 1;
const TAG_MAX: u8 = 2;

static NEXT_TAG: AtomicU64 = AtomicU64::new(1);

fn thread_tag() -> u64 {
    thread_local! {
        static TAG: u64 = NEXT_TAG.fetch_add(1, Ordering::Relaxed);
    }
    TAG.with(|t| *t)
}

#[inline]
fn left(i: usize) -> usize {
    2 * i + 1
}

#[inline]
fn right(i: usize) -> usize {
    2 * i + 2
}

#[inline]
fn parent_of(i: usize) -> usize {
    (i - 1) >> 1
}

struct Slot {
    lock: Mutex<()>,
    /// CPU index of the node resident in this slot.
    resident: AtomicUsize,
    locked: AtomicBool,
    owner: AtomicU64,
}

struct NodeState {
    /// Slot currently holding this CPU's node. Read without a lock by the
    /// finish protocol; the climb re-validates under the locked path.
    position: AtomicUsize,
    tag: AtomicU8,
    dl: AtomicU64,
}

struct SlotGuard<'a> {
    slot: &'a Slot,
    _g: MutexGuard<'a, ()>,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slot.locked.store(false, Ordering::Relaxed);
    }
}

pub struct LockedHeap {
    order: DlOrder,
    nproc: usize,
    slots: Box<[Slot]>,
    nodes: Box<[NodeState]>,
}

impl LockedHeap {
    pub fn new(nproc: usize, order: DlOrder) -> LockedHeap {
        let heap = LockedHeap {
            order,
            nproc,
            slots: (0..nproc)
                .map(|i| Slot {
                    lock: Mutex::new(()),
                    resident: AtomicUsize::new(i),
                    locked: AtomicBool::new(false),
                    owner: AtomicU64::new(0),
                })
                .collect(),
            nodes: (0..nproc)
                .map(|i| NodeState {
                    position: AtomicUsize::new(i),
                    tag: AtomicU8::new(TAG_NORMAL),
                    dl: AtomicU64::new(0),
                })
                .collect(),
        };
        let detached = order.detached_key();
        for cpu in 0..nproc {
            heap.store_key(cpu, detached);
        }
        heap
    }

    fn lock_slot(&self, i: usize) -> SlotGuard<'_> {
        let slot = &self.slots[i];
        let g = slot.lock.lock();
        slot.locked.store(true, Ordering::Relaxed);
        slot.owner.store(thread_tag(), Ordering::Relaxed);
        SlotGuard { slot, _g: g }
    }

    fn key_of(&self, cpu: usize) -> Key {
        let node = &self.nodes[cpu];
        match node.tag.load(Ordering::Acquire) {
            TAG_MIN => Key::Min,
            TAG_MAX => Key::Max,
            _ => Key::Normal(Deadline(node.dl.load(Ordering::Acquire))),
        }
    }

    fn store_key(&self, cpu: usize, key: Key) {
        let node = &self.nodes[cpu];
        match key {
            Key::Min => node.tag.store(TAG_MIN, Ordering::Release),
            Key::Max => node.tag.store(TAG_MAX, Ordering::Release),
            Key::Normal(dl) => {
                node.dl.store(dl.0, Ordering::Release);
                node.tag.store(TAG_NORMAL, Ordering::Release);
            }
        }
    }

    fn key_at(&self, slot: usize) -> Key {
        self.key_of(self.slots[slot].resident.load(Ordering::Relaxed))
    }

    /// Swap the residents of two slots. Both slot locks must be held.
    fn swap_slots(&self, a: usize, b: usize) {
        let ra = self.slots[a].resident.load(Ordering::Relaxed);
        let rb = self.slots[b].resident.load(Ordering::Relaxed);
        self.slots[a].resident.store(rb, Ordering::Relaxed);
        self.slots[b].resident.store(ra, Ordering::Relaxed);
        self.nodes[ra].position.store(b, Ordering::Release);
        self.nodes[rb].position.store(a, Ordering::Release);
    }

    /// Hand-over-hand descent. Entered holding the guard of slot `n`.
    fn sift_down<'a>(&'a self, mut n: usize, mut g_n: SlotGuard<'a>) {
        loop {
            let l = left(n);
            let r = right(n);
            let g_l = (l < self.nproc).then(|| self.lock_slot(l));
            let g_r = (r < self.nproc).then(|| self.lock_slot(r));

            let mut p = n;
            if g_l.is_some() && self.order.key_prefers(self.key_at(l), self.key_at(p)) {
                p = l;
            }
            if g_r.is_some() && self.order.key_prefers(self.key_at(r), self.key_at(p)) {
                p = r;
            }
            if p == n {
                return;
            }
            self.swap_slots(n, p);
            let (keep, other) = if p == l { (g_l, g_r) } else { (g_r, g_l) };
            drop(other);
            drop(g_n);
            match keep {
                Some(g) => {
                    g_n = g;
                    n = p;
                }
                None => return,
            }
        }
    }

    /// Upward move along a freshly locked root path. Returns false when
    /// the direction assumption no longer holds once the path is locked;
    /// the caller re-dispatches.
    fn finish_climb(&self, cpu: usize, key: Key) -> bool {
        let mut path: Vec<(usize, Option<SlotGuard<'_>>)> = Vec::with_capacity(16);
        path.push((0, Some(self.lock_slot(0))));
        let mut k = 0usize;
        loop {
            let j = self.nodes[cpu].position.load(Ordering::Acquire);
            if j == k {
                break;
            }
            // The node cannot cross a locked slot, so j stays inside k's
            // subtree and the parent chase below terminates at k.
            let mut step = j;
            while parent_of(step) != k {
                step = parent_of(step);
            }
            k = step;
            path.push((k, Some(self.lock_slot(k))));
        }

        let cur = self.key_of(cpu);
        if self.order.key_prefers(cur, key) {
            return false;
        }

        // Slots whose keys still outrank the new one keep their place.
        let mut base = 0usize;
        while self.order.key_prefers(self.key_at(path[base].0), key) {
            path[base].1 = None;
            base += 1;
        }

        self.store_key(cpu, key);
        let mut carried = cpu;
        for (idx, _) in &path[base..] {
            let evicted = self.slots[*idx].resident.load(Ordering::Relaxed);
            self.slots[*idx].resident.store(carried, Ordering::Relaxed);
            self.nodes[carried].position.store(*idx, Ordering::Release);
            carried = evicted;
        }
        true
    }

    fn render(&self, w: &mut dyn Write) -> io::Result<()> {
        writeln!(w, "[")?;
        for i in 0..self.nproc {
            let cpu = self.slots[i].resident.load(Ordering::Relaxed);
            let locked = self.slots[i].locked.load(Ordering::Relaxed);
            write!(w, "  pos {i} = (cpu {cpu}, key {}, lk {})", self.key_of(cpu), locked as u8)?;
            if locked {
                writeln!(w, " owner {}", self.slots[i].owner.load(Ordering::Relaxed))?;
            } else {
                writeln!(w)?;
            }
        }
        writeln!(w, "]")
    }
}

impl DeadlineSummary for LockedHeap {
    fn order(&self) -> DlOrder {
        self.order
    }

    fn set(&self, cpu: usize, dl: Deadline, valid: bool) {
        let key = if valid {
            Key::Normal(dl)
        } else {
            self.order.detached_key()
        };
        loop {
            let pos = self.nodes[cpu].position.load(Ordering::Acquire);
            let guard = self.lock_slot(pos);
            if self.slots[pos].resident.load(Ordering::Relaxed) != cpu {
                // The node moved between the position read and the lock.
                drop(guard);
                continue;
            }
            let cur = self.key_of(cpu);
            if cur == key {
                return;
            }
            if self.order.key_prefers(cur, key) {
                self.store_key(cpu, key);
                self.sift_down(pos, guard);
                return;
            }
            drop(guard);
            if self.finish_climb(cpu, key) {
                return;
            }
        }
    }

    fn find_best(&self) -> Option<usize> {
        let resident = self.slots[0].resident.load(Ordering::Acquire);
        match self.key_of(resident) {
            Key::Normal(_) => Some(resident),
            _ => None,
        }
    }

    fn check(&self) -> Result<(), CheckError> {
        let _guards: Vec<SlotGuard<'_>> = (0..self.nproc).map(|i| self.lock_slot(i)).collect();
        let mut sum = 0usize;
        for i in 0..self.nproc {
            let cpu = self.slots[i].resident.load(Ordering::Relaxed);
            let pos = self.nodes[cpu].position.load(Ordering::Relaxed);
            if pos != i {
                return Err(CheckError::PositionMap {
                    index: i,
                    cpu,
                    position: pos,
                });
            }
            for child in [left(i), right(i)] {
                if child < self.nproc
                    && self.order.key_prefers(self.key_at(child), self.key_at(i))
                {
                    return Err(CheckError::HeapOrder {
                        parent: i,
                        child,
                        parent_key: self.key_at(i).to_string(),
                        child_key: self.key_at(child).to_string(),
                    });
                }
            }
            sum += cpu + 1;
        }
        let expected = self.nproc * (self.nproc + 1) / 2;
        if sum != expected {
            return Err(CheckError::SlotSum {
                sum,
                expected,
                nproc: self.nproc,
            });
        }
        Ok(())
    }

    fn check_cpu(&self, cpu: usize, dl: Deadline) -> Result<(), CheckError> {
        let pos = self.nodes[cpu].position.load(Ordering::Acquire);
        let _g = self.lock_slot(pos);
        let expected = if dl.is_valid() {
            Key::Normal(dl)
        } else {
            self.order.detached_key()
        };
        let found = self.key_of(cpu);
        if found == expected {
            Ok(())
        } else {
            Err(CheckError::SlotMismatch {
                cpu,
                found: found.to_string(),
                expected: expected.to_string(),
            })
        }
    }

    fn save(&self, w: &mut dyn Write) -> io::Result<()> {
        let _guards: Vec<SlotGuard<'_>> = (0..self.nproc).map(|i| self.lock_slot(i)).collect();
        self.render(w)
    }

    fn dump_raw(&self, w: &mut dyn Write) -> io::Result<()> {
        self.render(w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn filled(order: DlOrder) -> LockedHeap {
        let h = LockedHeap::new(4, order);
        for (cpu, dl) in [(0, 10), (1, 20), (2, 5), (3, 30)] {
            h.set(cpu, Deadline(dl), true);
        }
        h
    }

    #[test]
    fn orientations_pick_opposite_extremes() {
        let push = filled(DlOrder::Latest);
        assert_eq!(push.find_best(), Some(3));
        push.check().unwrap();

        let pull = filled(DlOrder::Earliest);
        assert_eq!(pull.find_best(), Some(2));
        pull.check().unwrap();
    }

    #[test]
    fn withdrawn_slots_sink_below_live_ones() {
        let pull = filled(DlOrder::Earliest);
        pull.set(2, Deadline::INVALID, false);
        assert_eq!(pull.find_best(), Some(0));
        pull.check().unwrap();
        pull.check_cpu(2, Deadline::INVALID).unwrap();
    }

    #[test]
    fn raising_a_key_climbs_to_the_root() {
        let push = filled(DlOrder::Latest);
        push.set(1, Deadline(100), true);
        assert_eq!(push.find_best(), Some(1));
        push.check().unwrap();
    }

    #[test]
    fn lowering_a_key_sifts_down() {
        let push = filled(DlOrder::Latest);
        push.set(3, Deadline(1), true);
        assert_eq!(push.find_best(), Some(1));
        push.check().unwrap();
    }

    #[test]
    fn all_withdrawn_means_no_best() {
        let h = filled(DlOrder::Latest);
        for cpu in 0..4 {
            h.set(cpu, Deadline::INVALID, false);
        }
        assert_eq!(h.find_best(), None);
        h.check().unwrap();
    }

    #[test]
    fn set_is_idempotent_per_cpu() {
        let h = LockedHeap::new(4, DlOrder::Latest);
        h.set(0, Deadline(50), true);
        h.set(0, Deadline(50), true);
        h.check().unwrap();
        h.check_cpu(0, Deadline(50)).unwrap();
        h.set(0, Deadline::INVALID, false);
        h.set(0, Deadline::INVALID, false);
        h.check().unwrap();
        h.check_cpu(0, Deadline::INVALID).unwrap();
    }

    #[test]
    fn concurrent_own_slot_updates_keep_the_heap_sound() {
        for order in [DlOrder::Earliest, DlOrder::Latest] {
            let h = Arc::new(LockedHeap::new(8, order));
            let mut handles = vec![];
            for cpu in 0..8usize {
                let h = Arc::clone(&h);
                handles.push(thread::spawn(move || {
                    for i in 0..3_000u64 {
                        let dl = (cpu as u64 * 131 + i * 17) % 997 + 1;
                        h.set(cpu, Deadline(dl), i % 11 != 0);
                    }
                }));
            }
            for _ in 0..2 {
                let h = Arc::clone(&h);
                handles.push(thread::spawn(move || {
                    for _ in 0..10_000 {
                        let _ = h.find_best();
                    }
                }));
            }
            for handle in handles {
                handle.join().unwrap();
            }
            h.check().unwrap();
        }
    }
}
