//! Array-backed heap summary.
//!
//! One spinlock guards the whole structure. A CPU→index inverse map gives
//! O(log n) change-key for any CPU, so `set` never needs to search.

use std::io::{self, Write};

use crate::deadline::{Deadline, DlOrder};
use crate::spinlock::SpinLock;
use crate::summary::{CheckError, DeadlineSummary};

#[derive(Debug, Clone, Copy)]
struct Element {
    dl: Deadline,
    cpu: usize,
}

struct Inner {
    size: usize,
    elements: Box<[Element]>,
    cpu_to_idx: Box<[Option<usize>]>,
}

pub struct ArrayHeap {
    order: DlOrder,
    inner: SpinLock<Inner>,
}

#[inline]
fn parent(i: usize) -> usize {
    (i - 1) >> 1
}

#[inline]
fn left(i: usize) -> usize {
    (i << 1) + 1
}

#[inline]
fn right(i: usize) -> usize {
    (i << 1) + 2
}

impl Inner {
    /// Swap two live slots, fixing the inverse map through the cpu values
    /// captured before the swap.
    fn exchange(&mut self, a: usize, b: usize) {
        let cpu_a = self.elements[a].cpu;
        let cpu_b = self.elements[b].cpu;
        self.elements.swap(a, b);
        self.cpu_to_idx[cpu_a] = Some(b);
        self.cpu_to_idx[cpu_b] = Some(a);
    }

    fn sift_down(&mut self, mut idx: usize, order: DlOrder) {
        loop {
            let l = left(idx);
            let r = right(idx);
            let mut best = idx;
            if l < self.size && order.prefers(self.elements[l].dl, self.elements[best].dl) {
                best = l;
            }
            if r < self.size && order.prefers(self.elements[r].dl, self.elements[best].dl) {
                best = r;
            }
            if best == idx {
                return;
            }
            self.exchange(idx, best);
            idx = best;
        }
    }

    fn bubble_up(&mut self, mut idx: usize, order: DlOrder) {
        while idx > 0 && order.prefers(self.elements[idx].dl, self.elements[parent(idx)].dl) {
            let p = parent(idx);
            self.exchange(idx, p);
            idx = p;
        }
    }

    /// Single-direction fix after overwriting a key in place.
    fn change_key(&mut self, idx: usize, new_dl: Deadline, order: DlOrder) {
        let old = self.elements[idx].dl;
        self.elements[idx].dl = new_dl;
        if order.prefers(old, new_dl) {
            self.sift_down(idx, order);
        } else {
            self.bubble_up(idx, order);
        }
    }

    fn remove(&mut self, cpu: usize, idx: usize, order: DlOrder) {
        let last = self.size - 1;
        let moved = self.elements[last];
        self.elements[idx] = moved;
        self.size = last;
        self.cpu_to_idx[moved.cpu] = Some(idx);
        self.cpu_to_idx[cpu] = None;
        if idx < self.size {
            self.bubble_up(idx, order);
            self.sift_down(idx, order);
        }
    }

    fn save(&self, w: &mut dyn Write) -> io::Result<()> {
        writeln!(w, "Heap ({} elements):", self.size)?;
        write!(w, "[ ")?;
        for e in &self.elements[..self.size.min(self.elements.len())] {
            write!(w, "({}, {}) ", e.cpu, e.dl)?;
        }
        write!(w, "] Cpu_to_idx:")?;
        for idx in self.cpu_to_idx.iter() {
            match idx {
                Some(i) => write!(w, " {i}")?,
                None => write!(w, " -")?,
            }
        }
        writeln!(w)
    }
}

impl ArrayHeap {
    pub fn new(nproc: usize, order: DlOrder) -> ArrayHeap {
        ArrayHeap {
            order,
            inner: SpinLock::new(Inner {
                size: 0,
                elements: vec![
                    Element {
                        dl: Deadline::INVALID,
                        cpu: 0,
                    };
                    nproc
                ]
                .into_boxed_slice(),
                cpu_to_idx: vec![None; nproc].into_boxed_slice(),
            }),
        }
    }
}

impl DeadlineSummary for ArrayHeap {
    fn order(&self) -> DlOrder {
        self.order
    }

    fn set(&self, cpu: usize, dl: Deadline, valid: bool) {
        let mut h = self.inner.lock();
        let old_idx = h.cpu_to_idx[cpu];
        if !valid {
            // Withdraw only if present; an absent cpu is a no-op.
            if let Some(idx) = old_idx {
                h.remove(cpu, idx, self.order);
            }
            return;
        }
        match old_idx {
            Some(idx) => h.change_key(idx, dl, self.order),
            None => {
                let idx = h.size;
                h.size += 1;
                h.elements[idx] = Element { dl, cpu };
                h.cpu_to_idx[cpu] = Some(idx);
                h.bubble_up(idx, self.order);
            }
        }
    }

    fn find_best(&self) -> Option<usize> {
        let h = self.inner.lock();
        if h.size == 0 {
            None
        } else {
            Some(h.elements[0].cpu)
        }
    }

    fn check(&self) -> Result<(), CheckError> {
        let h = self.inner.lock();
        for cpu in 0..h.cpu_to_idx.len() {
            if let Some(idx) = h.cpu_to_idx[cpu] {
                if idx >= h.size || h.elements[idx].cpu != cpu {
                    return Err(CheckError::InverseMap {
                        cpu,
                        index: idx,
                        found: if idx < h.size {
                            h.elements[idx].cpu
                        } else {
                            usize::MAX
                        },
                    });
                }
            }
        }
        for i in 0..h.size {
            for child in [left(i), right(i)] {
                if child < h.size && self.order.prefers(h.elements[child].dl, h.elements[i].dl) {
                    return Err(CheckError::HeapOrder {
                        parent: i,
                        child,
                        parent_key: h.elements[i].dl.to_string(),
                        child_key: h.elements[child].dl.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn check_cpu(&self, cpu: usize, dl: Deadline) -> Result<(), CheckError> {
        let h = self.inner.lock();
        let found = h.cpu_to_idx[cpu].map(|idx| h.elements[idx].dl);
        let ok = if dl.is_valid() {
            found == Some(dl)
        } else {
            found.is_none()
        };
        if ok {
            Ok(())
        } else {
            Err(CheckError::SlotMismatch {
                cpu,
                found: found.map_or_else(|| "absent".into(), |d| d.to_string()),
                expected: if dl.is_valid() {
                    dl.to_string()
                } else {
                    "absent".into()
                },
            })
        }
    }

    fn save(&self, w: &mut dyn Write) -> io::Result<()> {
        let h = self.inner.lock();
        h.save(w)
    }

    fn dump_raw(&self, w: &mut dyn Write) -> io::Result<()> {
        let h = unsafe { &*self.inner.raw_ptr() };
        h.save(w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    fn filled(order: DlOrder) -> ArrayHeap {
        let h = ArrayHeap::new(4, order);
        for (cpu, dl) in [(0, 10), (1, 20), (2, 5), (3, 30)] {
            h.set(cpu, Deadline(dl), true);
        }
        h
    }

    #[test]
    fn push_view_finds_latest_pull_view_finds_earliest() {
        let push = filled(DlOrder::Latest);
        assert_eq!(push.find_best(), Some(3));
        let pull = filled(DlOrder::Earliest);
        assert_eq!(pull.find_best(), Some(2));
    }

    #[test]
    fn withdraw_reroutes_to_next_best() {
        let pull = filled(DlOrder::Earliest);
        pull.set(2, Deadline::INVALID, false);
        assert_eq!(pull.find_best(), Some(0));
        pull.check().unwrap();
    }

    #[test]
    fn update_in_place_moves_the_best() {
        let push = filled(DlOrder::Latest);
        push.set(1, Deadline(100), true);
        assert_eq!(push.find_best(), Some(1));
        push.check().unwrap();
    }

    #[test]
    fn set_then_withdraw_restores_size_and_invariants() {
        let h = filled(DlOrder::Latest);
        h.set(0, Deadline(99), true);
        h.set(0, Deadline::INVALID, false);
        h.check().unwrap();
        assert_eq!(h.inner.lock().size, 3);
        h.check_cpu(0, Deadline::INVALID).unwrap();
    }

    #[test]
    fn duplicate_set_keeps_one_entry_with_latest_key() {
        let h = ArrayHeap::new(2, DlOrder::Latest);
        h.set(0, Deadline(10), true);
        h.set(0, Deadline(10), true);
        assert_eq!(h.inner.lock().size, 1);
        h.set(0, Deadline(25), true);
        assert_eq!(h.inner.lock().size, 1);
        h.check_cpu(0, Deadline(25)).unwrap();
    }

    #[test]
    fn withdraw_absent_cpu_is_a_noop() {
        let h = ArrayHeap::new(4, DlOrder::Earliest);
        h.set(1, Deadline::INVALID, false);
        assert_eq!(h.find_best(), None);
        h.check().unwrap();
    }

    #[test]
    fn empty_heap_has_no_best() {
        let h = ArrayHeap::new(4, DlOrder::Latest);
        assert_eq!(h.find_best(), None);
    }

    #[test]
    fn concurrent_owners_keep_inverse_map_consistent() {
        let h = Arc::new(ArrayHeap::new(8, DlOrder::Earliest));
        let mut handles = vec![];
        for cpu in 0..8usize {
            let h = Arc::clone(&h);
            handles.push(thread::spawn(move || {
                for i in 0..2_000u64 {
                    let dl = (cpu as u64 * 131 + i * 17) % 1_000 + 1;
                    h.set(cpu, Deadline(dl), true);
                    if i % 7 == 0 {
                        h.set(cpu, Deadline::INVALID, false);
                    }
                    let _ = h.find_best();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        h.check().unwrap();
    }

    proptest! {
        #[test]
        fn random_op_sequences_preserve_invariants(
            ops in prop::collection::vec((0usize..6, 1u64..500, prop::bool::ANY), 0..200)
        ) {
            let h = ArrayHeap::new(6, DlOrder::Latest);
            let mut model: [Option<u64>; 6] = [None; 6];
            for (cpu, dl, valid) in ops {
                h.set(cpu, Deadline(dl), valid);
                model[cpu] = if valid { Some(dl) } else { None };
                prop_assert!(h.check().is_ok());
            }
            for cpu in 0..6 {
                let expected = model[cpu].map(Deadline).unwrap_or(Deadline::INVALID);
                prop_assert!(h.check_cpu(cpu, expected).is_ok());
            }
            let best = h.find_best();
            let model_best = model
                .iter()
                .enumerate()
                .filter_map(|(c, d)| d.map(|d| (c, d)))
                .max_by_key(|&(_, d)| d)
                .map(|(c, _)| c);
            match (best, model_best) {
                (None, None) => {}
                (Some(b), Some(_)) => {
                    let best_dl = model[b].unwrap();
                    prop_assert!(model.iter().flatten().all(|&d| d <= best_dl));
                }
                other => prop_assert!(false, "mismatch: {:?}", other),
            }
        }
    }
}
