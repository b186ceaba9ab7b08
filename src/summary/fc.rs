//! Flat-combining publication layer.
//!
//! Producers publish `set` operations into preallocated per-CPU records;
//! whichever thread wins the combining lock drains everything pending and
//! applies it to the wrapped structure. Producers never wait for their
//! operation to be applied (asynchronous flat combining), so the layer
//! only promises eventual consistency.
//!
//! Two interchangeable publication queues:
//! - [`LinkedPubList`]: a Treiber stack of records, CAS enqueue, combiner
//!   steals the whole stack with one CAS and reverses it.
//! - [`BitmapPubList`]: a 64-bit publisher-CPU bitmap plus a 32-bit
//!   record bitmap per CPU, drained via first-set-bit scans.
//!
//! Record payloads are atomics because the optimistic `find_best` scan
//! reads records that are concurrently being filled or drained.

use std::ptr;
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::deadline::Deadline;

/// One published `set(cpu, dl, valid)` payload.
pub struct SetOp {
    cpu: AtomicUsize,
    dl: AtomicU64,
    valid: AtomicBool,
}

impl SetOp {
    fn new() -> SetOp {
        SetOp {
            cpu: AtomicUsize::new(0),
            dl: AtomicU64::new(0),
            valid: AtomicBool::new(false),
        }
    }

    fn fill(&self, cpu: usize, dl: Deadline, valid: bool) {
        self.cpu.store(cpu, Ordering::Relaxed);
        self.dl.store(dl.0, Ordering::Relaxed);
        self.valid.store(valid, Ordering::Relaxed);
    }

    fn read(&self) -> (usize, Deadline, bool) {
        (
            self.cpu.load(Ordering::Relaxed),
            Deadline(self.dl.load(Ordering::Relaxed)),
            self.valid.load(Ordering::Relaxed),
        )
    }
}

/// Publication record for the linked flavor.
///
/// State machine: `free → active/!ready → active/ready → free`.
/// `active` is the producer→combiner signal, `ready` the combiner ack.
pub struct PubRecord {
    op: SetOp,
    active: AtomicBool,
    ready: AtomicBool,
    next: AtomicPtr<PubRecord>,
}

impl PubRecord {
    fn new() -> PubRecord {
        PubRecord {
            op: SetOp::new(),
            active: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// Publication queue behaviour shared by the two flavors.
pub trait PubQueue: Send + Sync {
    /// Publish one operation for `cpu`. Spins through `try_combine`
    /// while the CPU's record ring is exhausted.
    fn publish(&self, cpu: usize, dl: Deadline, valid: bool, try_combine: &mut dyn FnMut());

    /// Drain every pending record through `exec`. Caller must hold the
    /// combining lock.
    fn drain(&self, exec: &mut dyn FnMut(usize, Deadline, bool));

    /// Visit records published but not yet drained. Best-effort; may
    /// race with a combiner.
    fn scan_pending(&self, visit: &mut dyn FnMut(usize, Deadline, bool));
}

/// Treiber-stack publication list with a per-CPU record ring.
pub struct LinkedPubList {
    records: Box<[PubRecord]>,
    ring_idx: Box<[AtomicUsize]>,
    head: AtomicPtr<PubRecord>,
    per_cpu: usize,
}

impl LinkedPubList {
    pub fn new(nproc: usize, per_cpu: usize) -> LinkedPubList {
        LinkedPubList {
            records: (0..nproc * per_cpu).map(|_| PubRecord::new()).collect(),
            ring_idx: (0..nproc).map(|_| AtomicUsize::new(0)).collect(),
            head: AtomicPtr::new(ptr::null_mut()),
            per_cpu,
        }
    }

    fn acquire_record(&self, cpu: usize, try_combine: &mut dyn FnMut()) -> &PubRecord {
        let base = cpu * self.per_cpu;
        loop {
            let idx = self.ring_idx[cpu].load(Ordering::Relaxed);
            let rec = &self.records[base + idx];
            if !rec.active.load(Ordering::Acquire) {
                rec.active.store(true, Ordering::Release);
                self.ring_idx[cpu].store((idx + 1) % self.per_cpu, Ordering::Relaxed);
                return rec;
            }
            // Every record in flight: help drain until one frees up.
            try_combine();
        }
    }
}

impl PubQueue for LinkedPubList {
    fn publish(&self, cpu: usize, dl: Deadline, valid: bool, try_combine: &mut dyn FnMut()) {
        let rec = self.acquire_record(cpu, try_combine);
        rec.op.fill(cpu, dl, valid);
        rec.ready.store(false, Ordering::Release);

        let rec_ptr = rec as *const PubRecord as *mut PubRecord;
        let mut head = self.head.load(Ordering::SeqCst);
        loop {
            rec.next.store(head, Ordering::SeqCst);
            match self
                .head
                .compare_exchange(head, rec_ptr, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(h) => head = h,
            }
        }
    }

    fn drain(&self, exec: &mut dyn FnMut(usize, Deadline, bool)) {
        let mut head = self.head.load(Ordering::SeqCst);
        let stolen = loop {
            if head.is_null() {
                return;
            }
            match self
                .head
                .compare_exchange(head, ptr::null_mut(), Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break head,
                Err(h) => head = h,
            }
        };
        fence(Ordering::SeqCst);

        // Reverse the stolen stack so operations apply in publish order.
        let mut rev: *mut PubRecord = ptr::null_mut();
        let mut cur = stolen;
        while !cur.is_null() {
            let rec = unsafe { &*cur };
            let nxt = rec.next.load(Ordering::SeqCst);
            rec.next.store(rev, Ordering::SeqCst);
            rev = cur;
            cur = nxt;
        }

        let mut cur = rev;
        while !cur.is_null() {
            let rec = unsafe { &*cur };
            // Read the successor before releasing the record: a producer
            // may reuse it the moment `active` clears.
            let nxt = rec.next.load(Ordering::SeqCst);
            let (cpu, dl, valid) = rec.op.read();
            exec(cpu, dl, valid);
            rec.ready.store(true, Ordering::Release);
            rec.active.store(false, Ordering::Release);
            cur = nxt;
        }
    }

    fn scan_pending(&self, visit: &mut dyn FnMut(usize, Deadline, bool)) {
        // The combiner may be reversing the chain under us, so the walk
        // is bounded by the total record count.
        let mut cur = self.head.load(Ordering::SeqCst);
        let mut hops = 0;
        while !cur.is_null() && hops < self.records.len() {
            let rec = unsafe { &*cur };
            if rec.active.load(Ordering::Acquire) && !rec.ready.load(Ordering::Acquire) {
                let (cpu, dl, valid) = rec.op.read();
                visit(cpu, dl, valid);
            }
            cur = rec.next.load(Ordering::SeqCst);
            hops += 1;
        }
    }
}

/// Bitmap-indexed publication array.
///
/// `cpu_bitmap` bit c says "CPU c has pending records"; `rec_bitmap[c]`
/// bit i says "record i of CPU c is pending". At most 32 records per CPU
/// and 64 CPUs.
pub struct BitmapPubList {
    cpu_bitmap: AtomicU64,
    rec_bitmap: Box<[AtomicU32]>,
    records: Box<[SetOp]>,
    last_used: Box<[AtomicUsize]>,
    per_cpu: usize,
}

impl BitmapPubList {
    pub fn new(nproc: usize, per_cpu: usize) -> BitmapPubList {
        assert!(nproc <= 64, "bitmap flavor handles at most 64 cpus");
        assert!(per_cpu <= 32, "at most 32 records per cpu");
        BitmapPubList {
            cpu_bitmap: AtomicU64::new(0),
            rec_bitmap: (0..nproc).map(|_| AtomicU32::new(0)).collect(),
            records: (0..nproc * per_cpu).map(|_| SetOp::new()).collect(),
            last_used: (0..nproc).map(|_| AtomicUsize::new(0)).collect(),
            per_cpu,
        }
    }
}

impl PubQueue for BitmapPubList {
    fn publish(&self, cpu: usize, dl: Deadline, valid: bool, try_combine: &mut dyn FnMut()) {
        loop {
            let idx = self.last_used[cpu].load(Ordering::Relaxed);
            let bit = 1u32 << idx;
            if self.rec_bitmap[cpu].load(Ordering::Acquire) & bit == 0 {
                self.records[cpu * self.per_cpu + idx].fill(cpu, dl, valid);
                self.last_used[cpu].store((idx + 1) % self.per_cpu, Ordering::Relaxed);
                self.rec_bitmap[cpu].fetch_or(bit, Ordering::Release);
                self.cpu_bitmap.fetch_or(1u64 << cpu, Ordering::Release);
                return;
            }
            // Ring exhausted: flag the CPU and help drain.
            self.cpu_bitmap.fetch_or(1u64 << cpu, Ordering::SeqCst);
            try_combine();
        }
    }

    fn drain(&self, exec: &mut dyn FnMut(usize, Deadline, bool)) {
        loop {
            let cpus = self.cpu_bitmap.load(Ordering::Acquire);
            if cpus == 0 {
                return;
            }
            let cpu = cpus.trailing_zeros() as usize;
            loop {
                let recs = self.rec_bitmap[cpu].load(Ordering::Acquire);
                if recs == 0 {
                    break;
                }
                let i = recs.trailing_zeros() as usize;
                let (op_cpu, dl, valid) = self.records[cpu * self.per_cpu + i].read();
                exec(op_cpu, dl, valid);
                self.rec_bitmap[cpu].fetch_and(!(1u32 << i), Ordering::Release);
            }
            self.cpu_bitmap.fetch_and(!(1u64 << cpu), Ordering::AcqRel);
            // A record published right as we cleared the CPU bit must not
            // strand until the next publish from that CPU.
            if self.rec_bitmap[cpu].load(Ordering::Acquire) != 0 {
                self.cpu_bitmap.fetch_or(1u64 << cpu, Ordering::Release);
            }
        }
    }

    fn scan_pending(&self, visit: &mut dyn FnMut(usize, Deadline, bool)) {
        for cpu in 0..self.rec_bitmap.len() {
            let mut bits = self.rec_bitmap[cpu].load(Ordering::Acquire);
            while bits != 0 {
                let i = bits.trailing_zeros() as usize;
                bits &= !(1u32 << i);
                let (op_cpu, dl, valid) = self.records[cpu * self.per_cpu + i].read();
                visit(op_cpu, dl, valid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn collect_drain(q: &dyn PubQueue) -> Vec<(usize, u64, bool)> {
        let mut out = Vec::new();
        q.drain(&mut |cpu, dl, valid| out.push((cpu, dl.0, valid)));
        out
    }

    #[test]
    fn linked_drain_applies_in_publish_order() {
        let q = LinkedPubList::new(2, 4);
        let mut noop = || {};
        q.publish(0, Deadline(10), true, &mut noop);
        q.publish(0, Deadline(20), true, &mut noop);
        q.publish(1, Deadline(30), false, &mut noop);
        assert_eq!(
            collect_drain(&q),
            vec![(0, 10, true), (0, 20, true), (1, 30, false)]
        );
        assert!(collect_drain(&q).is_empty());
    }

    #[test]
    fn linked_records_recycle_after_drain() {
        let q = LinkedPubList::new(1, 2);
        let mut combines = 0;
        for round in 0..5u64 {
            q.publish(0, Deadline(round + 1), true, &mut || combines += 1);
            q.publish(0, Deadline(round + 2), true, &mut || combines += 1);
            let drained = collect_drain(&q);
            assert_eq!(drained.len(), 2);
        }
        assert_eq!(combines, 0);
    }

    #[test]
    fn linked_scan_sees_only_pending_records() {
        let q = LinkedPubList::new(2, 4);
        let mut noop = || {};
        q.publish(0, Deadline(5), true, &mut noop);
        q.publish(1, Deadline(9), true, &mut noop);
        let mut seen = Vec::new();
        q.scan_pending(&mut |cpu, dl, _| seen.push((cpu, dl.0)));
        seen.sort_unstable();
        assert_eq!(seen, vec![(0, 5), (1, 9)]);
        let _ = collect_drain(&q);
        let mut seen = Vec::new();
        q.scan_pending(&mut |cpu, dl, _| seen.push((cpu, dl.0)));
        assert!(seen.is_empty());
    }

    #[test]
    fn bitmap_drain_clears_all_bits() {
        let q = BitmapPubList::new(4, 8);
        let mut noop = || {};
        q.publish(0, Deadline(10), true, &mut noop);
        q.publish(3, Deadline(40), true, &mut noop);
        q.publish(3, Deadline(41), false, &mut noop);
        let mut drained = collect_drain(&q);
        drained.sort_unstable();
        assert_eq!(drained, vec![(0, 10, true), (3, 40, true), (3, 41, false)]);
        assert_eq!(q.cpu_bitmap.load(Ordering::Relaxed), 0);
        assert!(q.rec_bitmap.iter().all(|b| b.load(Ordering::Relaxed) == 0));
    }

    #[test]
    fn bitmap_exhausted_ring_forces_a_combine() {
        let q = Arc::new(BitmapPubList::new(1, 2));
        q.publish(0, Deadline(1), true, &mut || {});
        q.publish(0, Deadline(2), true, &mut || {});
        let helper = Arc::clone(&q);
        let mut combined = Vec::new();
        q.publish(0, Deadline(3), true, &mut || {
            helper.drain(&mut |_, dl, _| combined.push(dl.0));
        });
        assert_eq!(combined, vec![1, 2]);
        let rest = collect_drain(&*q);
        assert_eq!(rest, vec![(0, 3, true)]);
    }

    #[test]
    fn concurrent_publishers_never_lose_records() {
        let q = Arc::new(LinkedPubList::new(4, 8));
        let total = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for cpu in 0..4usize {
            let q = Arc::clone(&q);
            let total = Arc::clone(&total);
            handles.push(thread::spawn(move || {
                for i in 0..1_000u64 {
                    let q2 = Arc::clone(&q);
                    let total2 = Arc::clone(&total);
                    q.publish(cpu, Deadline(i + 1), true, &mut || {
                        q2.drain(&mut |_, _, _| {
                            total2.fetch_add(1, Ordering::Relaxed);
                        });
                    });
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        q.drain(&mut |_, _, _| {
            total.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(total.load(Ordering::Relaxed), 4_000);
    }
}
