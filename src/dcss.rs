//! Double-compare-single-swap.
//!
//! `dcss(addr1, expected1, addr2, old2, new2)` atomically checks that
//! `*addr1 == expected1` and `*addr2 == old2`, and only then stores `new2`
//! at `*addr2`. On failure it reports which of the two checks failed.
//!
//! The primitive exists for one race: an inserter decides "no rebuild in
//! progress" by reading a null successor pointer and then wants to CAS a
//! node into a bucket of the old table. A rebuild may publish the successor
//! and start moving nodes in between. DCSS folds both checks into one
//! atomic step; on [`DcssResult::FailedAddr1`] the inserter re-routes to the
//! successor table.
//!
//! ## Protocol
//!
//! Each thread owns one preallocated, cache-line-aligned descriptor. An
//! operation writes its five operands into the descriptor, bumps the
//! descriptor's sequence number, and CASes a *tagged descriptor pointer*
//! (low bit set, tid and sequence packed into the remaining bits) into
//! `*addr2`. Any thread that observes the tag in a cell helps the operation
//! to completion before proceeding; the sequence number lets helpers detect
//! stale snapshots and abort. Steady-state cell words therefore keep bit 0
//! clear, which is why the lists built on this module store their words in
//! shifted "value form" (see [`crate::tag::to_value`]).
//!
//! Cells a descriptor refers to must stay mapped while the descriptor can
//! still be observed. Helping only ever happens from inside a read-side
//! critical section of the owning table, and the cells (bucket heads, node
//! next words, the successor pointer) are reclaimed only after a grace
//! period, so a helper never touches freed memory.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Bit 0 of a cell word marks a published descriptor pointer.
pub const DESCRIPTOR_TAG: usize = 1;

const STATE_UNDECIDED: usize = 0;
const STATE_SUCCEEDED: usize = 4;
const STATE_FAILED: usize = 8;
const STATE_MASK: usize = 0xf;

const TID_OFFSET: u32 = 3;
const SEQ_OFFSET: u32 = 14;
const TID_MASK: usize = ((1 << SEQ_OFFSET) - 1) & !((1 << TID_OFFSET) - 1);
const SEQ_MASK: usize = !0 << SEQ_OFFSET;

/// Maximum number of thread ids the tid field can encode.
pub const MAX_THREADS: usize = 1 << (SEQ_OFFSET - TID_OFFSET);

/// Outcome of a DCSS operation.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DcssResult {
    /// Both checks passed; `new2` is stored at `addr2`.
    Success,
    /// `*addr1` did not match; the observed value is carried.
    FailedAddr1(usize),
    /// `*addr2` did not match; the observed word is carried.
    FailedAddr2(usize),
}

/// Per-thread operation record.
///
/// Every field is atomic: helpers read them racily and rely on the sequence
/// number in `mutables` to reject torn snapshots. The alignment keeps
/// descriptors of different threads off each other's cache lines.
#[repr(align(128))]
struct Descriptor {
    /// Operation state (low bits) and sequence number (high bits).
    ///
    /// An odd sequence number means the descriptor is published; an even
    /// one means it is being (re)written and must be ignored.
    mutables: AtomicUsize,
    addr1: AtomicUsize,
    old1: AtomicUsize,
    addr2: AtomicUsize,
    old2: AtomicUsize,
    new2: AtomicUsize,
}

impl Descriptor {
    fn new() -> Descriptor {
        Descriptor {
            mutables: AtomicUsize::new(0),
            addr1: AtomicUsize::new(0),
            old1: AtomicUsize::new(0),
            addr2: AtomicUsize::new(0),
            old2: AtomicUsize::new(0),
            new2: AtomicUsize::new(0),
        }
    }
}

/// A validated copy of a descriptor's operands.
struct Snapshot {
    mutables: usize,
    addr1: *const AtomicUsize,
    old1: usize,
    addr2: *const AtomicUsize,
    old2: usize,
    new2: usize,
}

/// The DCSS provider: one descriptor per participating thread.
pub struct Dcss {
    descriptors: Box<[Descriptor]>,
}

unsafe impl Send for Dcss {}
unsafe impl Sync for Dcss {}

impl Dcss {
    /// Create a provider with capacity for `nthreads` dense thread ids.
    pub fn new(nthreads: usize) -> Dcss {
        assert!(nthreads <= MAX_THREADS, "thread id does not fit the tag");

        Dcss {
            descriptors: (0..nthreads).map(|_| Descriptor::new()).collect(),
        }
    }

    /// DCSS on a value-form cell.
    ///
    /// `old2`/`new2` are given in plain form and shifted into value form
    /// here; `addr1` is compared raw.
    pub fn dcss_value(
        &self,
        tid: usize,
        addr1: &AtomicUsize,
        expected1: usize,
        addr2: &AtomicUsize,
        old2: usize,
        new2: usize,
    ) -> DcssResult {
        self.dcss_word(tid, addr1, expected1, addr2, old2 << 1, new2 << 1)
    }

    /// DCSS on a raw cell word.
    pub fn dcss_word(
        &self,
        tid: usize,
        addr1: &AtomicUsize,
        expected1: usize,
        addr2: &AtomicUsize,
        old2: usize,
        new2: usize,
    ) -> DcssResult {
        debug_assert_eq!(old2 & DESCRIPTOR_TAG, 0, "old2 collides with the tag");
        debug_assert_eq!(new2 & DESCRIPTOR_TAG, 0, "new2 collides with the tag");

        let desc = &self.descriptors[tid];

        // Invalidate the descriptor (even sequence) while rewriting it.
        let seq = (desc.mutables.load(Ordering::Relaxed) & SEQ_MASK) >> SEQ_OFFSET;
        let writing = (seq | 1) + 1;
        desc.mutables
            .store((writing << SEQ_OFFSET) | STATE_UNDECIDED, Ordering::SeqCst);

        desc.addr1
            .store(addr1 as *const AtomicUsize as usize, Ordering::SeqCst);
        desc.old1.store(expected1, Ordering::SeqCst);
        desc.addr2
            .store(addr2 as *const AtomicUsize as usize, Ordering::SeqCst);
        desc.old2.store(old2, Ordering::SeqCst);
        desc.new2.store(new2, Ordering::SeqCst);

        // Publish (odd sequence).
        let mutables = ((writing + 1) << SEQ_OFFSET) | STATE_UNDECIDED;
        desc.mutables.store(mutables, Ordering::SeqCst);

        let tagptr = (mutables & SEQ_MASK) | (tid << TID_OFFSET) | DESCRIPTOR_TAG;

        // Install the descriptor at addr2, helping whoever is in the way.
        loop {
            match addr2.compare_exchange(old2, tagptr, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => break,
                Err(observed) if observed & DESCRIPTOR_TAG != 0 => {
                    self.help_other(observed);
                }
                Err(observed) => return DcssResult::FailedAddr2(observed),
            }
        }

        let snapshot = Snapshot {
            mutables,
            addr1,
            old1: expected1,
            addr2,
            old2,
            new2,
        };
        // Finishing our own operation cannot observe a stale sequence.
        self.help(tagptr, &snapshot, false)
            .expect("own descriptor invalidated mid-operation")
    }

    /// Read a cell word, helping any published descriptor out of the way.
    pub fn read_word(&self, addr: &AtomicUsize) -> usize {
        loop {
            let word = addr.load(Ordering::SeqCst);
            if word & DESCRIPTOR_TAG == 0 {
                return word;
            }
            self.help_other(word);
        }
    }

    /// Read a value-form cell as a plain word.
    pub fn read_value(&self, addr: &AtomicUsize) -> usize {
        self.read_word(addr) >> 1
    }

    /// Finish the operation described by `tagptr`.
    ///
    /// Returns `None` when the snapshot went stale (the owner moved on), in
    /// which case the cell no longer holds `tagptr` either.
    fn help(&self, tagptr: usize, snapshot: &Snapshot, helping_other: bool) -> Option<DcssResult> {
        // Decide the outcome from the gating cell.
        let val1 = unsafe { (*snapshot.addr1).load(Ordering::SeqCst) };
        let decided = if val1 == snapshot.old1 {
            STATE_SUCCEEDED
        } else {
            STATE_FAILED
        };

        let desc = &self.descriptors[unpack_tid(tagptr)];
        let state = self.commit_state(desc, snapshot.mutables, decided)?;

        if state == STATE_SUCCEEDED {
            debug_assert!(helping_other || decided == STATE_SUCCEEDED);
            let _ = unsafe {
                (*snapshot.addr2).compare_exchange(
                    tagptr,
                    snapshot.new2,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
            };
            Some(DcssResult::Success)
        } else {
            debug_assert!(helping_other || decided == STATE_FAILED);
            let _ = unsafe {
                (*snapshot.addr2).compare_exchange(
                    tagptr,
                    snapshot.old2,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
            };
            Some(DcssResult::FailedAddr1(val1))
        }
    }

    /// Move the descriptor's state from undecided to `decided`.
    ///
    /// Concurrent helpers may race on this; the first one wins and everyone
    /// returns the winning state. `None` means the sequence number moved and
    /// the snapshot must be discarded.
    fn commit_state(&self, desc: &Descriptor, snap_mutables: usize, decided: usize) -> Option<usize> {
        let mut current = desc.mutables.load(Ordering::SeqCst);
        loop {
            if current & SEQ_MASK != snap_mutables & SEQ_MASK {
                return None;
            }
            let old_word = (current & !STATE_MASK) | STATE_UNDECIDED;
            let new_word = (current & !STATE_MASK) | decided;
            match desc
                .mutables
                .compare_exchange(old_word, new_word, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Some(decided),
                Err(observed) => {
                    let state = observed & STATE_MASK;
                    if state != STATE_UNDECIDED && observed & SEQ_MASK == snap_mutables & SEQ_MASK {
                        // Another helper decided first.
                        return Some(state);
                    }
                    current = observed;
                }
            }
        }
    }

    /// Help the operation another thread published at some cell.
    fn help_other(&self, tagptr: usize) {
        debug_assert!(tagptr & DESCRIPTOR_TAG != 0);
        if let Some(snapshot) = self.snapshot(tagptr) {
            let _ = self.help(tagptr, &snapshot, true);
        }
    }

    /// Copy the operands of the descriptor `tagptr` names.
    ///
    /// The copy is only returned if the sequence number matched before and
    /// after, so the fields are a consistent picture of one operation.
    fn snapshot(&self, tagptr: usize) -> Option<Snapshot> {
        let desc = &self.descriptors[unpack_tid(tagptr)];

        let mutables = desc.mutables.load(Ordering::SeqCst);
        if mutables & SEQ_MASK != tagptr & SEQ_MASK {
            return None;
        }
        let snapshot = Snapshot {
            mutables,
            addr1: desc.addr1.load(Ordering::SeqCst) as *const AtomicUsize,
            old1: desc.old1.load(Ordering::SeqCst),
            addr2: desc.addr2.load(Ordering::SeqCst) as *const AtomicUsize,
            old2: desc.old2.load(Ordering::SeqCst),
            new2: desc.new2.load(Ordering::SeqCst),
        };
        if desc.mutables.load(Ordering::SeqCst) & SEQ_MASK != tagptr & SEQ_MASK {
            return None;
        }
        Some(snapshot)
    }
}

fn unpack_tid(tagptr: usize) -> usize {
    (tagptr & TID_MASK) >> TID_OFFSET
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn success_when_both_match() {
        let dcss = Dcss::new(1);
        let gate = AtomicUsize::new(0);
        let cell = AtomicUsize::new(10 << 1);

        let r = dcss.dcss_value(0, &gate, 0, &cell, 10, 20);
        assert_eq!(r, DcssResult::Success);
        assert_eq!(dcss.read_value(&cell), 20);
    }

    #[test]
    fn failed_addr1_leaves_cell_untouched() {
        let dcss = Dcss::new(1);
        let gate = AtomicUsize::new(7);
        let cell = AtomicUsize::new(10 << 1);

        let r = dcss.dcss_value(0, &gate, 0, &cell, 10, 20);
        assert_eq!(r, DcssResult::FailedAddr1(7));
        assert_eq!(dcss.read_value(&cell), 10);
    }

    #[test]
    fn failed_addr2_reports_observed_word() {
        let dcss = Dcss::new(1);
        let gate = AtomicUsize::new(0);
        let cell = AtomicUsize::new(11 << 1);

        let r = dcss.dcss_value(0, &gate, 0, &cell, 10, 20);
        assert_eq!(r, DcssResult::FailedAddr2(11 << 1));
        assert_eq!(dcss.read_value(&cell), 11);
    }

    #[test]
    fn descriptor_reuse_across_operations() {
        let dcss = Dcss::new(1);
        let gate = AtomicUsize::new(0);
        let cell = AtomicUsize::new(0);

        for i in 0..1000 {
            let r = dcss.dcss_value(0, &gate, 0, &cell, i, i + 1);
            assert_eq!(r, DcssResult::Success);
        }
        assert_eq!(dcss.read_value(&cell), 1000);
    }

    #[test]
    fn contended_counter_is_exact() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 10_000;

        let dcss = Arc::new(Dcss::new(THREADS));
        let gate = Arc::new(AtomicUsize::new(0));
        let cell = Arc::new(AtomicUsize::new(0));

        let mut joins = Vec::new();
        for tid in 0..THREADS {
            let dcss = dcss.clone();
            let gate = gate.clone();
            let cell = cell.clone();
            joins.push(thread::spawn(move || {
                for _ in 0..PER_THREAD {
                    loop {
                        let cur = dcss.read_value(&cell);
                        match dcss.dcss_value(tid, &gate, 0, &cell, cur, cur + 1) {
                            DcssResult::Success => break,
                            DcssResult::FailedAddr2(_) => continue,
                            DcssResult::FailedAddr1(_) => unreachable!("gate never changes"),
                        }
                    }
                }
            }));
        }
        for j in joins {
            j.join().unwrap();
        }

        assert_eq!(dcss.read_value(&cell), THREADS * PER_THREAD);
    }

    #[test]
    fn gate_flip_kills_pending_inserts() {
        // One thread repeatedly tries the conditional store, another flips
        // the gate; after the flip every attempt must fail on addr1.
        let dcss = Arc::new(Dcss::new(2));
        let gate = Arc::new(AtomicUsize::new(0));
        let cell = Arc::new(AtomicUsize::new(0));

        let flipper = {
            let gate = gate.clone();
            thread::spawn(move || {
                thread::yield_now();
                gate.store(1, Ordering::SeqCst);
            })
        };

        let mut successes_after_flip = 0;
        let mut after_flip_failures = 0;
        for _ in 0..100_000 {
            let flipped = gate.load(Ordering::SeqCst) == 1;
            let cur = dcss.read_value(&cell);
            match dcss.dcss_value(0, &gate, 0, &cell, cur, cur + 1) {
                DcssResult::Success => {
                    // The gate was observed flipped before the attempt, yet
                    // the attempt succeeded: that is the race DCSS closes.
                    if flipped {
                        successes_after_flip += 1;
                    }
                }
                DcssResult::FailedAddr1(v) => {
                    assert_eq!(v, 1);
                    after_flip_failures += 1;
                }
                DcssResult::FailedAddr2(_) => {}
            }
            if after_flip_failures > 10 {
                break;
            }
        }
        flipper.join().unwrap();
        assert_eq!(successes_after_flip, 0);
        assert!(after_flip_failures > 0);
    }
}
