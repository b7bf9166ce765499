//! The reclamation service.
//!
//! Every bucket engine in this crate physically unlinks nodes while
//! concurrent readers may still be traversing them. This module decides when
//! such a node may actually be destroyed: first when every read-side
//! critical section that could have reached it has ended.
//!
//! The service is deliberately small:
//!
//! - [`Rcu::read`] opens a read-side critical section (a [`ReadGuard`]).
//!   Sections nest and never block.
//! - [`Rcu::synchronize`] waits for a grace period: every section that
//!   started before the call has ended when it returns.
//! - [`Rcu::defer`] queues a [`Garbage`] item for destruction after a later
//!   grace period covers it.
//!
//! Readers are registered by dense thread id. Each id owns one padded slot
//! holding the epoch it entered its current outermost section at, or zero
//! when quiescent. A grace period bumps the global epoch and then waits for
//! every slot to be quiescent or to carry the new epoch.
//!
//! There is no free-standing global state here: each table owns its own
//! `Rcu`, so several tables coexist in one process without sharing
//! reclamation traffic.

mod garbage;

pub use self::garbage::Garbage;

use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::thread;

use parking_lot::Mutex;

/// Probability of attempting a collection on `defer`, out of `usize::MAX`.
const COLLECT_PROBABILITY: usize = usize::MAX / 128;

/// Queue length past which `defer` collects unconditionally.
const COLLECT_THRESHOLD: usize = 64;

/// A reader slot.
///
/// `ctr` is zero while the owning thread is quiescent; otherwise it holds
/// the (even) global epoch at section entry with the low bit set. `nesting`
/// is only ever touched by the owning thread.
#[repr(align(128))]
struct ReaderSlot {
    ctr: AtomicUsize,
    nesting: AtomicUsize,
}

impl ReaderSlot {
    fn new() -> ReaderSlot {
        ReaderSlot {
            ctr: AtomicUsize::new(0),
            nesting: AtomicUsize::new(0),
        }
    }
}

/// Deferred garbage, stamped with the epoch it was queued at.
struct Garbo {
    deferred: Vec<(usize, Garbage)>,
}

/// The reclamation service for one table.
pub struct Rcu {
    /// One slot per registered thread id.
    readers: Box<[ReaderSlot]>,
    /// The global epoch. Always even, never zero.
    epoch: AtomicUsize,
    /// The newest epoch for which a grace period has fully elapsed.
    completed: AtomicUsize,
    /// Serializes grace periods.
    ///
    /// Never held while waiting on `garbo`: a reader inside its critical
    /// section must always be able to queue garbage, or `synchronize` would
    /// deadlock against the very sections it waits for.
    sync_lock: Mutex<()>,
    /// The garbage queue. Held only for pushes and drains.
    garbo: Mutex<Garbo>,
}

impl Rcu {
    /// Create a service with capacity for `nthreads` dense thread ids.
    pub fn new(nthreads: usize) -> Rcu {
        Rcu {
            readers: (0..nthreads).map(|_| ReaderSlot::new()).collect(),
            epoch: AtomicUsize::new(2),
            completed: AtomicUsize::new(0),
            sync_lock: Mutex::new(()),
            garbo: Mutex::new(Garbo {
                deferred: Vec::new(),
            }),
        }
    }

    /// The number of registered thread ids.
    pub fn capacity(&self) -> usize {
        self.readers.len()
    }

    /// Open a read-side critical section for thread `tid`.
    ///
    /// Sections nest; the section ends when the outermost guard drops. No
    /// node physically unlinked during the section is destroyed before the
    /// section ends.
    pub fn read(&self, tid: usize) -> ReadGuard<'_> {
        let slot = &self.readers[tid];
        let nesting = slot.nesting.load(Ordering::Relaxed);
        if nesting == 0 {
            // Publish the entry epoch. The SeqCst store orders the
            // publication before any traversal load inside the section, so a
            // concurrent grace period either sees this slot active or the
            // section sees everything that happened before the grace period
            // began.
            slot.ctr
                .store(self.epoch.load(Ordering::SeqCst) | 1, Ordering::SeqCst);
            fence(Ordering::SeqCst);
        }
        slot.nesting.store(nesting + 1, Ordering::Relaxed);

        ReadGuard { rcu: self, tid }
    }

    /// Whether thread `tid` is currently inside a read section.
    pub fn in_read_section(&self, tid: usize) -> bool {
        self.readers[tid].nesting.load(Ordering::Relaxed) != 0
    }

    /// Wait for a grace period.
    ///
    /// When this returns, every read section that started before the call
    /// has ended. The calling thread must not be inside a read section
    /// itself.
    pub fn synchronize(&self, tid: usize) {
        debug_assert!(
            !self.in_read_section(tid),
            "synchronize called inside a read section"
        );

        let _sync = self.sync_lock.lock();

        // Move to a new epoch. Readers entering after this point stamp the
        // new value and need not be waited for.
        let new = self.epoch.fetch_add(2, Ordering::SeqCst) + 2;
        fence(Ordering::SeqCst);

        for slot in self.readers.iter() {
            let mut spins = 0u32;
            loop {
                let v = slot.ctr.load(Ordering::SeqCst);
                if v == 0 || (v & !1) >= new {
                    break;
                }
                spins += 1;
                if spins < 128 {
                    std::hint::spin_loop();
                } else {
                    thread::yield_now();
                }
            }
        }

        self.completed.store(new, Ordering::SeqCst);
        drop(_sync);

        self.collect();
    }

    /// Queue garbage for destruction after a future grace period.
    ///
    /// Safe to call from inside a read section; the item will survive at
    /// least until every section active at the call has ended.
    pub fn defer(&self, garbage: Garbage) {
        let over_threshold = {
            let mut garbo = self.garbo.lock();
            let stamp = self.epoch.load(Ordering::SeqCst);
            garbo.deferred.push((stamp, garbage));
            garbo.deferred.len() >= COLLECT_THRESHOLD
        };

        // Tick: collection is amortized over defers, so no one thread pays
        // for the whole backlog.
        if over_threshold || rand::random::<usize>() < COLLECT_PROBABILITY {
            self.try_collect();
        }
    }

    /// Destroy every queued item already covered by a finished grace period.
    ///
    /// This never waits for readers; items not yet covered stay queued.
    pub fn collect(&self) {
        let garbo = self.garbo.lock();
        self.drain_covered(garbo);
    }

    /// Like `collect`, but does nothing if another thread holds the queue.
    pub fn try_collect(&self) {
        if let Some(garbo) = self.garbo.try_lock() {
            self.drain_covered(garbo);
        }
    }

    fn drain_covered(&self, mut garbo: parking_lot::MutexGuard<'_, Garbo>) {
        let completed = self.completed.load(Ordering::SeqCst);
        let mut reclaim = Vec::new();
        let mut i = 0;
        while i < garbo.deferred.len() {
            if garbo.deferred[i].0 < completed {
                let (_, g) = garbo.deferred.swap_remove(i);
                reclaim.push(g);
            } else {
                i += 1;
            }
        }
        drop(garbo);

        if !reclaim.is_empty() {
            log::trace!("reclaiming {} deferred nodes", reclaim.len());
        }
        // Destructors run outside the queue lock.
        drop(reclaim);
    }

    /// Wait for a grace period and destroy everything covered by it.
    pub fn gc(&self, tid: usize) {
        self.synchronize(tid);
    }
}

impl Drop for Rcu {
    fn drop(&mut self) {
        // No guard can outlive the service (guards borrow it), so every
        // queued item is unreachable by now.
        let garbo = self.garbo.get_mut();
        for (_, g) in garbo.deferred.drain(..) {
            drop(g);
        }
    }
}

/// A read-side critical section.
///
/// While any guard for a thread is alive, nothing that thread could reach
/// through the table is destroyed.
#[must_use = "a read section only protects while the guard is alive"]
pub struct ReadGuard<'a> {
    rcu: &'a Rcu,
    tid: usize,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let slot = &self.rcu.readers[self.tid];
        let nesting = slot.nesting.load(Ordering::Relaxed);
        debug_assert!(nesting > 0, "unbalanced read section");
        slot.nesting.store(nesting - 1, Ordering::Relaxed);
        if nesting == 1 {
            slot.ctr.store(0, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn read_sections_nest() {
        let rcu = Rcu::new(1);
        let a = rcu.read(0);
        let b = rcu.read(0);
        assert!(rcu.in_read_section(0));
        drop(b);
        assert!(rcu.in_read_section(0));
        drop(a);
        assert!(!rcu.in_read_section(0));
    }

    #[test]
    fn synchronize_with_no_readers_returns() {
        let rcu = Rcu::new(4);
        rcu.synchronize(0);
        rcu.synchronize(0);
    }

    #[test]
    fn defer_runs_after_grace_period() {
        struct Flagged(Arc<AtomicUsize>);
        impl Drop for Flagged {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let rcu = Rcu::new(1);
        let drops = Arc::new(AtomicUsize::new(0));
        let item = Box::into_raw(Box::new(Flagged(drops.clone())));
        rcu.defer(unsafe { Garbage::new_box(item) });

        // Not covered yet.
        rcu.collect();
        assert_eq!(drops.load(Ordering::Relaxed), 0);

        rcu.synchronize(0);
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn synchronize_waits_for_active_reader() {
        let rcu = Arc::new(Rcu::new(2));
        let entered = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let synced = Arc::new(AtomicBool::new(false));

        let reader = {
            let rcu = rcu.clone();
            let entered = entered.clone();
            let release = release.clone();
            thread::spawn(move || {
                let guard = rcu.read(0);
                entered.store(true, Ordering::SeqCst);
                while !release.load(Ordering::SeqCst) {
                    thread::yield_now();
                }
                drop(guard);
            })
        };

        while !entered.load(Ordering::SeqCst) {
            thread::yield_now();
        }

        let writer = {
            let rcu = rcu.clone();
            let synced = synced.clone();
            thread::spawn(move || {
                rcu.synchronize(1);
                synced.store(true, Ordering::SeqCst);
            })
        };

        // The grace period must not complete while the reader is inside.
        thread::sleep(std::time::Duration::from_millis(50));
        assert!(!synced.load(Ordering::SeqCst));

        release.store(true, Ordering::SeqCst);
        reader.join().unwrap();
        writer.join().unwrap();
        assert!(synced.load(Ordering::SeqCst));
    }

    #[test]
    fn drop_reclaims_everything() {
        struct Flagged(Arc<AtomicUsize>);
        impl Drop for Flagged {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let rcu = Rcu::new(1);
            for _ in 0..10 {
                let item = Box::into_raw(Box::new(Flagged(drops.clone())));
                rcu.defer(unsafe { Garbage::new_box(item) });
            }
        }
        assert_eq!(drops.load(Ordering::Relaxed), 10);
    }
}
