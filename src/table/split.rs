//! The split-ordered variant.
//!
//! All nodes live in one global lock-free list sorted by reversed-bit hash
//! (see [`crate::list::split`]). A bucket is an anchor into that list: the
//! dummy node whose original key is the bucket index. Buckets are
//! initialized lazily, parent first, so the anchor array can be sized for
//! the maximum bucket count up front.
//!
//! A "rebuild" here moves nothing: it publishes a new bucket count with a
//! release store, waits a grace period so every reader observes the new
//! mapping, and refreshes the per-bucket load counters. The hash seed is
//! fixed for the lifetime of the table — the sort order *is* the hash, so
//! reseeding would invalidate every anchor.

use std::sync::atomic::{AtomicIsize, AtomicU32, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::list::split::{self, Node};
use crate::rcu::Rcu;
use crate::table::{
    self, AddError, DelError, HashTable, KeyOps, LoadSignals, NodeRef, RebuildError, TableTuning,
};
use crate::tag;

struct Bucket {
    /// The bucket's dummy node, or 0 while uninitialized.
    head: AtomicUsize,
    nnodes: AtomicIsize,
}

/// The master. There is only ever one instance: rebuilds mutate the bucket
/// count in place instead of chaining a successor.
pub struct SplitTable {
    rcu: Rcu,
    migration: Mutex<()>,
    signals: LoadSignals,
    tuning: TableTuning,
    live: AtomicIsize,
    ops: KeyOps,
    seed: u32,
    nbuckets: AtomicUsize,
    /// Monotonic rebuild count, for debugging.
    idx: AtomicU32,
    /// Anchor array sized at `max_nbuckets` so growth never reallocates.
    buckets: Box<[Bucket]>,
}

impl SplitTable {
    pub fn alloc(
        nbuckets: usize,
        ops: KeyOps,
        seed: u32,
        tuning: TableTuning,
        nclient: usize,
    ) -> SplitTable {
        assert!(nbuckets.is_power_of_two(), "bucket count must be a power of two");
        assert!(nbuckets <= tuning.max_nbuckets);

        let buckets: Box<[Bucket]> = (0..tuning.max_nbuckets)
            .map(|_| Bucket {
                head: AtomicUsize::new(0),
                nnodes: AtomicIsize::new(0),
            })
            .collect();

        // Bucket 0 anchors the whole list; every other bucket descends
        // from it, so it is the one dummy created eagerly.
        let dummy = Node::alloc_dummy(0);
        buckets[0].head.store(dummy as usize, Ordering::SeqCst);

        SplitTable {
            rcu: Rcu::new(nclient),
            migration: Mutex::new(()),
            signals: LoadSignals::new(),
            tuning,
            live: AtomicIsize::new(0),
            ops,
            seed,
            nbuckets: AtomicUsize::new(nbuckets),
            idx: AtomicU32::new(0),
            buckets,
        }
    }

    pub fn rcu(&self) -> &Rcu {
        &self.rcu
    }

    /// Hash a key and name its bucket under the published bucket count.
    fn place(&self, key: u64) -> (usize, u32) {
        let hash = (self.ops.hash)((self.ops.getkey)(key), self.seed);
        let nbuckets = self.nbuckets.load(Ordering::Acquire);
        ((hash % nbuckets as u64) as usize, hash as u32)
    }

    /// Make sure bucket `b` has its dummy, initializing ancestors first.
    unsafe fn initialize_bucket(&self, b: usize) {
        let parent = split::parent_bucket(b);
        if self.buckets[parent].head.load(Ordering::SeqCst) == 0 {
            self.initialize_bucket(parent);
        }

        let dummy = Node::alloc_dummy(b);
        match split::insert(&self.rcu, &self.buckets[parent].head, dummy) {
            Ok(()) => {
                self.buckets[b].head.store(dummy as usize, Ordering::SeqCst);
            }
            Err(existing) => {
                // Another thread initialized the bucket first; adopt its
                // dummy.
                drop(Box::from_raw(dummy));
                self.buckets[b].head.store(existing as usize, Ordering::SeqCst);
            }
        }
    }

    /// The bucket's anchor cell, initializing it on first touch.
    unsafe fn anchor(&self, b: usize) -> &AtomicUsize {
        if self.buckets[b].head.load(Ordering::SeqCst) == 0 {
            self.initialize_bucket(b);
        }
        &self.buckets[b].head
    }
}

impl HashTable for SplitTable {
    fn lookup(&self, tid: usize, key: u64) -> Option<NodeRef> {
        let _guard = self.rcu.read(tid);
        unsafe {
            let (b, hash) = self.place(key);
            let head = self.anchor(b);
            match split::find(&self.rcu, head, key, split::hash_regular(hash)) {
                Ok(ss) => Some(NodeRef::new(ss.cur as *const (), key)),
                Err(_) => None,
            }
        }
    }

    fn add(&self, tid: usize, key: u64) -> Result<(), AddError> {
        let _guard = self.rcu.read(tid);
        unsafe {
            let (b, hash) = self.place(key);
            let head = self.anchor(b);
            let node = Node::alloc(key, split::hash_regular(hash));
            match split::insert(&self.rcu, head, node) {
                Ok(()) => {
                    table::note_insert(&self.buckets[b].nnodes, &self.tuning, &self.signals);
                    self.live.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Err(_existing) => {
                    // One well-defined duplicate path: nothing was stored,
                    // the new node just goes away again.
                    drop(Box::from_raw(node));
                    Err(AddError::Exists)
                }
            }
        }
    }

    fn del(&self, tid: usize, key: u64) -> Result<(), DelError> {
        let _guard = self.rcu.read(tid);
        unsafe {
            let (b, hash) = self.place(key);
            let head = self.anchor(b);
            match split::delete(
                &self.rcu,
                head,
                key,
                split::hash_regular(hash),
                tag::LOGICALLY_REMOVED,
            ) {
                Ok(_) => {
                    table::note_remove(&self.buckets[b].nnodes);
                    let live = self.live.fetch_sub(1, Ordering::Relaxed) - 1;
                    table::note_load(
                        live,
                        self.nbuckets.load(Ordering::Acquire),
                        &self.tuning,
                        &self.signals,
                    );
                    Ok(())
                }
                Err(()) => Err(DelError::NotFound),
            }
        }
    }

    /// Publish a new bucket count. No node moves; the new anchors fill in
    /// lazily as the remapped buckets are touched.
    fn rebuild(
        &self,
        tid: usize,
        nbuckets: usize,
        ops: Option<KeyOps>,
    ) -> Result<(), RebuildError> {
        let lock = self.migration.try_lock().ok_or(RebuildError::Busy)?;
        // The parent-bucket recurrence needs a power of two; anything else
        // cannot be accommodated by this variant.
        if nbuckets == 0 || nbuckets > self.tuning.max_nbuckets || !nbuckets.is_power_of_two() {
            return Err(RebuildError::NoMem);
        }
        if ops.is_some() {
            // The sort order is the hash; there is nothing a new record
            // could mean here.
            log::warn!("split tables cannot change their hash record; ignoring");
        }

        let start = Instant::now();
        let old_nbuckets = self.nbuckets.swap(nbuckets, Ordering::Release);

        // Readers must observe the new mapping before the counters claim
        // to describe it.
        self.rcu.synchronize(tid);

        let mut longest = 0usize;
        let mut longest_at = 0usize;
        unsafe {
            for b in 0..nbuckets {
                let head = self.buckets[b].head.load(Ordering::SeqCst) as *mut Node;
                let len = split::segment_len(head);
                if len > longest {
                    longest = len;
                    longest_at = b;
                }
                self.buckets[b].nnodes.store(len as isize, Ordering::Relaxed);
            }
        }

        let idx = self.idx.fetch_add(1, Ordering::Relaxed) + 1;
        log::info!(
            "resize done: instance {} -> {}, size {} -> {}, {} us, longest chain {} at bucket {}",
            idx - 1,
            idx,
            old_nbuckets,
            nbuckets,
            start.elapsed().as_micros(),
            longest,
            longest_at
        );

        self.rcu.synchronize(tid);
        drop(lock);
        Ok(())
    }

    fn nbuckets(&self) -> usize {
        self.nbuckets.load(Ordering::Acquire)
    }

    fn len(&self) -> usize {
        self.live.load(Ordering::Relaxed).max(0) as usize
    }

    fn signals(&self) -> &LoadSignals {
        &self.signals
    }

    fn tuning(&self) -> &TableTuning {
        &self.tuning
    }

    fn quiesce(&self, tid: usize) {
        self.rcu.gc(tid);
    }

    fn variant(&self) -> &'static str {
        "split"
    }
}

impl Drop for SplitTable {
    fn drop(&mut self) {
        // Walk the global list from the bucket-0 dummy; every node, dummy
        // or regular, hangs off it.
        unsafe {
            let mut cur = self.buckets[0].head.load(Ordering::SeqCst) as *mut Node;
            while !cur.is_null() {
                let next = tag::ptr((*cur).next_word()) as *mut Node;
                drop(Box::from_raw(cur));
                cur = next;
            }
        }
    }
}
