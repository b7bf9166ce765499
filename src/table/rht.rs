//! The relativistic-hash-table variant.
//!
//! A port of the Linux-kernel rhashtable shape: buckets are unordered
//! chains guarded by a per-bucket spinlock for updates, while lookups walk
//! them under nothing but a read-side critical section. Each chain is
//! terminated by a *nulls marker* — a word with the least significant bit
//! set whose upper bits encode the address of the bucket head it belongs
//! to. During a rebuild a node is briefly reachable from both tables, and a
//! lookup following it can slide into another bucket's chain; the marker at
//! the end tells it so, and it restarts.
//!
//! The rebuild peels each old chain from its *tail*: the last node is
//! spliced onto the head of its new bucket, then unlinked from the old
//! chain. The instance's `migration_cursor` records the highest old bucket
//! fully forwarded, so deletes skip chains that can no longer hold their
//! key.

use std::sync::atomic::{AtomicIsize, AtomicPtr, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::rcu::{Garbage, Rcu};
use crate::table::{
    self, AddError, DelError, HashTable, KeyOps, LoadSignals, NodeRef, RebuildError, TableTuning,
};

/// A chain node. The next word holds either a plain node pointer or a
/// nulls marker (bit 0 set).
#[repr(align(8))]
struct Node {
    key: u64,
    next: AtomicUsize,
}

impl Node {
    fn alloc(key: u64) -> *mut Node {
        Box::into_raw(Box::new(Node {
            key,
            next: AtomicUsize::new(0),
        }))
    }
}

struct Bucket {
    /// First node of the chain, or 0 when empty. Never a marker.
    head: AtomicUsize,
    lock: Mutex<()>,
    nnodes: AtomicIsize,
}

#[inline]
fn is_nulls(word: usize) -> bool {
    word & 1 == 1
}

/// The nulls marker naming this bucket: its head cell's address, tagged.
#[inline]
fn nulls_marker(bucket: &Bucket) -> usize {
    &bucket.head as *const AtomicUsize as usize | 1
}

/// Where a walk of this bucket starts: the first node, or the bucket's own
/// marker when the chain is empty.
#[inline]
fn head_or_marker(bucket: &Bucket) -> usize {
    let head = bucket.head.load(Ordering::SeqCst);
    if head != 0 {
        head
    } else {
        nulls_marker(bucket)
    }
}

/// One hash-table instance.
struct Ht {
    nbuckets: usize,
    seed: u32,
    idx: usize,
    ops: KeyOps,
    successor: AtomicUsize,
    /// Highest old-bucket index whose chain has been fully forwarded.
    migration_cursor: AtomicIsize,
    buckets: Box<[Bucket]>,
}

impl Ht {
    fn alloc(nbuckets: usize, ops: KeyOps, seed: u32, idx: usize) -> Box<Ht> {
        Box::new(Ht {
            nbuckets,
            seed,
            idx,
            ops,
            successor: AtomicUsize::new(0),
            migration_cursor: AtomicIsize::new(-1),
            buckets: (0..nbuckets)
                .map(|_| Bucket {
                    head: AtomicUsize::new(0),
                    lock: Mutex::new(()),
                    nnodes: AtomicIsize::new(0),
                })
                .collect(),
        })
    }

    fn bucket_index(&self, key: u64) -> usize {
        let hash = (self.ops.hash)((self.ops.getkey)(key), self.seed);
        (hash % self.nbuckets as u64) as usize
    }

    fn successor(&self) -> *mut Ht {
        self.successor.load(Ordering::SeqCst) as *mut Ht
    }
}

/// The master.
pub struct RhtTable {
    rcu: Rcu,
    current: AtomicPtr<Ht>,
    migration: Mutex<()>,
    signals: LoadSignals,
    tuning: TableTuning,
    live: AtomicIsize,
}

impl RhtTable {
    pub fn alloc(
        nbuckets: usize,
        ops: KeyOps,
        seed: u32,
        tuning: TableTuning,
        nclient: usize,
    ) -> RhtTable {
        RhtTable {
            rcu: Rcu::new(nclient),
            current: AtomicPtr::new(Box::into_raw(Ht::alloc(nbuckets, ops, seed, 0))),
            migration: Mutex::new(()),
            signals: LoadSignals::new(),
            tuning,
            live: AtomicIsize::new(0),
        }
    }

    pub fn rcu(&self) -> &Rcu {
        &self.rcu
    }

    /// Walk one bucket. Restarts while the walk keeps ending at a foreign
    /// marker — the sign that it crossed into another bucket mid-rebuild.
    unsafe fn find_in(&self, ht: &Ht, key: u64) -> Option<*mut Node> {
        let bucket = &ht.buckets[ht.bucket_index(key)];
        loop {
            let mut pos = head_or_marker(bucket);
            while !is_nulls(pos) {
                let node = pos as *mut Node;
                if (ht.ops.cmp)((ht.ops.getkey)((*node).key), key, ht.seed) {
                    return Some(node);
                }
                pos = (*node).next.load(Ordering::SeqCst);
            }
            if pos == nulls_marker(bucket) {
                return None;
            }
            log::trace!("walk ended at a foreign nulls marker, restarting");
        }
    }

    /// Delete `key` from one table's chain, under the bucket lock.
    unsafe fn del_in(&self, ht: &Ht, key: u64) -> Result<(), ()> {
        let bucket = &ht.buckets[ht.bucket_index(key)];
        let _lock = bucket.lock.lock();

        let mut pprev: Option<&AtomicUsize> = None;
        let mut pos = head_or_marker(bucket);
        while !is_nulls(pos) {
            let node = pos as *mut Node;
            let next = (*node).next.load(Ordering::SeqCst);
            if (ht.ops.cmp)((ht.ops.getkey)((*node).key), key, ht.seed) {
                match pprev {
                    Some(cell) => cell.store(next, Ordering::SeqCst),
                    None => {
                        // Unlinking the head; an empty chain stores 0, not
                        // a marker.
                        let word = if is_nulls(next) { 0 } else { next };
                        bucket.head.store(word, Ordering::SeqCst);
                    }
                }
                table::note_remove(&bucket.nnodes);
                self.rcu.defer(Garbage::new_box(node));
                return Ok(());
            }
            pprev = Some(&(*node).next);
            pos = next;
        }
        Err(())
    }

    /// Push a node onto the front of `ht`'s chain for its key, under the
    /// bucket lock. Fails on a duplicate already in the chain.
    unsafe fn push_front(&self, ht: &Ht, node: *mut Node) -> Result<(), ()> {
        let key = (*node).key;
        let bucket = &ht.buckets[ht.bucket_index(key)];
        let _lock = bucket.lock.lock();

        let mut pos = head_or_marker(bucket);
        while !is_nulls(pos) {
            let cur = pos as *mut Node;
            if (ht.ops.cmp)((ht.ops.getkey)((*cur).key), key, ht.seed) {
                return Err(());
            }
            pos = (*cur).next.load(Ordering::SeqCst);
        }

        (*node).next.store(head_or_marker(bucket), Ordering::SeqCst);
        bucket.head.store(node as usize, Ordering::SeqCst);
        table::note_insert(&bucket.nnodes, &self.tuning, &self.signals);
        Ok(())
    }

    /// Insert into the newest table, for inserts arriving mid-rebuild.
    unsafe fn add_slow(&self, key: u64) -> Result<(), AddError> {
        let mut ht = &*self.current.load(Ordering::SeqCst);
        loop {
            let new = ht.successor();
            if new.is_null() {
                break;
            }
            ht = &*new;
        }

        // The key may still sit in a not-yet-forwarded old chain.
        if self.lookup_locked(key).is_some() {
            return Err(AddError::Exists);
        }

        let node = Node::alloc(key);
        match self.push_front(ht, node) {
            Ok(()) => {
                self.live.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(()) => {
                drop(Box::from_raw(node));
                Err(AddError::Exists)
            }
        }
    }

    unsafe fn lookup_locked(&self, key: u64) -> Option<NodeRef> {
        let mut ht = &*self.current.load(Ordering::SeqCst);
        loop {
            if let Some(node) = self.find_in(ht, key) {
                return Some(NodeRef::new(node as *const (), key));
            }
            let new = ht.successor();
            if new.is_null() {
                return None;
            }
            ht = &*new;
        }
    }

    /// Forward one old chain into the new table, peeling from the tail.
    unsafe fn rebuild_chain(&self, old: &Ht, new: &Ht, bucket_idx: usize) {
        let bucket = &old.buckets[bucket_idx];
        let _lock = bucket.lock.lock();

        loop {
            // Find the last node and the cell that points at it.
            let mut pprev: Option<&AtomicUsize> = None;
            let first = head_or_marker(bucket);
            if is_nulls(first) {
                break;
            }
            let mut node = first as *mut Node;
            let mut end;
            loop {
                end = (*node).next.load(Ordering::SeqCst);
                if is_nulls(end) {
                    break;
                }
                pprev = Some(&(*node).next);
                node = end as *mut Node;
            }

            // Splice it onto the head of its new bucket.
            let nbucket = &new.buckets[new.bucket_index((*node).key)];
            {
                let _nlock = nbucket.lock.lock();
                (*node).next.store(head_or_marker(nbucket), Ordering::SeqCst);
                nbucket.head.store(node as usize, Ordering::SeqCst);
            }

            // The node is now reachable from both tables: a lookup visiting
            // it from the old chain runs into the new bucket's chain and is
            // caught by the foreign nulls marker at its end.

            // Unlink it from the old chain.
            match pprev {
                Some(cell) => cell.store(end, Ordering::SeqCst),
                None => bucket.head.store(0, Ordering::SeqCst),
            }

            table::note_insert(&nbucket.nnodes, &self.tuning, &self.signals);
            log::trace!(
                "forwarded key {} from instance {} to {}",
                (*node).key,
                old.idx,
                new.idx
            );
        }
    }
}

impl HashTable for RhtTable {
    fn lookup(&self, tid: usize, key: u64) -> Option<NodeRef> {
        let _guard = self.rcu.read(tid);
        unsafe { self.lookup_locked(key) }
    }

    fn add(&self, tid: usize, key: u64) -> Result<(), AddError> {
        let _guard = self.rcu.read(tid);
        unsafe {
            let ht = &*self.current.load(Ordering::SeqCst);
            if !ht.successor().is_null() {
                return self.add_slow(key);
            }

            let node = Node::alloc(key);
            match self.push_front(ht, node) {
                Ok(()) => {
                    self.live.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Err(()) => {
                    drop(Box::from_raw(node));
                    Err(AddError::Exists)
                }
            }
        }
    }

    fn del(&self, tid: usize, key: u64) -> Result<(), DelError> {
        let _guard = self.rcu.read(tid);
        unsafe {
            let ht = &*self.current.load(Ordering::SeqCst);
            let new = ht.successor();

            // A fully forwarded chain cannot hold the key anymore; the
            // cursor saves the walk under the old bucket's lock.
            let bucket_idx = ht.bucket_index(key);
            let forwarded = !new.is_null()
                && bucket_idx as isize <= ht.migration_cursor.load(Ordering::SeqCst);

            if !forwarded && self.del_in(ht, key).is_ok() {
                let live = self.live.fetch_sub(1, Ordering::Relaxed) - 1;
                table::note_load(live, ht.nbuckets, &self.tuning, &self.signals);
                return Ok(());
            }

            if new.is_null() {
                return Err(DelError::NotFound);
            }
            if self.del_in(&*new, key).is_ok() {
                let live = self.live.fetch_sub(1, Ordering::Relaxed) - 1;
                table::note_load(live, (*new).nbuckets, &self.tuning, &self.signals);
                return Ok(());
            }
            Err(DelError::NotFound)
        }
    }

    fn rebuild(
        &self,
        tid: usize,
        nbuckets: usize,
        ops: Option<KeyOps>,
    ) -> Result<(), RebuildError> {
        let lock = self.migration.try_lock().ok_or(RebuildError::Busy)?;
        if nbuckets == 0 || nbuckets > self.tuning.max_nbuckets {
            return Err(RebuildError::NoMem);
        }

        unsafe {
            let old_ptr = self.current.load(Ordering::SeqCst);
            let old = &*old_ptr;
            debug_assert!(old.successor().is_null());
            let seed = if self.tuning.rebuild_seed {
                old.seed.wrapping_add(1)
            } else {
                old.seed
            };
            let new_ptr =
                Box::into_raw(Ht::alloc(nbuckets, ops.unwrap_or(old.ops), seed, old.idx + 1));

            old.successor.store(new_ptr as usize, Ordering::SeqCst);

            // Wait until every update that may not know about the new table
            // has finished.
            self.rcu.synchronize(tid);

            let start = Instant::now();
            for i in 0..old.nbuckets {
                self.rebuild_chain(old, &*new_ptr, i);
                old.migration_cursor.store(i as isize, Ordering::SeqCst);
            }
            log::info!(
                "rebuild done: instance {} -> {}, size {} -> {}, {} us",
                old.idx,
                (*new_ptr).idx,
                old.nbuckets,
                nbuckets,
                start.elapsed().as_micros()
            );

            // Wait out updates still working on the old table, flip the
            // master, and wait out the references to the old instance.
            self.rcu.synchronize(tid);
            self.current.store(new_ptr, Ordering::SeqCst);
            self.rcu.synchronize(tid);

            drop(Box::from_raw(old_ptr));
        }

        drop(lock);
        Ok(())
    }

    fn nbuckets(&self) -> usize {
        unsafe { (*self.current.load(Ordering::SeqCst)).nbuckets }
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
        "rht"
    }
}

impl Drop for RhtTable {
    fn drop(&mut self) {
        unsafe {
            let cur = *self.current.get_mut();
            debug_assert!((*cur).successor().is_null(), "dropped mid-rebuild");
            for bucket in (*cur).buckets.iter() {
                let mut pos = head_or_marker(bucket);
                while !is_nulls(pos) {
                    let node = pos as *mut Node;
                    pos = (*node).next.load(Ordering::SeqCst);
                    drop(Box::from_raw(node));
                }
            }
            drop(Box::from_raw(cur));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TableBuilder;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn add_lookup_del() {
        let t = TableBuilder::new().nbuckets(8).client_threads(1).build_rht();
        t.add(0, 11).unwrap();
        assert_eq!(t.add(0, 11), Err(AddError::Exists));
        assert!(t.lookup(0, 11).is_some());
        t.del(0, 11).unwrap();
        assert_eq!(t.del(0, 11), Err(DelError::NotFound));
    }

    #[test]
    fn rebuild_preserves_contents() {
        let t = TableBuilder::new().nbuckets(4).client_threads(1).build_rht();
        for key in 0..256u64 {
            t.add(0, key).unwrap();
        }
        t.rebuild(0, 32, None).unwrap();
        for key in 0..256u64 {
            assert!(t.lookup(0, key).is_some(), "lost key {key}");
        }
        assert_eq!(t.len(), 256);
    }

    #[test]
    fn readers_race_rebuilds() {
        const KEYS: u64 = 512;
        let t = Arc::new(
            TableBuilder::new()
                .nbuckets(8)
                .client_threads(3)
                .build_rht(),
        );
        for k in 0..KEYS {
            t.add(0, k).unwrap();
        }

        let reader = {
            let t = t.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    for k in 0..KEYS {
                        assert!(t.lookup(1, k).is_some(), "key {k} went missing");
                    }
                }
            })
        };
        let rebuilder = {
            let t = t.clone();
            thread::spawn(move || {
                for i in 0..8 {
                    let n = if i % 2 == 0 { 64 } else { 8 };
                    t.rebuild(2, n, None).unwrap();
                }
            })
        };
        reader.join().unwrap();
        rebuilder.join().unwrap();
        assert_eq!(t.len(), KEYS as usize);
    }

    #[test]
    fn updates_race_rebuilds() {
        const KEYS: u64 = 256;
        let t = Arc::new(
            TableBuilder::new()
                .nbuckets(8)
                .client_threads(2)
                .build_rht(),
        );

        let updater = {
            let t = t.clone();
            thread::spawn(move || {
                for _ in 0..30 {
                    for k in 0..KEYS {
                        t.add(0, k).unwrap();
                    }
                    for k in 0..KEYS {
                        t.del(0, k).unwrap();
                    }
                }
            })
        };
        let rebuilder = {
            let t = t.clone();
            thread::spawn(move || {
                for i in 0..10 {
                    let n = if i % 2 == 0 { 64 } else { 4 };
                    t.rebuild(1, n, None).unwrap();
                }
            })
        };
        updater.join().unwrap();
        rebuilder.join().unwrap();
        assert_eq!(t.len(), 0);
    }
}
