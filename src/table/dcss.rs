//! The DCSS-anchored lock-free variant.
//!
//! Buckets are lock-free ordered lists. An insert that found no successor
//! table goes through [`LfList::insert_dcss`], gated on the table's
//! successor pointer still being null: publishing a successor and linking a
//! node into the old table cannot both happen. On the gate failing, the
//! insert restarts and re-routes to the successor.
//!
//! Rebuilds run across multiple worker threads. Workers partition the old
//! buckets by index modulo the worker count; each worker repeatedly takes
//! the head node of one of its buckets, publishes it in its *hazard slot*,
//! unlinks it from the old table under the `IS_BEING_DISTRIBUTED` mark, and
//! reinserts it into the successor. The hazard slot is what client lookups
//! and deletes consult for the short window in which a node is in neither
//! table.

use std::ptr;
use std::sync::atomic::{AtomicIsize, AtomicPtr, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::dcss::Dcss;
use crate::list::lf::{InsertError, LfList, Node};
use crate::rcu::Rcu;
use crate::table::{
    self, AddError, DelError, HashTable, KeyOps, LoadSignals, NodeRef, RebuildError, TableTuning,
    MAX_REBUILD_THREADS,
};
use crate::tag;

/// A hazard slot: pins the node its owning rebuild worker is moving.
///
/// Single writer (the worker), many readers (client lookups and deletes).
#[repr(align(128))]
struct HazardSlot(AtomicPtr<Node>);

/// Hash-table bucket.
struct Bucket {
    list: LfList,
    nnodes: AtomicIsize,
}

/// One hash-table instance; duplicated at rebuild time.
///
/// Immutable after publication except for `successor`.
struct Ht {
    nbuckets: usize,
    seed: u32,
    /// Monotonic instance index, for debugging.
    idx: usize,
    ops: KeyOps,
    /// Raw pointer to the successor instance; the DCSS gate address.
    successor: AtomicUsize,
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
            buckets: (0..nbuckets)
                .map(|_| Bucket {
                    list: LfList::new(),
                    nnodes: AtomicIsize::new(0),
                })
                .collect(),
        })
    }

    fn bucket_for(&self, key: u64) -> &Bucket {
        let hash = (self.ops.hash)((self.ops.getkey)(key), self.seed);
        &self.buckets[(hash % self.nbuckets as u64) as usize]
    }

    fn successor(&self) -> *mut Ht {
        self.successor.load(Ordering::SeqCst) as *mut Ht
    }
}

/// The master: current instance plus everything rebuilds need.
pub struct DcssTable {
    rcu: Rcu,
    dcss: Dcss,
    current: AtomicPtr<Ht>,
    /// Held for the whole of a migration by a single coordinator.
    migration: Mutex<()>,
    rebuild_cur: Box<[HazardSlot]>,
    signals: LoadSignals,
    tuning: TableTuning,
    live: AtomicIsize,
    nclient: usize,
}

impl DcssTable {
    /// Allocate a table sized for `nclient` client thread ids.
    pub fn alloc(
        nbuckets: usize,
        ops: KeyOps,
        seed: u32,
        tuning: TableTuning,
        nclient: usize,
    ) -> DcssTable {
        let workers = tuning.rebuild_threads.clamp(1, MAX_REBUILD_THREADS);
        let ht = Box::into_raw(Ht::alloc(nbuckets, ops, seed, 0));

        DcssTable {
            rcu: Rcu::new(nclient + workers),
            dcss: Dcss::new(nclient + workers),
            current: AtomicPtr::new(ht),
            migration: Mutex::new(()),
            rebuild_cur: (0..workers)
                .map(|_| HazardSlot(AtomicPtr::new(ptr::null_mut())))
                .collect(),
            signals: LoadSignals::new(),
            tuning: TableTuning {
                rebuild_threads: workers,
                ..tuning
            },
            live: AtomicIsize::new(0),
            nclient,
        }
    }

    /// The reclamation service, for callers that want to force collection.
    pub fn rcu(&self) -> &Rcu {
        &self.rcu
    }

    /// Lookup body; the caller already holds a read section.
    unsafe fn lookup_locked(&self, key: u64) -> Option<NodeRef> {
        // (1) Search the current table.
        let ht = &*self.current.load(Ordering::SeqCst);
        if let Ok(ss) = ht.bucket_for(key).list.find(&self.dcss, &self.rcu, key) {
            return Some(NodeRef::new(ss.cur as *const (), key));
        }

        let new = ht.successor();
        if new.is_null() {
            return None;
        }

        // (2) A rebuild worker may hold the node in its hazard slot,
        // in-flight between the tables.
        for slot in self.rebuild_cur.iter() {
            let node = slot.0.load(Ordering::SeqCst);
            if !node.is_null() && (*node).key == key {
                let next = (*node).next_word(&self.dcss);
                if !tag::is_logically_removed(next) {
                    return Some(NodeRef::new(node as *const (), key));
                }
            }
        }

        // (3) Search the successor table.
        match (*new).bucket_for(key).list.find(&self.dcss, &self.rcu, key) {
            Ok(ss) => Some(NodeRef::new(ss.cur as *const (), key)),
            Err(_) => None,
        }
    }

    /// Per-worker transfer loop: buckets `worker`, `worker + nworkers`, ...
    fn transfer_worker(&self, tid: usize, worker: usize, nworkers: usize, old: &Ht, new: &Ht) {
        let slot = &self.rebuild_cur[worker];
        let mut moved = 0usize;

        let mut bucket_idx = worker;
        while bucket_idx < old.nbuckets {
            let bucket = &old.buckets[bucket_idx];
            loop {
                let guard = self.rcu.read(tid);
                unsafe {
                    let node = bucket.list.head_node(&self.dcss);
                    if node.is_null() {
                        break;
                    }

                    // Pin the node before touching it; clients must be able
                    // to find it while it is in neither table.
                    slot.0.store(node, Ordering::SeqCst);

                    match bucket
                        .list
                        .delete(&self.dcss, &self.rcu, (*node).key, tag::IS_BEING_DISTRIBUTED)
                    {
                        Err(()) => {
                            // A concurrent delete beat us to it; take the
                            // next head.
                            drop(guard);
                            continue;
                        }
                        Ok(ss) => {
                            debug_assert_eq!(ss.cur, node, "pinned node moved under the rebuild");
                            table::note_remove(&bucket.nnodes);

                            (*node).clear_flag(&self.dcss, tag::IS_BEING_DISTRIBUTED);
                            // LOGICALLY_REMOVED may be present if a deleter
                            // claimed the node through the slot; it is
                            // inserted regardless, and the successor's next
                            // traversal unlinks it.

                            let nbucket = new.bucket_for((*node).key);
                            match nbucket.list.insert(&self.dcss, &self.rcu, node) {
                                Ok(()) => {
                                    table::note_insert(&nbucket.nnodes, &self.tuning, &self.signals)
                                }
                                Err(InsertError::Exists) => {
                                    log::error!(
                                        "duplicate key {} while distributing",
                                        (*node).key
                                    );
                                    debug_assert!(false, "duplicate key during distribution");
                                }
                                Err(InsertError::MigrationStarted) => unreachable!(),
                            }

                            // Fully linked; release the pin.
                            slot.0.store(ptr::null_mut(), Ordering::SeqCst);
                            moved += 1;
                            log::trace!(
                                "moved key {} from instance {} to {}",
                                (*node).key,
                                old.idx,
                                new.idx
                            );
                        }
                    }
                }
                drop(guard);
            }
            bucket_idx += nworkers;
        }

        // Leave nothing pinned behind for the next migration to trip on.
        slot.0.store(ptr::null_mut(), Ordering::SeqCst);
        log::debug!("rebuild worker {worker} moved {moved} nodes");
    }
}

impl HashTable for DcssTable {
    fn lookup(&self, tid: usize, key: u64) -> Option<NodeRef> {
        let _guard = self.rcu.read(tid);
        unsafe { self.lookup_locked(key) }
    }

    fn add(&self, tid: usize, key: u64) -> Result<(), AddError> {
        let _guard = self.rcu.read(tid);
        unsafe {
            let node = Node::alloc(key);
            let ht = &*self.current.load(Ordering::SeqCst);
            loop {
                let new = ht.successor();
                if new.is_null() {
                    // (1) Insert into the only (old) table, gated on the
                    // successor staying null.
                    let bucket = ht.bucket_for(key);
                    match bucket.list.insert_dcss(
                        &self.dcss,
                        &self.rcu,
                        tid,
                        &ht.successor,
                        node,
                    ) {
                        Ok(()) => {
                            table::note_insert(&bucket.nnodes, &self.tuning, &self.signals);
                            self.live.fetch_add(1, Ordering::Relaxed);
                            return Ok(());
                        }
                        Err(InsertError::MigrationStarted) => continue,
                        Err(InsertError::Exists) => {
                            drop(Box::from_raw(node));
                            return Err(AddError::Exists);
                        }
                    }
                } else {
                    // (2) A rebuild is in progress: enforce uniqueness
                    // against both tables and any in-flight node, then
                    // insert into the successor.
                    if self.lookup_locked(key).is_some() {
                        drop(Box::from_raw(node));
                        return Err(AddError::Exists);
                    }
                    let bucket = (*new).bucket_for(key);
                    match bucket.list.insert(&self.dcss, &self.rcu, node) {
                        Ok(()) => {
                            table::note_insert(&bucket.nnodes, &self.tuning, &self.signals);
                            self.live.fetch_add(1, Ordering::Relaxed);
                            return Ok(());
                        }
                        Err(InsertError::Exists) => {
                            drop(Box::from_raw(node));
                            return Err(AddError::Exists);
                        }
                        Err(InsertError::MigrationStarted) => unreachable!(),
                    }
                }
            }
        }
    }

    fn del(&self, tid: usize, key: u64) -> Result<(), DelError> {
        let _guard = self.rcu.read(tid);
        unsafe {
            // (1) Delete from the current table.
            let ht = &*self.current.load(Ordering::SeqCst);
            let bucket = ht.bucket_for(key);
            if bucket
                .list
                .delete(&self.dcss, &self.rcu, key, tag::LOGICALLY_REMOVED)
                .is_ok()
            {
                table::note_remove(&bucket.nnodes);
                let live = self.live.fetch_sub(1, Ordering::Relaxed) - 1;
                table::note_load(live, ht.nbuckets, &self.tuning, &self.signals);
                return Ok(());
            }

            let new = ht.successor();
            if new.is_null() {
                return Err(DelError::NotFound);
            }

            // (2) Claim the node through a hazard slot. Both the slot and
            // the pinned node's next word are re-read on every attempt, so
            // a racing rebuild worker cannot spin us on a stale word.
            for slot in self.rebuild_cur.iter() {
                let mut node = slot.0.load(Ordering::SeqCst);
                while !node.is_null() && (*node).key == key {
                    let next = (*node).next_word(&self.dcss);
                    if tag::is_logically_removed(next) {
                        break;
                    }
                    if (*node).mark_removed(next) {
                        let live = self.live.fetch_sub(1, Ordering::Relaxed) - 1;
                        table::note_load(live, ht.nbuckets, &self.tuning, &self.signals);
                        return Ok(());
                    }
                    node = slot.0.load(Ordering::SeqCst);
                }
            }

            // (3) Delete from the successor table.
            let bucket = (*new).bucket_for(key);
            if bucket
                .list
                .delete(&self.dcss, &self.rcu, key, tag::LOGICALLY_REMOVED)
                .is_ok()
            {
                table::note_remove(&bucket.nnodes);
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
            let seed = if self.tuning.rebuild_seed {
                old.seed.wrapping_add(1)
            } else {
                old.seed
            };
            let new_ptr =
                Box::into_raw(Ht::alloc(nbuckets, ops.unwrap_or(old.ops), seed, old.idx + 1));
            let new = &*new_ptr;

            // Publish, then wait until every reader sees both tables.
            old.successor.store(new_ptr as usize, Ordering::SeqCst);
            self.rcu.synchronize(tid);

            let nworkers = self.tuning.rebuild_threads;
            let start = Instant::now();
            std::thread::scope(|scope| {
                for worker in 0..nworkers {
                    let worker_tid = self.nclient + worker;
                    scope.spawn(move || {
                        self.transfer_worker(worker_tid, worker, nworkers, old, new)
                    });
                }
            });

            log::info!(
                "rebuild done: instance {} -> {}, size {} -> {}, {} us",
                old.idx,
                new.idx,
                old.nbuckets,
                nbuckets,
                start.elapsed().as_micros()
            );

            // Swap the master only after every worker returned and a grace
            // period covered the transfer.
            self.rcu.synchronize(tid);
            self.current.store(new_ptr, Ordering::SeqCst);
            self.rcu.synchronize(tid);

            for bucket in old.buckets.iter() {
                bucket.list.drain(&self.dcss);
            }
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
        "lf-dcss"
    }
}

impl Drop for DcssTable {
    fn drop(&mut self) {
        unsafe {
            let cur = *self.current.get_mut();
            debug_assert!((*cur).successor().is_null(), "dropped mid-rebuild");
            for bucket in (*cur).buckets.iter() {
                bucket.list.drain(&self.dcss);
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

    fn small(threads: usize) -> DcssTable {
        TableBuilder::new()
            .nbuckets(8)
            .client_threads(threads)
            .build_dcss()
    }

    #[test]
    fn add_lookup_del() {
        let t = small(1);
        t.add(0, 1).unwrap();
        t.add(0, 5).unwrap();
        assert_eq!(t.add(0, 5), Err(AddError::Exists));
        assert!(t.lookup(0, 5).is_some());
        assert!(t.lookup(0, 2).is_none());
        assert_eq!(t.len(), 2);
        t.del(0, 5).unwrap();
        assert_eq!(t.del(0, 5), Err(DelError::NotFound));
        assert!(t.lookup(0, 5).is_none());
    }

    #[test]
    fn rebuild_preserves_contents() {
        let t = TableBuilder::new()
            .nbuckets(4)
            .client_threads(1)
            .build_dcss();
        for key in [1u64, 5, 9] {
            t.add(0, key).unwrap();
        }
        t.rebuild(0, 8, None).unwrap();
        assert_eq!(t.nbuckets(), 8);
        assert!(t.lookup(0, 5).is_some());
        assert!(t.lookup(0, 3).is_none());
        for key in [1u64, 5, 9] {
            assert!(t.lookup(0, key).is_some(), "lost key {key} in rebuild");
        }
    }

    #[test]
    fn rebuild_rejects_oversize() {
        let t = small(1);
        let too_big = t.tuning().max_nbuckets + 1;
        assert_eq!(t.rebuild(0, too_big, None), Err(RebuildError::NoMem));
    }

    #[test]
    fn adds_race_one_rebuild() {
        const UPDATERS: usize = 4;
        const KEYS_PER: u64 = 400;

        let t = Arc::new(
            TableBuilder::new()
                .nbuckets(16)
                .client_threads(UPDATERS + 1)
                .build_dcss(),
        );

        let mut joins = Vec::new();
        for u in 0..UPDATERS {
            let t = t.clone();
            joins.push(thread::spawn(move || {
                for i in 0..KEYS_PER {
                    t.add(u, i * UPDATERS as u64 + u as u64).unwrap();
                }
            }));
        }
        let rebuilder = {
            let t = t.clone();
            thread::spawn(move || {
                let mut n = 32;
                for _ in 0..4 {
                    match t.rebuild(UPDATERS, n, None) {
                        Ok(()) | Err(RebuildError::Busy) => {}
                        Err(e) => panic!("rebuild failed: {e}"),
                    }
                    n *= 2;
                }
            })
        };
        for j in joins {
            j.join().unwrap();
        }
        rebuilder.join().unwrap();

        for k in 0..UPDATERS as u64 * KEYS_PER {
            assert!(t.lookup(0, k).is_some(), "lost key {k}");
        }
        assert_eq!(t.len(), (UPDATERS as u64 * KEYS_PER) as usize);
    }

    #[test]
    fn deletes_race_rebuild() {
        const N: u64 = 1000;
        let t = Arc::new(
            TableBuilder::new()
                .nbuckets(8)
                .client_threads(2)
                .build_dcss(),
        );
        for k in 0..N {
            t.add(0, k).unwrap();
        }

        let deleter = {
            let t = t.clone();
            thread::spawn(move || {
                let mut hits = 0;
                for k in 0..N {
                    if t.del(0, k).is_ok() {
                        hits += 1;
                    }
                }
                hits
            })
        };
        t.rebuild(1, 64, None).unwrap();
        let deleted = deleter.join().unwrap();
        assert_eq!(deleted, N);

        for k in 0..N {
            assert!(t.lookup(1, k).is_none(), "resurrected key {k}");
        }
        assert_eq!(t.len(), 0);
    }
}
