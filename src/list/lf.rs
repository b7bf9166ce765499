//! Lock-free ordered list on DCSS-coded words.
//!
//! A Michael-style ordered list: deletion first marks the victim's next
//! word (the linearization point) and then unlinks it with a CAS of the
//! predecessor; any traversal that meets a marked node finishes the unlink
//! in-line. The ABA problem is handled by the reclamation service rather
//! than by version tags: a node's memory cannot be reused while a traversal
//! could still hold it.
//!
//! All words — the bucket head and every `next` — are stored in DCSS value
//! form (shifted left by one) so that bit 0 stays free for the descriptor
//! tag. Plain CAS on such a cell is still sound: a published descriptor has
//! bit 0 set, so the CAS simply fails and the retry path reads through
//! [`Dcss::read_value`], which helps the descriptor out of the way first.
//!
//! [`LfList::insert_dcss`] is the one operation that differs from the
//! textbook list: instead of a single CAS of the predecessor it performs a
//! DCSS gated on a second location (the table's successor pointer), so an
//! insert into a bucket can only succeed while no rebuild has been
//! published.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::dcss::{Dcss, DcssResult};
use crate::list::Snapshot;
use crate::rcu::{Garbage, Rcu};
use crate::tag;

/// A list node: an opaque key and a value-form tagged next word.
#[repr(align(8))]
pub struct Node {
    pub key: u64,
    next: AtomicUsize,
}

impl Node {
    /// Allocate a detached node.
    pub fn alloc(key: u64) -> *mut Node {
        Box::into_raw(Box::new(Node {
            key,
            next: AtomicUsize::new(0),
        }))
    }

    /// Read the next word in plain form, helping descriptors out of the way.
    pub fn next_word(&self, dcss: &Dcss) -> usize {
        dcss.read_value(&self.next)
    }

    /// Point this node at `next`, preserving its own flag bits.
    ///
    /// The flags must be preserved: a rebuild worker reinserts nodes that a
    /// concurrent deleter may have marked through the hazard slot, and that
    /// mark must survive the splice.
    pub fn set_next(&self, dcss: &Dcss, next: usize) {
        debug_assert_eq!(tag::flags(next), 0);
        loop {
            let old = dcss.read_value(&self.next);
            let new = tag::with_flags(next, tag::flags(old));
            if self
                .next
                .compare_exchange(
                    tag::to_value(old),
                    tag::to_value(new),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    /// Clear a flag bit on this node's next word.
    pub fn clear_flag(&self, dcss: &Dcss, flag: usize) {
        loop {
            let old = dcss.read_value(&self.next);
            if self
                .next
                .compare_exchange(
                    tag::to_value(old),
                    tag::to_value(old & !flag),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    /// One attempt at setting `LOGICALLY_REMOVED`, expecting the next word
    /// read by the caller.
    ///
    /// Used by deleters claiming a node through a hazard slot. A single
    /// attempt, not a loop: between attempts the caller must re-read both
    /// the slot and the next word, or a racing rebuild worker could spin it
    /// on a stale snapshot.
    pub fn mark_removed(&self, expected: usize) -> bool {
        debug_assert!(!tag::is_logically_removed(expected));
        self.next
            .compare_exchange(
                tag::to_value(expected),
                tag::to_value(expected | tag::LOGICALLY_REMOVED),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}

/// Errors an insert can report.
#[derive(Debug, PartialEq, Eq)]
pub enum InsertError {
    /// A live node with the same key is already present.
    Exists,
    /// The DCSS gate failed: a rebuild has been published since the caller
    /// read a null successor. The caller must restart and re-route.
    MigrationStarted,
}

/// A lock-free ordered list of [`Node`]s.
pub struct LfList {
    head: AtomicUsize,
}

impl LfList {
    pub fn new() -> LfList {
        LfList {
            head: AtomicUsize::new(0),
        }
    }

    /// Read the first node, in plain form.
    pub fn head_node(&self, dcss: &Dcss) -> *mut Node {
        tag::ptr(dcss.read_value(&self.head)) as *mut Node
    }

    /// Walk to `key`.
    ///
    /// `Ok` carries the snapshot of a live node with the key; `Err` carries
    /// the insertion point. Marked nodes met on the way are physically
    /// unlinked; if the predecessor moved under us, the walk restarts.
    ///
    /// # Safety
    ///
    /// Caller must be inside a read section of `rcu`, and every node in the
    /// list must have been allocated by [`Node::alloc`].
    pub unsafe fn find(
        &self,
        dcss: &Dcss,
        rcu: &Rcu,
        key: u64,
    ) -> Result<Snapshot<Node>, Snapshot<Node>> {
        'retry: loop {
            let mut prev: *const AtomicUsize = &self.head;
            let mut cur = tag::ptr(dcss.read_value(&*prev)) as *mut Node;

            loop {
                if cur.is_null() {
                    return Err(Snapshot {
                        prev,
                        cur: std::ptr::null_mut(),
                        next: std::ptr::null_mut(),
                    });
                }
                let next_word = dcss.read_value(&(*cur).next);
                let next = tag::ptr(next_word) as *mut Node;
                let cmark = tag::flags(next_word);
                let ckey = (*cur).key;

                // A node spliced in before cur invalidates the snapshot.
                if dcss.read_value(&*prev) != cur as usize {
                    continue 'retry;
                }

                if cmark == 0 {
                    if ckey >= key {
                        let ss = Snapshot { prev, cur, next };
                        return if ckey == key { Ok(ss) } else { Err(ss) };
                    }
                    prev = &(*cur).next;
                } else {
                    // cur is logically deleted; finish the unlink.
                    if (*prev)
                        .compare_exchange(
                            tag::to_value(cur as usize),
                            tag::to_value(next as usize),
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        if cmark == tag::LOGICALLY_REMOVED {
                            rcu.defer(Garbage::new_box(cur));
                        }
                        // A node carrying IS_BEING_DISTRIBUTED is owned by
                        // the rebuild worker; it must never reach
                        // reclamation from here.
                    } else {
                        continue 'retry;
                    }
                }
                cur = next;
            }
        }
    }

    /// Insert a detached node, plain-CAS flavor.
    ///
    /// # Safety
    ///
    /// Caller must be inside a read section of `rcu`; `node` must be
    /// detached and unaliased.
    pub unsafe fn insert(
        &self,
        dcss: &Dcss,
        rcu: &Rcu,
        node: *mut Node,
    ) -> Result<(), InsertError> {
        let key = (*node).key;
        loop {
            let ss = match self.find(dcss, rcu, key) {
                Ok(_) => return Err(InsertError::Exists),
                Err(ss) => ss,
            };
            (*node).set_next(dcss, ss.cur as usize);

            if (*ss.prev)
                .compare_exchange(
                    tag::to_value(ss.cur as usize),
                    tag::to_value(node as usize),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                if tag::is_logically_removed((*node).next_word(dcss)) {
                    // The node was claimed by a deleter while in flight
                    // between tables; let a traversal unlink it right away.
                    log::debug!("inserted a logically removed node, cleaning up");
                    let _ = self.find(dcss, rcu, key);
                }
                return Ok(());
            }
        }
    }

    /// Insert a detached node, gated on `successor` still being null.
    ///
    /// # Safety
    ///
    /// As for [`LfList::insert`]; `tid` must be the caller's descriptor
    /// slot.
    pub unsafe fn insert_dcss(
        &self,
        dcss: &Dcss,
        rcu: &Rcu,
        tid: usize,
        successor: &AtomicUsize,
        node: *mut Node,
    ) -> Result<(), InsertError> {
        let key = (*node).key;
        loop {
            let ss = match self.find(dcss, rcu, key) {
                Ok(_) => return Err(InsertError::Exists),
                Err(ss) => ss,
            };
            (*node).set_next(dcss, ss.cur as usize);

            match dcss.dcss_value(
                tid,
                successor,
                0,
                &*ss.prev,
                ss.cur as usize,
                node as usize,
            ) {
                DcssResult::Success => return Ok(()),
                DcssResult::FailedAddr1(_) => {
                    log::debug!("insert of {key} lost to a rebuild publication");
                    return Err(InsertError::MigrationStarted);
                }
                // Bucket head moved; ordinary contention.
                DcssResult::FailedAddr2(_) => continue,
            }
        }
    }

    /// Delete the node with `key`, setting `flag` as the removal mark.
    ///
    /// The mark CAS is the linearization point; the physical unlink is best
    /// effort and later traversals finish it on failure. `Ok` carries the
    /// snapshot of the victim.
    ///
    /// # Safety
    ///
    /// Caller must be inside a read section of `rcu`.
    pub unsafe fn delete(
        &self,
        dcss: &Dcss,
        rcu: &Rcu,
        key: u64,
        flag: usize,
    ) -> Result<Snapshot<Node>, ()> {
        debug_assert!(flag != 0 && tag::flags(flag) == flag);
        loop {
            let ss = match self.find(dcss, rcu, key) {
                Ok(ss) => ss,
                Err(_) => return Err(()),
            };
            let next = ss.next as usize;

            // Linearization point: mark the victim. The expected word has
            // no flags, so exactly one marker wins.
            if (*ss.cur)
                .next
                .compare_exchange(
                    tag::to_value(next),
                    tag::to_value(next | flag),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_err()
            {
                continue;
            }

            if (*ss.prev)
                .compare_exchange(
                    tag::to_value(ss.cur as usize),
                    tag::to_value(next),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                if flag == tag::LOGICALLY_REMOVED {
                    rcu.defer(Garbage::new_box(ss.cur));
                }
            } else {
                // Someone moved prev; a fresh traversal cleans up.
                let _ = self.find(dcss, rcu, key);
            }
            return Ok(ss);
        }
    }

    /// Free every node left in the list.
    ///
    /// # Safety
    ///
    /// No concurrent access of any kind; used from table teardown only.
    pub unsafe fn drain(&self, dcss: &Dcss) {
        let mut cur = self.head_node(dcss);
        while !cur.is_null() {
            let next = tag::ptr((*cur).next_word(dcss)) as *mut Node;
            drop(Box::from_raw(cur));
            cur = next;
        }
        self.head.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn fixture() -> (Dcss, Rcu, LfList) {
        (Dcss::new(8), Rcu::new(8), LfList::new())
    }

    #[test]
    fn insert_find_delete() {
        let (dcss, rcu, list) = fixture();
        unsafe {
            let g = rcu.read(0);
            for key in [5u64, 1, 9, 3] {
                list.insert(&dcss, &rcu, Node::alloc(key)).unwrap();
            }
            assert!(list.find(&dcss, &rcu, 3).is_ok());
            assert!(list.find(&dcss, &rcu, 4).is_err());

            // Ordered walk.
            let mut keys = Vec::new();
            let mut cur = list.head_node(&dcss);
            while !cur.is_null() {
                keys.push((*cur).key);
                cur = tag::ptr((*cur).next_word(&dcss)) as *mut Node;
            }
            assert_eq!(keys, vec![1, 3, 5, 9]);

            assert!(list
                .delete(&dcss, &rcu, 3, tag::LOGICALLY_REMOVED)
                .is_ok());
            assert!(list.find(&dcss, &rcu, 3).is_err());
            assert!(list
                .delete(&dcss, &rcu, 3, tag::LOGICALLY_REMOVED)
                .is_err());
            drop(g);
            list.drain(&dcss);
        }
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let (dcss, rcu, list) = fixture();
        unsafe {
            let _g = rcu.read(0);
            list.insert(&dcss, &rcu, Node::alloc(7)).unwrap();
            let dup = Node::alloc(7);
            assert_eq!(
                list.insert(&dcss, &rcu, dup),
                Err(InsertError::Exists)
            );
            drop(Box::from_raw(dup));
            list.drain(&dcss);
        }
    }

    #[test]
    fn dcss_insert_respects_the_gate() {
        let (dcss, rcu, list) = fixture();
        let successor = AtomicUsize::new(0);
        unsafe {
            let _g = rcu.read(0);
            list.insert_dcss(&dcss, &rcu, 0, &successor, Node::alloc(1))
                .unwrap();

            // Publish a "successor"; further gated inserts must re-route.
            successor.store(0x1000, Ordering::SeqCst);
            let node = Node::alloc(2);
            assert_eq!(
                list.insert_dcss(&dcss, &rcu, 0, &successor, node),
                Err(InsertError::MigrationStarted)
            );
            drop(Box::from_raw(node));
            assert!(list.find(&dcss, &rcu, 2).is_err());
            list.drain(&dcss);
        }
    }

    #[test]
    fn concurrent_disjoint_inserts() {
        const THREADS: usize = 8;
        const PER_THREAD: u64 = 500;

        let dcss = Arc::new(Dcss::new(THREADS));
        let rcu = Arc::new(Rcu::new(THREADS));
        let list = Arc::new(LfList::new());

        let mut joins = Vec::new();
        for t in 0..THREADS {
            let (dcss, rcu, list) = (dcss.clone(), rcu.clone(), list.clone());
            joins.push(thread::spawn(move || unsafe {
                for i in 0..PER_THREAD {
                    let _g = rcu.read(t);
                    list.insert(&dcss, &rcu, Node::alloc(i * THREADS as u64 + t as u64))
                        .unwrap();
                }
            }));
        }
        for j in joins {
            j.join().unwrap();
        }

        unsafe {
            let _g = rcu.read(0);
            for k in 0..THREADS as u64 * PER_THREAD {
                assert!(list.find(&dcss, &rcu, k).is_ok(), "missing key {k}");
            }
            drop(_g);
            list.drain(&dcss);
        }
    }

    #[test]
    fn concurrent_delete_is_idempotent() {
        const THREADS: usize = 4;

        for _ in 0..200 {
            let dcss = Arc::new(Dcss::new(THREADS));
            let rcu = Arc::new(Rcu::new(THREADS));
            let list = Arc::new(LfList::new());
            unsafe {
                let _g = rcu.read(0);
                list.insert(&dcss, &rcu, Node::alloc(42)).unwrap();
            }

            let mut joins = Vec::new();
            for t in 0..THREADS {
                let (dcss, rcu, list) = (dcss.clone(), rcu.clone(), list.clone());
                joins.push(thread::spawn(move || unsafe {
                    let _g = rcu.read(t);
                    list.delete(&dcss, &rcu, 42, tag::LOGICALLY_REMOVED).is_ok()
                }));
            }
            let wins: usize = joins.into_iter().map(|j| j.join().unwrap() as usize).sum();
            assert_eq!(wins, 1, "exactly one delete may claim the node");
        }
    }
}
