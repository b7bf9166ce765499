//! Lazy-locking ordered list with wait-free lookups.
//!
//! Lookups never lock, never restart and traverse strictly increasing keys,
//! so they are wait-free. Updates take the per-node locks of the
//! predecessor and the current node, re-validate the window, and splice
//! with release stores. The list is framed by MIN and MAX sentinels so no
//! operation ever runs off an empty list.
//!
//! Client keys must lie strictly between [`MIN_KEY`] and [`MAX_KEY`].

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::rcu::{Garbage, Rcu};
use crate::tag;

/// Key of the head sentinel.
pub const MIN_KEY: u64 = 0;
/// Key of the tail sentinel.
pub const MAX_KEY: u64 = u64::MAX;

/// A list node with its own lock.
#[repr(align(8))]
pub struct Node {
    pub key: u64,
    next: AtomicUsize,
    lock: Mutex<()>,
}

impl Node {
    /// Allocate a detached node.
    pub fn alloc(key: u64) -> *mut Node {
        Box::into_raw(Box::new(Node {
            key,
            next: AtomicUsize::new(0),
            lock: Mutex::new(()),
        }))
    }

    /// The next word: tagged pointer, plain form.
    pub fn next_word(&self) -> usize {
        self.next.load(Ordering::SeqCst)
    }

    /// Point this node at `next`, preserving its own flag bits.
    pub fn set_next(&self, next: usize) {
        debug_assert_eq!(tag::flags(next), 0);
        loop {
            let old = self.next.load(Ordering::SeqCst);
            let new = tag::with_flags(next, tag::flags(old));
            if self
                .next
                .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Clear a flag bit on this node's next word.
    pub fn clear_flag(&self, flag: usize) {
        loop {
            let old = self.next.load(Ordering::SeqCst);
            if self
                .next
                .compare_exchange(old, old & !flag, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    /// One attempt at setting `LOGICALLY_REMOVED`, expecting the next word
    /// read by the caller.
    ///
    /// Used by deleters claiming a node through the hazard slot; the caller
    /// re-reads both the slot and the next word between attempts.
    pub fn mark_removed(&self, expected: usize) -> bool {
        debug_assert!(!tag::is_logically_removed(expected));
        self.next
            .compare_exchange(
                expected,
                expected | tag::LOGICALLY_REMOVED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    fn is_removed(&self) -> bool {
        tag::is_removed(self.next.load(Ordering::SeqCst))
    }
}

/// Insert failure.
#[derive(Debug, PartialEq, Eq)]
pub enum InsertError {
    /// A live node with the same key is already present.
    Exists,
}

/// An ordered list framed by MIN/MAX sentinels.
pub struct WfList {
    head: *mut Node,
}

unsafe impl Send for WfList {}
unsafe impl Sync for WfList {}

impl WfList {
    pub fn new() -> WfList {
        let max = Node::alloc(MAX_KEY);
        let min = Node::alloc(MIN_KEY);
        unsafe {
            (*min).next.store(max as usize, Ordering::SeqCst);
        }
        WfList { head: min }
    }

    /// First node after the MIN sentinel (possibly the MAX sentinel).
    pub fn first(&self) -> *mut Node {
        unsafe { tag::ptr((*self.head).next_word()) as *mut Node }
    }

    /// Wait-free lookup: a plain monotone walk.
    ///
    /// # Safety
    ///
    /// Caller must be inside a read section of the owning table's `Rcu`.
    pub unsafe fn find(&self, key: u64) -> Option<*mut Node> {
        debug_assert!(key > MIN_KEY && key < MAX_KEY, "sentinel key in find");

        let mut cur = self.head;
        while (*cur).key < key {
            cur = tag::ptr((*cur).next_word()) as *mut Node;
        }
        if (*cur).key == key && !(*cur).is_removed() {
            Some(cur)
        } else {
            None
        }
    }

    /// Both nodes alive and still adjacent.
    unsafe fn validate(prev: *mut Node, cur: *mut Node) -> bool {
        !(*prev).is_removed()
            && !(*cur).is_removed()
            && (*prev).next.load(Ordering::SeqCst) == cur as usize
    }

    /// Walk to the first node with a key >= `key`, unlocked.
    unsafe fn locate(&self, key: u64) -> (*mut Node, *mut Node) {
        let mut prev = self.head;
        let mut cur = tag::ptr((*prev).next_word()) as *mut Node;
        while (*cur).key < key {
            prev = cur;
            cur = tag::ptr((*cur).next_word()) as *mut Node;
        }
        (prev, cur)
    }

    /// Unlink `cur` from behind `prev`, both locked by the caller.
    ///
    /// A node marked `IS_BEING_DISTRIBUTED` stays owned by the rebuild
    /// worker and is not handed to reclamation.
    unsafe fn unlink_locked(&self, rcu: &Rcu, prev: *mut Node, cur: *mut Node) {
        let cur_flags = tag::flags((*cur).next_word());
        (*prev).set_next(tag::ptr((*cur).next_word()));
        if cur_flags == tag::LOGICALLY_REMOVED {
            rcu.defer(Garbage::new_box(cur));
        }
    }

    /// Insert a detached node.
    ///
    /// # Safety
    ///
    /// Caller must be inside a read section; `node` must be detached and
    /// unaliased, with a key strictly between the sentinels.
    pub unsafe fn insert(&self, rcu: &Rcu, node: *mut Node) -> Result<(), InsertError> {
        let key = (*node).key;
        debug_assert!(key > MIN_KEY && key < MAX_KEY, "sentinel key in insert");

        loop {
            let (prev, cur) = self.locate(key);
            let _pl = (*prev).lock.lock();
            let _cl = (*cur).lock.lock();

            if Self::validate(prev, cur) {
                if (*cur).key == key {
                    return Err(InsertError::Exists);
                }
                // The node's own flags survive the splice: a rebuild worker
                // may be inserting a node a deleter already claimed.
                (*node).set_next(cur as usize);
                (*prev).next.store(node as usize, Ordering::SeqCst);
                return Ok(());
            }

            // If the window broke because cur got marked while still
            // linked (a hazard-slot delete landing after reinsertion),
            // clean it out so retries make progress.
            if !(*prev).is_removed()
                && (*prev).next.load(Ordering::SeqCst) == cur as usize
                && tag::flags((*cur).next_word()) == tag::LOGICALLY_REMOVED
            {
                self.unlink_locked(rcu, prev, cur);
            }
        }
    }

    /// Delete the node with `key`, setting `flag` as the removal mark.
    ///
    /// Unlike the lock-free engine, marking and unlinking both happen under
    /// the two node locks, so the unlink is not best-effort. `Ok` carries
    /// the victim.
    ///
    /// # Safety
    ///
    /// Caller must be inside a read section.
    pub unsafe fn delete(&self, rcu: &Rcu, key: u64, flag: usize) -> Result<*mut Node, ()> {
        debug_assert!(key > MIN_KEY && key < MAX_KEY, "sentinel key in delete");
        debug_assert!(flag != 0 && tag::flags(flag) == flag);

        loop {
            let (prev, cur) = self.locate(key);
            let _pl = (*prev).lock.lock();
            let _cl = (*cur).lock.lock();

            if Self::validate(prev, cur) {
                if (*cur).key != key {
                    return Err(());
                }
                // Claim the node. A deleter working through the hazard slot
                // marks without taking the locks, so the mark must be a CAS
                // that concedes once LOGICALLY_REMOVED appears: exactly one
                // claimer wins.
                loop {
                    let next = (*cur).next_word();
                    if tag::is_logically_removed(next) {
                        self.unlink_locked(rcu, prev, cur);
                        return Err(());
                    }
                    if (*cur)
                        .next
                        .compare_exchange(next, next | flag, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        break;
                    }
                }
                (*prev).set_next(tag::ptr((*cur).next_word()));
                if flag == tag::LOGICALLY_REMOVED {
                    rcu.defer(Garbage::new_box(cur));
                }
                return Ok(cur);
            }

            if !(*prev).is_removed()
                && (*prev).next.load(Ordering::SeqCst) == cur as usize
                && tag::flags((*cur).next_word()) == tag::LOGICALLY_REMOVED
            {
                self.unlink_locked(rcu, prev, cur);
            }
        }
    }

    /// Unlink a specific marked node wherever it sits in the list.
    ///
    /// Used by the rebuild worker after reinserting a node that a deleter
    /// claimed through the hazard slot. No-op if the node is not linked.
    ///
    /// # Safety
    ///
    /// Caller must be inside a read section; `node` must be a node of this
    /// list or detached.
    pub unsafe fn unlink_marked(&self, rcu: &Rcu, node: *mut Node) {
        loop {
            let mut prev = self.head;
            let mut cur = tag::ptr((*prev).next_word()) as *mut Node;
            while (*cur).key < (*node).key {
                prev = cur;
                cur = tag::ptr((*cur).next_word()) as *mut Node;
            }
            if cur != node {
                return;
            }

            let _pl = (*prev).lock.lock();
            let _cl = (*cur).lock.lock();
            if !(*prev).is_removed() && (*prev).next.load(Ordering::SeqCst) == cur as usize {
                debug_assert!(tag::is_logically_removed((*cur).next_word()));
                self.unlink_locked(rcu, prev, cur);
                return;
            }
            // Window moved; take another look.
        }
    }

    /// Free every node, sentinels included.
    ///
    /// # Safety
    ///
    /// No concurrent access of any kind; table teardown only.
    pub unsafe fn drain(&self) {
        let mut cur = self.head;
        loop {
            let next = tag::ptr((*cur).next_word()) as *mut Node;
            let is_tail = (*cur).key == MAX_KEY;
            drop(Box::from_raw(cur));
            if is_tail {
                break;
            }
            cur = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn insert_find_delete() {
        let rcu = Rcu::new(1);
        let list = WfList::new();
        unsafe {
            let _g = rcu.read(0);
            for key in [5u64, 1, 9] {
                list.insert(&rcu, Node::alloc(key)).unwrap();
            }
            assert!(list.find(5).is_some());
            assert!(list.find(4).is_none());
            assert!(list.delete(&rcu, 5, tag::LOGICALLY_REMOVED).is_ok());
            assert!(list.find(5).is_none());
            assert!(list.delete(&rcu, 5, tag::LOGICALLY_REMOVED).is_err());
            drop(_g);
            list.drain();
        }
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let rcu = Rcu::new(1);
        let list = WfList::new();
        unsafe {
            let _g = rcu.read(0);
            list.insert(&rcu, Node::alloc(3)).unwrap();
            let dup = Node::alloc(3);
            assert_eq!(list.insert(&rcu, dup), Err(InsertError::Exists));
            drop(Box::from_raw(dup));
            drop(_g);
            list.drain();
        }
    }

    #[test]
    fn lookups_race_updates() {
        const KEYS: u64 = 256;

        let rcu = Arc::new(Rcu::new(3));
        let list = Arc::new(WfList::new());

        let updater = {
            let (rcu, list) = (rcu.clone(), list.clone());
            thread::spawn(move || unsafe {
                for round in 0..50 {
                    for k in 1..=KEYS {
                        let _g = rcu.read(0);
                        if round % 2 == 0 {
                            let _ = list.insert(&rcu, Node::alloc(k));
                        } else {
                            let _ = list.delete(&rcu, k, tag::LOGICALLY_REMOVED);
                        }
                    }
                }
            })
        };
        let reader = {
            let (rcu, list) = (rcu.clone(), list.clone());
            thread::spawn(move || unsafe {
                for _ in 0..20_000 {
                    let _g = rcu.read(1);
                    // Whatever the interleaving, the walk must terminate
                    // and report a consistent answer.
                    let _ = list.find(1 + rand::random::<u64>() % KEYS);
                }
            })
        };

        updater.join().unwrap();
        reader.join().unwrap();
        rcu.synchronize(2);
    }
}
