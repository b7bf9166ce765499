//! Split-ordered list.
//!
//! One global lock-free list holds every node of the table, sorted by
//! *reversed-bit* hash. Bucket `b` is nothing but a pointer into that list,
//! at the dummy node whose original key is `b`. Because the sort order is
//! the bit-reversed hash, doubling the bucket count splits every bucket's
//! segment in place: resizing never moves a node.
//!
//! Regular keys hash to odd reversed values, dummy keys to even ones, so
//! the low bit of the stored hash discriminates the two. Ordering ties on
//! the hash are broken by the key, which keeps two colliding regular keys
//! both reachable.

use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::list::Snapshot;
use crate::rcu::{Garbage, Rcu};
use crate::tag;

/// Reversed-bit hash of a regular key's hash value.
#[inline]
pub fn hash_regular(h: u32) -> u32 {
    (h | 0x8000_0000).reverse_bits()
}

/// Reversed-bit hash of a bucket index, for dummy nodes.
#[inline]
pub fn hash_dummy(bucket: u32) -> u32 {
    (bucket & 0x7fff_ffff).reverse_bits()
}

/// Dummy nodes carry an even reversed hash.
#[inline]
pub fn is_dummy(hash: u32) -> bool {
    hash & 1 == 0
}

/// Regular nodes carry an odd reversed hash.
#[inline]
pub fn is_regular(hash: u32) -> bool {
    hash & 1 == 1
}

/// The parent of bucket `b`: `b` with its highest set bit cleared.
#[inline]
pub fn parent_bucket(b: usize) -> usize {
    debug_assert!(b > 0, "bucket 0 has no parent");
    b & !(1usize << (usize::BITS - 1 - b.leading_zeros()))
}

/// A node of the global list.
#[repr(align(8))]
pub struct Node {
    pub key: u64,
    /// Reversed-bit hash; the list's sort key.
    pub hash: u32,
    next: AtomicUsize,
}

impl Node {
    /// Allocate a detached regular node.
    pub fn alloc(key: u64, hash: u32) -> *mut Node {
        Box::into_raw(Box::new(Node {
            key,
            hash,
            next: AtomicUsize::new(0),
        }))
    }

    /// Allocate the dummy node anchoring `bucket`.
    pub fn alloc_dummy(bucket: usize) -> *mut Node {
        Node::alloc(bucket as u64, hash_dummy(bucket as u32))
    }

    pub fn next_word(&self) -> usize {
        self.next.load(Ordering::SeqCst)
    }

    fn set_next(&self, next: usize) {
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
}

/// Total order of the global list.
#[inline]
fn precedes(a_hash: u32, a_key: u64, b_hash: u32, b_key: u64) -> bool {
    a_hash < b_hash || (a_hash == b_hash && a_key < b_key)
}

/// Walk the segment starting at `head` to `(hash, key)`.
///
/// `Ok` carries the snapshot of a live exact match, `Err` the insertion
/// point. Marked nodes are physically unlinked in passing.
///
/// # Safety
///
/// Caller must be inside a read section of `rcu`; `head` must anchor into
/// the global list (a bucket head or the list head).
pub unsafe fn find(
    rcu: &Rcu,
    head: &AtomicUsize,
    key: u64,
    hash: u32,
) -> Result<Snapshot<Node>, Snapshot<Node>> {
    'retry: loop {
        let mut prev: *const AtomicUsize = head;
        let mut cur = tag::ptr((*prev).load(Ordering::SeqCst)) as *mut Node;

        loop {
            if cur.is_null() {
                return Err(Snapshot {
                    prev,
                    cur: ptr::null_mut(),
                    next: ptr::null_mut(),
                });
            }
            let next_word = (*cur).next_word();
            let next = tag::ptr(next_word) as *mut Node;
            let cmark = tag::flags(next_word);
            let chash = (*cur).hash;
            let ckey = (*cur).key;

            if (*prev).load(Ordering::SeqCst) != cur as usize {
                continue 'retry;
            }

            if cmark == 0 {
                if !precedes(chash, ckey, hash, key) {
                    let ss = Snapshot { prev, cur, next };
                    return if chash == hash && ckey == key {
                        Ok(ss)
                    } else {
                        Err(ss)
                    };
                }
                prev = &(*cur).next;
            } else {
                if (*prev)
                    .compare_exchange(
                        cur as usize,
                        next as usize,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    if cmark == tag::LOGICALLY_REMOVED {
                        rcu.defer(Garbage::new_box(cur));
                    }
                } else {
                    continue 'retry;
                }
            }
            cur = next;
        }
    }
}

/// Insert a detached node into the segment at `head`.
///
/// On a duplicate the existing node is reported and *no* store of any kind
/// is attempted; the caller decides whether to adopt it (dummy
/// initialization does) or surface an error (the facade does).
///
/// # Safety
///
/// As for [`find`]; `node` must be detached and unaliased.
pub unsafe fn insert(
    rcu: &Rcu,
    head: &AtomicUsize,
    node: *mut Node,
) -> Result<(), *mut Node> {
    let key = (*node).key;
    let hash = (*node).hash;

    loop {
        let ss = match find(rcu, head, key, hash) {
            Ok(ss) => return Err(ss.cur),
            Err(ss) => ss,
        };
        (*node).set_next(ss.cur as usize);
        if (*ss.prev)
            .compare_exchange(
                ss.cur as usize,
                node as usize,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            return Ok(());
        }
    }
}

/// Delete the live node matching `(hash, key)` from the segment at `head`.
///
/// # Safety
///
/// As for [`find`].
pub unsafe fn delete(
    rcu: &Rcu,
    head: &AtomicUsize,
    key: u64,
    hash: u32,
    flag: usize,
) -> Result<*mut Node, ()> {
    debug_assert!(flag != 0 && tag::flags(flag) == flag);
    loop {
        let ss = match find(rcu, head, key, hash) {
            Ok(ss) => ss,
            Err(_) => return Err(()),
        };
        let next = ss.next as usize;

        // Linearization point.
        if (*ss.cur)
            .next
            .compare_exchange(next, next | flag, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            continue;
        }

        if (*ss.prev)
            .compare_exchange(
                ss.cur as usize,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            if flag == tag::LOGICALLY_REMOVED {
                rcu.defer(Garbage::new_box(ss.cur));
            }
        } else {
            let _ = find(rcu, head, key, hash);
        }
        return Ok(ss.cur);
    }
}

/// Number of regular nodes in the segment anchored at `head_node`, up to
/// the next dummy.
///
/// # Safety
///
/// Caller must be inside a read section.
pub unsafe fn segment_len(head_node: *mut Node) -> usize {
    if head_node.is_null() {
        return 0;
    }
    let mut count = 0;
    let mut cur = tag::ptr((*head_node).next_word()) as *mut Node;
    while !cur.is_null() && is_regular((*cur).hash) {
        count += 1;
        cur = tag::ptr((*cur).next_word()) as *mut Node;
    }
    count
}
