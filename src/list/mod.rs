//! Bucket list engines.
//!
//! Every hash-table variant stores its collisions in some flavor of
//! singly-linked list. The engines here share one semantic interface —
//! ordered insert, exact-key find, delete-with-flag — and report their
//! position through a [`Snapshot`] of `{prev, cur, next}`.
//!
//! Three engines live in this module:
//!
//! - [`lf`] — a lock-free ordered list whose words are stored in DCSS value
//!   form, so inserts can be anchored on a second location.
//! - [`wf`] — a lazy-locking ordered list whose lookups are wait-free: they
//!   never lock, never restart and walk strictly monotonically between MIN
//!   and MAX sentinels.
//! - [`split`] — a split-ordered list: a single global list sorted by
//!   reversed-bit hash, with dummy nodes anchoring bucket starts.
//!
//! The fourth bucket engine (the per-bucket locked chain with nulls
//! markers) is so entangled with its table's migration protocol that it
//! lives with it, in [`crate::table::rht`].
//!
//! Callers must be inside a read-side critical section of the owning
//! table's [`crate::rcu::Rcu`] for every engine call; the engines unlink
//! nodes in-line and hand them to reclamation on the assumption that
//! concurrent traversals are protected.

pub mod lf;
pub mod split;
pub mod wf;

use std::sync::atomic::AtomicUsize;

/// A traversal position.
///
/// `prev` addresses the cell that pointed at `cur` when the snapshot was
/// taken: either a bucket head or the `next` word of the predecessor node.
pub struct Snapshot<N> {
    /// The cell whose CAS moves `cur` in or out of the list.
    pub prev: *const AtomicUsize,
    /// The node the operation landed on, or null past the end.
    pub cur: *mut N,
    /// `cur`'s successor at snapshot time.
    pub next: *mut N,
}
