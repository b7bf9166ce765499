//! # `rehash` — concurrent hash tables that can rebuild their hash function
//!
//! This crate implements a family of concurrent, resizable hash tables whose
//! defining capability is *dynamic hash-function rebuilding*: at runtime a
//! table may atomically replace its bucket count and/or its hash seed while
//! readers and writers keep operating with bounded interference.
//!
//! ## Overview
//!
//! Four variants share one external contract and differ in their bucket
//! engine and rebuild coordination:
//!
//! - [`DcssTable`] — buckets are lock-free ordered lists; inserts into a
//!   table that might be mid-rebuild go through a double-compare-single-swap
//!   ([`dcss`]) so they cannot race with the transition that first exposes a
//!   successor table. Rebuilds run across multiple worker threads.
//! - [`WfTable`] — buckets are lazy-locking lists with wait-free lookups;
//!   rebuilds run on the calling thread.
//! - [`RhtTable`] — per-bucket spinlocks for updates, grace-period protected
//!   lookups, and nulls-marker sentinels at list ends so a lookup can detect
//!   that it wandered into the wrong bucket during a rebuild.
//! - [`SplitTable`] — one global split-ordered list with dummy nodes marking
//!   bucket starts; a "rebuild" publishes a new bucket count without moving
//!   a single node.
//!
//! All four route through the [`table::HashTable`] trait, so benchmarks and
//! policies are written once.
//!
//! ## Memory reclamation
//!
//! Nodes unlinked from a bucket may still be referenced by concurrent
//! readers. The [`rcu`] module provides the reclamation service the tables
//! are built on: read-side critical sections ([`rcu::Rcu::read`]), grace
//! periods ([`rcu::Rcu::synchronize`]) and deferred destruction
//! ([`rcu::Rcu::defer`]). Nothing is freed while a reader that could reach
//! it is still inside its critical section.
//!
//! ## Thread ids
//!
//! Every operation takes a small dense thread id (`tid`). The id indexes the
//! caller's reader slot and — for [`DcssTable`] — its descriptor slot. Each
//! OS thread must use its own id, below the capacity the table was built
//! with. This is the same discipline the per-thread descriptor table
//! requires anyway, so the crate embraces it instead of hiding it behind
//! thread-local magic.
//!
//! ## Example
//!
//! ```
//! use rehash::table::{HashTable, TableBuilder};
//!
//! // One client thread (tid 0).
//! let table = TableBuilder::new().nbuckets(64).client_threads(1).build_wf();
//! table.add(0, 42).unwrap();
//! assert!(table.lookup(0, 42).is_some());
//! table.rebuild(0, 128, None).unwrap();
//! assert!(table.lookup(0, 42).is_some());
//! assert_eq!(table.nbuckets(), 128);
//! ```

#[macro_use]
extern crate quick_error;

pub mod dcss;
pub mod harness;
pub mod list;
pub mod policy;
pub mod rcu;
pub mod tag;
pub mod table;

pub use table::dcss::DcssTable;
pub use table::rht::RhtTable;
pub use table::split::SplitTable;
pub use table::wf::WfTable;
