//! The hash-table facade.
//!
//! Everything the four variants share lives here: the [`HashTable`] trait
//! they implement, the [`KeyOps`] capability record stored on every table
//! instance, the status errors of the external contract, the load-signal
//! flags the resize policy polls, and the tuning knobs.
//!
//! Variant selection is a type-level affair: [`TableBuilder`] builds one of
//! four concrete types, and generic code (the resize policy, the torture
//! harness, the tests) is written once against the trait.

pub mod dcss;
pub mod rht;
pub mod split;
pub mod wf;

use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

/// Seeded hash, compare and key-extraction functions of a table instance.
///
/// The record is immutable once stored on an instance; a rebuild may swap
/// in a whole new record together with the new instance. Every function
/// must be callable from inside a read-side critical section, so none of
/// them may allocate or block.
#[derive(Clone, Copy)]
pub struct KeyOps {
    /// Hash a key under a seed.
    pub hash: fn(u64, u32) -> u64,
    /// Whether a node's key matches a queried key, under a seed.
    pub cmp: fn(u64, u64, u32) -> bool,
    /// Extract the comparable key from a node's stored key.
    pub getkey: fn(u64) -> u64,
}

impl KeyOps {
    /// Identity hashing: the key is its own hash. The default.
    pub fn identity() -> KeyOps {
        KeyOps {
            hash: |key, _seed| key,
            cmp: |node_key, key, _seed| node_key == key,
            getkey: |key| key,
        }
    }

    /// Seeded hashing. Reseeding on rebuild only redistributes keys when
    /// the hash actually uses the seed, so this is the record rebuild
    /// benchmarks run with.
    pub fn seeded() -> KeyOps {
        KeyOps {
            hash: seeded_hash,
            cmp: |node_key, key, _seed| node_key == key,
            getkey: |key| key,
        }
    }
}

impl Default for KeyOps {
    fn default() -> KeyOps {
        KeyOps::identity()
    }
}

/// Seeded 64-bit hash of a key.
pub fn seeded_hash(key: u64, seed: u32) -> u64 {
    seahash::hash_seeded(
        &key.to_le_bytes(),
        seed as u64,
        0x9e37_79b9_7f4a_7c15,
        0x6c62_272e_07bb_0142,
        0x2f72_3602_1314_8d1f,
    )
}

/// Identity token for a node returned by a lookup.
///
/// The token compares by node instance, which is what the contract is
/// about: a lookup after a no-move rebuild returns the *same* node. It
/// carries the key but deliberately offers no dereference — the node's
/// lifetime is governed by grace periods, not by this token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeRef {
    ptr: *const (),
    key: u64,
}

impl NodeRef {
    pub(crate) fn new(ptr: *const (), key: u64) -> NodeRef {
        NodeRef { ptr, key }
    }

    /// The key the node was found under.
    pub fn key(&self) -> u64 {
        self.key
    }
}

quick_error! {
    /// Insert failure.
    #[derive(Debug, PartialEq, Eq)]
    pub enum AddError {
        /// A live node with this key is already present.
        Exists {
            display("an entry with this key already exists")
        }
    }
}

quick_error! {
    /// Delete failure.
    #[derive(Debug, PartialEq, Eq)]
    pub enum DelError {
        /// No live node with this key is resident.
        NotFound {
            display("no entry with this key is resident")
        }
    }
}

quick_error! {
    /// Rebuild failure. The table is left in its pre-call state.
    #[derive(Debug, PartialEq, Eq)]
    pub enum RebuildError {
        /// Another rebuild holds the migration mutex.
        Busy {
            display("a rebuild is already in progress")
        }
        /// The requested bucket count cannot be accommodated.
        NoMem {
            display("the requested bucket count exceeds the table bound")
        }
    }
}

/// Resize-request flags, polled and cleared by the resize policy.
///
/// Raising is idempotent: requests do not pile up while the policy is
/// busy.
#[derive(Default)]
pub struct LoadSignals {
    enlarge: AtomicUsize,
    shrink: AtomicUsize,
}

impl LoadSignals {
    pub fn new() -> LoadSignals {
        LoadSignals::default()
    }

    pub fn raise_enlarge(&self) {
        if self.enlarge.load(Ordering::Relaxed) == 0 {
            self.enlarge.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn raise_shrink(&self) {
        if self.shrink.load(Ordering::Relaxed) == 0 {
            self.shrink.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Consume a pending enlarge request.
    pub fn take_enlarge(&self) -> bool {
        self.enlarge.swap(0, Ordering::Relaxed) != 0
    }

    /// Consume a pending shrink request.
    pub fn take_shrink(&self) -> bool {
        self.shrink.swap(0, Ordering::Relaxed) != 0
    }
}

/// Tuning knobs of a table.
#[derive(Clone, Copy, Debug)]
pub struct TableTuning {
    /// A bucket growing past this raises an enlarge request.
    pub max_list_length: isize,
    /// Average load dropping below this raises a shrink request.
    /// Zero disables the signal.
    pub min_avg_load_factor: isize,
    /// Whether a rebuild bumps the hash seed (rebuild) or keeps it
    /// (resize).
    pub rebuild_seed: bool,
    /// Worker threads a multi-worker rebuild spawns.
    pub rebuild_threads: usize,
    /// Hard bound on the bucket count.
    pub max_nbuckets: usize,
}

/// Most rebuild workers a table will ever spawn.
pub const MAX_REBUILD_THREADS: usize = 32;

impl Default for TableTuning {
    fn default() -> TableTuning {
        TableTuning {
            max_list_length: 64,
            min_avg_load_factor: 0,
            rebuild_seed: false,
            rebuild_threads: 1,
            max_nbuckets: 1024 * 64,
        }
    }
}

/// The facade contract every variant implements.
///
/// All methods take the caller's dense thread id; see the crate docs for
/// the id discipline. Every method wraps itself in a read-side critical
/// section — callers never manage guards.
pub trait HashTable: Send + Sync {
    /// Look up a key across the current table, any in-flight nodes, and
    /// the successor table.
    fn lookup(&self, tid: usize, key: u64) -> Option<NodeRef>;

    /// Insert a key. Exactly one of two concurrent inserts of the same key
    /// succeeds.
    fn add(&self, tid: usize, key: u64) -> Result<(), AddError>;

    /// Delete the node holding a key. Exactly one of two concurrent
    /// deletes of the same node succeeds.
    fn del(&self, tid: usize, key: u64) -> Result<(), DelError>;

    /// Change the bucket count (and, in rebuild mode, the hash seed),
    /// redistributing nodes while readers and writers continue.
    ///
    /// `ops` optionally replaces the hash/compare/getkey record.
    fn rebuild(&self, tid: usize, nbuckets: usize, ops: Option<KeyOps>)
        -> Result<(), RebuildError>;

    /// Current bucket count.
    fn nbuckets(&self) -> usize;

    /// Live nodes, up to in-flight slack during a rebuild.
    fn len(&self) -> usize;

    /// The resize-request flags of this table.
    fn signals(&self) -> &LoadSignals;

    /// The tuning knobs of this table.
    fn tuning(&self) -> &TableTuning;

    /// Wait a grace period and destroy everything it covers.
    fn quiesce(&self, tid: usize);

    /// Variant name, for logs and reports.
    fn variant(&self) -> &'static str;
}

/// Builder for the four table variants.
pub struct TableBuilder {
    nbuckets: usize,
    seed: u32,
    ops: KeyOps,
    tuning: TableTuning,
    client_threads: usize,
}

impl TableBuilder {
    pub fn new() -> TableBuilder {
        TableBuilder {
            nbuckets: 1024,
            seed: 0,
            ops: KeyOps::identity(),
            tuning: TableTuning::default(),
            client_threads: 1,
        }
    }

    /// Initial bucket count.
    pub fn nbuckets(mut self, n: usize) -> Self {
        self.nbuckets = n;
        self
    }

    /// Initial hash seed.
    pub fn seed(mut self, seed: u32) -> Self {
        self.seed = seed;
        self
    }

    /// The hash/compare/getkey record.
    pub fn ops(mut self, ops: KeyOps) -> Self {
        self.ops = ops;
        self
    }

    pub fn tuning(mut self, tuning: TableTuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// How many client thread ids the table must accommodate. Rebuild
    /// workers get their own ids on top of these.
    pub fn client_threads(mut self, n: usize) -> Self {
        self.client_threads = n;
        self
    }

    pub fn build_dcss(self) -> dcss::DcssTable {
        dcss::DcssTable::alloc(
            self.nbuckets,
            self.ops,
            self.seed,
            self.tuning,
            self.client_threads,
        )
    }

    pub fn build_wf(self) -> wf::WfTable {
        wf::WfTable::alloc(
            self.nbuckets,
            self.ops,
            self.seed,
            self.tuning,
            self.client_threads,
        )
    }

    pub fn build_rht(self) -> rht::RhtTable {
        rht::RhtTable::alloc(
            self.nbuckets,
            self.ops,
            self.seed,
            self.tuning,
            self.client_threads,
        )
    }

    pub fn build_split(self) -> split::SplitTable {
        split::SplitTable::alloc(
            self.nbuckets,
            self.ops,
            self.seed,
            self.tuning,
            self.client_threads,
        )
    }
}

impl Default for TableBuilder {
    fn default() -> Self {
        TableBuilder::new()
    }
}

/// Bump a bucket's node counter, raising the enlarge signal past the
/// threshold.
pub(crate) fn note_insert(nnodes: &AtomicIsize, tuning: &TableTuning, signals: &LoadSignals) {
    if nnodes.fetch_add(1, Ordering::Relaxed) + 1 > tuning.max_list_length {
        signals.raise_enlarge();
    }
}

/// Drop a bucket's node counter. A negative counter is an invariant
/// violation, not an operational error.
pub(crate) fn note_remove(nnodes: &AtomicIsize) {
    let after = nnodes.fetch_sub(1, Ordering::Relaxed) - 1;
    if after < 0 {
        log::error!("bucket node counter went negative ({after})");
        debug_assert!(false, "bucket node counter went negative");
    }
}

/// Check the table-wide average load and raise the shrink signal when it
/// falls below the configured floor.
pub(crate) fn note_load(live: isize, nbuckets: usize, tuning: &TableTuning, signals: &LoadSignals) {
    if tuning.min_avg_load_factor > 0
        && nbuckets > 0
        && live / (nbuckets as isize) < tuning.min_avg_load_factor
    {
        signals.raise_shrink();
    }
}
