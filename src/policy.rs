//! The resize/rebuild policy.
//!
//! A table does not resize itself; a dedicated resize thread runs
//! [`resize_loop`] against it. Two modes:
//!
//! - *Repeated resize* — alternate between two bucket counts every
//!   `wait_ms`, regardless of load. This is the torture mode: it keeps a
//!   migration in flight almost permanently.
//! - *Signal-driven* — poll the table's [`crate::table::LoadSignals`]: an
//!   enlarge request
//!   multiplies the bucket count, a shrink request divides it, and quiet
//!   tables are left alone.
//!
//! A `Busy` result from the table means another rebuild is still running;
//! the request is put back and retried on the next tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::table::{HashTable, RebuildError};

/// Parameters of the resize thread.
#[derive(Clone, Copy, Debug)]
pub struct ResizePolicy {
    /// Growth multiplier.
    pub mult: usize,
    /// Shrink divisor.
    pub div: usize,
    /// Milliseconds between resize attempts.
    pub wait_ms: u64,
    /// Alternate between two sizes instead of polling the load signals.
    pub repeatedly: bool,
}

impl Default for ResizePolicy {
    fn default() -> ResizePolicy {
        ResizePolicy {
            mult: 1,
            div: 1,
            wait_ms: 1,
            repeatedly: true,
        }
    }
}

/// Drive resizes until `run` goes false. Returns the number of completed
/// rebuilds.
pub fn resize_loop<T: HashTable + ?Sized>(
    table: &T,
    tid: usize,
    policy: ResizePolicy,
    run: &AtomicBool,
) -> u64 {
    let max_nbuckets = table.tuning().max_nbuckets;
    let div = policy.div.max(1);
    let mult = policy.mult.max(1);

    // The two sizes the repeated mode alternates between.
    let mut sizes = [table.nbuckets(), 0];
    sizes[1] = (sizes[0] * mult / div).max(1);
    if sizes[1] > max_nbuckets {
        log::error!(
            "resize target {} exceeds the table bound {}",
            sizes[1],
            max_nbuckets
        );
        return 0;
    }
    log::info!("resize thread running ({} <-> {})", sizes[0], sizes[1]);

    let mut flip = 0usize;
    let mut nresizes = 0u64;
    while run.load(Ordering::Relaxed) {
        if policy.wait_ms > 0 {
            thread::sleep(Duration::from_millis(policy.wait_ms));
            if !run.load(Ordering::Relaxed) {
                break;
            }
        }

        if policy.repeatedly {
            flip += 1;
            match table.rebuild(tid, sizes[flip & 1], None) {
                Ok(()) => nresizes += 1,
                Err(RebuildError::Busy) => {}
                Err(e) => {
                    log::error!("rebuild to {} failed: {e}", sizes[flip & 1]);
                    break;
                }
            }
            continue;
        }

        let signals = table.signals();
        let current = sizes[flip & 1];
        let target = if signals.take_enlarge() {
            let target = current * mult;
            if target > max_nbuckets {
                log::error!("enlarge target {target} exceeds the table bound, stopping");
                break;
            }
            target
        } else if signals.take_shrink() {
            (current / div).max(1)
        } else {
            thread::sleep(Duration::from_millis(1));
            continue;
        };

        match table.rebuild(tid, target, None) {
            Ok(()) => {
                nresizes += 1;
                flip += 1;
                sizes[flip & 1] = target;
                log::debug!("resized {} -> {}", current, target);
            }
            Err(RebuildError::Busy) => {
                // Put the request back; next tick retries.
                if target > current {
                    signals.raise_enlarge();
                } else {
                    signals.raise_shrink();
                }
            }
            Err(e) => {
                log::error!("rebuild to {target} failed: {e}");
                break;
            }
        }
    }

    nresizes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TableBuilder;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn repeated_mode_oscillates() {
        let table = Arc::new(
            TableBuilder::new()
                .nbuckets(8)
                .client_threads(2)
                .build_wf(),
        );
        for k in 1..=128u64 {
            table.add(0, k).unwrap();
        }

        let run = Arc::new(AtomicBool::new(true));
        let handle = {
            let (table, run) = (table.clone(), run.clone());
            std::thread::spawn(move || {
                resize_loop(
                    &*table,
                    1,
                    ResizePolicy {
                        mult: 2,
                        div: 1,
                        wait_ms: 0,
                        repeatedly: true,
                    },
                    &run,
                )
            })
        };
        std::thread::sleep(Duration::from_millis(200));
        run.store(false, Ordering::Relaxed);
        let nresizes = handle.join().unwrap();

        assert!(nresizes > 0, "no resize completed");
        for k in 1..=128u64 {
            assert!(table.lookup(0, k).is_some(), "lost key {k}");
        }
    }

    #[test]
    fn signal_mode_grows_on_request() {
        let table = Arc::new(
            TableBuilder::new()
                .nbuckets(4)
                .client_threads(2)
                .build_rht(),
        );
        table.signals().raise_enlarge();

        let run = Arc::new(AtomicBool::new(true));
        let handle = {
            let (table, run) = (table.clone(), run.clone());
            std::thread::spawn(move || {
                resize_loop(
                    &*table,
                    1,
                    ResizePolicy {
                        mult: 4,
                        div: 2,
                        wait_ms: 1,
                        repeatedly: false,
                    },
                    &run,
                )
            })
        };
        // Give the thread a few ticks to pick the request up.
        let mut waited = 0;
        while table.nbuckets() == 4 && waited < 2000 {
            std::thread::sleep(Duration::from_millis(5));
            waited += 5;
        }
        run.store(false, Ordering::Relaxed);
        handle.join().unwrap();

        assert_eq!(table.nbuckets(), 16);
    }
}
