use crate::tablet::clock::Timestamp;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Condvar, Mutex};

/// MvccManager tracks ops that are mutating the tablet at a given timestamp.
/// A scanner snapshot at timestamp T is only clean once no op at a timestamp
/// <= T is still in flight; until then readers at T must hold off, because an
/// in-flight op may yet commit below them.
#[derive(Clone)]
pub struct MvccManager {
    shared: Arc<MvccShared>,
}

struct MvccShared {
    state: Mutex<MvccInner>,
    clean_changed: Condvar,
}

struct MvccInner {
    /// Count of in-flight ops per timestamp. Multiple ops may share one.
    in_flight: BTreeMap<Timestamp, usize>,
    /// Timestamps whose op finished applying (result is visible).
    committed: BTreeSet<Timestamp>,
}

impl MvccManager {
    pub fn new() -> Self {
        MvccManager {
            shared: Arc::new(MvccShared {
                state: Mutex::new(MvccInner {
                    in_flight: BTreeMap::new(),
                    committed: BTreeSet::new(),
                }),
                clean_changed: Condvar::new(),
            }),
        }
    }

    /// Registers an op at `timestamp`. Scanners at or above it block until
    /// the returned handle is finished or aborted.
    pub fn start_op(&self, timestamp: Timestamp) -> ScopedOp {
        {
            let mut state = self
                .shared
                .state
                .lock()
                .expect("MvccManager.start_op() mutex guard poison");
            *state.in_flight.entry(timestamp).or_insert(0) += 1;
        }
        ScopedOp {
            mvcc: self.clone(),
            timestamp,
            phase: OpPhase::Active,
        }
    }

    /// True when a scanner at `timestamp` may proceed: no op at or below it
    /// is still in flight.
    pub fn clean_snapshot_upto(&self, timestamp: Timestamp) -> bool {
        let state = self
            .shared
            .state
            .lock()
            .expect("MvccManager.clean_snapshot_upto() mutex guard poison");
        state
            .in_flight
            .range(..=timestamp)
            .next()
            .is_none()
    }

    /// Blocks until `clean_snapshot_upto(timestamp)` holds.
    pub fn wait_until_clean(&self, timestamp: Timestamp) {
        let mut state = self
            .shared
            .state
            .lock()
            .expect("MvccManager.wait_until_clean() mutex guard poison");
        while state.in_flight.range(..=timestamp).next().is_some() {
            state = self
                .shared
                .clean_changed
                .wait(state)
                .expect("MvccManager.wait_until_clean() mutex guard poison");
        }
    }

    /// True when an op at exactly `timestamp` committed and is visible.
    pub fn is_committed(&self, timestamp: Timestamp) -> bool {
        let state = self
            .shared
            .state
            .lock()
            .expect("MvccManager.is_committed() mutex guard poison");
        state.committed.contains(&timestamp)
    }

    fn complete_op(&self, timestamp: Timestamp, committed: bool) {
        let mut state = self
            .shared
            .state
            .lock()
            .expect("MvccManager.complete_op() mutex guard poison");
        match state.in_flight.get_mut(&timestamp) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                state.in_flight.remove(&timestamp);
            }
            None => panic!("Completing op at {} which is not in flight", timestamp),
        }
        if committed {
            state.committed.insert(timestamp);
        }
        self.shared.clean_changed.notify_all();
    }
}

impl Default for MvccManager {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum OpPhase {
    Active,
    Applying,
    Done,
}

/// ScopedOp keeps an in-progress mutation visible to the MVCC gate for as
/// long as it lives. Finishing publishes the result to scanners; aborting
/// (explicitly or by drop) discards it.
pub struct ScopedOp {
    mvcc: MvccManager,
    timestamp: Timestamp,
    phase: OpPhase,
}

impl ScopedOp {
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Marks the op as applying its mutation. Purely a phase transition; the
    /// op still blocks scanners until finished.
    pub fn start_applying(&mut self) {
        assert_eq!(self.phase, OpPhase::Active, "start_applying on a non-active op");
        self.phase = OpPhase::Applying;
    }

    pub fn finish_applying(mut self) {
        self.complete(true);
    }

    pub fn abort(mut self) {
        self.complete(false);
    }

    fn complete(&mut self, committed: bool) {
        if self.phase == OpPhase::Done {
            return;
        }
        self.phase = OpPhase::Done;
        self.mvcc.complete_op(self.timestamp, committed);
    }
}

impl Drop for ScopedOp {
    fn drop(&mut self) {
        // An op dropped without an explicit outcome never applied.
        self.complete(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn in_flight_op_blocks_snapshots_at_or_above_it() {
        let mvcc = MvccManager::new();
        let op = mvcc.start_op(Timestamp::new(1000));

        assert!(mvcc.clean_snapshot_upto(Timestamp::new(999)));
        assert!(!mvcc.clean_snapshot_upto(Timestamp::new(1000)));
        assert!(!mvcc.clean_snapshot_upto(Timestamp::new(2000)));

        op.finish_applying();
        assert!(mvcc.clean_snapshot_upto(Timestamp::new(2000)));
        assert!(mvcc.is_committed(Timestamp::new(1000)));
    }

    #[test]
    fn aborted_op_unblocks_without_visibility() {
        let mvcc = MvccManager::new();
        let op = mvcc.start_op(Timestamp::new(1000));

        op.abort();
        assert!(mvcc.clean_snapshot_upto(Timestamp::new(1000)));
        assert!(!mvcc.is_committed(Timestamp::new(1000)));
    }

    #[test]
    fn dropped_op_counts_as_aborted() {
        let mvcc = MvccManager::new();
        {
            let mut op = mvcc.start_op(Timestamp::new(5));
            op.start_applying();
        }
        assert!(mvcc.clean_snapshot_upto(Timestamp::new(5)));
        assert!(!mvcc.is_committed(Timestamp::new(5)));
    }

    #[test]
    fn two_ops_at_same_timestamp() {
        let mvcc = MvccManager::new();
        let first = mvcc.start_op(Timestamp::new(7));
        let second = mvcc.start_op(Timestamp::new(7));

        first.finish_applying();
        assert!(!mvcc.clean_snapshot_upto(Timestamp::new(7)));
        second.abort();
        assert!(mvcc.clean_snapshot_upto(Timestamp::new(7)));
    }

    #[test]
    fn wait_until_clean_wakes_on_finish() {
        let mvcc = MvccManager::new();
        let op = mvcc.start_op(Timestamp::new(1000));

        let waiter = {
            let mvcc = mvcc.clone();
            thread::spawn(move || mvcc.wait_until_clean(Timestamp::new(1000)))
        };
        // Give the waiter a moment to actually block.
        thread::sleep(Duration::from_millis(10));
        op.finish_applying();
        waiter.join().unwrap();
    }
}
