use crate::consensus::OpId;
use crate::error::{Error, Result};
use crate::tablet::clock::Timestamp;
use crate::tablet::mvcc::ScopedOp;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

/// LogAnchorRegistry is opaque to the transaction participant: transactions
/// retain a handle so their earliest relevant log entry stays anchored, but
/// what anchoring means is the log's concern.
pub struct LogAnchorRegistry {
    _private: (),
}

impl LogAnchorRegistry {
    pub fn new() -> Self {
        LogAnchorRegistry { _private: () }
    }
}

impl Default for LogAnchorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle of a transaction on one participant tablet. `Initializing` is a
/// freshly created slot that no BEGIN_TXN has opened yet.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TxnState {
    Initializing,
    Open,
    Committing,
    Committed,
    Aborted,
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxnState::Initializing => "INITIALIZING",
            TxnState::Open => "OPEN",
            TxnState::Committing => "COMMITTING",
            TxnState::Committed => "COMMITTED",
            TxnState::Aborted => "ABORTED",
        };
        write!(f, "{}", name)
    }
}

/// The mutable half of a transaction slot, reachable only through the txn's
/// write lock. Holding that lock across a participant op's whole lifetime is
/// what serializes concurrent participant ops for the same transaction.
pub struct TxnInner {
    state: TxnState,
    last_op_id: Option<OpId>,
    commit_timestamp: Option<Timestamp>,
    commit_op: Option<ScopedOp>,
}

impl TxnInner {
    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn last_op_id(&self) -> Option<OpId> {
        self.last_op_id
    }

    pub fn commit_timestamp(&self) -> Option<Timestamp> {
        self.commit_timestamp
    }

    pub fn validate_begin(&self) -> Result<()> {
        match self.state {
            TxnState::Initializing => Ok(()),
            state => Err(Error::IllegalState(format!(
                "Cannot begin transaction in state {}",
                state
            ))),
        }
    }

    pub fn validate_begin_commit(&self) -> Result<()> {
        match self.state {
            TxnState::Open => Ok(()),
            state => Err(Error::IllegalState(format!(
                "Cannot begin committing transaction in state {}",
                state
            ))),
        }
    }

    pub fn validate_finalize(&self) -> Result<()> {
        match self.state {
            TxnState::Committing => Ok(()),
            state => Err(Error::IllegalState(format!(
                "Cannot finalize transaction in state {}",
                state
            ))),
        }
    }

    pub fn validate_abort(&self) -> Result<()> {
        match self.state {
            TxnState::Open | TxnState::Committing => Ok(()),
            state => Err(Error::IllegalState(format!(
                "Cannot abort transaction in state {}",
                state
            ))),
        }
    }

    pub fn begin(&mut self, op_id: OpId) {
        debug_assert!(self.validate_begin().is_ok());
        self.state = TxnState::Open;
        self.last_op_id = Some(op_id);
    }

    pub fn begin_commit(&mut self, op_id: OpId) {
        debug_assert!(self.validate_begin_commit().is_ok());
        self.state = TxnState::Committing;
        self.last_op_id = Some(op_id);
    }

    pub fn finalize_commit(&mut self, op_id: OpId, commit_timestamp: Timestamp) {
        debug_assert!(self.validate_finalize().is_ok());
        self.state = TxnState::Committed;
        self.last_op_id = Some(op_id);
        self.commit_timestamp = Some(commit_timestamp);
    }

    pub fn abort(&mut self, op_id: OpId) {
        debug_assert!(self.validate_abort().is_ok());
        self.state = TxnState::Aborted;
        self.last_op_id = Some(op_id);
    }

    /// Hands the BEGIN_COMMIT MVCC op to the transaction. The transaction now
    /// owns it; FINALIZE_COMMIT or ABORT_TXN closes it.
    pub fn set_commit_op(&mut self, op: ScopedOp) {
        debug_assert!(self.commit_op.is_none(), "commit op already held");
        self.commit_op = Some(op);
    }

    pub fn commit_op(&self) -> Option<&ScopedOp> {
        self.commit_op.as_ref()
    }

    /// May return None during log replay, when a FINALIZE_COMMIT or
    /// ABORT_TXN replays without its BEGIN_COMMIT having re-registered one.
    pub fn take_commit_op(&mut self) -> Option<ScopedOp> {
        self.commit_op.take()
    }
}

/// One transaction's slot on this tablet.
pub struct Txn {
    txn_id: i64,
    _log_anchor_registry: Arc<LogAnchorRegistry>,
    inner: Arc<RwLock<TxnInner>>,
}

impl Txn {
    fn new(txn_id: i64, log_anchor_registry: Arc<LogAnchorRegistry>) -> Self {
        Txn {
            txn_id,
            _log_anchor_registry: log_anchor_registry,
            inner: Arc::new(RwLock::new(TxnInner {
                state: TxnState::Initializing,
                last_op_id: None,
                commit_timestamp: None,
                commit_op: None,
            })),
        }
    }

    pub fn txn_id(&self) -> i64 {
        self.txn_id
    }

    /// Takes the slot's write lock for the duration of a participant op.
    /// The guard is owned, so the op can carry it across its phases.
    pub async fn acquire_write_lock(&self) -> OwnedRwLockWriteGuard<TxnInner> {
        Arc::clone(&self.inner).write_owned().await
    }

    /// Snapshot of the slot state, for callers not driving an op.
    pub async fn state(&self) -> TxnState {
        self.inner.read().await.state()
    }
}

/// TxnParticipant is the per-tablet registry of transaction slots.
pub struct TxnParticipant {
    logger: slog::Logger,
    txns: Mutex<HashMap<i64, Arc<Txn>>>,
}

impl TxnParticipant {
    pub fn new(logger: slog::Logger) -> Self {
        TxnParticipant {
            logger,
            txns: Mutex::new(HashMap::new()),
        }
    }

    /// Looks up the slot for `txn_id`, creating it on first sight.
    pub fn get_or_create(
        &self,
        txn_id: i64,
        log_anchor_registry: &Arc<LogAnchorRegistry>,
    ) -> Arc<Txn> {
        let mut txns = self
            .txns
            .lock()
            .expect("TxnParticipant.get_or_create() mutex guard poison");
        Arc::clone(
            txns.entry(txn_id)
                .or_insert_with(|| Arc::new(Txn::new(txn_id, Arc::clone(log_anchor_registry)))),
        )
    }

    pub fn txn(&self, txn_id: i64) -> Option<Arc<Txn>> {
        self.txns
            .lock()
            .expect("TxnParticipant.txn() mutex guard poison")
            .get(&txn_id)
            .cloned()
    }

    pub fn num_txns(&self) -> usize {
        self.txns
            .lock()
            .expect("TxnParticipant.num_txns() mutex guard poison")
            .len()
    }

    /// Removes the slot if it was created but never opened, rolling back the
    /// side effect of a BEGIN_TXN that aborted before applying.
    pub fn clear_if_init_failed(&self, txn_id: i64) {
        let mut txns = self
            .txns
            .lock()
            .expect("TxnParticipant.clear_if_init_failed() mutex guard poison");
        let never_opened = match txns.get(&txn_id) {
            // A held write lock means another op is using the slot; leave it.
            Some(txn) => match txn.inner.try_read() {
                Ok(inner) => inner.state() == TxnState::Initializing,
                Err(_) => false,
            },
            None => false,
        };
        if never_opened {
            slog::debug!(self.logger, "Clearing never-opened transaction {}", txn_id);
            txns.remove(&txn_id);
        }
    }
}
