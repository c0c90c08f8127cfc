use crate::consensus::{CommitMsg, ConsensusRound, OpPayload, OpType, ReplicateMsg, RequestId};
use crate::error::{Error, Result};
use crate::tablet::clock::Timestamp;
use crate::tablet::mvcc::ScopedOp;
use crate::tablet::txn_participant::{Txn, TxnInner};
use crate::tablet::TabletReplica;
use std::fmt;
use std::sync::Arc;
use tokio::sync::OwnedRwLockWriteGuard;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ParticipantOpType {
    BeginTxn,
    BeginCommit,
    FinalizeCommit,
    AbortTxn,
    Unknown,
}

impl fmt::Display for ParticipantOpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParticipantOpType::BeginTxn => "BEGIN_TXN",
            ParticipantOpType::BeginCommit => "BEGIN_COMMIT",
            ParticipantOpType::FinalizeCommit => "FINALIZE_COMMIT",
            ParticipantOpType::AbortTxn => "ABORT_TXN",
            ParticipantOpType::Unknown => "UNKNOWN",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone)]
pub struct ParticipantOpRequest {
    pub txn_id: i64,
    pub op_type: ParticipantOpType,
    /// Only meaningful for FINALIZE_COMMIT.
    pub finalized_commit_timestamp: Option<Timestamp>,
}

/// Whether this replica is driving the op as the leader proposing it, or
/// following a leader's already-replicated decision.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DriverType {
    Leader,
    Replica,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OpResult {
    Applied,
    Aborted,
}

/// Everything a participant op owns while it runs: the addressed tablet
/// replica, the request, the locked transaction slot, and (for BEGIN_COMMIT)
/// the MVCC op that will be transferred to the transaction on apply.
pub struct ParticipantOpState {
    tablet_replica: Arc<TabletReplica>,
    request: ParticipantOpRequest,
    request_id: Option<RequestId>,
    round: Option<Arc<ConsensusRound>>,
    txn: Option<Arc<Txn>>,
    txn_lock: Option<OwnedRwLockWriteGuard<TxnInner>>,
    timestamp: Option<Timestamp>,
    begin_commit_mvcc_op: Option<ScopedOp>,
}

impl ParticipantOpState {
    pub fn new(tablet_replica: Arc<TabletReplica>, request: ParticipantOpRequest) -> Self {
        ParticipantOpState {
            tablet_replica,
            request,
            request_id: None,
            round: None,
            txn: None,
            txn_lock: None,
            timestamp: None,
            begin_commit_mvcc_op: None,
        }
    }

    /// Marks the originating request for idempotent retry tracking; carried
    /// into the replicate message.
    pub fn set_request_id(&mut self, request_id: RequestId) {
        self.request_id = Some(request_id);
    }

    pub fn set_consensus_round(&mut self, round: Arc<ConsensusRound>) {
        self.round = Some(round);
    }

    pub fn request(&self) -> &ParticipantOpRequest {
        &self.request
    }

    pub fn timestamp(&self) -> Option<Timestamp> {
        self.timestamp
    }

    /// Looks up (creating if first sight) the txn slot and takes its write
    /// lock, serializing all participant ops for this txn_id.
    async fn acquire_txn_and_lock(&mut self) {
        debug_assert!(self.txn.is_none(), "txn already acquired");
        debug_assert!(self.txn_lock.is_none(), "txn lock already held");
        let txn = self.tablet_replica.txn_participant().get_or_create(
            self.request.txn_id,
            self.tablet_replica.log_anchor_registry(),
        );
        let lock = txn.acquire_write_lock().await;
        self.txn = Some(txn);
        self.txn_lock = Some(lock);
    }

    fn release_txn(&mut self) {
        self.txn_lock = None;
        self.txn = None;
    }

    fn validate_op(&self) -> Result<()> {
        let inner = self.txn_lock.as_deref().expect("validating without txn lock");
        match self.request.op_type {
            ParticipantOpType::BeginTxn => inner.validate_begin(),
            ParticipantOpType::BeginCommit => inner.validate_begin_commit(),
            ParticipantOpType::FinalizeCommit => inner.validate_finalize(),
            ParticipantOpType::AbortTxn => inner.validate_abort(),
            ParticipantOpType::Unknown => {
                Err(Error::InvalidArgument("unknown op type".to_string()))
            }
        }
    }

    fn set_mvcc_op(&mut self, op: ScopedOp) {
        debug_assert_eq!(self.request.op_type, ParticipantOpType::BeginCommit);
        debug_assert!(self.begin_commit_mvcc_op.is_none(), "mvcc op already held");
        self.begin_commit_mvcc_op = Some(op);
    }

    pub fn summary(&self) -> String {
        let ts = match self.timestamp {
            Some(ts) => ts.to_string(),
            None => "<unassigned>".to_string(),
        };
        format!(
            "ParticipantOpState [txn_id={}, ts={}, type={}]",
            self.request.txn_id, ts, self.request.op_type,
        )
    }
}

/// ParticipantOp drives one transaction-participant operation through the
/// replication pipeline in four phases: prepare (lock + validate), start
/// (adopt the replicated timestamp), apply (the state transition), and
/// finish (release / roll back).
pub struct ParticipantOp {
    state: ParticipantOpState,
    driver: DriverType,
}

impl ParticipantOp {
    pub fn new(state: ParticipantOpState, driver: DriverType) -> Self {
        ParticipantOp { state, driver }
    }

    pub fn state(&self) -> &ParticipantOpState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ParticipantOpState {
        &mut self.state
    }

    pub fn driver(&self) -> DriverType {
        self.driver
    }

    /// Builds the message this op replicates: the request embedded as the
    /// payload, plus the request id when the caller tracks results.
    pub fn new_replicate_msg(&self) -> ReplicateMsg {
        let mut msg = ReplicateMsg::new(OpPayload::Participant(self.state.request.clone()));
        if let Some(request_id) = &self.state.request_id {
            msg.set_request_id(request_id.clone());
        }
        msg
    }

    /// Phase 1: acquire the txn slot and its write lock, validate the
    /// requested transition, and (leader-side FINALIZE_COMMIT only) bump the
    /// clock past the finalized commit timestamp so every later op, and every
    /// scanner, observes it.
    pub async fn prepare(&mut self) -> Result<()> {
        self.state.acquire_txn_and_lock().await;
        self.state.validate_op()?;

        if self.state.request.op_type == ParticipantOpType::FinalizeCommit
            && self.driver == DriverType::Leader
        {
            debug_assert!(
                self.state
                    .round
                    .as_ref()
                    .map_or(true, |r| r.replicate_msg().timestamp().is_none()),
                "clock bump must happen before the round's timestamp is assigned"
            );
            let commit_ts = self.state.request.finalized_commit_timestamp.ok_or_else(|| {
                Error::InvalidArgument(
                    "FINALIZE_COMMIT without a finalized commit timestamp".to_string(),
                )
            })?;
            self.state
                .tablet_replica
                .time_manager()
                .update_clock_and_last_assigned(commit_ts)?;
        }
        Ok(())
    }

    /// Phase 2: adopt the timestamp consensus assigned to the round. For
    /// BEGIN_COMMIT, also register the MVCC op that makes scanners at or
    /// above that timestamp wait for the commit's outcome.
    pub fn start(&mut self) -> Result<()> {
        debug_assert!(self.state.timestamp.is_none());
        let round = self
            .state
            .round
            .as_ref()
            .ok_or_else(|| Error::IllegalState("op has no consensus round".to_string()))?;
        let timestamp = round.replicate_msg().timestamp().ok_or_else(|| {
            Error::IllegalState("consensus round has no timestamp assigned".to_string())
        })?;
        self.state.timestamp = Some(timestamp);

        if self.state.request.op_type == ParticipantOpType::BeginCommit {
            let op = self.state.tablet_replica.mvcc().start_op(timestamp);
            self.state.set_mvcc_op(op);
        }
        Ok(())
    }

    /// Phase 3: perform the transition under the held txn lock and emit the
    /// commit message.
    pub fn apply(&mut self) -> Result<CommitMsg> {
        let op_type = self.state.request.op_type;
        let txn_id = self.state.request.txn_id;
        let finalized_ts = self.state.request.finalized_commit_timestamp;
        let op_id = self
            .state
            .round
            .as_ref()
            .and_then(|round| round.id())
            .ok_or_else(|| Error::IllegalState("op has no assigned id".to_string()))?;
        let mvcc_op = self.state.begin_commit_mvcc_op.take();

        let lock = self.state.txn_lock.as_mut().expect("applying without txn lock");
        match op_type {
            ParticipantOpType::BeginTxn => {
                lock.begin(op_id);
            }
            ParticipantOpType::BeginCommit => {
                // TODO: wait for in-flight ops below this timestamp to finish
                // before beginning the commit; until then a scanner could see
                // the commit ahead of an older op's result.
                lock.begin_commit(op_id);
                let mut mvcc_op = mvcc_op.expect("BEGIN_COMMIT applied without an MVCC op");
                mvcc_op.start_applying();
                lock.set_commit_op(mvcc_op);
            }
            ParticipantOpType::FinalizeCommit => {
                let commit_ts = finalized_ts.ok_or_else(|| {
                    Error::InvalidArgument(
                        "FINALIZE_COMMIT without a finalized commit timestamp".to_string(),
                    )
                })?;
                lock.finalize_commit(op_id, commit_ts);
                // Absent during log replay when the BEGIN_COMMIT was not
                // replayed; the transition alone is then sufficient.
                if let Some(commit_op) = lock.take_commit_op() {
                    commit_op.finish_applying();
                }
            }
            ParticipantOpType::AbortTxn => {
                lock.abort(op_id);
                if let Some(commit_op) = lock.take_commit_op() {
                    commit_op.abort();
                }
            }
            ParticipantOpType::Unknown => {
                return Err(Error::InvalidArgument("unknown op type".to_string()));
            }
        }

        slog::debug!(
            self.state.tablet_replica.logger(),
            "Applied {} for txn {}",
            op_type,
            txn_id
        );
        Ok(CommitMsg::new(OpType::ParticipantOp))
    }

    /// Phase 4: release the txn lock and handle. An ABORTED outcome rolls
    /// back a slot that a failed BEGIN_TXN created but never opened.
    pub fn finish(&mut self, result: OpResult) {
        let txn_id = self.state.request.txn_id;
        self.state.release_txn();
        if result == OpResult::Aborted {
            self.state.tablet_replica.txn_participant().clear_if_init_failed(txn_id);
        }
    }

    pub fn summary(&self) -> String {
        format!("ParticipantOp [driver={:?}, state={}]", self.driver, self.state.summary())
    }
}
