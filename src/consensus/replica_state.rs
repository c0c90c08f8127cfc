use crate::consensus::callback_pool::{CallbackPool, OperationCallbackRunnable};
use crate::consensus::latch::CountdownLatch;
use crate::consensus::metadata::{ConsensusMetadata, MetadataStore};
use crate::consensus::op_id::OpId;
use crate::consensus::quorum::{PeerId, PeerRole, Quorum, QuorumState};
use crate::consensus::round::{CompletionCallback, ConsensusRound, OpType, ReplicateMsg};
use crate::consensus::watchers::{MarkPolicy, OpIdWaiterSet};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound::{Excluded, Included};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone)]
pub struct ConsensusOptions {
    pub tablet_id: String,
}

/// Lifecycle of a replica. Transitions are strict:
/// Initialized -> ChangingConfig -> Running -> ShuttingDown -> ShutDown,
/// with Running <-> ChangingConfig allowed for later config changes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LifecycleState {
    Initialized,
    Running,
    ChangingConfig,
    ShuttingDown,
    ShutDown,
}

/// Hook consulted before the active quorum state is rebuilt from a new
/// quorum. The default performs no validation; installing a custom check
/// lets a server reject illegal role changes without this module deciding
/// what "legal" means.
pub enum QuorumLegalityCheck {
    Permissive,
    Custom(Box<dyn Fn(&QuorumState, &Quorum) -> Result<()> + Send>),
}

impl QuorumLegalityCheck {
    fn check(&self, current: &QuorumState, proposed: &Quorum) -> Result<()> {
        match self {
            QuorumLegalityCheck::Permissive => Ok(()),
            QuorumLegalityCheck::Custom(f) => f(current, proposed),
        }
    }
}

/// ReplicaState owns everything observable about one tablet replica's
/// consensus: durable metadata, the derived quorum view, the three
/// watermarks, the pending-op table, in-flight applies, and the watcher
/// registries. All of it sits behind one mutex; callers acquire the lock
/// through an intent-specific `lock_for_*` method and operate on the
/// returned guard.
pub struct ReplicaState {
    inner: Mutex<ReplicaStateInner>,
}

/// StateGuard proves the replica lock is held. It derefs to the state
/// itself, so every state-mutating operation is only reachable through a
/// successful lock intent.
pub struct StateGuard<'a>(MutexGuard<'a, ReplicaStateInner>);

impl<'a> Deref for StateGuard<'a> {
    type Target = ReplicaStateInner;

    fn deref(&self) -> &ReplicaStateInner {
        &self.0
    }
}

impl<'a> DerefMut for StateGuard<'a> {
    fn deref_mut(&mut self) -> &mut ReplicaStateInner {
        &mut self.0
    }
}

pub struct ReplicaStateInner {
    logger: slog::Logger,
    options: ConsensusOptions,
    peer_uuid: PeerId,
    store: Box<dyn MetadataStore>,
    cmeta: ConsensusMetadata,
    state: LifecycleState,
    active_quorum_state: Arc<QuorumState>,
    pending_quorum: Option<Quorum>,
    legality_check: QuorumLegalityCheck,

    /// Next log index to assign on this term.
    next_index: u64,
    /// Largest OpId seen from a leader (follower) or assigned locally (leader).
    received_op_id: OpId,
    /// Largest OpId known to be durably replicated.
    replicated_op_id: OpId,
    /// Largest OpId whose apply has been triggered.
    last_triggered_apply: OpId,

    /// Ordered so watermark advance can walk a key range.
    pending_ops: BTreeMap<OpId, Arc<ConsensusRound>>,
    /// Ops whose apply has been triggered but not yet finished. Always a
    /// subset of `pending_ops` keys.
    in_flight_commits: BTreeSet<OpId>,
    applies_latch: Arc<CountdownLatch>,

    callback_pool: CallbackPool,
    replicate_watchers: OpIdWaiterSet,
    commit_watchers: OpIdWaiterSet,
}

impl ReplicaState {
    pub fn new(
        logger: slog::Logger,
        options: ConsensusOptions,
        peer_uuid: PeerId,
        cmeta: ConsensusMetadata,
        store: Box<dyn MetadataStore>,
        callback_pool: CallbackPool,
    ) -> Self {
        let logger = logger.new(slog::o!(
            "tablet" => options.tablet_id.clone(),
            "peer" => peer_uuid.as_str().to_string(),
        ));
        let active_quorum_state =
            Arc::new(QuorumState::build(cmeta.committed_quorum(), &peer_uuid));

        ReplicaState {
            inner: Mutex::new(ReplicaStateInner {
                logger,
                options,
                peer_uuid,
                store,
                cmeta,
                state: LifecycleState::Initialized,
                active_quorum_state,
                pending_quorum: None,
                legality_check: QuorumLegalityCheck::Permissive,
                next_index: 0,
                received_op_id: OpId::initial(),
                replicated_op_id: OpId::initial(),
                last_triggered_apply: OpId::initial(),
                pending_ops: BTreeMap::new(),
                in_flight_commits: BTreeSet::new(),
                applies_latch: Arc::new(CountdownLatch::new(0)),
                callback_pool: callback_pool.clone(),
                replicate_watchers: OpIdWaiterSet::new(callback_pool.clone()),
                commit_watchers: OpIdWaiterSet::new(callback_pool),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReplicaStateInner> {
        self.inner.lock().expect("ReplicaState mutex guard poison")
    }

    pub fn lock_for_start(&self) -> Result<StateGuard<'_>> {
        let inner = self.lock();
        if inner.state != LifecycleState::Initialized {
            return Err(Error::IllegalState(format!(
                "Cannot start; replica is in state {:?}",
                inner.state
            )));
        }
        Ok(StateGuard(inner))
    }

    /// Read-only access. Allowed in any state; the guard still permits
    /// mutation at the type level, so read intents are a discipline, not a
    /// proof.
    pub fn lock_for_read(&self) -> StateGuard<'_> {
        StateGuard(self.lock())
    }

    pub fn lock_for_replicate(&self, msg: &ReplicateMsg) -> Result<StateGuard<'_>> {
        debug_assert!(msg.id().is_none(), "Replicate message should not have an id yet");
        let inner = self.lock();
        if inner.state != LifecycleState::Running {
            return Err(Error::IllegalState("Replica not in running state".to_string()));
        }
        match inner.active_quorum_state.role {
            PeerRole::Leader => Ok(StateGuard(inner)),
            PeerRole::Candidate => {
                if msg.op_type() != OpType::ChangeConfig {
                    return Err(Error::IllegalState(
                        "Only a config change round can be proposed while CANDIDATE".to_string(),
                    ));
                }
                // A candidate may push the very first config of a quorum,
                // before any term has been won.
                if inner.cmeta.current_term() != 0 {
                    return Err(Error::IllegalState(format!(
                        "Candidate config change only allowed at term 0, current term is {}",
                        inner.cmeta.current_term()
                    )));
                }
                Ok(StateGuard(inner))
            }
            role => Err(Error::IllegalState(format!(
                "Replica {} is not leader of this quorum. Role: {}",
                inner.peer_uuid, role
            ))),
        }
    }

    pub fn lock_for_commit(&self) -> Result<StateGuard<'_>> {
        let inner = self.lock();
        match inner.state {
            LifecycleState::Running | LifecycleState::ShuttingDown => Ok(StateGuard(inner)),
            state => Err(Error::IllegalState(format!(
                "Cannot commit; replica is in state {:?}",
                state
            ))),
        }
    }

    pub fn lock_for_config_change(&self) -> Result<StateGuard<'_>> {
        let mut inner = self.lock();
        match inner.state {
            LifecycleState::Initialized | LifecycleState::Running => {
                inner.state = LifecycleState::ChangingConfig;
                Ok(StateGuard(inner))
            }
            state => Err(Error::IllegalState(format!(
                "Cannot change config; replica is in state {:?}",
                state
            ))),
        }
    }

    pub fn lock_for_election(&self) -> Result<StateGuard<'_>> {
        let inner = self.lock();
        match inner.state {
            LifecycleState::Initialized | LifecycleState::Running => Ok(StateGuard(inner)),
            state => Err(Error::IllegalState(format!(
                "Cannot start election; replica is in state {:?}",
                state
            ))),
        }
    }

    /// Follower-side intent for receiving entries from a leader.
    pub fn lock_for_update(&self) -> Result<StateGuard<'_>> {
        let inner = self.lock();
        if inner.state != LifecycleState::Running {
            return Err(Error::IllegalState("Replica not in running state".to_string()));
        }
        match inner.active_quorum_state.role {
            PeerRole::Leader => Err(Error::IllegalState(
                "Replica is leader of the quorum".to_string(),
            )),
            PeerRole::NonParticipant => Err(Error::IllegalState(
                "Replica is not a participant of this quorum".to_string(),
            )),
            _ => Ok(StateGuard(inner)),
        }
    }

    /// First call moves the replica to ShuttingDown and arms the applies
    /// latch with the number of in-flight commits; later calls just re-take
    /// the lock.
    pub fn lock_for_shutdown(&self) -> Result<StateGuard<'_>> {
        let mut inner = self.lock();
        if inner.state == LifecycleState::ShutDown {
            return Err(Error::IllegalState("Replica is already shut down".to_string()));
        }
        if inner.state != LifecycleState::ShuttingDown {
            inner.state = LifecycleState::ShuttingDown;
            inner.applies_latch.reset(inner.in_flight_commits.len());
        }
        Ok(StateGuard(inner))
    }

    /// Final transition. The caller must have gone through
    /// `lock_for_shutdown` (and drained applies) first.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        assert_eq!(
            inner.state,
            LifecycleState::ShuttingDown,
            "Shutdown without passing through ShuttingDown"
        );
        inner.state = LifecycleState::ShutDown;
    }

    /// Aborts every pending op whose apply has not been triggered yet.
    /// In-flight applies are left alone; they drain through
    /// `wait_for_outstanding_applies`.
    pub fn cancel_pending_ops(&self) -> Result<()> {
        let inner = self.lock();
        if inner.state != LifecycleState::ShuttingDown {
            return Err(Error::IllegalState(
                "Can only cancel pending operations while shutting down".to_string(),
            ));
        }
        slog::info!(
            inner.logger,
            "Trying to abort {} pending operations",
            inner.pending_ops.len()
        );
        for (id, round) in inner.pending_ops.iter() {
            if inner.in_flight_commits.contains(id) {
                slog::info!(inner.logger, "Skipping abort of {}; apply already in flight", id);
                continue;
            }
            if let Some(continuation) = round.continuation() {
                slog::info!(inner.logger, "Aborting operation {}; not in flight", id);
                continuation.abort();
            }
        }
        Ok(())
    }

    /// Blocks until every apply that was in flight when shutdown started has
    /// finished. Must not be called while holding a guard.
    pub fn wait_for_outstanding_applies(&self) -> Result<()> {
        let (latch, logger) = {
            let inner = self.lock();
            if inner.state != LifecycleState::ShuttingDown {
                return Err(Error::IllegalState(
                    "Can only wait for applies while shutting down".to_string(),
                ));
            }
            slog::info!(
                inner.logger,
                "Waiting on {} outstanding applies",
                inner.applies_latch.count()
            );
            (Arc::clone(&inner.applies_latch), inner.logger.clone())
        };
        latch.wait();
        slog::info!(logger, "All local applies completed");
        Ok(())
    }

    /// Registers for "this id has been durably replicated". Fails with
    /// AlreadyPresent when the event already fired.
    pub fn register_on_replicate_callback(
        &self,
        id: OpId,
        callback: CompletionCallback,
    ) -> Result<()> {
        let mut inner = self.lock();
        if id > inner.replicated_op_id {
            inner.replicate_watchers.register(id, callback);
            return Ok(());
        }
        Err(Error::AlreadyPresent(
            "The operation has already been replicated".to_string(),
        ))
    }

    /// Registers for "this id's apply has finished". An id at or below the
    /// replicate watermark may still be pending (commit not finished), so a
    /// presence check in the pending table decides.
    pub fn register_on_commit_callback(&self, id: OpId, callback: CompletionCallback) -> Result<()> {
        let mut inner = self.lock();
        if id > inner.replicated_op_id || inner.pending_ops.contains_key(&id) {
            inner.commit_watchers.register(id, callback);
            return Ok(());
        }
        Err(Error::AlreadyPresent(
            "The operation has already been committed".to_string(),
        ))
    }

    pub fn summary(&self) -> String {
        self.lock().summary()
    }
}

impl ReplicaStateInner {
    /// Seeds the watermarks and index counter from the id this replica is
    /// (re)starting at. Does not change the lifecycle state; the caller
    /// drives Initialized -> Running through its bootstrap config round.
    pub fn start(&mut self, initial_id: OpId) -> Result<()> {
        let current_term = self.cmeta.current_term();
        if initial_id.term() < current_term {
            return Err(Error::InvalidArgument(format!(
                "Cannot start in older term. Current term: {}, passed term: {}",
                current_term,
                initial_id.term()
            )));
        }
        assert_eq!(
            initial_id.term(),
            current_term,
            "Starting with term {} which is greater than last recorded term {}",
            initial_id.term(),
            current_term,
        );

        self.next_index = initial_id.index() + 1;
        self.received_op_id = initial_id;
        self.replicated_op_id = initial_id;
        self.last_triggered_apply = initial_id;
        Ok(())
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn role(&self) -> PeerRole {
        self.active_quorum_state.role
    }

    pub fn peer_uuid(&self) -> &PeerId {
        &self.peer_uuid
    }

    pub fn options(&self) -> &ConsensusOptions {
        &self.options
    }

    pub fn active_quorum_state(&self) -> &QuorumState {
        &self.active_quorum_state
    }

    pub fn set_config_done(&mut self) {
        assert_eq!(
            self.state,
            LifecycleState::ChangingConfig,
            "set_config_done outside of a config change"
        );
        self.state = LifecycleState::Running;
    }

    pub fn current_term(&self) -> u64 {
        self.cmeta.current_term()
    }

    pub fn has_voted_current_term(&self) -> bool {
        self.cmeta.voted_for().is_some()
    }

    pub fn voted_for_current_term(&self) -> Option<&PeerId> {
        self.cmeta.voted_for()
    }

    /// Bumps the term by one, clearing the vote, and flushes. The in-memory
    /// record only changes once the flush succeeds.
    pub fn increment_term(&mut self) -> Result<()> {
        let updated = self.cmeta.with_term(self.cmeta.current_term() + 1);
        self.store.flush(&updated)?;
        self.cmeta = updated;
        Ok(())
    }

    pub fn set_current_term(&mut self, new_term: u64) -> Result<()> {
        if new_term < self.cmeta.current_term() {
            return Err(Error::IllegalState(format!(
                "Cannot change term to a term that is lower than the current one. \
                 Current: {}, Proposed: {}",
                self.cmeta.current_term(),
                new_term
            )));
        }
        let updated = self.cmeta.with_term(new_term);
        self.store.flush(&updated)?;
        self.cmeta = updated;
        Ok(())
    }

    pub fn set_voted_for_current_term(&mut self, uuid: PeerId) -> Result<()> {
        let updated = self.cmeta.with_vote(uuid);
        self.store.flush(&updated)?;
        self.cmeta = updated;
        Ok(())
    }

    pub fn committed_quorum(&self) -> &Quorum {
        self.cmeta.committed_quorum()
    }

    pub fn is_quorum_change_pending(&self) -> bool {
        self.pending_quorum.is_some()
    }

    pub fn pending_quorum(&self) -> Option<&Quorum> {
        self.pending_quorum.as_ref()
    }

    /// Stages a quorum change and rebuilds the active view from it. Only one
    /// change may be pending at a time; a second is a protocol bug.
    pub fn set_pending_quorum(&mut self, new_quorum: Quorum) -> Result<()> {
        assert!(
            self.pending_quorum.is_none(),
            "Attempting to make a pending quorum change while another is already pending"
        );
        self.reset_active_quorum_state(&new_quorum)?;
        self.pending_quorum = Some(new_quorum);
        Ok(())
    }

    /// Persists a quorum as committed. With a change pending, the committed
    /// quorum must be byte-identical to it; committing something else means
    /// the replica diverged from its own proposal.
    pub fn set_committed_quorum(&mut self, new_quorum: Quorum) -> Result<()> {
        let had_pending = match &self.pending_quorum {
            Some(pending) => {
                assert!(
                    pending.canonical_bytes() == new_quorum.canonical_bytes(),
                    "Attempting to persist quorum change while a different one is pending"
                );
                true
            }
            None => false,
        };

        let updated = self.cmeta.with_committed_quorum(new_quorum.clone());
        self.store.flush(&updated)?;
        self.cmeta = updated;
        if !had_pending {
            // Net-new commit (e.g. follower learning config); with a pending
            // change the active view was already rebuilt when it was staged.
            self.reset_active_quorum_state(&new_quorum)?;
        }
        self.pending_quorum = None;
        Ok(())
    }

    pub fn increment_config_seqno(&mut self) -> Result<()> {
        let mut quorum = self.cmeta.committed_quorum().clone();
        quorum.set_seqno(quorum.seqno() + 1);
        let updated = self.cmeta.with_committed_quorum(quorum);
        self.store.flush(&updated)?;
        self.cmeta = updated;
        Ok(())
    }

    pub fn set_quorum_legality_check(&mut self, check: QuorumLegalityCheck) {
        self.legality_check = check;
    }

    fn reset_active_quorum_state(&mut self, quorum: &Quorum) -> Result<()> {
        self.legality_check.check(&self.active_quorum_state, quorum)?;
        self.active_quorum_state = Arc::new(QuorumState::build(quorum, &self.peer_uuid));
        Ok(())
    }

    /// Assigns the next id on this term. Only reachable through a replicate
    /// intent, which already established the caller's right to propose.
    pub fn new_id(&mut self) -> OpId {
        let id = OpId::new(self.cmeta.current_term(), self.next_index);
        self.next_index += 1;
        id
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn add_pending_operation(&mut self, round: Arc<ConsensusRound>) -> Result<()> {
        if self.state != LifecycleState::Running
            && round.replicate_msg().op_type() != OpType::ChangeConfig
        {
            // While configuring, only the config round itself may proceed.
            return Err(Error::IllegalState(
                "Cannot accept operation; replica is not in running state".to_string(),
            ));
        }
        let id = round.id().expect("Adding pending operation with no id assigned");
        let evicted = self.pending_ops.insert(id, round);
        assert!(evicted.is_none(), "Duplicate pending operation {}", id);
        Ok(())
    }

    pub fn num_pending_ops(&self) -> usize {
        self.pending_ops.len()
    }

    /// Advances the commit watermark to `id`, triggering the apply of every
    /// pending op in `(last_triggered_apply, id]` in key order. Idempotent
    /// with respect to re-delivered ids. A failing commit continuation stops
    /// the walk and leaves the watermark where it was.
    pub fn mark_committed_up_to(&mut self, id: OpId) -> Result<()> {
        match self.state {
            LifecycleState::ShuttingDown | LifecycleState::ShutDown => {
                return Err(Error::ServiceUnavailable(
                    "Cannot trigger apply. Replica is shutting down".to_string(),
                ));
            }
            LifecycleState::Running => {}
            state => {
                return Err(Error::IllegalState(format!(
                    "Cannot trigger apply. Replica is in state {:?}",
                    state
                )));
            }
        }

        // Interleaved RPC deliveries can replay an older commit index.
        if self.last_triggered_apply >= id {
            slog::debug!(
                self.logger,
                "Already marked ops through {} as committed; {} is a no-op",
                self.last_triggered_apply,
                id
            );
            return Ok(());
        }

        let to_commit: Vec<Arc<ConsensusRound>> = self
            .pending_ops
            .range((Excluded(self.last_triggered_apply), Included(id)))
            .map(|(_, round)| Arc::clone(round))
            .collect();

        for round in to_commit {
            let round_id = round.id().expect("Pending round with no id");
            let inserted = self.in_flight_commits.insert(round_id);
            assert!(inserted, "Apply already triggered for {}", round_id);

            match round.continuation() {
                Some(continuation) => continuation.consensus_committed()?,
                None => match round.take_replicate_callback() {
                    Some(callback) => {
                        self.callback_pool
                            .submit(OperationCallbackRunnable::new(round_id, callback))?;
                    }
                    None => {
                        slog::warn!(
                            self.logger,
                            "Committed round {} has neither continuation nor callback",
                            round_id
                        );
                    }
                },
            }
        }

        self.last_triggered_apply = id;
        Ok(())
    }

    /// The commit watermark: the largest id whose apply has been triggered.
    pub fn committed_op_id(&self) -> OpId {
        self.last_triggered_apply
    }

    pub fn update_last_replicated_op_id(&mut self, op_id: OpId) {
        self.replicated_op_id = op_id;
        self.replicate_watchers
            .mark_finished(&self.logger, op_id, MarkPolicy::AllOpsBefore);
    }

    pub fn last_replicated_op_id(&self) -> OpId {
        self.replicated_op_id
    }

    pub fn update_last_received_op_id(&mut self, op_id: OpId) {
        assert!(
            self.received_op_id <= op_id,
            "Received OpId went backwards. Previous: {}, updated: {}",
            self.received_op_id,
            op_id,
        );
        self.received_op_id = op_id;
        self.next_index = op_id.index() + 1;
    }

    pub fn last_received_op_id(&self) -> OpId {
        self.received_op_id
    }

    /// Called by a committing round once its apply completes. Removes the op
    /// from both tracking structures atomically and fires its commit
    /// watchers.
    pub fn update_committed_op_id(&mut self, committed_op_id: OpId) {
        assert!(
            self.in_flight_commits.remove(&committed_op_id),
            "Trying to mark {} as committed, but it is not in the in-flight set",
            committed_op_id,
        );
        assert!(
            self.pending_ops.remove(&committed_op_id).is_some(),
            "Couldn't remove {} from the pending set",
            committed_op_id,
        );
        self.commit_watchers
            .mark_finished(&self.logger, committed_op_id, MarkPolicy::OnlyThisOp);
        if self.state == LifecycleState::ShuttingDown {
            self.applies_latch.count_down();
        }
    }

    /// Rolls back the most recently assigned id, for a proposal that failed
    /// before entering replication. Anything else is a bookkeeping bug.
    pub fn cancel_pending_operation(&mut self, id: OpId) {
        assert_eq!(self.cmeta.current_term(), id.term(), "Cancelling op from another term");
        assert_eq!(
            self.next_index,
            id.index() + 1,
            "Can only cancel the last assigned op"
        );
        self.next_index = id.index();
        assert!(
            self.pending_ops.remove(&id).is_some(),
            "Cancelled op {} was not pending",
            id,
        );
    }

    pub fn summary(&self) -> String {
        format!(
            "Replica: {}, State: {:?}, Role: {}; \
             Watermarks: {{Received: {} Replicated: {} Committed: {}}}; \
             Num. outstanding commits: {}",
            self.peer_uuid,
            self.state,
            self.active_quorum_state.role,
            self.received_op_id,
            self.replicated_op_id,
            self.last_triggered_apply,
            self.in_flight_commits.len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::metadata::VolatileMetadataStore;
    use crate::consensus::quorum::QuorumPeer;
    use crate::consensus::round::{completion_channel, CommitContinuation, OpPayload};
    use bytes::Bytes;
    use std::io;
    use std::sync::Mutex as StdMutex;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn three_peer_quorum(leader: &str) -> Quorum {
        let peers = ["p1", "p2", "p3"]
            .iter()
            .map(|uuid| {
                let role = if *uuid == leader {
                    PeerRole::Leader
                } else {
                    PeerRole::Follower
                };
                QuorumPeer::new(PeerId::new(*uuid), role)
            })
            .collect();
        Quorum::new(peers, 1)
    }

    /// Replica "p1" leading a 3-peer quorum at the given term. The pool
    /// worker is not spawned; these tests never await pooled callbacks.
    fn leader_replica(term: u64) -> ReplicaState {
        let (pool, _task) = CallbackPool::new(test_logger());
        let cmeta = ConsensusMetadata::new(term, None, three_peer_quorum("p1"));
        ReplicaState::new(
            test_logger(),
            ConsensusOptions {
                tablet_id: "tablet-1".to_string(),
            },
            PeerId::new("p1"),
            cmeta,
            Box::new(VolatileMetadataStore::new()),
            pool,
        )
    }

    fn follower_replica(term: u64) -> ReplicaState {
        let (pool, _task) = CallbackPool::new(test_logger());
        let cmeta = ConsensusMetadata::new(term, None, three_peer_quorum("p2"));
        ReplicaState::new(
            test_logger(),
            ConsensusOptions {
                tablet_id: "tablet-1".to_string(),
            },
            PeerId::new("p1"),
            cmeta,
            Box::new(VolatileMetadataStore::new()),
            pool,
        )
    }

    /// Drives Initialized -> Running the way a bootstrapping server does.
    fn run_replica(replica: &ReplicaState, initial_id: OpId) {
        {
            let mut guard = replica.lock_for_start().unwrap();
            guard.start(initial_id).unwrap();
        }
        let mut guard = replica.lock_for_config_change().unwrap();
        guard.set_config_done();
    }

    fn write_msg() -> ReplicateMsg {
        ReplicateMsg::new(OpPayload::Write(Bytes::from_static(b"payload")))
    }

    fn pending_round(id: OpId) -> Arc<ConsensusRound> {
        let mut msg = write_msg();
        msg.set_id(id);
        Arc::new(ConsensusRound::new(msg))
    }

    #[derive(Default)]
    struct RecordingContinuation {
        committed: StdMutex<Vec<OpId>>,
        aborted: StdMutex<Vec<OpId>>,
        id: StdMutex<Option<OpId>>,
        fail_commit: bool,
    }

    impl RecordingContinuation {
        fn shared(id: OpId) -> Arc<RecordingContinuation> {
            let continuation = RecordingContinuation::default();
            *continuation.id.lock().unwrap() = Some(id);
            Arc::new(continuation)
        }

        fn committed_ids(&self) -> Vec<OpId> {
            self.committed.lock().unwrap().clone()
        }

        fn aborted_ids(&self) -> Vec<OpId> {
            self.aborted.lock().unwrap().clone()
        }
    }

    impl CommitContinuation for RecordingContinuation {
        fn consensus_committed(&self) -> Result<()> {
            let id = self.id.lock().unwrap().expect("id set");
            self.committed.lock().unwrap().push(id);
            if self.fail_commit {
                return Err(Error::IllegalState("apply refused".to_string()));
            }
            Ok(())
        }

        fn abort(&self) {
            let id = self.id.lock().unwrap().expect("id set");
            self.aborted.lock().unwrap().push(id);
        }
    }

    fn round_with_continuation(id: OpId) -> (Arc<ConsensusRound>, Arc<RecordingContinuation>) {
        let continuation = RecordingContinuation::shared(id);
        let round: Arc<ConsensusRound> = {
            let mut msg = write_msg();
            msg.set_id(id);
            let dyn_continuation: Arc<dyn CommitContinuation> = continuation.clone();
            Arc::new(ConsensusRound::new(msg).with_continuation(dyn_continuation))
        };
        (round, continuation)
    }

    #[test]
    fn start_seeds_watermarks_and_index() {
        let replica = leader_replica(3);

        let mut guard = replica.lock_for_start().unwrap();
        guard.start(OpId::new(3, 10)).unwrap();

        assert_eq!(guard.next_index(), 11);
        assert_eq!(guard.last_received_op_id(), OpId::new(3, 10));
        assert_eq!(guard.last_replicated_op_id(), OpId::new(3, 10));
        assert_eq!(guard.committed_op_id(), OpId::new(3, 10));
        // Start does not flip the lifecycle; bootstrap does that separately.
        assert_eq!(guard.state(), LifecycleState::Initialized);
    }

    #[test]
    fn start_rejects_older_term() {
        let replica = leader_replica(5);
        let mut guard = replica.lock_for_start().unwrap();

        let result = guard.start(OpId::new(3, 10));
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        // Nothing moved.
        assert_eq!(guard.next_index(), 0);
    }

    #[test]
    fn lock_for_start_requires_initialized() {
        let replica = leader_replica(0);
        run_replica(&replica, OpId::new(0, 0));

        assert!(matches!(
            replica.lock_for_start(),
            Err(Error::IllegalState(_))
        ));
    }

    #[test]
    fn new_id_assigns_term_and_increments_index() {
        let replica = leader_replica(7);
        run_replica(&replica, OpId::new(7, 41));

        let mut guard = replica.lock_for_replicate(&write_msg()).unwrap();
        let id = guard.new_id();

        assert_eq!(id, OpId::new(7, 42));
        assert_eq!(guard.next_index(), 43);
    }

    #[test]
    fn assign_then_cancel_restores_next_index() {
        let replica = leader_replica(7);
        run_replica(&replica, OpId::new(7, 41));

        let mut guard = replica.lock_for_replicate(&write_msg()).unwrap();
        let id = guard.new_id();
        guard.add_pending_operation(pending_round(id)).unwrap();

        guard.cancel_pending_operation(id);
        assert_eq!(guard.next_index(), 42);
        assert_eq!(guard.num_pending_ops(), 0);
    }

    #[test]
    fn replicate_intent_requires_leadership() {
        let replica = follower_replica(2);
        run_replica(&replica, OpId::new(2, 5));

        assert!(matches!(
            replica.lock_for_replicate(&write_msg()),
            Err(Error::IllegalState(_))
        ));
    }

    #[test]
    fn update_intent_rejected_for_leader() {
        let replica = leader_replica(2);
        run_replica(&replica, OpId::new(2, 5));

        assert!(matches!(
            replica.lock_for_update(),
            Err(Error::IllegalState(_))
        ));
        // A follower replica takes the same intent fine.
        let follower = follower_replica(2);
        run_replica(&follower, OpId::new(2, 5));
        assert!(follower.lock_for_update().is_ok());
    }

    #[test]
    fn add_pending_outside_running_only_accepts_config_change() {
        let replica = leader_replica(0);

        let mut guard = replica.lock_for_config_change().unwrap();
        guard.start(OpId::new(0, 0)).unwrap();

        let mut write = write_msg();
        write.set_id(OpId::new(0, 1));
        let rejected = guard.add_pending_operation(Arc::new(ConsensusRound::new(write)));
        assert!(matches!(rejected, Err(Error::IllegalState(_))));

        let mut config = ReplicateMsg::new(OpPayload::ChangeConfig(three_peer_quorum("p1")));
        config.set_id(OpId::new(0, 1));
        guard
            .add_pending_operation(Arc::new(ConsensusRound::new(config)))
            .unwrap();
        assert_eq!(guard.num_pending_ops(), 1);
    }

    #[test]
    fn mark_committed_triggers_continuations_in_order() {
        let replica = leader_replica(7);
        run_replica(&replica, OpId::new(7, 41));

        let (round_a, cont_a) = round_with_continuation(OpId::new(7, 42));
        let (round_b, cont_b) = round_with_continuation(OpId::new(7, 43));
        {
            let mut guard = replica.lock_for_replicate(&write_msg()).unwrap();
            guard.new_id();
            guard.new_id();
            guard.add_pending_operation(round_a).unwrap();
            guard.add_pending_operation(round_b).unwrap();
        }

        let mut guard = replica.lock_for_commit().unwrap();
        guard.mark_committed_up_to(OpId::new(7, 43)).unwrap();

        assert_eq!(cont_a.committed_ids(), vec![OpId::new(7, 42)]);
        assert_eq!(cont_b.committed_ids(), vec![OpId::new(7, 43)]);
        assert!(guard.in_flight_commits.contains(&OpId::new(7, 42)));
        assert!(guard.in_flight_commits.contains(&OpId::new(7, 43)));
        assert_eq!(guard.committed_op_id(), OpId::new(7, 43));
    }

    #[test]
    fn mark_committed_is_idempotent() {
        let replica = leader_replica(7);
        run_replica(&replica, OpId::new(7, 41));

        let (round_a, cont_a) = round_with_continuation(OpId::new(7, 42));
        let (round_b, cont_b) = round_with_continuation(OpId::new(7, 43));
        {
            let mut guard = replica.lock_for_replicate(&write_msg()).unwrap();
            guard.new_id();
            guard.new_id();
            guard.add_pending_operation(round_a).unwrap();
            guard.add_pending_operation(round_b).unwrap();
        }

        let mut guard = replica.lock_for_commit().unwrap();
        guard.mark_committed_up_to(OpId::new(7, 43)).unwrap();
        guard.mark_committed_up_to(OpId::new(7, 43)).unwrap();
        // Replaying an even older id is also a no-op.
        guard.mark_committed_up_to(OpId::new(7, 42)).unwrap();

        assert_eq!(cont_a.committed_ids().len(), 1);
        assert_eq!(cont_b.committed_ids().len(), 1);
        assert_eq!(guard.committed_op_id(), OpId::new(7, 43));
    }

    #[test]
    fn failing_continuation_stops_watermark_advance() {
        let replica = leader_replica(7);
        run_replica(&replica, OpId::new(7, 41));

        let failing = {
            let continuation = RecordingContinuation {
                fail_commit: true,
                ..Default::default()
            };
            *continuation.id.lock().unwrap() = Some(OpId::new(7, 42));
            Arc::new(continuation)
        };
        let mut msg = write_msg();
        msg.set_id(OpId::new(7, 42));
        let dyn_failing: Arc<dyn CommitContinuation> = failing.clone();
        let round_a = Arc::new(ConsensusRound::new(msg).with_continuation(dyn_failing));
        let (round_b, cont_b) = round_with_continuation(OpId::new(7, 43));
        {
            let mut guard = replica.lock_for_replicate(&write_msg()).unwrap();
            guard.new_id();
            guard.new_id();
            guard.add_pending_operation(round_a).unwrap();
            guard.add_pending_operation(round_b).unwrap();
        }

        let mut guard = replica.lock_for_commit().unwrap();
        let result = guard.mark_committed_up_to(OpId::new(7, 43));

        assert!(matches!(result, Err(Error::IllegalState(_))));
        // The walk stopped at the failed op: its successor was never
        // triggered and the watermark did not move.
        assert!(cont_b.committed_ids().is_empty());
        assert_eq!(guard.committed_op_id(), OpId::new(7, 41));
    }

    #[test]
    fn update_committed_op_id_removes_from_both_sets() {
        let replica = leader_replica(7);
        run_replica(&replica, OpId::new(7, 41));

        let (round, _cont) = round_with_continuation(OpId::new(7, 42));
        {
            let mut guard = replica.lock_for_replicate(&write_msg()).unwrap();
            guard.new_id();
            guard.add_pending_operation(round).unwrap();
        }

        let mut guard = replica.lock_for_commit().unwrap();
        guard.mark_committed_up_to(OpId::new(7, 42)).unwrap();
        guard.update_committed_op_id(OpId::new(7, 42));

        assert!(guard.in_flight_commits.is_empty());
        assert_eq!(guard.num_pending_ops(), 0);
    }

    #[test]
    #[should_panic(expected = "not in the in-flight set")]
    fn update_committed_op_id_panics_when_not_in_flight() {
        let replica = leader_replica(7);
        run_replica(&replica, OpId::new(7, 41));

        let mut guard = replica.lock_for_commit().unwrap();
        guard.update_committed_op_id(OpId::new(7, 42));
    }

    #[test]
    #[should_panic(expected = "Received OpId went backwards")]
    fn received_watermark_regression_panics() {
        let replica = follower_replica(2);
        run_replica(&replica, OpId::new(2, 5));

        let mut guard = replica.lock_for_update().unwrap();
        guard.update_last_received_op_id(OpId::new(2, 6));
        guard.update_last_received_op_id(OpId::new(2, 4));
    }

    #[test]
    fn received_watermark_tracks_next_index() {
        let replica = follower_replica(2);
        run_replica(&replica, OpId::new(2, 5));

        let mut guard = replica.lock_for_update().unwrap();
        guard.update_last_received_op_id(OpId::new(2, 9));
        assert_eq!(guard.last_received_op_id(), OpId::new(2, 9));
        assert_eq!(guard.next_index(), 10);
    }

    #[test]
    fn mark_committed_rejected_during_shutdown() {
        let replica = leader_replica(7);
        run_replica(&replica, OpId::new(7, 41));

        drop(replica.lock_for_shutdown().unwrap());
        let mut guard = replica.lock_for_commit().unwrap();
        let result = guard.mark_committed_up_to(OpId::new(7, 42));
        assert!(matches!(result, Err(Error::ServiceUnavailable(_))));
    }

    #[test]
    fn increment_term_clears_vote_and_flushes() {
        let replica = leader_replica(4);
        let mut guard = replica.lock_for_election().unwrap();

        guard.set_voted_for_current_term(PeerId::new("p2")).unwrap();
        assert!(guard.has_voted_current_term());

        guard.increment_term().unwrap();
        assert_eq!(guard.current_term(), 5);
        assert!(!guard.has_voted_current_term());
    }

    #[test]
    fn set_current_term_rejects_lower() {
        let replica = leader_replica(4);
        let mut guard = replica.lock_for_election().unwrap();

        assert!(matches!(
            guard.set_current_term(3),
            Err(Error::IllegalState(_))
        ));
        assert_eq!(guard.current_term(), 4);

        guard.set_current_term(9).unwrap();
        assert_eq!(guard.current_term(), 9);
    }

    struct FailingStore;

    impl MetadataStore for FailingStore {
        fn flush(&mut self, _metadata: &ConsensusMetadata) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk on fire"))
        }
    }

    #[test]
    fn failed_flush_leaves_term_unchanged() {
        let (pool, _task) = CallbackPool::new(test_logger());
        let cmeta = ConsensusMetadata::new(4, None, three_peer_quorum("p1"));
        let replica = ReplicaState::new(
            test_logger(),
            ConsensusOptions {
                tablet_id: "tablet-1".to_string(),
            },
            PeerId::new("p1"),
            cmeta,
            Box::new(FailingStore),
            pool,
        );

        let mut guard = replica.lock_for_election().unwrap();
        assert!(matches!(guard.increment_term(), Err(Error::Io(_))));
        assert_eq!(guard.current_term(), 4);
        assert!(matches!(
            guard.set_voted_for_current_term(PeerId::new("p2")),
            Err(Error::Io(_))
        ));
        assert!(!guard.has_voted_current_term());
    }

    #[test]
    fn pending_quorum_then_commit() {
        let replica = leader_replica(1);
        let mut guard = replica.lock_for_config_change().unwrap();

        let mut new_quorum = three_peer_quorum("p2");
        new_quorum.set_seqno(2);
        guard.set_pending_quorum(new_quorum.clone()).unwrap();
        assert!(guard.is_quorum_change_pending());
        // The active view is rebuilt immediately from the pending quorum.
        assert_eq!(guard.role(), PeerRole::Follower);

        guard.set_committed_quorum(new_quorum.clone()).unwrap();
        assert!(!guard.is_quorum_change_pending());
        assert_eq!(guard.committed_quorum(), &new_quorum);
    }

    #[test]
    #[should_panic(expected = "different one is pending")]
    fn committing_mismatched_quorum_panics() {
        let replica = leader_replica(1);
        let mut guard = replica.lock_for_config_change().unwrap();

        let mut pending = three_peer_quorum("p2");
        pending.set_seqno(2);
        guard.set_pending_quorum(pending).unwrap();

        let mut other = three_peer_quorum("p3");
        other.set_seqno(2);
        let _ = guard.set_committed_quorum(other);
    }

    #[test]
    fn increment_config_seqno() {
        let replica = leader_replica(1);
        let mut guard = replica.lock_for_config_change().unwrap();

        guard.increment_config_seqno().unwrap();
        assert_eq!(guard.committed_quorum().seqno(), 2);
    }

    #[test]
    fn legality_check_can_reject_quorum_change() {
        let replica = leader_replica(1);
        let mut guard = replica.lock_for_config_change().unwrap();
        guard.set_quorum_legality_check(QuorumLegalityCheck::Custom(Box::new(|_, _| {
            Err(Error::IllegalState("role change refused".to_string()))
        })));

        let result = guard.set_pending_quorum(three_peer_quorum("p2"));
        assert!(matches!(result, Err(Error::IllegalState(_))));
        assert!(!guard.is_quorum_change_pending());
        assert_eq!(guard.role(), PeerRole::Leader);
    }

    #[tokio::test]
    async fn replicate_watcher_fires_once_watermark_passes() {
        let (pool, task) = CallbackPool::new(test_logger());
        tokio::spawn(task.run());
        let cmeta = ConsensusMetadata::new(7, None, three_peer_quorum("p1"));
        let replica = ReplicaState::new(
            test_logger(),
            ConsensusOptions {
                tablet_id: "tablet-1".to_string(),
            },
            PeerId::new("p1"),
            cmeta,
            Box::new(VolatileMetadataStore::new()),
            pool,
        );
        run_replica(&replica, OpId::new(7, 41));

        let (callback, rx) = completion_channel();
        replica
            .register_on_replicate_callback(OpId::new(7, 42), callback)
            .unwrap();

        {
            let mut guard = replica.lock_for_commit().unwrap();
            guard.update_last_replicated_op_id(OpId::new(7, 43));
        }
        assert_eq!(rx.await.unwrap().unwrap(), OpId::new(7, 42));

        // Registering behind the watermark reports the event already fired.
        let (late, _rx) = completion_channel();
        assert!(matches!(
            replica.register_on_replicate_callback(OpId::new(7, 43), late),
            Err(Error::AlreadyPresent(_))
        ));
    }

    #[test]
    fn commit_watcher_registration_rules() {
        let replica = leader_replica(7);
        run_replica(&replica, OpId::new(7, 41));

        let (round, _cont) = round_with_continuation(OpId::new(7, 42));
        {
            let mut guard = replica.lock_for_replicate(&write_msg()).unwrap();
            guard.new_id();
            guard.add_pending_operation(round).unwrap();
            guard.update_last_replicated_op_id(OpId::new(7, 42));
        }

        // At/below the replicate watermark but still pending: registrable.
        let (pending_cb, _rx1) = completion_channel();
        replica
            .register_on_commit_callback(OpId::new(7, 42), pending_cb)
            .unwrap();

        // At/below the watermark and long gone: already committed.
        let (gone_cb, _rx2) = completion_channel();
        assert!(matches!(
            replica.register_on_commit_callback(OpId::new(7, 41), gone_cb),
            Err(Error::AlreadyPresent(_))
        ));

        // Above the watermark: registrable.
        let (future_cb, _rx3) = completion_channel();
        replica
            .register_on_commit_callback(OpId::new(7, 50), future_cb)
            .unwrap();
    }

    #[test]
    fn cancel_pending_ops_aborts_only_non_in_flight() {
        let replica = leader_replica(7);
        run_replica(&replica, OpId::new(7, 41));

        let (round_a, cont_a) = round_with_continuation(OpId::new(7, 42));
        let (round_b, cont_b) = round_with_continuation(OpId::new(7, 43));
        {
            let mut guard = replica.lock_for_replicate(&write_msg()).unwrap();
            guard.new_id();
            guard.new_id();
            guard.add_pending_operation(round_a).unwrap();
            guard.add_pending_operation(round_b).unwrap();
            // Only the first op's apply is triggered before shutdown.
            guard.mark_committed_up_to(OpId::new(7, 42)).unwrap();
        }

        assert!(matches!(
            replica.cancel_pending_ops(),
            Err(Error::IllegalState(_))
        ));

        drop(replica.lock_for_shutdown().unwrap());
        replica.cancel_pending_ops().unwrap();

        assert!(cont_a.aborted_ids().is_empty());
        assert_eq!(cont_b.aborted_ids(), vec![OpId::new(7, 43)]);
    }

    #[test]
    fn shutdown_latch_counts_in_flight_applies() {
        let replica = leader_replica(7);
        run_replica(&replica, OpId::new(7, 41));

        let (round, _cont) = round_with_continuation(OpId::new(7, 42));
        {
            let mut guard = replica.lock_for_replicate(&write_msg()).unwrap();
            guard.new_id();
            guard.add_pending_operation(round).unwrap();
            guard.mark_committed_up_to(OpId::new(7, 42)).unwrap();
        }

        {
            let mut guard = replica.lock_for_shutdown().unwrap();
            assert_eq!(guard.state(), LifecycleState::ShuttingDown);
            // The in-flight apply finishes during shutdown and counts down.
            guard.update_committed_op_id(OpId::new(7, 42));
        }

        replica.wait_for_outstanding_applies().unwrap();
        replica.shutdown();
        assert_eq!(replica.lock_for_read().state(), LifecycleState::ShutDown);
        assert!(matches!(
            replica.lock_for_shutdown(),
            Err(Error::IllegalState(_))
        ));
    }

    #[test]
    fn summary_mentions_watermarks() {
        let replica = leader_replica(3);
        {
            let mut guard = replica.lock_for_start().unwrap();
            guard.start(OpId::new(3, 10)).unwrap();
        }
        let summary = replica.summary();
        assert!(summary.contains("3.10"), "summary was: {}", summary);
        assert!(summary.contains("LEADER"), "summary was: {}", summary);
    }
}
