use crate::consensus::op_id::OpId;
use crate::consensus::quorum::Quorum;
use crate::consensus::tracker::MajorityOpStatusTracker;
use crate::error::{Error, Result};
use crate::tablet::{ParticipantOpRequest, Timestamp};
use bytes::Bytes;
use std::fmt;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OpType {
    Write,
    ChangeConfig,
    ParticipantOp,
}

/// RequestId identifies a client request for idempotent retry detection.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RequestId {
    pub client_id: String,
    pub seq_no: u64,
}

/// The op-specific body of a replicate message. The op type is derived from
/// the payload so the two can never disagree.
#[derive(Debug, Clone)]
pub enum OpPayload {
    Write(Bytes),
    ChangeConfig(Quorum),
    Participant(ParticipantOpRequest),
}

impl OpPayload {
    pub fn op_type(&self) -> OpType {
        match self {
            OpPayload::Write(_) => OpType::Write,
            OpPayload::ChangeConfig(_) => OpType::ChangeConfig,
            OpPayload::Participant(_) => OpType::ParticipantOp,
        }
    }
}

/// ReplicateMsg is the message a leader proposes into the log. The id and
/// timestamp are unset at construction and assigned during replication,
/// before the message is wrapped into a round and shared.
#[derive(Debug, Clone)]
pub struct ReplicateMsg {
    payload: OpPayload,
    id: Option<OpId>,
    timestamp: Option<Timestamp>,
    request_id: Option<RequestId>,
}

impl ReplicateMsg {
    pub fn new(payload: OpPayload) -> Self {
        ReplicateMsg {
            payload,
            id: None,
            timestamp: None,
            request_id: None,
        }
    }

    pub fn op_type(&self) -> OpType {
        self.payload.op_type()
    }

    pub fn payload(&self) -> &OpPayload {
        &self.payload
    }

    pub fn id(&self) -> Option<OpId> {
        self.id
    }

    pub fn set_id(&mut self, id: OpId) {
        self.id = Some(id);
    }

    pub fn timestamp(&self) -> Option<Timestamp> {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: Timestamp) {
        self.timestamp = Some(timestamp);
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        self.request_id.as_ref()
    }

    pub fn set_request_id(&mut self, request_id: RequestId) {
        self.request_id = Some(request_id);
    }
}

/// CommitMsg is emitted at apply time and records what kind of op was
/// applied. The durable log appends it after the apply completes.
#[derive(Debug, Clone)]
pub struct CommitMsg {
    op_type: OpType,
}

impl CommitMsg {
    pub fn new(op_type: OpType) -> Self {
        CommitMsg { op_type }
    }

    pub fn op_type(&self) -> OpType {
        self.op_type
    }
}

/// CompletionCallback delivers the final outcome of an operation to whoever
/// proposed or registered for it. Dropping the receiving end is fine; the
/// send result is intentionally ignored.
pub struct CompletionCallback(oneshot::Sender<Result<OpId>>);

impl CompletionCallback {
    pub fn send_success(self, id: OpId) {
        let _ = self.0.send(Ok(id));
    }

    pub fn send_failure(self, error: Error) {
        let _ = self.0.send(Err(error));
    }
}

impl Debug for CompletionCallback {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionCallback").finish()
    }
}

pub fn completion_channel() -> (CompletionCallback, oneshot::Receiver<Result<OpId>>) {
    let (tx, rx) = oneshot::channel();
    (CompletionCallback(tx), rx)
}

/// CommitContinuation is the hook a round's owner installs to be driven by
/// the replica when consensus commits (or cancels) the round.
pub trait CommitContinuation: Send + Sync {
    /// The round's id is now committed; trigger the apply. An error stops the
    /// replica's watermark advance at this op.
    fn consensus_committed(&self) -> Result<()>;

    /// The round was cancelled before its apply was triggered.
    fn abort(&self);
}

/// ConsensusRound is one in-flight replicated operation: the proposed
/// message plus the hooks that drive it to completion.
pub struct ConsensusRound {
    replicate_msg: ReplicateMsg,
    replicate_callback: Mutex<Option<CompletionCallback>>,
    continuation: Option<Arc<dyn CommitContinuation>>,
    tracker: Option<Arc<MajorityOpStatusTracker>>,
}

impl ConsensusRound {
    pub fn new(replicate_msg: ReplicateMsg) -> Self {
        ConsensusRound {
            replicate_msg,
            replicate_callback: Mutex::new(None),
            continuation: None,
            tracker: None,
        }
    }

    pub fn with_replicate_callback(self, callback: CompletionCallback) -> Self {
        self.replicate_callback
            .lock()
            .expect("ConsensusRound callback mutex guard poison")
            .replace(callback);
        self
    }

    pub fn with_continuation(mut self, continuation: Arc<dyn CommitContinuation>) -> Self {
        self.continuation = Some(continuation);
        self
    }

    /// Attaches the majority tracker for a leader-initiated round.
    pub fn with_tracker(mut self, tracker: Arc<MajorityOpStatusTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn replicate_msg(&self) -> &ReplicateMsg {
        &self.replicate_msg
    }

    pub fn id(&self) -> Option<OpId> {
        self.replicate_msg.id()
    }

    pub fn continuation(&self) -> Option<&Arc<dyn CommitContinuation>> {
        self.continuation.as_ref()
    }

    pub fn tracker(&self) -> Option<&Arc<MajorityOpStatusTracker>> {
        self.tracker.as_ref()
    }

    /// Takes the replicate callback, leaving None. Fired at most once, either
    /// when the commit watermark crosses this round or never.
    pub fn take_replicate_callback(&self) -> Option<CompletionCallback> {
        self.replicate_callback
            .lock()
            .expect("ConsensusRound callback mutex guard poison")
            .take()
    }
}

impl Debug for ConsensusRound {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsensusRound")
            .field("op_type", &self.replicate_msg.op_type())
            .field("id", &self.replicate_msg.id())
            .finish()
    }
}
