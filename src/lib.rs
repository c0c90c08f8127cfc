mod consensus;
mod error;
mod tablet;

pub use consensus::completion_channel;
pub use consensus::CallbackPool;
pub use consensus::CallbackPoolTask;
pub use consensus::CommitContinuation;
pub use consensus::CommitMsg;
pub use consensus::CompletionCallback;
pub use consensus::ConsensusMetadata;
pub use consensus::ConsensusOptions;
pub use consensus::ConsensusRound;
pub use consensus::CountdownLatch;
pub use consensus::DiskMetadataStore;
pub use consensus::LifecycleState;
pub use consensus::MajorityOpStatusTracker;
pub use consensus::MetadataStore;
pub use consensus::OpId;
pub use consensus::OpPayload;
pub use consensus::OpType;
pub use consensus::OperationCallbackRunnable;
pub use consensus::PeerId;
pub use consensus::PeerRole;
pub use consensus::Quorum;
pub use consensus::QuorumLegalityCheck;
pub use consensus::QuorumPeer;
pub use consensus::QuorumState;
pub use consensus::ReplicaState;
pub use consensus::ReplicaStateInner;
pub use consensus::ReplicateMsg;
pub use consensus::RequestId;
pub use consensus::StateGuard;
pub use consensus::VolatileMetadataStore;
pub use error::Error;
pub use error::Result;
pub use tablet::Clock;
pub use tablet::DriverType;
pub use tablet::LogAnchorRegistry;
pub use tablet::ManualClock;
pub use tablet::MvccManager;
pub use tablet::OpResult;
pub use tablet::ParticipantOp;
pub use tablet::ParticipantOpRequest;
pub use tablet::ParticipantOpState;
pub use tablet::ParticipantOpType;
pub use tablet::ScopedOp;
pub use tablet::SystemClock;
pub use tablet::TabletReplica;
pub use tablet::TimeManager;
pub use tablet::Timestamp;
pub use tablet::Txn;
pub use tablet::TxnInner;
pub use tablet::TxnParticipant;
pub use tablet::TxnState;
