mod callback_pool;
mod latch;
mod metadata;
mod op_id;
mod quorum;
mod replica_state;
mod round;
mod tracker;
mod watchers;

pub use callback_pool::CallbackPool;
pub use callback_pool::CallbackPoolTask;
pub use callback_pool::OperationCallbackRunnable;
pub use latch::CountdownLatch;
pub use metadata::ConsensusMetadata;
pub use metadata::DiskMetadataStore;
pub use metadata::MetadataStore;
pub use metadata::VolatileMetadataStore;
pub use op_id::OpId;
pub use quorum::PeerId;
pub use quorum::PeerRole;
pub use quorum::Quorum;
pub use quorum::QuorumPeer;
pub use quorum::QuorumState;
pub use replica_state::ConsensusOptions;
pub use replica_state::LifecycleState;
pub use replica_state::QuorumLegalityCheck;
pub use replica_state::ReplicaState;
pub use replica_state::ReplicaStateInner;
pub use replica_state::StateGuard;
pub use round::completion_channel;
pub use round::CommitContinuation;
pub use round::CommitMsg;
pub use round::CompletionCallback;
pub use round::ConsensusRound;
pub use round::OpPayload;
pub use round::OpType;
pub use round::ReplicateMsg;
pub use round::RequestId;
pub use tracker::MajorityOpStatusTracker;
