mod clock;
mod mvcc;
mod participant_op;
mod txn_participant;

pub use clock::Clock;
pub use clock::ManualClock;
pub use clock::SystemClock;
pub use clock::TimeManager;
pub use clock::Timestamp;
pub use mvcc::MvccManager;
pub use mvcc::ScopedOp;
pub use participant_op::DriverType;
pub use participant_op::OpResult;
pub use participant_op::ParticipantOp;
pub use participant_op::ParticipantOpRequest;
pub use participant_op::ParticipantOpState;
pub use participant_op::ParticipantOpType;
pub use txn_participant::LogAnchorRegistry;
pub use txn_participant::Txn;
pub use txn_participant::TxnInner;
pub use txn_participant::TxnParticipant;
pub use txn_participant::TxnState;

use std::sync::Arc;

/// TabletReplica bundles the collaborators a participant op needs from its
/// tablet: the MVCC gate, the time manager, the transaction registry, and
/// the log anchor registry it passes through.
pub struct TabletReplica {
    logger: slog::Logger,
    mvcc: MvccManager,
    time_manager: TimeManager,
    txn_participant: TxnParticipant,
    log_anchor_registry: Arc<LogAnchorRegistry>,
}

impl TabletReplica {
    pub fn new(logger: slog::Logger, clock: Arc<dyn Clock>) -> Self {
        TabletReplica {
            mvcc: MvccManager::new(),
            time_manager: TimeManager::new(clock),
            txn_participant: TxnParticipant::new(logger.clone()),
            log_anchor_registry: Arc::new(LogAnchorRegistry::new()),
            logger,
        }
    }

    pub fn logger(&self) -> &slog::Logger {
        &self.logger
    }

    pub fn mvcc(&self) -> &MvccManager {
        &self.mvcc
    }

    pub fn time_manager(&self) -> &TimeManager {
        &self.time_manager
    }

    pub fn txn_participant(&self) -> &TxnParticipant {
        &self.txn_participant
    }

    pub fn log_anchor_registry(&self) -> &Arc<LogAnchorRegistry> {
        &self.log_anchor_registry
    }
}
