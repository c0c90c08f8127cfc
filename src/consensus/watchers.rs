use crate::consensus::callback_pool::{CallbackPool, OperationCallbackRunnable};
use crate::consensus::op_id::OpId;
use crate::consensus::round::CompletionCallback;
use std::collections::BTreeMap;

/// How `mark_finished` selects waiters to fire.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum MarkPolicy {
    /// Fire every waiter at or below the given id. Used by the replicate
    /// watermark, which implies everything before it.
    AllOpsBefore,
    /// Fire only waiters registered exactly at the given id. Used by per-op
    /// commit notification.
    OnlyThisOp,
}

/// OpIdWaiterSet maps a pending OpId to the callbacks awaiting it. Firing
/// dispatches onto the callback pool; nothing runs under the replica lock.
pub(crate) struct OpIdWaiterSet {
    waiters: BTreeMap<OpId, Vec<CompletionCallback>>,
    pool: CallbackPool,
}

impl OpIdWaiterSet {
    pub(crate) fn new(pool: CallbackPool) -> Self {
        OpIdWaiterSet {
            waiters: BTreeMap::new(),
            pool,
        }
    }

    pub(crate) fn register(&mut self, id: OpId, callback: CompletionCallback) {
        self.waiters.entry(id).or_default().push(callback);
    }

    pub(crate) fn mark_finished(&mut self, logger: &slog::Logger, id: OpId, policy: MarkPolicy) {
        let fired: Vec<(OpId, Vec<CompletionCallback>)> = match policy {
            MarkPolicy::AllOpsBefore => {
                // split_off keeps keys >= the successor of `id`; what remains
                // in the old map is exactly the <= id prefix to fire.
                let keep = self.waiters.split_off(&OpId::new(id.term(), id.index() + 1));
                std::mem::replace(&mut self.waiters, keep).into_iter().collect()
            }
            MarkPolicy::OnlyThisOp => self
                .waiters
                .remove(&id)
                .map(|callbacks| vec![(id, callbacks)])
                .unwrap_or_default(),
        };

        for (waited_id, callbacks) in fired {
            for callback in callbacks {
                let runnable = OperationCallbackRunnable::new(waited_id, callback);
                if self.pool.submit(runnable).is_err() {
                    slog::warn!(
                        logger,
                        "Callback pool has shut down; dropping waiter for {}",
                        waited_id
                    );
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }
}
