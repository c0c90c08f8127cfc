use crate::consensus::op_id::OpId;
use crate::consensus::round::CompletionCallback;
use crate::error::Error;
use tokio::sync::mpsc;

/// OperationCallbackRunnable is one unit of callback work dispatched to the
/// pool: it routes the stored callback to its success or failure arm based on
/// whether an error was recorded before submission.
pub struct OperationCallbackRunnable {
    op_id: OpId,
    callback: CompletionCallback,
    error: Option<Error>,
}

impl OperationCallbackRunnable {
    pub fn new(op_id: OpId, callback: CompletionCallback) -> Self {
        OperationCallbackRunnable {
            op_id,
            callback,
            error: None,
        }
    }

    pub fn set_error(&mut self, error: Error) {
        self.error = Some(error);
    }

    pub fn run(self) {
        match self.error {
            None => self.callback.send_success(self.op_id),
            Some(error) => self.callback.send_failure(error),
        }
    }
}

/// CallbackPool executes operation callbacks off the replica lock path.
/// Submission is a non-blocking enqueue from synchronous code; a spawned
/// worker task drains the queue. The pool handle is cheap to clone and every
/// ReplicaState of a server shares one.
#[derive(Clone)]
pub struct CallbackPool {
    sender: mpsc::UnboundedSender<OperationCallbackRunnable>,
}

impl CallbackPool {
    pub fn new(logger: slog::Logger) -> (CallbackPool, CallbackPoolTask) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = CallbackPool { sender: tx };
        let task = CallbackPoolTask {
            logger,
            receiver: rx,
        };
        (pool, task)
    }

    pub fn submit(&self, runnable: OperationCallbackRunnable) -> crate::Result<()> {
        self.sender.send(runnable).map_err(|_| {
            Error::ServiceUnavailable("callback pool worker has exited".to_string())
        })
    }
}

/// CallbackPoolTask is the worker half. Spawn `run()` once at server startup;
/// it exits when every pool handle has dropped.
pub struct CallbackPoolTask {
    logger: slog::Logger,
    receiver: mpsc::UnboundedReceiver<OperationCallbackRunnable>,
}

impl CallbackPoolTask {
    pub async fn run(mut self) {
        while let Some(runnable) = self.receiver.recv().await {
            runnable.run();
        }
        slog::debug!(self.logger, "Callback pool worker exiting.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::round::completion_channel;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn runnable_routes_success() {
        let (pool, task) = CallbackPool::new(test_logger());
        tokio::spawn(task.run());

        let (callback, rx) = completion_channel();
        let op_id = OpId::new(3, 7);
        pool.submit(OperationCallbackRunnable::new(op_id, callback)).unwrap();

        assert_eq!(rx.await.unwrap().unwrap(), op_id);
    }

    #[tokio::test]
    async fn runnable_routes_stored_error() {
        let (pool, task) = CallbackPool::new(test_logger());
        tokio::spawn(task.run());

        let (callback, rx) = completion_channel();
        let mut runnable = OperationCallbackRunnable::new(OpId::new(1, 1), callback);
        runnable.set_error(Error::ServiceUnavailable("replica shutting down".to_string()));
        pool.submit(runnable).unwrap();

        let result = rx.await.unwrap();
        assert!(matches!(result, Err(Error::ServiceUnavailable(_))));
    }

    #[tokio::test]
    async fn submit_after_worker_exit_fails() {
        let (pool, task) = CallbackPool::new(test_logger());
        drop(task);

        let (callback, _rx) = completion_channel();
        let result = pool.submit(OperationCallbackRunnable::new(OpId::new(1, 1), callback));
        assert!(matches!(result, Err(Error::ServiceUnavailable(_))));
    }
}
