//! Serial executor for delegated actions.
//!
//! One worker per session channel. Actions run one at a time in arrival
//! order and each observation goes out on the emitter of the channel the
//! action came from. The worker outlives transport reconnects of that
//! channel and stops when the channel shuts down. Dropping the worker aborts
//! it; an in-flight `run` is killed and its result never emitted.

use std::sync::Arc;

use relaydock_connector::ObservationEmitter;
use relaydock_executor::{failure_observation, ActionExecutor, ExecutionError};
use relaydock_protocol::DelegatedAction;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const QUEUE_DEPTH: usize = 128;

pub struct ActionWorker {
    emitter: ObservationEmitter,
    queue: mpsc::Sender<DelegatedAction>,
    task: JoinHandle<()>,
}

impl ActionWorker {
    pub fn spawn(executor: Arc<ActionExecutor>, emitter: ObservationEmitter) -> Self {
        Self::with_depth(executor, emitter, QUEUE_DEPTH)
    }

    fn with_depth(
        executor: Arc<ActionExecutor>,
        emitter: ObservationEmitter,
        depth: usize,
    ) -> Self {
        let (queue, rx) = mpsc::channel(depth);
        let task = tokio::spawn(worker_loop(executor, emitter.clone(), rx));
        Self {
            emitter,
            queue,
            task,
        }
    }

    pub fn conversation_id(&self) -> &str {
        self.emitter.conversation_id()
    }

    /// The channel is gone and this worker can no longer answer anything.
    pub fn is_retired(&self) -> bool {
        self.emitter.is_closed() || self.task.is_finished()
    }

    /// Queue an action. An action that cannot be queued is answered with a
    /// failure observation instead. Returns false in that case.
    pub async fn submit(&self, action: DelegatedAction) -> bool {
        let (action, err) = match self.queue.try_send(action) {
            Ok(()) => return true,
            Err(TrySendError::Full(action)) => (action, ExecutionError::QueueFull),
            Err(TrySendError::Closed(action)) => (action, ExecutionError::WorkerStopped),
        };

        warn!(
            component = "dispatch",
            event = "dispatch.submit.rejected",
            conversation_id = %self.conversation_id(),
            action = %action.action,
            action_id = %action.id,
            error = %err,
            "Delegated action rejected"
        );
        if let Err(e) = self.emitter.emit(failure_observation(&action, &err)).await {
            debug!(
                component = "dispatch",
                event = "dispatch.emit.discarded",
                conversation_id = %self.conversation_id(),
                action_id = %action.id,
                error = %e,
                "Rejection discarded"
            );
        }
        false
    }
}

impl Drop for ActionWorker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn worker_loop(
    executor: Arc<ActionExecutor>,
    emitter: ObservationEmitter,
    mut rx: mpsc::Receiver<DelegatedAction>,
) {
    loop {
        let action = tokio::select! {
            _ = emitter.closed() => break,
            action = rx.recv() => match action {
                Some(action) => action,
                None => break,
            },
        };

        // Dropping the execution kills its process group.
        let observation = tokio::select! {
            _ = emitter.closed() => break,
            observation = executor.execute(&action) => observation,
        };

        if let Err(e) = emitter.emit(observation).await {
            debug!(
                component = "dispatch",
                event = "dispatch.emit.discarded",
                conversation_id = %emitter.conversation_id(),
                action_id = %action.id,
                error = %e,
                "Observation discarded"
            );
        }
    }

    debug!(
        component = "dispatch",
        event = "dispatch.worker.stopped",
        conversation_id = %emitter.conversation_id(),
        "Action worker stopped"
    );
}
