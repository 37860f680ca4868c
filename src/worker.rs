//! Lifecycle queue worker.
//!
//! Processes that should not drive providers themselves enqueue lifecycle
//! commands on the `lifecycle` queue; `serve` claims and applies them
//! through the manager one at a time.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::LeaseError;
use crate::manager::{LifecycleOutcome, SandboxManager};
use crate::queue::{MessageQueue, QueueMessage};
use crate::store::StoreError;

pub(crate) const LIFECYCLE_QUEUE: &str = "lifecycle";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub(crate) enum LifecycleCommand {
    Pause { thread_id: String },
    Resume { thread_id: String },
    Destroy { thread_id: String },
}

impl LifecycleCommand {
    pub fn thread_id(&self) -> &str {
        match self {
            Self::Pause { thread_id } | Self::Resume { thread_id } | Self::Destroy { thread_id } => {
                thread_id
            }
        }
    }

    pub fn enqueue(&self, queue: &MessageQueue) -> Result<i64, StoreError> {
        queue.enqueue(LIFECYCLE_QUEUE, &serde_json::to_value(self)?)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct LifecycleWorker {
    manager: SandboxManager,
    queue: MessageQueue,
    poll_interval: Duration,
    claim_timeout: Duration,
}

impl LifecycleWorker {
    pub fn new(
        manager: SandboxManager,
        queue: MessageQueue,
        poll_interval: Duration,
        claim_timeout: Duration,
    ) -> Self {
        Self {
            manager,
            queue,
            poll_interval,
            claim_timeout,
        }
    }

    async fn apply(&self, command: &LifecycleCommand) -> Result<LifecycleOutcome, LeaseError> {
        match command {
            LifecycleCommand::Pause { thread_id } => self.manager.pause_session(thread_id).await,
            LifecycleCommand::Resume { thread_id } => self.manager.resume_session(thread_id).await,
            LifecycleCommand::Destroy { thread_id } => self.manager.destroy_session(thread_id).await,
        }
    }

    async fn handle(&self, message: &QueueMessage) -> Result<(), StoreError> {
        let command: LifecycleCommand = match serde_json::from_value(message.payload.clone()) {
            Ok(command) => command,
            Err(e) => {
                warn!("Rejecting malformed lifecycle message {}: {}", message.id, e);
                self.queue.fail(message.id, &format!("invalid payload: {e}"))?;
                return Ok(());
            }
        };

        match self.apply(&command).await {
            Ok(outcome) => {
                debug!(
                    "Message {} applied to {}: converged={}",
                    message.id,
                    command.thread_id(),
                    outcome.converged
                );
                self.queue.complete(message.id)?;
            }
            Err(e) => {
                error!("Lifecycle message {} failed: {}", message.id, e);
                self.queue.fail(message.id, &e.to_string())?;
            }
        }
        Ok(())
    }

    /// Claims and handles one message. Returns false when the queue was empty.
    pub async fn process_next(&self) -> Result<bool, StoreError> {
        let Some(message) = self.queue.claim(LIFECYCLE_QUEUE)? else {
            return Ok(false);
        };
        self.handle(&message).await?;
        Ok(true)
    }

    /// Drains the queue, then polls until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Lifecycle worker polling every {:?}", self.poll_interval);
        match self.queue.release_stale(LIFECYCLE_QUEUE, self.claim_timeout) {
            Ok(0) => {}
            Ok(n) => info!("Released {} stale lifecycle claims", n),
            Err(e) => error!("Cannot release stale claims: {}", e),
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            let busy = match self.process_next().await {
                Ok(busy) => busy,
                Err(e) => {
                    error!("Lifecycle worker error: {}", e);
                    false
                }
            };
            if busy {
                continue;
            }
            tokio::select! {
                () = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Lifecycle worker stopped");
    }
}
