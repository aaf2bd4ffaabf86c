#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wkf-queue-core** – Core durable-queue abstraction for the workflow
//! runtime (§4.B).
//!
//! Grounded on `toka-bus-core`'s `EventBus` trait (small async-free surface,
//! a `thiserror` error enum, a broadcast-backed in-memory default) but
//! generalized from fire-and-forget pub/sub to an at-least-once, durably
//! acknowledged queue: messages persist until [`Queue::ack`], carry redelivery
//! `attempt` counts, and support delayed dispatch up to [`MAX_QUEUE_DELAY`].
//! This crate defines the trait and the generic dispatch loop
//! ([`run_handler`]) that both queue families in §4.B (`__wkf_workflow_*`,
//! `__wkf_step_*`) are driven by; concrete drivers live in `wkf-queue-memory`.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Maximum delayed-delivery window a single enqueue can request (~23h, §4.B).
/// Waits longer than this are chained by re-enqueueing with the remaining
/// duration on each wake-up (§5 Timeouts).
pub const MAX_QUEUE_DELAY: Duration = Duration::from_secs(23 * 3600);

/// Reserved prefix for orchestrator-invocation queues, one per workflow name.
pub const WORKFLOW_QUEUE_PREFIX: &str = "__wkf_workflow_";
/// Reserved prefix for step-execution queues, one per step name.
pub const STEP_QUEUE_PREFIX: &str = "__wkf_step_";

/// Opaque, driver-assigned message identifier.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Options accompanying a [`Queue::enqueue`] call.
#[derive(Clone, Debug, Default)]
pub struct EnqueueOptions {
    /// If set and a prior accepted message carries the same key within the
    /// driver's retention window, this call is a no-op that reports success
    /// without duplicating delivery (§4.B).
    pub idempotency_key: Option<String>,
    /// Delay before the message becomes visible to [`Queue::receive`].
    /// Clamped to [`MAX_QUEUE_DELAY`] by the driver.
    pub delay: Option<Duration>,
    /// Deployment this message belongs to, carried for multi-tenant drivers.
    pub deployment_id: String,
    /// Opaque trace/propagation headers (e.g. `traceCarrier`).
    pub headers: HashMap<String, String>,
}

/// One delivered message, handed to a [`run_handler`] callback.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// Name of the queue this message was enqueued onto.
    pub queue_name: String,
    /// Driver-assigned message id.
    pub message_id: MessageId,
    /// Redelivery counter, starting at 1 on first delivery (§4.B).
    pub attempt: u32,
    /// Opaque message body, decoded by the caller.
    pub payload: Vec<u8>,
    /// Headers carried from the enqueue call.
    pub headers: HashMap<String, String>,
}

/// Errors surfaced by [`Queue`] operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The requested queue name matched no registered handler prefix.
    #[error("no handler registered for queue {0}")]
    NoHandler(String),
    /// A driver I/O or (de)serialization failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The pluggable durable queue (§4.B): at-least-once delivery, idempotency
/// keys, and delayed dispatch.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Enqueue `payload` onto `name`. A matching `idempotency_key` within the
    /// retention window makes this call a no-op reporting success.
    async fn enqueue(
        &self,
        name: &str,
        payload: Vec<u8>,
        opts: EnqueueOptions,
    ) -> Result<MessageId, QueueError>;

    /// Receive the next message whose queue name starts with `prefix` and
    /// whose delay has elapsed. Waits until one is available.
    async fn receive(&self, prefix: &str) -> Result<Delivery, QueueError>;

    /// Durably acknowledge `delivery`, removing it from the queue so it is
    /// not redelivered.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;
}

/// What a [`run_handler`] callback asks the dispatch loop to do next.
pub enum HandlerOutcome {
    /// The message is fully processed; acknowledge it.
    Done,
    /// Re-schedule this logical unit of work after `timeout`, then
    /// acknowledge the current message (§4.B: the re-enqueue must happen
    /// *before* the ack, so a crash between the two yields at most one
    /// duplicate rather than losing the retry).
    RetryAfter {
        /// Delay before the next attempt, clamped to [`MAX_QUEUE_DELAY`] by
        /// the caller.
        timeout: Duration,
        /// Payload to carry on the rescheduled message (commonly identical
        /// to the one just processed).
        payload: Vec<u8>,
    },
}

/// Drive one `prefix`-matching message through `handler`, honoring the
/// crash-safety ordering required by §4.B: on [`HandlerOutcome::RetryAfter`],
/// the new message is enqueued *before* the current one is acknowledged.
///
/// Returns once one delivery has been processed; callers loop this to keep
/// consuming (see `wkf-runtime`'s suspension/step handler drivers, which
/// also need to inspect the delivery's queue name to route to the right
/// per-workflow or per-step user function before calling this).
pub async fn run_handler<Q, F, Fut>(queue: &Q, prefix: &str, handler: F) -> Result<(), QueueError>
where
    Q: Queue + ?Sized,
    F: FnOnce(Delivery) -> Fut,
    Fut: Future<Output = Result<HandlerOutcome, QueueError>>,
{
    let delivery = queue.receive(prefix).await?;
    let queue_name = delivery.queue_name.clone();
    let deployment_id = delivery
        .headers
        .get("deployment_id")
        .cloned()
        .unwrap_or_default();
    let outcome = handler(delivery.clone()).await?;
    match outcome {
        HandlerOutcome::Done => {
            queue.ack(&delivery).await?;
        }
        HandlerOutcome::RetryAfter { timeout, payload } => {
            let clamped = timeout.min(MAX_QUEUE_DELAY);
            queue
                .enqueue(
                    &queue_name,
                    payload,
                    EnqueueOptions {
                        idempotency_key: None,
                        delay: Some(clamped),
                        deployment_id,
                        headers: delivery.headers.clone(),
                    },
                )
                .await?;
            queue.ack(&delivery).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_delay_is_under_24h() {
        assert!(MAX_QUEUE_DELAY < Duration::from_secs(24 * 3600));
        assert!(MAX_QUEUE_DELAY >= Duration::from_secs(23 * 3600));
    }

    #[test]
    fn message_id_displays_raw_string() {
        let id = MessageId("abc-123".to_string());
        assert_eq!(id.to_string(), "abc-123");
    }
}
