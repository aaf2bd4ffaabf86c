#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wkf-queue-memory** – In-memory durable queue driver for the workflow
//! runtime (§4.B).
//!
//! Grounded on `toka-bus-core::InMemoryBus` for the crate shape (a single
//! struct wrapping shared interior state behind an async lock, a `new`/
//! `with_capacity` pair), generalized from broadcast pub/sub to an
//! acknowledged, at-least-once queue. Visibility delays are driven the way
//! `toka-runtime`'s event loop drives its own wait points: a `receive` call
//! polls for a ready message and, finding none, sleeps until the earliest
//! candidate's delay elapses (or a bounded poll interval, whichever is
//! sooner) rather than parking on a dedicated timer wheel. This keeps the
//! driver simple; it is a development/test backend, not the one a
//! production deployment would run (an external broker is expected there).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::sync::{Mutex, Notify};

use wkf_queue_core::{Delivery, EnqueueOptions, MessageId, Queue, QueueError, MAX_QUEUE_DELAY};

/// How long a delivered-but-unacknowledged message stays invisible before
/// being considered abandoned and redelivered (at-least-once semantics).
const VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll granularity used when no message is yet visible and none is due
/// soon enough to compute an exact wake time worth sleeping for.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

struct Message {
    queue_name: String,
    payload: Vec<u8>,
    headers: HashMap<String, String>,
    idempotency_key: Option<String>,
    delivered_count: u32,
    visible_at: Instant,
}

struct Inner {
    messages: IndexMap<MessageId, Message>,
    idempotency: HashMap<String, MessageId>,
    next_id: u64,
}

/// An in-memory, non-persistent [`Queue`] driver.
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    /// Construct an empty queue.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                messages: IndexMap::new(),
                idempotency: HashMap::new(),
                next_id: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Number of messages currently held (delivered or not).
    pub async fn len(&self) -> usize {
        self.inner.lock().await.messages.len()
    }

    /// Whether the queue holds no messages.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(
        &self,
        name: &str,
        payload: Vec<u8>,
        opts: EnqueueOptions,
    ) -> Result<MessageId, QueueError> {
        let mut inner = self.inner.lock().await;

        if let Some(key) = &opts.idempotency_key {
            if let Some(existing) = inner.idempotency.get(key) {
                return Ok(existing.clone());
            }
        }

        let id = MessageId(format!("msg_{}", inner.next_id));
        inner.next_id += 1;

        let delay = opts.delay.unwrap_or(Duration::ZERO).min(MAX_QUEUE_DELAY);
        let message = Message {
            queue_name: name.to_string(),
            payload,
            headers: opts.headers,
            idempotency_key: opts.idempotency_key.clone(),
            delivered_count: 0,
            visible_at: Instant::now() + delay,
        };

        if let Some(key) = opts.idempotency_key {
            inner.idempotency.insert(key, id.clone());
        }
        inner.messages.insert(id.clone(), message);
        drop(inner);
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn receive(&self, prefix: &str) -> Result<Delivery, QueueError> {
        loop {
            let mut wait_for = None;
            {
                let mut inner = self.inner.lock().await;
                let now = Instant::now();
                let mut ready_id = None;
                for (id, msg) in inner.messages.iter() {
                    if !msg.queue_name.starts_with(prefix) {
                        continue;
                    }
                    if msg.visible_at <= now {
                        ready_id = Some(id.clone());
                        break;
                    }
                    wait_for = Some(match wait_for {
                        Some(existing) if existing < msg.visible_at => existing,
                        _ => msg.visible_at,
                    });
                }

                if let Some(id) = ready_id {
                    let msg = inner.messages.get_mut(&id).expect("just matched");
                    msg.delivered_count += 1;
                    msg.visible_at = now + VISIBILITY_TIMEOUT;
                    return Ok(Delivery {
                        queue_name: msg.queue_name.clone(),
                        message_id: id,
                        attempt: msg.delivered_count,
                        payload: msg.payload.clone(),
                        headers: msg.headers.clone(),
                    });
                }
            }

            let sleep_for = wait_for
                .map(|at| at.saturating_duration_since(Instant::now()))
                .unwrap_or(POLL_INTERVAL)
                .min(POLL_INTERVAL.max(Duration::from_millis(1)));
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.notify.notified() => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        if let Some(msg) = inner.messages.shift_remove(&delivery.message_id) {
            if let Some(key) = msg.idempotency_key {
                inner.idempotency.remove(&key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> EnqueueOptions {
        EnqueueOptions { idempotency_key: None, delay: None, deployment_id: "dep".into(), headers: HashMap::new() }
    }

    #[tokio::test]
    async fn enqueue_then_receive_then_ack() {
        let queue = MemoryQueue::new();
        queue.enqueue("__wkf_step_foo", b"payload".to_vec(), opts()).await.unwrap();
        let delivery = queue.receive("__wkf_step_").await.unwrap();
        assert_eq!(delivery.attempt, 1);
        assert_eq!(delivery.payload, b"payload");
        queue.ack(&delivery).await.unwrap();
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn idempotency_key_dedupes() {
        let queue = MemoryQueue::new();
        let mut o = opts();
        o.idempotency_key = Some("step-1".to_string());
        let a = queue.enqueue("__wkf_step_foo", b"1".to_vec(), o.clone()).await.unwrap();
        let b = queue.enqueue("__wkf_step_foo", b"2".to_vec(), o).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn prefix_routes_to_matching_handler_only() {
        let queue = MemoryQueue::new();
        queue.enqueue("__wkf_workflow_wf", b"w".to_vec(), opts()).await.unwrap();
        queue.enqueue("__wkf_step_do_thing", b"s".to_vec(), opts()).await.unwrap();
        let step = queue.receive("__wkf_step_").await.unwrap();
        assert_eq!(step.payload, b"s");
        let wf = queue.receive("__wkf_workflow_").await.unwrap();
        assert_eq!(wf.payload, b"w");
    }

    #[tokio::test]
    async fn delayed_message_not_visible_until_elapsed() {
        let queue = MemoryQueue::new();
        let mut o = opts();
        o.delay = Some(Duration::from_millis(60));
        queue.enqueue("__wkf_step_foo", b"later".to_vec(), o).await.unwrap();

        let start = Instant::now();
        let delivery = queue.receive("__wkf_step_").await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(55));
        assert_eq!(delivery.payload, b"later");
    }

    #[tokio::test]
    async fn attempt_counter_starts_at_one() {
        let queue = MemoryQueue::new();
        queue.enqueue("__wkf_step_foo", b"x".to_vec(), opts()).await.unwrap();
        let delivery = queue.receive("__wkf_step_").await.unwrap();
        assert_eq!(delivery.attempt, 1);
    }
}
