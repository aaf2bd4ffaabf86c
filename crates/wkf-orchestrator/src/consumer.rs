//! The events consumer (§4.C): a single cursor over one invocation's event
//! log snapshot, dispatched to a priority-ordered list of callbacks.
//!
//! Newly registered callbacks must get a chance to observe the current
//! event before it is declared orphaned. This two-phase window is realized
//! with `tokio::task::yield_now` (a same-tick re-entry after every advance)
//! followed by a short `tokio::time::sleep` (the orphan-detection check),
//! matching the scheduling contract in §4.C and §9.

use std::time::Duration;

use wkf_types::{Event, WorkflowError};

/// How long the consumer waits after a fully-unconsumed dispatch pass before
/// concluding the current event is genuinely orphaned. Kept short: this is a
/// scheduling window for same-tick registrations, not a retry delay.
const ORPHAN_DETECTION_WINDOW: Duration = Duration::from_millis(2);

/// What a registered callback decided about the current event (§4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerOutcome {
    /// This callback claimed the event; advance the cursor, keep the callback.
    Consumed,
    /// This callback claimed the event and is now done; advance the cursor,
    /// drop the callback.
    Finished,
    /// Not this callback's event; try the next one.
    NotConsumed,
}

type Callback = Box<dyn FnMut(Option<&Event>) -> ConsumerOutcome + Send>;

/// Drives a single cursor over a fixed event-log snapshot, matching each
/// position against every live callback until one claims it.
pub struct EventsConsumer {
    events: Vec<Event>,
    cursor: usize,
    callbacks: Vec<Callback>,
}

impl EventsConsumer {
    /// Bind a consumer to one invocation's log snapshot (§4.D: "bound to the
    /// current log snapshot").
    pub fn new(events: Vec<Event>) -> Self {
        Self { events, cursor: 0, callbacks: Vec::new() }
    }

    /// Register a callback. It observes the event at the current cursor on
    /// the very next dispatch pass, same as every other live callback.
    pub fn subscribe(&mut self, callback: Callback) {
        self.callbacks.push(callback);
    }

    /// The event the cursor currently points at, or `None` at end-of-log.
    fn current(&self) -> Option<&Event> {
        self.events.get(self.cursor)
    }

    /// One dispatch pass: offer the current position to callbacks in
    /// registration order until one returns `Consumed`/`Finished`.
    fn dispatch_once(&mut self) -> bool {
        let current = self.current().cloned();
        let mut i = 0;
        while i < self.callbacks.len() {
            match (self.callbacks[i])(current.as_ref()) {
                ConsumerOutcome::Consumed => {
                    self.cursor += 1;
                    return true;
                }
                ConsumerOutcome::Finished => {
                    self.callbacks.remove(i);
                    self.cursor += 1;
                    return true;
                }
                ConsumerOutcome::NotConsumed => i += 1,
            }
        }
        false
    }

    /// Run dispatch passes until the cursor can advance no further: either
    /// every live callback has gone quiet at end-of-log (a legitimate
    /// suspension point), or one position goes through a full pass with no
    /// callback claiming it (orphan detection fires, §4.C).
    ///
    /// Returns `Ok(())` once quiescent; callers inspect their own resolution
    /// state afterward to decide between "resolved" and "must suspend".
    pub async fn run_until_quiescent(&mut self) -> Result<(), WorkflowError> {
        loop {
            if self.dispatch_once() {
                // A callback advanced the cursor; give any callback
                // registered during this same pass a chance at the new
                // position before anything is declared orphaned.
                tokio::task::yield_now().await;
                continue;
            }

            if self.callbacks.is_empty() {
                return Ok(());
            }

            let cursor_before = self.cursor;
            tokio::time::sleep(ORPHAN_DETECTION_WINDOW).await;
            if self.cursor != cursor_before {
                // Something consumed the position while we waited (a
                // callback registered in the interim); loop and re-dispatch.
                continue;
            }

            return match self.current() {
                Some(event) => Err(WorkflowError::LogCorruption(format!(
                    "event {} ({:?}) at index {} was not consumed by any registered callback",
                    event.event_id,
                    event.event_type(),
                    self.cursor
                ))),
                None => Ok(()),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use wkf_types::{CorrelationId, EventData, RunId};

    fn sample_event(event_id: u64, correlation_id: &CorrelationId, data: EventData) -> Event {
        Event {
            event_id,
            run_id: RunId::new("wrun_consumer_test").unwrap(),
            correlation_id: Some(correlation_id.clone()),
            event_data: data,
            created_at: Utc::now(),
            spec_version: wkf_types::CURRENT_SPEC_VERSION,
            digest: [0u8; 32],
        }
    }

    #[tokio::test]
    async fn consumed_event_advances_cursor() {
        let run_id = RunId::new("wrun_consumer_test").unwrap();
        let cid = CorrelationId::derive(&run_id, "step", 0);
        let event = sample_event(0, &cid, EventData::StepStarted { attempt: 1 });
        let mut consumer = EventsConsumer::new(vec![event]);
        consumer.subscribe(Box::new(|_| ConsumerOutcome::Consumed));
        consumer.run_until_quiescent().await.unwrap();
        assert_eq!(consumer.cursor, 1);
    }

    #[tokio::test]
    async fn unconsumed_event_is_log_corruption() {
        let run_id = RunId::new("wrun_consumer_test").unwrap();
        let cid = CorrelationId::derive(&run_id, "step", 0);
        let event = sample_event(0, &cid, EventData::StepStarted { attempt: 1 });
        let mut consumer = EventsConsumer::new(vec![event]);
        consumer.subscribe(Box::new(|_| ConsumerOutcome::NotConsumed));
        let err = consumer.run_until_quiescent().await.unwrap_err();
        assert!(matches!(err, WorkflowError::LogCorruption(_)));
    }

    #[tokio::test]
    async fn end_of_log_with_no_callbacks_is_quiescent() {
        let mut consumer = EventsConsumer::new(Vec::new());
        consumer.run_until_quiescent().await.unwrap();
        assert_eq!(consumer.cursor, 0);
    }

    #[tokio::test]
    async fn second_callback_gets_a_turn_after_first_declines() {
        let run_id = RunId::new("wrun_consumer_test").unwrap();
        let cid = CorrelationId::derive(&run_id, "step", 0);
        let event = sample_event(0, &cid, EventData::StepStarted { attempt: 1 });
        let mut consumer = EventsConsumer::new(vec![event]);
        consumer.subscribe(Box::new(|_| ConsumerOutcome::NotConsumed));
        consumer.subscribe(Box::new(|_| ConsumerOutcome::Finished));
        consumer.run_until_quiescent().await.unwrap();
        assert_eq!(consumer.cursor, 1);
    }
}
