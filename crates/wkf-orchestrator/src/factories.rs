//! Consumer factories (§4.E): the step, hook, and sleep awaits user code
//! calls from inside a registered workflow function.
//!
//! Each factory enqueues an [`InvocationItem`], subscribes a callback to the
//! context's [`EventsConsumer`], drives dispatch to quiescence, and either
//! returns the resolved value or propagates [`Suspend`]. The callbacks
//! themselves write into `Arc<Mutex<_>>` cells rather than capturing `&mut
//! OrchestratorContext` directly: they are boxed as `'static + Send` trait
//! objects stored inside the consumer, so they cannot borrow the context
//! they were created from.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use wkf_types::{CorrelationId, EventData, SerializedData, StructuredError, WorkflowError};

use crate::consumer::ConsumerOutcome;
use crate::context::{HookSignal, OrchestratorContext};
use crate::invocation::{Interrupt, InvocationItem, Suspend};

enum StepSignal {
    Completed(SerializedData),
    Failed(StructuredError),
    Corrupt(String),
}

/// Await a step's terminal event (§4.E.1), enqueuing its creation on first
/// entry and re-issuing automatically on `step_retrying` replay.
pub async fn await_step(
    ctx: &mut OrchestratorContext,
    step_name: &str,
    input: SerializedData,
) -> Result<SerializedData, Interrupt> {
    let correlation_id = ctx.next_correlation_id("step");
    ctx.invocations.entry(correlation_id.clone()).or_insert_with(|| InvocationItem::Step {
        step_name: step_name.to_string(),
        input,
        has_created_event: false,
    });

    let resolved: Arc<Mutex<Option<StepSignal>>> = Arc::new(Mutex::new(None));
    let created = Arc::new(Mutex::new(false));
    {
        let resolved = resolved.clone();
        let created = created.clone();
        let target = correlation_id.clone();
        ctx.events.subscribe(Box::new(move |event| match event {
            None => ConsumerOutcome::NotConsumed,
            Some(event) if event.correlation_id.as_ref() != Some(&target) => ConsumerOutcome::NotConsumed,
            Some(event) => match &event.event_data {
                EventData::StepCreated { .. } => {
                    *created.lock().expect("not poisoned") = true;
                    ConsumerOutcome::Consumed
                }
                EventData::StepRetrying { .. } => ConsumerOutcome::Consumed,
                EventData::StepCompleted { result } => {
                    *resolved.lock().expect("not poisoned") = Some(StepSignal::Completed(result.clone()));
                    ConsumerOutcome::Finished
                }
                EventData::StepFailed { error } => {
                    *resolved.lock().expect("not poisoned") = Some(StepSignal::Failed(error.clone()));
                    ConsumerOutcome::Finished
                }
                other => {
                    *resolved.lock().expect("not poisoned") =
                        Some(StepSignal::Corrupt(format!("unexpected {:?} for step {target}", other.event_type())));
                    ConsumerOutcome::Finished
                }
            },
        }));
    }

    ctx.events.run_until_quiescent().await.map_err(Interrupt::Fatal)?;

    if *created.lock().expect("not poisoned") {
        if let Some(item) = ctx.invocations.get_mut(&correlation_id) {
            if let InvocationItem::Step { has_created_event, .. } = item {
                *has_created_event = true;
            }
        }
    }

    match resolved.lock().expect("not poisoned").take() {
        Some(StepSignal::Completed(result)) => {
            ctx.invocations.shift_remove(&correlation_id);
            Ok(result)
        }
        Some(StepSignal::Failed(error)) => {
            ctx.invocations.shift_remove(&correlation_id);
            Err(Interrupt::Fatal(WorkflowError::Fatal(error)))
        }
        Some(StepSignal::Corrupt(message)) => {
            ctx.invocations.shift_remove(&correlation_id);
            Err(Interrupt::Fatal(WorkflowError::LogCorruption(message)))
        }
        None => Err(Suspend.into()),
    }
}

/// A live or replaying hook: both a single-payload "thenable" via
/// [`HookHandle::next`] and, by repeated calls, a stream of payloads until
/// `hook_disposed` (§4.E.2).
///
/// This handle cannot also implement `futures::Stream` directly: every poll
/// needs `&mut OrchestratorContext` to drive dispatch, and `Stream::poll_next`
/// takes none. Callers loop `next(ctx)` instead — a deliberate design choice
/// (§9), not an omission.
pub struct HookHandle {
    hook_id: CorrelationId,
    token: String,
}

impl HookHandle {
    /// Create (or, on replay, rejoin) a hook addressed by `token` (§4.E.2).
    pub fn create(ctx: &mut OrchestratorContext, token: impl Into<String>, metadata: Option<SerializedData>) -> Self {
        let token = token.into();
        let hook_id = ctx.next_correlation_id("hook");
        ctx.invocations.entry(hook_id.clone()).or_insert_with(|| InvocationItem::Hook {
            token: token.clone(),
            metadata,
            has_created_event: false,
        });
        ctx.hook_buffers.entry(hook_id.clone()).or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())));
        ctx.hook_signal.entry(hook_id.clone()).or_insert_with(|| Arc::new(Mutex::new(HookSignal::Live)));
        Self { hook_id, token }
    }

    /// The token this hook is addressed by.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// This hook's correlation id.
    pub fn hook_id(&self) -> &CorrelationId {
        &self.hook_id
    }

    /// Resolve the next payload, `None` once `hook_disposed` has been
    /// observed and the buffer is drained.
    pub async fn next(&self, ctx: &mut OrchestratorContext) -> Result<Option<SerializedData>, Interrupt> {
        if let Some(buffer) = ctx.hook_buffers.get(&self.hook_id) {
            if let Some(payload) = buffer.lock().expect("not poisoned").pop_front() {
                return Ok(Some(payload));
            }
        }

        let buffer = ctx.hook_buffers.entry(self.hook_id.clone()).or_insert_with(|| Arc::new(Mutex::new(VecDeque::new()))).clone();
        let signal = ctx
            .hook_signal
            .entry(self.hook_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(HookSignal::Live)))
            .clone();

        let created = Arc::new(Mutex::new(false));
        {
            let buffer = buffer.clone();
            let signal = signal.clone();
            let created = created.clone();
            let target = self.hook_id.clone();
            ctx.events.subscribe(Box::new(move |event| match event {
                None => ConsumerOutcome::NotConsumed,
                Some(event) if event.correlation_id.as_ref() != Some(&target) => ConsumerOutcome::NotConsumed,
                Some(event) => match &event.event_data {
                    EventData::HookCreated { .. } => {
                        *created.lock().expect("not poisoned") = true;
                        ConsumerOutcome::Consumed
                    }
                    EventData::HookConflict { .. } => {
                        *signal.lock().expect("not poisoned") = HookSignal::Conflicted;
                        ConsumerOutcome::Finished
                    }
                    EventData::HookReceived { payload } => {
                        buffer.lock().expect("not poisoned").push_back(payload.clone());
                        ConsumerOutcome::Consumed
                    }
                    EventData::HookDisposed => {
                        *signal.lock().expect("not poisoned") = HookSignal::Disposed;
                        ConsumerOutcome::Finished
                    }
                    _ => ConsumerOutcome::NotConsumed,
                },
            }));
        }

        ctx.events.run_until_quiescent().await.map_err(Interrupt::Fatal)?;

        if *created.lock().expect("not poisoned") {
            if let Some(item) = ctx.invocations.get_mut(&self.hook_id) {
                if let InvocationItem::Hook { has_created_event, .. } = item {
                    *has_created_event = true;
                }
            }
        }

        if let Some(payload) = buffer.lock().expect("not poisoned").pop_front() {
            return Ok(Some(payload));
        }

        match &*signal.lock().expect("not poisoned") {
            HookSignal::Conflicted => {
                ctx.invocations.shift_remove(&self.hook_id);
                Err(Interrupt::Fatal(WorkflowError::HookConflict(self.token.clone())))
            }
            HookSignal::Disposed => {
                ctx.invocations.shift_remove(&self.hook_id);
                Ok(None)
            }
            HookSignal::Live => Err(Suspend.into()),
        }
    }
}

/// Await a timed wait's completion (§4.E.3).
pub async fn sleep_until(ctx: &mut OrchestratorContext, resume_at: DateTime<Utc>) -> Result<(), Interrupt> {
    let correlation_id = ctx.next_correlation_id("wait");
    ctx.invocations
        .entry(correlation_id.clone())
        .or_insert_with(|| InvocationItem::Wait { resume_at, has_created_event: false });

    let resolved: Arc<Mutex<Option<Result<(), String>>>> = Arc::new(Mutex::new(None));
    let created = Arc::new(Mutex::new(false));
    {
        let resolved = resolved.clone();
        let created = created.clone();
        let target = correlation_id.clone();
        ctx.events.subscribe(Box::new(move |event| match event {
            None => ConsumerOutcome::NotConsumed,
            Some(event) if event.correlation_id.as_ref() != Some(&target) => ConsumerOutcome::NotConsumed,
            Some(event) => match &event.event_data {
                EventData::WaitCreated { .. } => {
                    *created.lock().expect("not poisoned") = true;
                    ConsumerOutcome::Consumed
                }
                EventData::WaitCompleted => {
                    *resolved.lock().expect("not poisoned") = Some(Ok(()));
                    ConsumerOutcome::Finished
                }
                other => {
                    *resolved.lock().expect("not poisoned") =
                        Some(Err(format!("unexpected {:?} for wait {target}", other.event_type())));
                    ConsumerOutcome::Finished
                }
            },
        }));
    }

    ctx.events.run_until_quiescent().await.map_err(Interrupt::Fatal)?;

    if *created.lock().expect("not poisoned") {
        if let Some(item) = ctx.invocations.get_mut(&correlation_id) {
            if let InvocationItem::Wait { has_created_event, .. } = item {
                *has_created_event = true;
            }
        }
    }

    match resolved.lock().expect("not poisoned").take() {
        Some(Ok(())) => {
            ctx.invocations.shift_remove(&correlation_id);
            Ok(())
        }
        Some(Err(message)) => {
            ctx.invocations.shift_remove(&correlation_id);
            Err(Interrupt::Fatal(WorkflowError::LogCorruption(message)))
        }
        None => Err(Suspend.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use wkf_types::{Event, RunId, CURRENT_SPEC_VERSION};

    fn run_id() -> RunId {
        RunId::new("wrun_factory_test").unwrap()
    }

    fn event(event_id: u64, correlation_id: CorrelationId, data: EventData) -> Event {
        Event {
            event_id,
            run_id: run_id(),
            correlation_id: Some(correlation_id),
            event_data: data,
            created_at: Utc::now(),
            spec_version: CURRENT_SPEC_VERSION,
            digest: [0u8; 32],
        }
    }

    #[tokio::test]
    async fn step_with_no_log_suspends() {
        let mut ctx = OrchestratorContext::new(run_id(), CURRENT_SPEC_VERSION, Vec::new(), Utc::now(), None);
        let input = SerializedData { spec_version: CURRENT_SPEC_VERSION, encrypted: false, bytes: vec![] };
        let err = await_step(&mut ctx, "do_thing", input).await.unwrap_err();
        assert!(matches!(err, Interrupt::Suspend));
        assert_eq!(ctx.invocations.len(), 1);
    }

    #[tokio::test]
    async fn step_completed_in_log_resolves() {
        let rid = run_id();
        let cid = CorrelationId::derive(&rid, "step", 0);
        let result = SerializedData { spec_version: CURRENT_SPEC_VERSION, encrypted: false, bytes: vec![9] };
        let log = vec![
            event(0, cid.clone(), EventData::StepCreated { step_name: "do_thing".into(), input: result.clone() }),
            event(1, cid, EventData::StepCompleted { result: result.clone() }),
        ];
        let mut ctx = OrchestratorContext::new(rid, CURRENT_SPEC_VERSION, log, Utc::now(), None);
        let input = SerializedData { spec_version: CURRENT_SPEC_VERSION, encrypted: false, bytes: vec![] };
        let out = await_step(&mut ctx, "do_thing", input).await.unwrap();
        assert_eq!(out, result);
        assert!(ctx.invocations.is_empty());
    }

    #[tokio::test]
    async fn sleep_with_no_log_suspends() {
        let mut ctx = OrchestratorContext::new(run_id(), CURRENT_SPEC_VERSION, Vec::new(), Utc::now(), None);
        let err = sleep_until(&mut ctx, Utc::now() + ChronoDuration::seconds(1)).await.unwrap_err();
        assert!(matches!(err, Interrupt::Suspend));
    }

    #[tokio::test]
    async fn hook_conflict_is_fatal() {
        let rid = run_id();
        let cid = CorrelationId::derive(&rid, "hook", 0);
        let log = vec![event(0, cid, EventData::HookConflict { token: "dup".into() })];
        let mut ctx = OrchestratorContext::new(rid, CURRENT_SPEC_VERSION, log, Utc::now(), None);
        let hook = HookHandle::create(&mut ctx, "dup", None);
        let err = hook.next(&mut ctx).await.unwrap_err();
        assert!(matches!(err, Interrupt::Fatal(WorkflowError::HookConflict(_))));
    }

    #[tokio::test]
    async fn hook_received_then_disposed_drains_then_ends() {
        let rid = run_id();
        let cid = CorrelationId::derive(&rid, "hook", 0);
        let payload = SerializedData { spec_version: CURRENT_SPEC_VERSION, encrypted: false, bytes: vec![7] };
        let log = vec![
            event(0, cid.clone(), EventData::HookCreated { token: "t-1".into(), metadata: None }),
            event(1, cid.clone(), EventData::HookReceived { payload: payload.clone() }),
            event(2, cid, EventData::HookDisposed),
        ];
        let mut ctx = OrchestratorContext::new(rid, CURRENT_SPEC_VERSION, log, Utc::now(), None);
        let hook = HookHandle::create(&mut ctx, "t-1", None);
        assert_eq!(hook.next(&mut ctx).await.unwrap(), Some(payload));
        assert_eq!(hook.next(&mut ctx).await.unwrap(), None);
    }
}
