//! Suspension handler (§4.F): drains a captured invocation queue into
//! durable event-log appends and queue messages, then reports how soon the
//! run should be re-invoked.
//!
//! Grounded on `toka-runtime`'s background-loop shape for the overall
//! driving pattern and `toka-agent-runtime`'s retry/backoff style for the
//! per-call error handling; the ordering itself (hooks first, then
//! steps+waits together) is dictated by §4.F step-by-step.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use wkf_orchestrator::{InvocationItem, Suspension};
use wkf_queue_core::{EnqueueOptions, Queue, STEP_QUEUE_PREFIX};
use wkf_types::{CorrelationId, EventData, RunId, StructuredError};
use wkf_world_core::World;

use crate::backoff::{hook_conflict_backoff_seconds, with_server_error_retry, with_throttle_retry, ThrottleOutcome};
use crate::messages::StepInvocationMessage;
use crate::RuntimeError;

/// Consecutive conflicted invocations tolerated before a run is forced to
/// `run_failed` rather than retried again (§9 Open Question 2).
const MAX_CONSECUTIVE_HOOK_CONFLICTS: u32 = 5;

/// Drains [`Suspension`]s into durable state, tracking a per-run consecutive
/// hook-conflict counter across calls.
pub struct SuspensionHandler<W, Q> {
    world: Arc<W>,
    queue: Arc<Q>,
    hook_conflicts: DashMap<RunId, u32>,
}

impl<W, Q> SuspensionHandler<W, Q>
where
    W: World + 'static,
    Q: Queue + 'static,
{
    /// Build a handler over `world`/`queue`.
    pub fn new(world: Arc<W>, queue: Arc<Q>) -> Self {
        Self { world, queue, hook_conflicts: DashMap::new() }
    }

    /// Persist every not-yet-created hook, step, and wait in `suspension`,
    /// enqueue continuation messages for newly-created steps, and return the
    /// delay (seconds) until this run should be re-invoked, if any.
    ///
    /// `None` means no timed re-invocation is needed: the suspension was
    /// step-only and the next invocation will be triggered naturally by that
    /// step's own continuation message once it settles.
    #[allow(clippy::too_many_arguments)]
    pub async fn handle(
        &self,
        run_id: &RunId,
        workflow_name: &str,
        deployment_id: &str,
        spec_version: u32,
        workflow_started_at: DateTime<Utc>,
        now: DateTime<Utc>,
        trace_carrier: &HashMap<String, String>,
        suspension: Suspension,
    ) -> Result<Option<u64>, RuntimeError> {
        let mut hooks_to_create = Vec::new();
        let mut steps_to_create = Vec::new();
        let mut waits_to_create = Vec::new();
        let mut all_wait_deadlines = Vec::new();

        for (cid, item) in suspension.invocations {
            match item {
                InvocationItem::Hook { token, metadata, has_created_event } => {
                    if !has_created_event {
                        hooks_to_create.push((cid, token, metadata));
                    }
                }
                InvocationItem::Step { step_name, input, has_created_event } => {
                    if !has_created_event {
                        steps_to_create.push((cid, step_name, input));
                    }
                }
                InvocationItem::Wait { resume_at, has_created_event } => {
                    all_wait_deadlines.push(resume_at);
                    if !has_created_event {
                        waits_to_create.push((cid, resume_at));
                    }
                }
            }
        }

        // Step 1 (§4.F): hooks committed first, in parallel. `withThrottleRetry`
        // wraps `withServerErrorRetry` here exactly as it does in the step
        // handler (§4.G): throttle handling applies to any `events.create`
        // call, not only the step handler's own.
        let hook_outcomes = futures::future::join_all(hooks_to_create.into_iter().map(|(cid, token, metadata)| {
            let world = self.world.clone();
            let run_id = run_id.clone();
            async move {
                let data = EventData::HookCreated { token, metadata };
                match with_throttle_retry(|| with_server_error_retry(|| world.append(&run_id, Some(cid.clone()), data.clone(), spec_version))).await {
                    Ok(ThrottleOutcome::Ready(outcome)) => {
                        let conflicted = outcome.event.as_ref().map(|e| e.event_type())
                            == Some(wkf_types::EventType::HookConflict);
                        Ok((conflicted, None))
                    }
                    Ok(ThrottleOutcome::Reschedule(secs)) => Ok((false, Some(secs))),
                    Err(wkf_world_core::WorldError::Api(api)) if api.is_gone() => {
                        tracing::warn!(%run_id, "run terminated while creating hook, skipping");
                        Ok((false, None))
                    }
                    Err(err) => Err(RuntimeError::from(err)),
                }
            }
        }))
        .await;

        let mut has_hook_conflict = false;
        let mut throttle_reschedules: Vec<u64> = Vec::new();
        for outcome in hook_outcomes {
            let (conflicted, throttled) = outcome?;
            if conflicted {
                has_hook_conflict = true;
            }
            if let Some(secs) = throttled {
                throttle_reschedules.push(secs);
            }
        }

        if has_hook_conflict {
            let count = {
                let mut entry = self.hook_conflicts.entry(run_id.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            if count > MAX_CONSECUTIVE_HOOK_CONFLICTS {
                self.hook_conflicts.remove(run_id);
                let error = StructuredError::new("exceeded maximum consecutive hook token conflicts")
                    .with_code("HOOK_CONFLICT");
                let _ = with_server_error_retry(|| {
                    self.world.append(run_id, None, EventData::RunFailed { error: error.clone() }, spec_version)
                })
                .await;
                return Ok(None);
            }
        } else {
            self.hook_conflicts.remove(run_id);
        }

        // Step 2 (§4.F): steps and waits committed together, in parallel.
        // A throttled step/wait creation is left uncreated (no continuation
        // enqueued) and reported as a reschedule, same as a throttled hook.
        let steps_fut = futures::future::join_all(steps_to_create.into_iter().map(|(cid, step_name, input)| {
            let world = self.world.clone();
            let queue = self.queue.clone();
            let run_id = run_id.clone();
            let workflow_name = workflow_name.to_string();
            let deployment_id = deployment_id.to_string();
            let trace_carrier = trace_carrier.clone();
            async move {
                let data = EventData::StepCreated { step_name: step_name.clone(), input };
                match with_throttle_retry(|| with_server_error_retry(|| world.append(&run_id, Some(cid.clone()), data.clone(), spec_version))).await {
                    Ok(ThrottleOutcome::Ready(_)) => {}
                    Ok(ThrottleOutcome::Reschedule(secs)) => return Ok(Some(secs)),
                    Err(wkf_world_core::WorldError::Api(api)) if api.is_conflict() => {
                        tracing::debug!(step = %cid, "step_created already persisted, idempotent replay");
                    }
                    Err(err) => return Err(RuntimeError::from(err)),
                }

                let message = StepInvocationMessage {
                    step_name: step_name.clone(),
                    workflow_run_id: run_id.as_str().to_string(),
                    workflow_name,
                    workflow_started_at,
                    step_id: cid.to_string(),
                    trace_carrier: trace_carrier.clone(),
                    requested_at: now,
                };
                let payload = serde_json::to_vec(&message).map_err(|e| RuntimeError::Serde(e.to_string()))?;
                let queue_name = format!("{STEP_QUEUE_PREFIX}{step_name}");
                queue
                    .enqueue(
                        &queue_name,
                        payload,
                        EnqueueOptions {
                            idempotency_key: Some(cid.to_string()),
                            delay: None,
                            deployment_id,
                            headers: trace_carrier,
                        },
                    )
                    .await
                    .map_err(RuntimeError::from)?;
                Ok(None)
            }
        }));

        let waits_fut = futures::future::join_all(waits_to_create.into_iter().map(|(cid, resume_at)| {
            let world = self.world.clone();
            let run_id = run_id.clone();
            async move {
                let data = EventData::WaitCreated { resume_at };
                match with_throttle_retry(|| with_server_error_retry(|| world.append(&run_id, Some(cid.clone()), data.clone(), spec_version))).await {
                    Ok(ThrottleOutcome::Ready(_)) => Ok(None),
                    Ok(ThrottleOutcome::Reschedule(secs)) => Ok(Some(secs)),
                    Err(wkf_world_core::WorldError::Api(api)) if api.is_conflict() => Ok(None),
                    Err(err) => Err(RuntimeError::from(err)),
                }
            }
        }));

        let (step_results, wait_results) = futures::future::join(steps_fut, waits_fut).await;
        for result in step_results {
            if let Some(secs) = result? {
                throttle_reschedules.push(secs);
            }
        }
        for result in wait_results {
            if let Some(secs) = result? {
                throttle_reschedules.push(secs);
            }
        }

        if let Some(max_secs) = throttle_reschedules.into_iter().max() {
            return Ok(Some(max_secs));
        }

        if has_hook_conflict {
            let count = self.hook_conflicts.get(run_id).map(|c| *c).unwrap_or(1);
            return Ok(Some(hook_conflict_backoff_seconds(count)));
        }

        let min_wait_timeout = all_wait_deadlines
            .iter()
            .map(|resume_at| {
                let remaining_ms = (*resume_at - now).num_milliseconds().max(1000);
                ((remaining_ms as f64) / 1000.0).ceil() as u64
            })
            .min()
            .map(|secs| secs.min(wkf_queue_core::MAX_QUEUE_DELAY.as_secs()));

        Ok(min_wait_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;
    use wkf_queue_core::Delivery;
    use wkf_types::{CURRENT_SPEC_VERSION, SerializedData};
    use wkf_world_memory::MemoryWorld;
    use wkf_queue_memory::MemoryQueue;

    fn input() -> SerializedData {
        SerializedData { spec_version: CURRENT_SPEC_VERSION, encrypted: false, bytes: vec![] }
    }

    async fn seeded_run(world: &MemoryWorld, run_id: &RunId) {
        world
            .append(run_id, None, EventData::RunCreated { workflow_name: "wf".to_string(), input: input() }, CURRENT_SPEC_VERSION)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn step_only_suspension_enqueues_continuation_and_returns_no_timeout() {
        let world = Arc::new(MemoryWorld::new("dep"));
        let queue = Arc::new(MemoryQueue::new());
        let run_id = RunId::new("wrun_susp_step").unwrap();
        seeded_run(&world, &run_id).await;

        let handler = SuspensionHandler::new(world.clone(), queue.clone());
        let mut invocations = indexmap::IndexMap::new();
        let cid = CorrelationId::derive(&run_id, "step", 0);
        invocations.insert(
            cid.clone(),
            InvocationItem::Step { step_name: "do_thing".to_string(), input: input(), has_created_event: false },
        );

        let now = Utc::now();
        let result = handler
            .handle(&run_id, "wf", "dep", CURRENT_SPEC_VERSION, now, now, &HashMap::new(), Suspension { invocations })
            .await
            .unwrap();
        assert!(result.is_none());

        let step = world.get_step(&cid).await.unwrap().unwrap();
        assert_eq!(step.status, wkf_types::StepStatus::Pending);

        let delivery: Delivery = queue.receive("__wkf_step_do_thing").await.unwrap();
        let msg: StepInvocationMessage = serde_json::from_slice(&delivery.payload).unwrap();
        assert_eq!(msg.step_id, cid.to_string());
    }

    #[tokio::test]
    async fn wait_only_suspension_returns_clamped_timeout() {
        let world = Arc::new(MemoryWorld::new("dep"));
        let queue = Arc::new(MemoryQueue::new());
        let run_id = RunId::new("wrun_susp_wait").unwrap();
        seeded_run(&world, &run_id).await;

        let handler = SuspensionHandler::new(world.clone(), queue.clone());
        let mut invocations = indexmap::IndexMap::new();
        let now = Utc::now();
        let resume_at = now + chrono::Duration::seconds(5);
        invocations.insert(
            CorrelationId::derive(&run_id, "wait", 0),
            InvocationItem::Wait { resume_at, has_created_event: false },
        );

        let result = handler
            .handle(&run_id, "wf", "dep", CURRENT_SPEC_VERSION, now, now, &HashMap::new(), Suspension { invocations })
            .await
            .unwrap();
        assert_eq!(result, Some(5));
    }

    /// A `World` that throttles the first `throttle_responses.len()` calls to
    /// append a `step_created` event, one `retryAfter` per call in order,
    /// then defers to the inner store (§8 scenario 5).
    struct ThrottlingWorld {
        inner: MemoryWorld,
        throttle_responses: Vec<StdDuration>,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl World for ThrottlingWorld {
        async fn append(
            &self,
            run_id: &RunId,
            correlation_id: Option<CorrelationId>,
            data: EventData,
            spec_version: u32,
        ) -> Result<wkf_world_core::AppendOutcome, wkf_world_core::WorldError> {
            if matches!(data, EventData::StepCreated { .. }) {
                let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if let Some(retry_after) = self.throttle_responses.get(call) {
                    return Err(wkf_types::ApiError::throttled(*retry_after).into());
                }
            }
            self.inner.append(run_id, correlation_id, data, spec_version).await
        }

        async fn list_events(&self, run_id: &RunId) -> anyhow::Result<Vec<wkf_types::Event>> {
            self.inner.list_events(run_id).await
        }

        async fn get_run(&self, run_id: &RunId) -> anyhow::Result<Option<wkf_types::Run>> {
            self.inner.get_run(run_id).await
        }

        async fn get_step(&self, step_id: &CorrelationId) -> anyhow::Result<Option<wkf_types::Step>> {
            self.inner.get_step(step_id).await
        }

        async fn get_hook(&self, hook_id: &CorrelationId) -> anyhow::Result<Option<wkf_types::Hook>> {
            self.inner.get_hook(hook_id).await
        }

        async fn get_hook_by_token(&self, token: &str) -> anyhow::Result<Option<wkf_types::Hook>> {
            self.inner.get_hook_by_token(token).await
        }

        async fn get_wait(&self, wait_id: &CorrelationId) -> anyhow::Result<Option<wkf_types::Wait>> {
            self.inner.get_wait(wait_id).await
        }

        async fn encryption_key_for_run(&self, run_id: &RunId) -> anyhow::Result<Option<[u8; 32]>> {
            self.inner.encryption_key_for_run(run_id).await
        }

        fn deployment_id(&self) -> &str {
            self.inner.deployment_id()
        }
    }

    #[tokio::test]
    async fn short_throttle_on_step_created_is_absorbed_by_an_in_process_retry() {
        let world = Arc::new(ThrottlingWorld {
            inner: MemoryWorld::new("dep"),
            throttle_responses: vec![StdDuration::from_millis(5)],
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let queue = Arc::new(MemoryQueue::new());
        let run_id = RunId::new("wrun_susp_throttle_short").unwrap();
        world
            .append(&run_id, None, EventData::RunCreated { workflow_name: "wf".to_string(), input: input() }, CURRENT_SPEC_VERSION)
            .await
            .unwrap();

        let handler = SuspensionHandler::new(world.clone(), queue.clone());
        let mut invocations = indexmap::IndexMap::new();
        let cid = CorrelationId::derive(&run_id, "step", 0);
        invocations.insert(
            cid.clone(),
            InvocationItem::Step { step_name: "do_thing".to_string(), input: input(), has_created_event: false },
        );

        let now = Utc::now();
        let result = handler
            .handle(&run_id, "wf", "dep", CURRENT_SPEC_VERSION, now, now, &HashMap::new(), Suspension { invocations })
            .await
            .unwrap();

        assert!(result.is_none(), "a short retryAfter should be absorbed in-process, not surfaced as a reschedule");
        let step = world.get_step(&cid).await.unwrap().unwrap();
        assert_eq!(step.status, wkf_types::StepStatus::Pending);
    }

    #[tokio::test]
    async fn long_throttle_on_step_created_is_reported_as_a_reschedule() {
        // `with_throttle_retry` only sleeps-and-retries once; a second
        // consecutive 429 is always reported as a reschedule regardless of
        // its own `retryAfter` magnitude, so the first response must be short
        // enough for the in-process retry to actually happen in a unit test.
        let world = Arc::new(ThrottlingWorld {
            inner: MemoryWorld::new("dep"),
            throttle_responses: vec![StdDuration::from_millis(5), StdDuration::from_secs(7)],
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let queue = Arc::new(MemoryQueue::new());
        let run_id = RunId::new("wrun_susp_throttle_long").unwrap();
        world
            .append(&run_id, None, EventData::RunCreated { workflow_name: "wf".to_string(), input: input() }, CURRENT_SPEC_VERSION)
            .await
            .unwrap();

        let handler = SuspensionHandler::new(world.clone(), queue.clone());
        let mut invocations = indexmap::IndexMap::new();
        let cid = CorrelationId::derive(&run_id, "step", 0);
        invocations.insert(
            cid.clone(),
            InvocationItem::Step { step_name: "do_thing".to_string(), input: input(), has_created_event: false },
        );

        let now = Utc::now();
        let result = handler
            .handle(&run_id, "wf", "dep", CURRENT_SPEC_VERSION, now, now, &HashMap::new(), Suspension { invocations })
            .await
            .unwrap();

        assert_eq!(result, Some(7));
        // Not yet created: the message was never enqueued, so a fresh
        // suspension on the next invocation will retry `step_created`.
        assert!(world.get_step(&cid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn hook_conflict_forces_run_failed_after_five_strikes() {
        let world = Arc::new(MemoryWorld::new("dep"));
        let queue = Arc::new(MemoryQueue::new());
        let handler = SuspensionHandler::new(world.clone(), queue.clone());
        let run_id = RunId::new("wrun_susp_hookconflict").unwrap();
        seeded_run(&world, &run_id).await;

        // Pre-create a hook with the token so every subsequent attempt conflicts.
        world
            .append(
                &run_id,
                Some(CorrelationId::derive(&run_id, "hook", 999)),
                EventData::HookCreated { token: "shared".to_string(), metadata: None },
                CURRENT_SPEC_VERSION,
            )
            .await
            .unwrap();

        let now = Utc::now();
        for i in 0..6u32 {
            let mut invocations = indexmap::IndexMap::new();
            invocations.insert(
                CorrelationId::derive(&run_id, "hook", i),
                InvocationItem::Hook { token: "shared".to_string(), metadata: None, has_created_event: false },
            );
            let result = handler
                .handle(&run_id, "wf", "dep", CURRENT_SPEC_VERSION, now, now, &HashMap::new(), Suspension { invocations })
                .await
                .unwrap();
            if i < 5 {
                assert!(result.is_some(), "attempt {i} should still be a backoff retry");
            } else {
                assert!(result.is_none(), "the 6th consecutive conflict should force run_failed");
            }
        }

        let run = world.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, wkf_types::RunStatus::Failed);
        let _ = StdDuration::from_secs(0);
    }
}
