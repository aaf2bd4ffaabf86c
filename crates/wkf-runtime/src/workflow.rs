//! Drives one `__wkf_workflow_<name>` message to completion: load the run's
//! log, append `wait_completed` for any elapsed wait, invoke the
//! orchestrator, and record the result.
//!
//! The event log has no independent "timer" mechanism — §4.B only promises
//! delayed *delivery* of queue messages, not a standing clock inside the
//! log. A wait's `resume_at` deadline is therefore checked here, the one
//! place that is guaranteed to run again once the delay elapses (the
//! suspension handler scheduled this very re-invocation via `timeoutSeconds`
//! for exactly that reason): before replaying user code, this handler scans
//! the log for any `wait_created` without a matching `wait_completed` whose
//! deadline has passed and appends it, so the orchestrator's `sleep_until`
//! factory sees a settled event on this replay instead of suspending again.

use std::sync::Arc;

use chrono::Utc;
use wkf_orchestrator::{OrchestratorContext, WorkflowOutcome};
use wkf_queue_core::{HandlerOutcome, Queue, QueueError};
use wkf_types::{CorrelationId, EventData, EventType, RunId, RunStatus, StructuredError, WorkflowError};
use wkf_world_core::World;

use crate::backoff::with_server_error_retry;
use crate::messages::WorkflowInvocationMessage;
use crate::suspension::SuspensionHandler;
use crate::RuntimeError;

/// Drives `__wkf_workflow_<name>` queue messages for every registered
/// workflow (the registry is process-wide in `wkf_orchestrator::registry`,
/// so one handler instance serves all workflow names).
pub struct WorkflowHandler<W, Q> {
    world: Arc<W>,
    queue: Arc<Q>,
    suspension: SuspensionHandler<W, Q>,
}

impl<W, Q> WorkflowHandler<W, Q>
where
    W: World + 'static,
    Q: Queue + 'static,
{
    /// Build a handler over `world`/`queue`.
    pub fn new(world: Arc<W>, queue: Arc<Q>) -> Self {
        let suspension = SuspensionHandler::new(world.clone(), queue.clone());
        Self { world, queue, suspension }
    }

    /// Process one delivered `WorkflowInvocationMessage`, returning the
    /// outcome for the caller's [`wkf_queue_core::run_handler`] loop.
    pub async fn handle_payload(&self, payload: &[u8]) -> Result<HandlerOutcome, QueueError> {
        let message: WorkflowInvocationMessage = serde_json::from_slice(payload)
            .map_err(|e| QueueError::Other(anyhow::anyhow!("invalid workflow invocation payload: {e}")))?;
        let run_id = RunId::new(&message.run_id)
            .map_err(|e| QueueError::Other(anyhow::anyhow!("invalid run id in workflow invocation: {e}")))?;

        match self.handle(&run_id, &message).await {
            Ok(outcome) => Ok(outcome),
            Err(RuntimeError::Queue(err)) => Err(err),
            Err(err) => Err(QueueError::Other(anyhow::Error::new(err))),
        }
    }

    async fn handle(&self, run_id: &RunId, message: &WorkflowInvocationMessage) -> Result<HandlerOutcome, RuntimeError> {
        let Some(run) = self.world.get_run(run_id).await.map_err(wkf_world_core::WorldError::Other)? else {
            tracing::warn!(%run_id, "workflow invocation for unknown run, dropping");
            return Ok(HandlerOutcome::Done);
        };
        if run.status.is_terminal() {
            tracing::debug!(%run_id, status = ?run.status, "run already terminal, nothing to do");
            return Ok(HandlerOutcome::Done);
        }

        let now = Utc::now();
        let mut events = self.world.list_events(run_id).await.map_err(wkf_world_core::WorldError::Other)?;
        self.complete_elapsed_waits(run_id, &mut events, run.spec_version, now).await?;

        let workflow = wkf_orchestrator::lookup(&run.workflow_name)?;
        let encryption_key = self.world.encryption_key_for_run(run_id).await.map_err(wkf_world_core::WorldError::Other)?;
        let ctx = OrchestratorContext::new(run_id.clone(), run.spec_version, events, now, encryption_key);

        match wkf_orchestrator::invoke(workflow, ctx, run.input.clone()).await {
            Ok(WorkflowOutcome::Completed(output)) => {
                self.finish_run(run_id, run.spec_version, EventData::RunCompleted { output }).await?;
                Ok(HandlerOutcome::Done)
            }
            Ok(WorkflowOutcome::Suspended(suspension)) => {
                let timeout = self
                    .suspension
                    .handle(
                        run_id,
                        &run.workflow_name,
                        &run.deployment_id,
                        run.spec_version,
                        run.created_at,
                        now,
                        &message.trace_carrier,
                        suspension,
                    )
                    .await?;
                match timeout {
                    Some(secs) => Ok(HandlerOutcome::RetryAfter {
                        timeout: std::time::Duration::from_secs(secs),
                        payload: serde_json::to_vec(message).map_err(|e| RuntimeError::Serde(e.to_string()))?,
                    }),
                    None => Ok(HandlerOutcome::Done),
                }
            }
            Err(WorkflowError::Api(api)) if api.is_gone() => {
                tracing::debug!(%run_id, "run terminated concurrently, dropping invocation");
                Ok(HandlerOutcome::Done)
            }
            Err(err) => {
                let error = to_structured_error(&err);
                self.finish_run(run_id, run.spec_version, EventData::RunFailed { error }).await?;
                Ok(HandlerOutcome::Done)
            }
        }
    }

    async fn finish_run(&self, run_id: &RunId, spec_version: u32, data: EventData) -> Result<(), RuntimeError> {
        match with_server_error_retry(|| self.world.append(run_id, None, data.clone(), spec_version)).await {
            Ok(_) => Ok(()),
            Err(wkf_world_core::WorldError::Api(api)) if api.is_conflict() || api.is_gone() => {
                tracing::debug!(%run_id, "run already terminal, idempotent replay");
                Ok(())
            }
            Err(err) => Err(RuntimeError::from(err)),
        }
    }

    async fn complete_elapsed_waits(
        &self,
        run_id: &RunId,
        events: &mut Vec<wkf_types::Event>,
        spec_version: u32,
        now: chrono::DateTime<Utc>,
    ) -> Result<(), RuntimeError> {
        let mut pending: Vec<CorrelationId> = Vec::new();
        for event in events.iter() {
            let Some(cid) = &event.correlation_id else { continue };
            match event.event_type() {
                EventType::WaitCreated => {
                    if let EventData::WaitCreated { resume_at } = &event.event_data {
                        if *resume_at <= now {
                            pending.push(cid.clone());
                        }
                    }
                }
                EventType::WaitCompleted => {
                    pending.retain(|id| id != cid);
                }
                _ => {}
            }
        }

        for cid in pending {
            match with_server_error_retry(|| {
                self.world.append(run_id, Some(cid.clone()), EventData::WaitCompleted, spec_version)
            })
            .await
            {
                Ok(outcome) => {
                    if let Some(event) = outcome.event {
                        events.push(event);
                    }
                }
                Err(wkf_world_core::WorldError::Api(api)) if api.is_conflict() => {
                    tracing::debug!(wait = %cid, "wait_completed already persisted, idempotent replay");
                }
                Err(err) => return Err(RuntimeError::from(err)),
            }
        }
        Ok(())
    }
}

fn to_structured_error(err: &WorkflowError) -> StructuredError {
    match err {
        WorkflowError::Api(api) => StructuredError::new(api.message.clone()).with_code("API_ERROR"),
        WorkflowError::LogCorruption(msg) => StructuredError::new(msg.clone()).with_code("LOG_CORRUPTION"),
        WorkflowError::HookConflict(msg) => StructuredError::new(msg.clone()).with_code("HOOK_CONFLICT"),
        WorkflowError::Fatal(structured) => structured.clone(),
        WorkflowError::Misconfigured(msg) => StructuredError::new(msg.clone()).with_code("MISCONFIGURED"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use wkf_codec::encode;
    use wkf_orchestrator::{await_step, register, sleep_until, WorkflowFn};
    use wkf_queue_memory::MemoryQueue;
    use wkf_types::{RunId as WkfRunId, CURRENT_SPEC_VERSION};
    use wkf_world_memory::MemoryWorld;

    fn handler() -> WorkflowHandler<MemoryWorld, MemoryQueue> {
        WorkflowHandler::new(StdArc::new(MemoryWorld::new("dep")), StdArc::new(MemoryQueue::new()))
    }

    #[tokio::test]
    async fn unknown_run_is_dropped_without_error() {
        let h = handler();
        let msg = WorkflowInvocationMessage { run_id: "wrun_missing".to_string(), trace_carrier: Default::default() };
        let outcome = h.handle(&WkfRunId::new("wrun_missing").unwrap(), &msg).await.unwrap();
        assert!(matches!(outcome, HandlerOutcome::Done));
    }

    #[tokio::test]
    async fn completed_workflow_appends_run_completed() {
        register("wf-echo-no-await", StdArc::new(|_ctx, input| Box::pin(async move { Ok(input) })) as WorkflowFn).unwrap();

        let world = StdArc::new(MemoryWorld::new("dep"));
        let queue = StdArc::new(MemoryQueue::new());
        let run_id = WkfRunId::new("wrun_workflow_complete").unwrap();
        let input = encode(&"hi".to_string(), CURRENT_SPEC_VERSION).unwrap();
        world
            .append(&run_id, None, EventData::RunCreated { workflow_name: "wf-echo-no-await".to_string(), input }, CURRENT_SPEC_VERSION)
            .await
            .unwrap();

        let h = WorkflowHandler::new(world.clone(), queue);
        let msg = WorkflowInvocationMessage { run_id: run_id.as_str().to_string(), trace_carrier: Default::default() };
        let outcome = h.handle(&run_id, &msg).await.unwrap();
        assert!(matches!(outcome, HandlerOutcome::Done));

        let run = world.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn suspended_step_only_workflow_returns_done_and_waits_on_step_continuation() {
        register(
            "wf-one-step",
            StdArc::new(|ctx, input| Box::pin(async move { await_step(ctx, "noop_step", input).await })) as WorkflowFn,
        )
        .unwrap();

        let world = StdArc::new(MemoryWorld::new("dep"));
        let queue = StdArc::new(MemoryQueue::new());
        let run_id = WkfRunId::new("wrun_workflow_one_step").unwrap();
        let input = encode(&"hi".to_string(), CURRENT_SPEC_VERSION).unwrap();
        world
            .append(&run_id, None, EventData::RunCreated { workflow_name: "wf-one-step".to_string(), input }, CURRENT_SPEC_VERSION)
            .await
            .unwrap();

        let h = WorkflowHandler::new(world.clone(), queue.clone());
        let msg = WorkflowInvocationMessage { run_id: run_id.as_str().to_string(), trace_carrier: Default::default() };
        let outcome = h.handle(&run_id, &msg).await.unwrap();
        assert!(matches!(outcome, HandlerOutcome::Done));

        let delivery = queue.receive("__wkf_step_noop_step").await.unwrap();
        assert_eq!(delivery.queue_name, "__wkf_step_noop_step");
    }

    #[tokio::test]
    async fn elapsed_wait_resolves_on_replay_without_reaching_suspension() {
        register(
            "wf-sleep-then-complete",
            StdArc::new(|ctx, input| {
                Box::pin(async move {
                    let deadline = ctx.now() - chrono::Duration::seconds(1);
                    sleep_until(ctx, deadline).await?;
                    Ok(input)
                })
            }) as WorkflowFn,
        )
        .unwrap();

        let world = StdArc::new(MemoryWorld::new("dep"));
        let queue = StdArc::new(MemoryQueue::new());
        let run_id = WkfRunId::new("wrun_workflow_elapsed_wait").unwrap();
        let input = encode(&"hi".to_string(), CURRENT_SPEC_VERSION).unwrap();
        world
            .append(
                &run_id,
                None,
                EventData::RunCreated { workflow_name: "wf-sleep-then-complete".to_string(), input },
                CURRENT_SPEC_VERSION,
            )
            .await
            .unwrap();

        let h = WorkflowHandler::new(world.clone(), queue);

        // First invocation: sleep_until suspends, wait_created is persisted with a past deadline.
        let msg = WorkflowInvocationMessage { run_id: run_id.as_str().to_string(), trace_carrier: Default::default() };
        h.handle(&run_id, &msg).await.unwrap();
        assert!(!world.get_run(&run_id).await.unwrap().unwrap().status.is_terminal());

        // Second invocation: the handler notices the deadline already elapsed,
        // appends wait_completed itself, and the workflow completes outright.
        h.handle(&run_id, &msg).await.unwrap();
        assert_eq!(world.get_run(&run_id).await.unwrap().unwrap().status, RunStatus::Completed);
    }
}
