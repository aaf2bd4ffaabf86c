//! Step handler (§4.G): drives one `__wkf_step_<name>` message through a
//! registered step function with attempt accounting, structured retries,
//! and throttle/server-error resilience.
//!
//! Grounded on `toka-agent-runtime`'s `task.rs` attempt/backoff loop for the
//! retry shape, composed here with the crash-safety ordering
//! `wkf_queue_core::run_handler` already provides (enqueue the
//! continuation before acknowledging the step message).

use std::sync::Arc;

use wkf_codec::{apply_encryption, run_cipher, strip_encryption};
use wkf_queue_core::{EnqueueOptions, HandlerOutcome, Queue, QueueError, WORKFLOW_QUEUE_PREFIX};
use wkf_types::{CorrelationId, EventData, RunId, StructuredError};
use wkf_world_core::{AppendOutcome, World, WorldError};

use crate::backoff::{with_server_error_retry, with_throttle_retry, ThrottleOutcome};
use crate::messages::{StepInvocationMessage, WorkflowInvocationMessage};
use crate::step_registry;
use crate::RuntimeError;

/// Drives `__wkf_step_<name>` queue messages for every registered step
/// function (the registry is process-wide in [`step_registry`], so one
/// handler instance serves all step names).
pub struct StepHandler<W, Q> {
    world: Arc<W>,
    queue: Arc<Q>,
}

impl<W, Q> StepHandler<W, Q>
where
    W: World + 'static,
    Q: Queue + 'static,
{
    /// Build a handler over `world`/`queue`.
    pub fn new(world: Arc<W>, queue: Arc<Q>) -> Self {
        Self { world, queue }
    }

    /// Process one delivered [`StepInvocationMessage`] payload, returning the
    /// outcome for the caller's [`wkf_queue_core::run_handler`] loop.
    pub async fn handle_payload(&self, payload: &[u8]) -> Result<HandlerOutcome, QueueError> {
        let message: StepInvocationMessage = serde_json::from_slice(payload)
            .map_err(|e| QueueError::Other(anyhow::anyhow!("invalid step invocation payload: {e}")))?;

        match self.handle(&message, payload).await {
            Ok(outcome) => Ok(outcome),
            Err(RuntimeError::Queue(err)) => Err(err),
            Err(err) => Err(QueueError::Other(anyhow::Error::new(err))),
        }
    }

    async fn handle(&self, message: &StepInvocationMessage, raw_payload: &[u8]) -> Result<HandlerOutcome, RuntimeError> {
        let run_id = RunId::new(&message.workflow_run_id)
            .map_err(|e| RuntimeError::Serde(format!("invalid run id in step invocation: {e}")))?;
        let step_id = CorrelationId(message.step_id.clone());

        let Some(run) = self.world.get_run(&run_id).await.map_err(WorldError::Other)? else {
            tracing::warn!(%run_id, step = %step_id, "step invocation for unknown run, dropping");
            return Ok(HandlerOutcome::Done);
        };
        let spec_version = run.spec_version;
        let deployment_id = run.deployment_id.clone();

        let Some(entry) = step_registry::lookup(&message.step_name) else {
            tracing::error!(step_name = %message.step_name, "no step function registered, failing step");
            let error = StructuredError::new(format!("no step function registered for {}", message.step_name))
                .with_code("MISCONFIGURED");
            return self.fail_and_continue(&run_id, &step_id, spec_version, &deployment_id, error, message, raw_payload).await;
        };

        // §4.G step 2: append step_started, the store computes the authoritative attempt.
        let started = match self
            .append_resilient(&run_id, &step_id, EventData::StepStarted { attempt: 1 }, spec_version, raw_payload)
            .await?
        {
            Outcome::Ready(outcome) => outcome,
            Outcome::Reschedule(handler_outcome) => return Ok(handler_outcome),
            Outcome::Conflict => {
                tracing::debug!(%run_id, step = %step_id, "step_started conflict, dropping redelivery");
                return Ok(HandlerOutcome::Done);
            }
            Outcome::Gone => {
                tracing::debug!(%run_id, step = %step_id, "run terminated, dropping step invocation");
                return Ok(HandlerOutcome::Done);
            }
        };
        let step_view = started
            .step
            .ok_or_else(|| RuntimeError::World(WorldError::Other(anyhow::anyhow!("step_started returned no step view"))))?;

        // §4.G step 3: pre-execution retry guard.
        if step_view.attempt > entry.max_attempts {
            let error = step_view
                .error
                .clone()
                .unwrap_or_else(|| StructuredError::new("max retries exceeded").with_code("MAX_RETRIES_EXCEEDED"));
            return self.fail_and_continue(&run_id, &step_id, spec_version, &deployment_id, error, message, raw_payload).await;
        }

        let cipher = self
            .world
            .encryption_key_for_run(&run_id)
            .await
            .map_err(WorldError::Other)?
            .map(|key| run_cipher(&run_id, key));

        let hydrated_input = match strip_encryption(&step_view.input, cipher.as_deref()) {
            Ok(data) => data,
            Err(err) => {
                let error = StructuredError::new(format!("failed to decrypt step input: {err}")).with_code("DECRYPT_FAILED");
                return self.fail_and_continue(&run_id, &step_id, spec_version, &deployment_id, error, message, raw_payload).await;
            }
        };

        match (entry.handler)(hydrated_input).await {
            Ok(result) => {
                let encrypted_result = apply_encryption(result, cipher.as_deref());
                match self
                    .append_resilient(
                        &run_id,
                        &step_id,
                        EventData::StepCompleted { result: encrypted_result },
                        spec_version,
                        raw_payload,
                    )
                    .await?
                {
                    Outcome::Ready(_) => {
                        self.enqueue_continuation(message, &step_id, &deployment_id).await?;
                        Ok(HandlerOutcome::Done)
                    }
                    Outcome::Reschedule(handler_outcome) => Ok(handler_outcome),
                    Outcome::Conflict | Outcome::Gone => {
                        tracing::debug!(%run_id, step = %step_id, "step already finished, dropping");
                        Ok(HandlerOutcome::Done)
                    }
                }
            }
            Err(error) => {
                if step_view.attempt < entry.max_attempts {
                    match self
                        .append_resilient(
                            &run_id,
                            &step_id,
                            EventData::StepRetrying { error, retry_after: None },
                            spec_version,
                            raw_payload,
                        )
                        .await?
                    {
                        Outcome::Ready(_) => Ok(HandlerOutcome::Done),
                        Outcome::Reschedule(handler_outcome) => Ok(handler_outcome),
                        Outcome::Conflict => {
                            tracing::debug!(%run_id, step = %step_id, "step_retrying conflict, dropping redelivery");
                            Ok(HandlerOutcome::Done)
                        }
                        // §4.G: any non-conflict error on step_retrying is thrown back to the
                        // queue to leverage its own redelivery, rather than recorded here.
                        Outcome::Gone => Ok(HandlerOutcome::Done),
                    }
                } else {
                    self.fail_and_continue(&run_id, &step_id, spec_version, &deployment_id, error, message, raw_payload).await
                }
            }
        }
    }

    async fn fail_and_continue(
        &self,
        run_id: &RunId,
        step_id: &CorrelationId,
        spec_version: u32,
        deployment_id: &str,
        error: StructuredError,
        message: &StepInvocationMessage,
        raw_payload: &[u8],
    ) -> Result<HandlerOutcome, RuntimeError> {
        match self
            .append_resilient(run_id, step_id, EventData::StepFailed { error }, spec_version, raw_payload)
            .await?
        {
            Outcome::Ready(_) => {
                self.enqueue_continuation(message, step_id, deployment_id).await?;
                Ok(HandlerOutcome::Done)
            }
            Outcome::Reschedule(handler_outcome) => Ok(handler_outcome),
            Outcome::Conflict | Outcome::Gone => {
                tracing::debug!(%run_id, step = %step_id, "step already finished, dropping");
                Ok(HandlerOutcome::Done)
            }
        }
    }

    /// Append a terminal/progress event with both throttle handling
    /// (§4.G "Throttle handling") and server-error backoff (§4.G
    /// "Server-error retry") layered over the raw `World::append` call.
    async fn append_resilient(
        &self,
        run_id: &RunId,
        step_id: &CorrelationId,
        data: EventData,
        spec_version: u32,
        raw_payload: &[u8],
    ) -> Result<Outcome, RuntimeError> {
        let throttled = with_throttle_retry(|| {
            with_server_error_retry(|| self.world.append(run_id, Some(step_id.clone()), data.clone(), spec_version))
        })
        .await;

        match throttled {
            Ok(ThrottleOutcome::Ready(outcome)) => Ok(Outcome::Ready(outcome)),
            Ok(ThrottleOutcome::Reschedule(secs)) => Ok(Outcome::Reschedule(HandlerOutcome::RetryAfter {
                timeout: std::time::Duration::from_secs(secs),
                payload: raw_payload.to_vec(),
            })),
            Err(WorldError::Api(api)) if api.is_conflict() => Ok(Outcome::Conflict),
            Err(WorldError::Api(api)) if api.is_gone() => Ok(Outcome::Gone),
            Err(err) => Err(err.into()),
        }
    }

    async fn enqueue_continuation(
        &self,
        message: &StepInvocationMessage,
        step_id: &CorrelationId,
        deployment_id: &str,
    ) -> Result<(), RuntimeError> {
        let continuation = WorkflowInvocationMessage {
            run_id: message.workflow_run_id.clone(),
            trace_carrier: message.trace_carrier.clone(),
        };
        let payload = serde_json::to_vec(&continuation).map_err(|e| RuntimeError::Serde(e.to_string()))?;
        let queue_name = format!("{WORKFLOW_QUEUE_PREFIX}{}", message.workflow_name);
        self.queue
            .enqueue(
                &queue_name,
                payload,
                EnqueueOptions {
                    idempotency_key: Some(step_id.to_string()),
                    delay: None,
                    deployment_id: deployment_id.to_string(),
                    headers: message.trace_carrier.clone(),
                },
            )
            .await
            .map_err(RuntimeError::from)?;
        Ok(())
    }
}

/// Outcome of [`StepHandler::append_resilient`], folding the throttle and
/// conflict/gone branches into one match point for every call site.
enum Outcome {
    Ready(AppendOutcome),
    Reschedule(HandlerOutcome),
    Conflict,
    Gone,
}
