//! The [`Run`] handle returned by [`crate::start`] (§4.H step 7).
//!
//! Grounded on `toka-orchestration`'s `OrchestrationSession` handle, but
//! `returnValue` here polls the durable `World` rather than awaiting an
//! in-process completion channel: the orchestrator invocation that actually
//! finishes this run may happen in a different process entirely, so the
//! only honest way to observe completion is through the store all workers
//! share.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use wkf_codec::decode_maybe_encrypted;
use wkf_types::{RunId, RunStatus};
use wkf_world_core::World;

use crate::error::{FacadeError, ReturnValueError, RunFailedError, RunNotCompletedError};
use crate::stream::StreamSink;

/// Default interval between polls in [`Run::return_value`].
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A handle to one workflow invocation (§4.H step 7).
pub struct Run<W> {
    run_id: RunId,
    created_at: DateTime<Utc>,
    world: Arc<W>,
    stream: Option<Arc<dyn StreamSink>>,
}

impl<W> Run<W>
where
    W: World,
{
    pub(crate) fn new(run_id: RunId, created_at: DateTime<Utc>, world: Arc<W>, stream: Option<Arc<dyn StreamSink>>) -> Self {
        Self { run_id, created_at, world, stream }
    }

    /// The run's identifier.
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// When `run_created` was appended.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Poll the store once; does not block. Returns
    /// [`RunNotCompletedError`] if the run has not reached a terminal state.
    pub async fn poll_return_value<Out>(&self) -> Result<Out, ReturnValueError>
    where
        Out: DeserializeOwned,
    {
        let run = self
            .world
            .get_run(&self.run_id)
            .await
            .map_err(wkf_world_core::WorldError::Other)?
            .ok_or_else(|| wkf_world_core::WorldError::Other(anyhow::anyhow!("run {} disappeared", self.run_id)))?;

        match run.status {
            RunStatus::Completed => {
                let output = run
                    .output
                    .ok_or_else(|| wkf_world_core::WorldError::Other(anyhow::anyhow!("completed run has no output")))?;
                let cipher = self
                    .world
                    .encryption_key_for_run(&self.run_id)
                    .await
                    .map_err(wkf_world_core::WorldError::Other)?
                    .map(|key| wkf_codec::run_cipher(&self.run_id, key));
                Ok(decode_maybe_encrypted(&output, cipher.as_deref())?)
            }
            RunStatus::Failed => {
                let error = run.error.unwrap_or_else(|| wkf_types::StructuredError::new("run failed with no recorded error"));
                Err(RunFailedError { run_id: self.run_id.clone(), error }.into())
            }
            RunStatus::Cancelled => {
                let error = wkf_types::StructuredError::new("run was cancelled").with_code("CANCELLED");
                Err(RunFailedError { run_id: self.run_id.clone(), error }.into())
            }
            RunStatus::Pending | RunStatus::Running => Err(RunNotCompletedError(self.run_id.clone()).into()),
        }
    }

    /// Resolve once the run reaches a terminal state, polling the store at
    /// [`DEFAULT_POLL_INTERVAL`]. Rejects with [`RunFailedError`] if the run
    /// failed or was cancelled.
    pub async fn return_value<Out>(&self) -> Result<Out, ReturnValueError>
    where
        Out: DeserializeOwned,
    {
        loop {
            match self.poll_return_value::<Out>().await {
                Err(ReturnValueError::NotCompleted(_)) => {
                    tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
                }
                other => return other,
            }
        }
    }

    /// Append `run_cancelled` (§4.H step 7 "`cancel()`"). A conflict or gone
    /// response means the run already reached a terminal state; treated as
    /// success since cancellation is idempotent in effect.
    pub async fn cancel(&self, reason: Option<String>) -> Result<(), FacadeError> {
        crate::hooks::cancel_run(self.world.as_ref(), &self.run_id, reason).await
    }

    /// Read `name`'s stream for this run, if a [`StreamSink`] was configured
    /// at `start()` time (§6 `readFromStream`).
    pub async fn get_readable(&self, namespace: &str, start_index: Option<u64>) -> anyhow::Result<Vec<Vec<u8>>> {
        let sink = self
            .stream
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no StreamSink configured for this run"))?;
        sink.read_from_stream(namespace, &self.run_id, start_index).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wkf_codec::encode;
    use wkf_types::{CorrelationId, EventData, CURRENT_SPEC_VERSION};
    use wkf_world_memory::MemoryWorld;

    async fn seeded(world: &MemoryWorld, run_id: &RunId) {
        let input = encode(&"hi".to_string(), CURRENT_SPEC_VERSION).unwrap();
        world
            .append(run_id, None, EventData::RunCreated { workflow_name: "wf".to_string(), input }, CURRENT_SPEC_VERSION)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn pending_run_reports_not_completed() {
        let world = Arc::new(MemoryWorld::new("dep"));
        let run_id = RunId::new("wrun_pending").unwrap();
        seeded(&world, &run_id).await;
        let run = Run::new(run_id.clone(), Utc::now(), world, None);
        let result = run.poll_return_value::<String>().await;
        assert!(matches!(result, Err(ReturnValueError::NotCompleted(_))));
    }

    #[tokio::test]
    async fn completed_run_decodes_output() {
        let world = Arc::new(MemoryWorld::new("dep"));
        let run_id = RunId::new("wrun_completed").unwrap();
        seeded(&world, &run_id).await;
        let output = encode(&"done".to_string(), CURRENT_SPEC_VERSION).unwrap();
        world.append(&run_id, None, EventData::RunCompleted { output }, CURRENT_SPEC_VERSION).await.unwrap();

        let run = Run::new(run_id, Utc::now(), world, None);
        let value: String = run.poll_return_value().await.unwrap();
        assert_eq!(value, "done");
    }

    #[tokio::test]
    async fn failed_run_rejects_with_structured_error() {
        let world = Arc::new(MemoryWorld::new("dep"));
        let run_id = RunId::new("wrun_failed").unwrap();
        seeded(&world, &run_id).await;
        let error = wkf_types::StructuredError::new("boom");
        world.append(&run_id, None, EventData::RunFailed { error }, CURRENT_SPEC_VERSION).await.unwrap();

        let run = Run::new(run_id, Utc::now(), world, None);
        let result = run.poll_return_value::<String>().await;
        assert!(matches!(result, Err(ReturnValueError::Failed(_))));
        let _ = CorrelationId::derive(run.run_id(), "step", 0);
    }
}
