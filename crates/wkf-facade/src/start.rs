//! `start()` (§4.H): create a run, enqueue its initial invocation, and hand
//! back a [`crate::Run`] handle.
//!
//! Grounded on `toka-orchestration`'s engine-entry-point shape
//! (`start_orchestration` building a session and handing back a
//! completion-channel handle); here the "session" is durable (a run row in
//! the `World`) rather than in-process, since a run must survive the very
//! process that created it.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use ulid::Ulid;
use wkf_codec::encode;
use wkf_queue_core::{EnqueueOptions, Queue, WORKFLOW_QUEUE_PREFIX};
use wkf_runtime::messages::WorkflowInvocationMessage;
use wkf_types::{EventData, RunId, CURRENT_SPEC_VERSION};
use wkf_world_core::World;

use crate::error::FacadeError;
use crate::run::Run;
use crate::stream::StreamSink;

/// Stand-in for the build-time source transform's injected metadata (§1,
/// §9): the transform that tags user functions with stable identifiers is
/// out of scope here, so callers supply the registered workflow name
/// directly instead of a decorated function reference.
#[derive(Clone, Debug)]
pub struct WorkflowMeta {
    /// The name this workflow was registered under via
    /// `wkf_orchestrator::register`.
    pub name: String,
}

impl WorkflowMeta {
    /// Build metadata for `name`. Returns a [`FacadeError::Misconfigured`]
    /// if `name` is empty (§4.H step 1: "Absent → fatal misconfiguration").
    pub fn new(name: impl Into<String>) -> Result<Self, FacadeError> {
        let name = name.into();
        if name.is_empty() {
            return Err(FacadeError::Misconfigured("workflow name must not be empty".to_string()));
        }
        Ok(Self { name })
    }
}

/// Inputs to [`start`] beyond the workflow name and arguments.
pub struct StartOptions<W, Q> {
    /// The backing `World`.
    pub world: Arc<W>,
    /// The backing `Queue`.
    pub queue: Arc<Q>,
    /// Deployment to create the run under. Defaults to `world.deployment_id()`.
    pub deployment_id: Option<String>,
    /// Spec version to create the run under. Defaults to
    /// [`CURRENT_SPEC_VERSION`].
    pub spec_version: Option<u32>,
    /// Opaque trace/propagation headers to thread onto the initial
    /// invocation message.
    pub trace_carrier: HashMap<String, String>,
    /// Streaming side-channel, if the caller wants [`Run::get_readable`] to
    /// be usable.
    pub stream: Option<Arc<dyn StreamSink>>,
}

impl<W, Q> StartOptions<W, Q> {
    /// Build options with every optional field at its default.
    pub fn new(world: Arc<W>, queue: Arc<Q>) -> Self {
        Self {
            world,
            queue,
            deployment_id: None,
            spec_version: None,
            trace_carrier: HashMap::new(),
            stream: None,
        }
    }
}

/// Create a new run of `meta.name`, passing `args` as its input (§4.H).
///
/// Steps 1-7 of §4.H: derive the workflow name (already done by
/// [`WorkflowMeta::new`]), generate a client-side `runId`, append
/// `run_created`, enqueue the initial workflow-invocation message, and
/// return a [`Run`] handle.
pub async fn start<W, Q, T>(
    meta: &WorkflowMeta,
    args: &T,
    opts: StartOptions<W, Q>,
) -> Result<Run<W>, FacadeError>
where
    W: World + 'static,
    Q: Queue + 'static,
    T: Serialize,
{
    let run_id = RunId::new(format!("wrun_{}", Ulid::new())).expect("freshly generated ulid always parses");
    let deployment_id = opts.deployment_id.unwrap_or_else(|| opts.world.deployment_id().to_string());
    let spec_version = opts.spec_version.unwrap_or(CURRENT_SPEC_VERSION);

    let encryption_key = opts
        .world
        .encryption_key_for_run(&run_id)
        .await
        .map_err(wkf_world_core::WorldError::Other)?;
    let input = match encryption_key {
        Some(key) => wkf_codec::encode_encrypted(args, spec_version, &wkf_codec::run_cipher(&run_id, key))?,
        None => encode(args, spec_version)?,
    };

    let outcome = opts
        .world
        .append(
            &run_id,
            None,
            EventData::RunCreated { workflow_name: meta.name.clone(), input },
            spec_version,
        )
        .await?;

    let run = outcome.run.ok_or_else(|| {
        FacadeError::World(wkf_world_core::WorldError::Other(anyhow::anyhow!(
            "run_created append returned no run view"
        )))
    })?;
    if run.run_id != run_id {
        return Err(FacadeError::RunIdMismatch {
            requested: run_id.as_str().to_string(),
            echoed: run.run_id.as_str().to_string(),
        });
    }

    let message = WorkflowInvocationMessage { run_id: run_id.as_str().to_string(), trace_carrier: opts.trace_carrier.clone() };
    let payload = serde_json::to_vec(&message)
        .map_err(|e| FacadeError::World(wkf_world_core::WorldError::Other(anyhow::anyhow!("{e}"))))?;
    let queue_name = format!("{WORKFLOW_QUEUE_PREFIX}{}", meta.name);
    opts.queue
        .enqueue(
            &queue_name,
            payload,
            EnqueueOptions {
                idempotency_key: Some(run_id.as_str().to_string()),
                delay: None,
                deployment_id,
                headers: opts.trace_carrier,
            },
        )
        .await?;

    Ok(Run::new(run_id, run.created_at, opts.world, opts.stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wkf_queue_memory::MemoryQueue;
    use wkf_world_memory::MemoryWorld;

    #[tokio::test]
    async fn start_creates_run_and_enqueues_initial_invocation() {
        let world = Arc::new(MemoryWorld::new("dep"));
        let queue = Arc::new(MemoryQueue::new());
        let meta = WorkflowMeta::new("greet").unwrap();
        let opts = StartOptions::new(world.clone(), queue.clone());

        let run = start(&meta, &"world".to_string(), opts).await.unwrap();

        let stored = world.get_run(run.run_id()).await.unwrap().unwrap();
        assert_eq!(stored.workflow_name, "greet");

        let delivery = queue.receive("__wkf_workflow_greet").await.unwrap();
        let msg: WorkflowInvocationMessage = serde_json::from_slice(&delivery.payload).unwrap();
        assert_eq!(msg.run_id, run.run_id().as_str());
    }

    #[test]
    fn empty_workflow_name_is_misconfigured() {
        assert!(WorkflowMeta::new("").is_err());
    }
}
