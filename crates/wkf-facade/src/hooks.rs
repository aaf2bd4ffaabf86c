//! External-facing hook delivery and run cancellation (§4.H, §6:
//! `resumeHook`, `cancelRun`).
//!
//! Creating and awaiting a hook from *inside* a workflow is
//! `wkf_orchestrator::factories::HookHandle`; this module is the other
//! half — an external caller (an HTTP handler, a webhook receiver)
//! delivering a payload to a hook it only knows by its token, or an
//! operator cancelling a run outright.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use wkf_codec::{encode, encode_encrypted, run_cipher};
use wkf_queue_core::{EnqueueOptions, Queue, WORKFLOW_QUEUE_PREFIX};
use wkf_runtime::messages::WorkflowInvocationMessage;
use wkf_types::{EventData, HookStatus, RunId};
use wkf_world_core::World;

use crate::error::FacadeError;

/// Deliver `payload` to the hook registered under `token` (§6 `resumeHook`).
///
/// Appends `hook_received` against the hook's correlation id, then enqueues
/// a workflow-continuation message so the owning run's next orchestrator
/// invocation observes the delivery — mirroring the step handler's
/// continuation enqueue (§4.G step 5), since nothing else would wake a run
/// that is suspended purely on a hook await.
pub async fn resume_hook<W, Q, T>(
    world: &W,
    queue: &Q,
    token: &str,
    payload: &T,
    trace_carrier: HashMap<String, String>,
) -> Result<(), FacadeError>
where
    W: World,
    Q: Queue,
    T: Serialize,
{
    let hook = world
        .get_hook_by_token(token)
        .await
        .map_err(wkf_world_core::WorldError::Other)?
        .ok_or_else(|| FacadeError::UnknownHookToken(token.to_string()))?;
    if hook.status != HookStatus::Live {
        return Err(FacadeError::UnknownHookToken(token.to_string()));
    }

    let run = world
        .get_run(&hook.run_id)
        .await
        .map_err(wkf_world_core::WorldError::Other)?
        .ok_or_else(|| FacadeError::UnknownRun(hook.run_id.clone()))?;

    let cipher = world
        .encryption_key_for_run(&hook.run_id)
        .await
        .map_err(wkf_world_core::WorldError::Other)?
        .map(|key| run_cipher(&hook.run_id, key));
    let encoded = match &cipher {
        Some(cipher) => encode_encrypted(payload, run.spec_version, cipher)?,
        None => encode(payload, run.spec_version)?,
    };

    let outcome = world
        .append(&hook.run_id, Some(hook.hook_id.clone()), EventData::HookReceived { payload: encoded }, run.spec_version)
        .await?;

    let idempotency_key = outcome.event.map(|e| format!("{}:{}", hook.hook_id, e.event_id));
    let message = WorkflowInvocationMessage { run_id: hook.run_id.as_str().to_string(), trace_carrier: trace_carrier.clone() };
    let message_payload = serde_json::to_vec(&message)
        .map_err(|e| FacadeError::World(wkf_world_core::WorldError::Other(anyhow::anyhow!("{e}"))))?;
    let queue_name = format!("{WORKFLOW_QUEUE_PREFIX}{}", run.workflow_name);
    queue
        .enqueue(
            &queue_name,
            message_payload,
            EnqueueOptions { idempotency_key, delay: None, deployment_id: run.deployment_id, headers: trace_carrier },
        )
        .await?;

    Ok(())
}

/// Cancel a run outright (§6 `cancelRun`): append `run_cancelled`. A 409/410
/// response means the run already reached a terminal state, which is
/// treated as success since cancellation only cares that the run end up
/// terminal, not that this call specifically terminated it.
pub async fn cancel_run<W>(world: &W, run_id: &RunId, reason: Option<String>) -> Result<(), FacadeError>
where
    W: World,
{
    match world.append(run_id, None, EventData::RunCancelled { reason }, wkf_types::CURRENT_SPEC_VERSION).await {
        Ok(_) => Ok(()),
        Err(wkf_world_core::WorldError::Api(api)) if api.is_conflict() || api.is_gone() => {
            tracing::debug!(%run_id, "run already terminal, cancel is a no-op");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wkf_queue_memory::MemoryQueue;
    use wkf_types::{CorrelationId, RunStatus, CURRENT_SPEC_VERSION};
    use wkf_world_memory::MemoryWorld;

    async fn seeded_run_with_hook(world: &MemoryWorld, run_id: &RunId, hook_id: &CorrelationId, token: &str) {
        let input = wkf_codec::encode(&"hi".to_string(), CURRENT_SPEC_VERSION).unwrap();
        world
            .append(run_id, None, EventData::RunCreated { workflow_name: "wf".to_string(), input }, CURRENT_SPEC_VERSION)
            .await
            .unwrap();
        world
            .append(run_id, Some(hook_id.clone()), EventData::HookCreated { token: token.to_string(), metadata: None }, CURRENT_SPEC_VERSION)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn resume_hook_delivers_payload_and_wakes_run() {
        let world = Arc::new(MemoryWorld::new("dep"));
        let queue = Arc::new(MemoryQueue::new());
        let run_id = RunId::new("wrun_resume_hook").unwrap();
        let hook_id = CorrelationId::derive(&run_id, "hook", 0);
        seeded_run_with_hook(&world, &run_id, &hook_id, "t-42").await;

        resume_hook(world.as_ref(), queue.as_ref(), "t-42", &"hello".to_string(), HashMap::new()).await.unwrap();

        let hook = world.get_hook(&hook_id).await.unwrap().unwrap();
        assert_eq!(hook.status, HookStatus::Live);

        let delivery = queue.receive("__wkf_workflow_wf").await.unwrap();
        let msg: WorkflowInvocationMessage = serde_json::from_slice(&delivery.payload).unwrap();
        assert_eq!(msg.run_id, run_id.as_str());
    }

    #[tokio::test]
    async fn resume_hook_rejects_unknown_token() {
        let world = Arc::new(MemoryWorld::new("dep"));
        let queue = Arc::new(MemoryQueue::new());
        let result = resume_hook(world.as_ref(), queue.as_ref(), "never-created", &"x".to_string(), HashMap::new()).await;
        assert!(matches!(result, Err(FacadeError::UnknownHookToken(_))));
    }

    #[tokio::test]
    async fn cancel_run_appends_run_cancelled() {
        let world = Arc::new(MemoryWorld::new("dep"));
        let run_id = RunId::new("wrun_cancel").unwrap();
        let input = wkf_codec::encode(&"hi".to_string(), CURRENT_SPEC_VERSION).unwrap();
        world.append(&run_id, None, EventData::RunCreated { workflow_name: "wf".to_string(), input }, CURRENT_SPEC_VERSION).await.unwrap();

        cancel_run(world.as_ref(), &run_id, Some("user requested".to_string())).await.unwrap();
        let run = world.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);

        // Cancelling an already-terminal run is a no-op, not an error.
        cancel_run(world.as_ref(), &run_id, None).await.unwrap();
    }
}
