#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wkf-world-memory** – In-memory `World` driver for the workflow runtime.
//!
//! Grounded on `toka-store-memory`'s `MemoryBackend` (HashMap-backed store
//! behind an async lock, broadcast channel for live updates). This backend
//! keeps one [`wkf_world_core::state::RunState`] per run and a process-wide
//! hook token index so that token uniqueness (§3 invariant 4) is enforced
//! across runs, not merely within one. Because the hook-token check and its
//! resulting insert span both the per-run state and that global index, a
//! single process-wide `write_lock` serializes all `append` calls — exactly
//! as `wkf-world-sled` and `wkf-world-sqlite` do, and for the same reason:
//! per-run locking alone lets two different runs both observe a token as
//! free and both win a race that should produce one `hook_created` and one
//! `hook_conflict`. It has no persistence: all data is lost when the
//! process exits, which makes it the right choice for tests and local
//! development, not production deployments (see `wkf-world-sled`,
//! `wkf-world-sqlite`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use hkdf::Hkdf;
use sha2::Sha256;
use tokio::sync::{broadcast, Mutex};

use wkf_types::{ApiError, CorrelationId, Event, EventData, Hook, Run, RunId, Step, Wait};
use wkf_world_core::{
    state::{apply_event, build_event, RunState},
    AppendOutcome, World, WorldError,
};

const DEFAULT_BUFFER: usize = 1024;

struct RunSlot {
    state: Mutex<RunState>,
    events: Mutex<Vec<Event>>,
    next_event_id: AtomicU64,
}

impl RunSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(RunState::default()),
            events: Mutex::new(Vec::new()),
            next_event_id: AtomicU64::new(1),
        }
    }
}

/// An in-memory, non-persistent [`World`] driver.
///
/// Broadcasts committed events on a channel mirroring `toka-store-memory`'s
/// live-stream pattern, so orchestrator-adjacent tooling (dashboards, tests)
/// can observe append traffic without polling `list_events`.
#[derive(Clone)]
pub struct MemoryWorld {
    deployment_id: String,
    runs: Arc<DashMap<RunId, Arc<RunSlot>>>,
    hook_tokens: Arc<DashMap<String, CorrelationId>>,
    hook_owner: Arc<DashMap<CorrelationId, Hook>>,
    deployment_secret: Option<[u8; 32]>,
    write_lock: Arc<Mutex<()>>,
    broadcast_tx: broadcast::Sender<Event>,
}

impl MemoryWorld {
    /// Construct an empty store for the given deployment, with no central
    /// encryption key management (`encryption_key_for_run` returns `None`).
    pub fn new(deployment_id: impl Into<String>) -> Self {
        Self::with_buffer_size(deployment_id, DEFAULT_BUFFER)
    }

    /// Construct an empty store that derives per-run AES keys via
    /// HKDF-SHA256 over `deployment_secret` (§4.A encryption contract).
    pub fn with_encryption(deployment_id: impl Into<String>, deployment_secret: [u8; 32]) -> Self {
        let mut world = Self::with_buffer_size(deployment_id, DEFAULT_BUFFER);
        world.deployment_secret = Some(deployment_secret);
        world
    }

    /// Construct an empty store with a custom live-event broadcast buffer.
    pub fn with_buffer_size(deployment_id: impl Into<String>, buffer_size: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(buffer_size);
        Self {
            deployment_id: deployment_id.into(),
            runs: Arc::new(DashMap::new()),
            hook_tokens: Arc::new(DashMap::new()),
            hook_owner: Arc::new(DashMap::new()),
            deployment_secret: None,
            write_lock: Arc::new(Mutex::new(())),
            broadcast_tx,
        }
    }

    /// Subscribe to the live event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.broadcast_tx.subscribe()
    }

    fn slot(&self, run_id: &RunId) -> Arc<RunSlot> {
        self.runs
            .entry(run_id.clone())
            .or_insert_with(|| Arc::new(RunSlot::new()))
            .clone()
    }
}

#[async_trait]
impl World for MemoryWorld {
    async fn append(
        &self,
        run_id: &RunId,
        correlation_id: Option<CorrelationId>,
        data: EventData,
        spec_version: u32,
    ) -> Result<AppendOutcome, WorldError> {
        let _write_guard = self.write_lock.lock().await;
        let slot = self.slot(run_id);
        let mut state = slot.state.lock().await;

        let hook_token_taken = match &data {
            EventData::HookCreated { token, .. } => self.hook_tokens.contains_key(token),
            _ => false,
        };

        let outcome = apply_event(&mut state, run_id, correlation_id.as_ref(), data, hook_token_taken)
            .map_err(WorldError::Api)?;

        if let Some(hook) = &outcome.hook {
            match hook.status {
                wkf_types::HookStatus::Live => {
                    self.hook_tokens.insert(hook.token.clone(), hook.hook_id.clone());
                    self.hook_owner.insert(hook.hook_id.clone(), hook.clone());
                }
                wkf_types::HookStatus::Disposed | wkf_types::HookStatus::Conflicted => {
                    self.hook_tokens.remove(&hook.token);
                    self.hook_owner.insert(hook.hook_id.clone(), hook.clone());
                }
            }
        }

        let event_id = slot.next_event_id.fetch_add(1, Ordering::SeqCst);
        let event = build_event(event_id, run_id.clone(), correlation_id, outcome.event_data, spec_version)
            .map_err(WorldError::Other)?;

        slot.events.lock().await.push(event.clone());
        let _ = self.broadcast_tx.send(event.clone());

        Ok(AppendOutcome {
            event: Some(event),
            run: outcome.run,
            step: outcome.step,
            hook: outcome.hook,
            wait: outcome.wait,
        })
    }

    async fn list_events(&self, run_id: &RunId) -> anyhow::Result<Vec<Event>> {
        match self.runs.get(run_id) {
            Some(slot) => Ok(slot.events.lock().await.clone()),
            None => Ok(Vec::new()),
        }
    }

    async fn get_run(&self, run_id: &RunId) -> anyhow::Result<Option<Run>> {
        match self.runs.get(run_id) {
            Some(slot) => Ok(slot.state.lock().await.run.clone()),
            None => Ok(None),
        }
    }

    async fn get_step(&self, step_id: &CorrelationId) -> anyhow::Result<Option<Step>> {
        for entry in self.runs.iter() {
            if let Some(step) = entry.value().state.lock().await.steps.get(step_id) {
                return Ok(Some(step.clone()));
            }
        }
        Ok(None)
    }

    async fn get_hook(&self, hook_id: &CorrelationId) -> anyhow::Result<Option<Hook>> {
        Ok(self.hook_owner.get(hook_id).map(|h| h.clone()))
    }

    async fn get_hook_by_token(&self, token: &str) -> anyhow::Result<Option<Hook>> {
        let Some(hook_id) = self.hook_tokens.get(token).map(|h| h.clone()) else {
            return Ok(None);
        };
        self.get_hook(&hook_id).await
    }

    async fn get_wait(&self, wait_id: &CorrelationId) -> anyhow::Result<Option<Wait>> {
        for entry in self.runs.iter() {
            if let Some(wait) = entry.value().state.lock().await.waits.get(wait_id) {
                return Ok(Some(wait.clone()));
            }
        }
        Ok(None)
    }

    async fn encryption_key_for_run(&self, run_id: &RunId) -> anyhow::Result<Option<[u8; 32]>> {
        let Some(secret) = self.deployment_secret else {
            return Ok(None);
        };
        let info = format!("{}|{}", self.deployment_id, run_id);
        let hk = Hkdf::<Sha256>::new(None, &secret);
        let mut key = [0u8; 32];
        hk.expand(info.as_bytes(), &mut key)
            .map_err(|e| anyhow::anyhow!("hkdf expand failed: {e}"))?;
        Ok(Some(key))
    }

    fn deployment_id(&self) -> &str {
        &self.deployment_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wkf_types::SerializedData;

    fn input() -> SerializedData {
        SerializedData { spec_version: 2, encrypted: false, bytes: vec![1, 2, 3] }
    }

    fn run_id() -> RunId {
        RunId::new("wrun_01HV0000000000000000000000").unwrap()
    }

    #[tokio::test]
    async fn run_created_then_completed() {
        let world = MemoryWorld::new("dep-1");
        let id = run_id();
        world
            .append(&id, None, EventData::RunCreated { workflow_name: "wf".into(), input: input() }, 2)
            .await
            .unwrap();
        let outcome = world
            .append(&id, None, EventData::RunCompleted { output: input() }, 2)
            .await
            .unwrap();
        assert_eq!(outcome.run.unwrap().status, wkf_types::RunStatus::Completed);
        assert_eq!(world.list_events(&id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_terminal_event_conflicts() {
        let world = MemoryWorld::new("dep-1");
        let id = run_id();
        world
            .append(&id, None, EventData::RunCreated { workflow_name: "wf".into(), input: input() }, 2)
            .await
            .unwrap();
        world
            .append(&id, None, EventData::RunCompleted { output: input() }, 2)
            .await
            .unwrap();
        let err = world
            .append(&id, None, EventData::RunCompleted { output: input() }, 2)
            .await
            .unwrap_err();
        match err {
            WorldError::Api(api) => assert!(api.is_conflict() || api.is_gone()),
            other => panic!("expected api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hook_token_conflict_across_runs() {
        let world = MemoryWorld::new("dep-1");
        let run_a = RunId::new("wrun_01HV0000000000000000000001").unwrap();
        let run_b = RunId::new("wrun_01HV0000000000000000000002").unwrap();
        world
            .append(&run_a, None, EventData::RunCreated { workflow_name: "wf".into(), input: input() }, 2)
            .await
            .unwrap();
        world
            .append(&run_b, None, EventData::RunCreated { workflow_name: "wf".into(), input: input() }, 2)
            .await
            .unwrap();

        let hook_a = CorrelationId::derive(&run_a, "hook", 0);
        let hook_b = CorrelationId::derive(&run_b, "hook", 0);

        let first = world
            .append(&run_a, Some(hook_a), EventData::HookCreated { token: "dup".into(), metadata: None }, 2)
            .await
            .unwrap();
        assert_eq!(first.event.unwrap().event_type(), wkf_types::EventType::HookCreated);

        let second = world
            .append(&run_b, Some(hook_b), EventData::HookCreated { token: "dup".into(), metadata: None }, 2)
            .await
            .unwrap();
        assert_eq!(second.event.unwrap().event_type(), wkf_types::EventType::HookConflict);
    }

    #[tokio::test]
    async fn hook_token_conflict_across_runs_under_concurrency() {
        let world = MemoryWorld::new("dep-1");
        let run_a = RunId::new("wrun_01HV0000000000000000000003").unwrap();
        let run_b = RunId::new("wrun_01HV0000000000000000000004").unwrap();
        world
            .append(&run_a, None, EventData::RunCreated { workflow_name: "wf".into(), input: input() }, 2)
            .await
            .unwrap();
        world
            .append(&run_b, None, EventData::RunCreated { workflow_name: "wf".into(), input: input() }, 2)
            .await
            .unwrap();

        let hook_a = CorrelationId::derive(&run_a, "hook", 0);
        let hook_b = CorrelationId::derive(&run_b, "hook", 0);

        let world_a = world.clone();
        let world_b = world.clone();
        let (first, second) = tokio::join!(
            world_a.append(&run_a, Some(hook_a), EventData::HookCreated { token: "race".into(), metadata: None }, 2),
            world_b.append(&run_b, Some(hook_b), EventData::HookCreated { token: "race".into(), metadata: None }, 2),
        );

        let types = [
            first.unwrap().event.unwrap().event_type(),
            second.unwrap().event.unwrap().event_type(),
        ];
        let created = types.iter().filter(|t| **t == wkf_types::EventType::HookCreated).count();
        let conflicted = types.iter().filter(|t| **t == wkf_types::EventType::HookConflict).count();
        assert_eq!(created, 1, "exactly one racer must win hook_created");
        assert_eq!(conflicted, 1, "exactly one racer must lose to hook_conflict");
    }

    #[tokio::test]
    async fn encryption_key_derivation_is_deterministic_per_run() {
        let world = MemoryWorld::with_encryption("dep-1", [7u8; 32]);
        let id = run_id();
        let k1 = world.encryption_key_for_run(&id).await.unwrap().unwrap();
        let k2 = world.encryption_key_for_run(&id).await.unwrap().unwrap();
        assert_eq!(k1, k2);
        let other = RunId::new("wrun_01HV0000000000000000000009").unwrap();
        let k3 = world.encryption_key_for_run(&other).await.unwrap().unwrap();
        assert_ne!(k1, k3);
    }

    #[tokio::test]
    async fn no_central_key_management_returns_none() {
        let world = MemoryWorld::new("dep-1");
        assert!(world.encryption_key_for_run(&run_id()).await.unwrap().is_none());
    }
}
