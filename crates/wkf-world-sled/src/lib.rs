#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wkf-world-sled** – Sled-based durable `World` driver for the workflow
//! runtime.
//!
//! Grounded on `toka-store-sled`'s `SledBackend` (tree-per-concern layout,
//! `Db` kept alive alongside its trees, `open`/`open_with_config`/`temporary`
//! constructors, live broadcast stream). This backend keeps four trees:
//! `events` (append-only log, keyed by run id + big-endian event id),
//! `states` (one serialized [`RunState`] per run, the materialized view),
//! `hook_tokens` (global token → hook id index enforcing §3 invariant 4
//! across runs), and `counters` (per-run next event id). A single async
//! mutex serializes writers so the four trees move together as one logical
//! transaction; sled's own per-tree atomicity is not enough on its own since
//! a commit here touches multiple trees.

use std::path::Path;

use async_trait::async_trait;
use hkdf::Hkdf;
use sha2::Sha256;
use sled::{Db, Tree};
use tokio::sync::{broadcast, Mutex};

use wkf_types::{CorrelationId, Event, EventData, Hook, Run, RunId, Step, Wait};
use wkf_world_core::{
    state::{apply_event, build_event, RunState},
    AppendOutcome, World, WorldError,
};

const DEFAULT_BROADCAST_SIZE: usize = 256;

/// A persistent, embedded [`World`] driver backed by sled.
pub struct SledWorld {
    _db: Db,
    events: Tree,
    states: Tree,
    hook_tokens: Tree,
    hook_owner: Tree,
    counters: Tree,
    deployment_id: String,
    deployment_secret: Option<[u8; 32]>,
    write_lock: Mutex<()>,
    broadcast_tx: broadcast::Sender<Event>,
}

impl SledWorld {
    /// Opens or creates a sled database at `path`.
    pub fn open<P: AsRef<Path>>(path: P, deployment_id: impl Into<String>) -> anyhow::Result<Self> {
        Self::open_with_config(path, deployment_id, sled::Config::default())
    }

    /// Opens a sled database with custom configuration.
    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        deployment_id: impl Into<String>,
        config: sled::Config,
    ) -> anyhow::Result<Self> {
        let db = config.path(path).open()?;
        Self::from_db(db, deployment_id)
    }

    /// Builds a backend from an already-open sled [`Db`].
    pub fn from_db(db: Db, deployment_id: impl Into<String>) -> anyhow::Result<Self> {
        let events = db.open_tree("events")?;
        let states = db.open_tree("states")?;
        let hook_tokens = db.open_tree("hook_tokens")?;
        let hook_owner = db.open_tree("hook_owner")?;
        let counters = db.open_tree("counters")?;
        let (broadcast_tx, _) = broadcast::channel(DEFAULT_BROADCAST_SIZE);
        Ok(Self {
            _db: db,
            events,
            states,
            hook_tokens,
            hook_owner,
            counters,
            deployment_id: deployment_id.into(),
            deployment_secret: None,
            write_lock: Mutex::new(()),
            broadcast_tx,
        })
    }

    /// Enables central per-run key derivation via HKDF-SHA256 (§4.A, §4.I).
    pub fn with_encryption(mut self, deployment_secret: [u8; 32]) -> Self {
        self.deployment_secret = Some(deployment_secret);
        self
    }

    /// Opens a temporary, self-cleaning database for tests.
    #[cfg(test)]
    pub fn temporary(deployment_id: impl Into<String>) -> anyhow::Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, deployment_id)
    }

    /// Subscribe to the live event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.broadcast_tx.subscribe()
    }

    /// Flush all pending writes to disk.
    pub async fn flush(&self) -> anyhow::Result<()> {
        self.events.flush_async().await?;
        self.states.flush_async().await?;
        self.hook_tokens.flush_async().await?;
        self.hook_owner.flush_async().await?;
        self.counters.flush_async().await?;
        Ok(())
    }

    fn load_state(&self, run_id: &RunId) -> anyhow::Result<RunState> {
        match self.states.get(run_id.as_str().as_bytes())? {
            Some(bytes) => Ok(rmp_serde::from_slice(&bytes)?),
            None => Ok(RunState::default()),
        }
    }

    fn save_state(&self, run_id: &RunId, state: &RunState) -> anyhow::Result<()> {
        let bytes = rmp_serde::to_vec_named(state)?;
        self.states.insert(run_id.as_str().as_bytes(), bytes)?;
        Ok(())
    }

    /// Allocate the next event id for `run_id`. Callers must hold
    /// `write_lock` so this read-modify-write is not racing another writer.
    fn next_event_id(&self, run_id: &RunId) -> anyhow::Result<u64> {
        let key = run_id.as_str().as_bytes();
        let current = match self.counters.get(key)? {
            Some(bytes) => u64::from_be_bytes(bytes.as_ref().try_into()?),
            None => 0,
        };
        let next = current + 1;
        self.counters.insert(key, next.to_be_bytes().to_vec())?;
        Ok(next)
    }

    fn event_key(run_id: &RunId, event_id: u64) -> Vec<u8> {
        let mut key = run_id.as_str().as_bytes().to_vec();
        key.push(0);
        key.extend_from_slice(&event_id.to_be_bytes());
        key
    }
}

#[async_trait]
impl World for SledWorld {
    async fn append(
        &self,
        run_id: &RunId,
        correlation_id: Option<CorrelationId>,
        data: EventData,
        spec_version: u32,
    ) -> Result<AppendOutcome, WorldError> {
        let _guard = self.write_lock.lock().await;

        let mut state = self.load_state(run_id).map_err(WorldError::Other)?;

        let hook_token_taken = match &data {
            EventData::HookCreated { token, .. } => {
                self.hook_tokens.contains_key(token.as_bytes()).map_err(|e| WorldError::Other(e.into()))?
            }
            _ => false,
        };

        let outcome = apply_event(&mut state, run_id, correlation_id.as_ref(), data, hook_token_taken)
            .map_err(WorldError::Api)?;

        if let Some(hook) = &outcome.hook {
            match hook.status {
                wkf_types::HookStatus::Live => {
                    self.hook_tokens
                        .insert(hook.token.as_bytes(), hook.hook_id.to_string().as_bytes())
                        .map_err(|e| WorldError::Other(e.into()))?;
                }
                wkf_types::HookStatus::Disposed | wkf_types::HookStatus::Conflicted => {
                    self.hook_tokens
                        .remove(hook.token.as_bytes())
                        .map_err(|e| WorldError::Other(e.into()))?;
                }
            }
            let hook_bytes = rmp_serde::to_vec_named(hook).map_err(|e| WorldError::Other(e.into()))?;
            self.hook_owner
                .insert(hook.hook_id.to_string().as_bytes(), hook_bytes)
                .map_err(|e| WorldError::Other(e.into()))?;
        }

        let event_id = self.next_event_id(run_id).map_err(WorldError::Other)?;
        let event = build_event(event_id, run_id.clone(), correlation_id, outcome.event_data, spec_version)
            .map_err(WorldError::Other)?;

        let event_bytes = rmp_serde::to_vec_named(&event).map_err(|e| WorldError::Other(e.into()))?;
        self.events
            .insert(Self::event_key(run_id, event_id), event_bytes)
            .map_err(|e| WorldError::Other(e.into()))?;
        self.save_state(run_id, &state).map_err(WorldError::Other)?;

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
        let prefix = {
            let mut p = run_id.as_str().as_bytes().to_vec();
            p.push(0);
            p
        };
        let mut out = Vec::new();
        for kv in self.events.scan_prefix(&prefix) {
            let (_, value) = kv?;
            out.push(rmp_serde::from_slice(&value)?);
        }
        Ok(out)
    }

    async fn get_run(&self, run_id: &RunId) -> anyhow::Result<Option<Run>> {
        Ok(self.load_state(run_id)?.run)
    }

    async fn get_step(&self, step_id: &CorrelationId) -> anyhow::Result<Option<Step>> {
        // Sled has no secondary index over step ids; correlation ids embed
        // the owning run id (`wkf_types::CorrelationId::derive`), so the run
        // can be recovered without a full scan.
        let run_id = run_id_from_correlation(step_id)?;
        Ok(self.load_state(&run_id)?.steps.get(step_id).cloned())
    }

    async fn get_hook(&self, hook_id: &CorrelationId) -> anyhow::Result<Option<Hook>> {
        match self.hook_owner.get(hook_id.to_string().as_bytes())? {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn get_hook_by_token(&self, token: &str) -> anyhow::Result<Option<Hook>> {
        let Some(id_bytes) = self.hook_tokens.get(token.as_bytes())? else {
            return Ok(None);
        };
        let hook_id = CorrelationId(String::from_utf8(id_bytes.to_vec())?);
        self.get_hook(&hook_id).await
    }

    async fn get_wait(&self, wait_id: &CorrelationId) -> anyhow::Result<Option<Wait>> {
        let run_id = run_id_from_correlation(wait_id)?;
        Ok(self.load_state(&run_id)?.waits.get(wait_id).cloned())
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

/// Recover the owning run id from a correlation id of the form
/// `"{run_id}:{kind}:{index}"` (see `wkf_types::CorrelationId::derive`).
fn run_id_from_correlation(correlation_id: &CorrelationId) -> anyhow::Result<RunId> {
    let raw = correlation_id.to_string();
    let run_part = raw
        .split(':')
        .next()
        .ok_or_else(|| anyhow::anyhow!("malformed correlation id: {raw}"))?;
    RunId::new(run_part.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wkf_types::SerializedData;

    fn input() -> SerializedData {
        SerializedData { spec_version: 2, encrypted: false, bytes: vec![9, 9, 9] }
    }

    fn run_id() -> RunId {
        RunId::new("wrun_01HV0000000000000000000010").unwrap()
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let id = run_id();
        {
            let world = SledWorld::open(&path, "dep-1").unwrap();
            world
                .append(&id, None, EventData::RunCreated { workflow_name: "wf".into(), input: input() }, 2)
                .await
                .unwrap();
            world.flush().await.unwrap();
        }
        {
            let world = SledWorld::open(&path, "dep-1").unwrap();
            let run = world.get_run(&id).await.unwrap().unwrap();
            assert_eq!(run.workflow_name, "wf");
            assert_eq!(world.list_events(&id).await.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn step_lookup_via_correlation_id() {
        let world = SledWorld::temporary("dep-1").unwrap();
        let id = run_id();
        world
            .append(&id, None, EventData::RunCreated { workflow_name: "wf".into(), input: input() }, 2)
            .await
            .unwrap();
        let step_id = CorrelationId::derive(&id, "step", 0);
        world
            .append(&id, Some(step_id.clone()), EventData::StepCreated { step_name: "do_thing".into(), input: input() }, 2)
            .await
            .unwrap();
        let step = world.get_step(&step_id).await.unwrap().unwrap();
        assert_eq!(step.step_name, "do_thing");
    }

    #[tokio::test]
    async fn hook_conflict_recorded_in_log() {
        let world = SledWorld::temporary("dep-1").unwrap();
        let run_a = RunId::new("wrun_01HV0000000000000000000011").unwrap();
        let run_b = RunId::new("wrun_01HV0000000000000000000012").unwrap();
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
        world
            .append(&run_a, Some(hook_a), EventData::HookCreated { token: "shared".into(), metadata: None }, 2)
            .await
            .unwrap();
        let second = world
            .append(&run_b, Some(hook_b), EventData::HookCreated { token: "shared".into(), metadata: None }, 2)
            .await
            .unwrap();
        assert_eq!(second.event.unwrap().event_type(), wkf_types::EventType::HookConflict);
    }
}
