#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wkf-world-sqlite** – SQLite-based durable `World` driver for the
//! workflow runtime.
//!
//! Grounded on `toka-store-sqlite`'s `SqliteBackend` (sqlx pool, `migrate`
//! run once at construction, `STRICT` tables, broadcast live stream). Five
//! tables hold the log (`events`), the materialized per-run view (`states`,
//! one serialized [`RunState`] row per run — the simplest schema that keeps
//! the conflict rules in one place, shared with `wkf-world-memory` and
//! `wkf-world-sled`), the global hook token index (`hook_tokens`), a hook
//! lookup-by-id table (`hook_owner`), and per-run event id counters
//! (`counters`). Every `append` runs inside one sqlx transaction so the
//! event row and the state/hook-index mutations commit together or not at
//! all; a process-wide async mutex additionally serializes writers so the
//! read-modify-write of the materialized state cannot race itself (sqlite's
//! own locking only protects individual statements, not this multi-table
//! read-then-write).

use std::path::Path;

use async_trait::async_trait;
use hkdf::Hkdf;
use sha2::Sha256;
use sqlx::{Row, SqlitePool};
use tokio::sync::{broadcast, Mutex};

use wkf_types::{CorrelationId, Event, EventData, Hook, Run, RunId, Step, Wait};
use wkf_world_core::{
    state::{apply_event, build_event, RunState},
    AppendOutcome, World, WorldError,
};

const DEFAULT_BROADCAST_SIZE: usize = 256;

/// A persistent, transactional [`World`] driver backed by SQLite.
pub struct SqliteWorld {
    pool: SqlitePool,
    deployment_id: String,
    deployment_secret: Option<[u8; 32]>,
    write_lock: Mutex<()>,
    broadcast_tx: broadcast::Sender<Event>,
}

impl SqliteWorld {
    /// Opens or creates a SQLite database file at `path`.
    pub async fn open<P: AsRef<Path>>(path: P, deployment_id: impl Into<String>) -> anyhow::Result<Self> {
        let url = format!("sqlite://{}?mode=rwc", path.as_ref().display());
        let pool = SqlitePool::connect(&url).await?;
        Self::from_pool(pool, deployment_id).await
    }

    /// Opens an in-memory database, useful for tests.
    pub async fn in_memory(deployment_id: impl Into<String>) -> anyhow::Result<Self> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        Self::from_pool(pool, deployment_id).await
    }

    /// Builds a backend from an existing pool, running migrations.
    pub async fn from_pool(pool: SqlitePool, deployment_id: impl Into<String>) -> anyhow::Result<Self> {
        let world = Self {
            pool,
            deployment_id: deployment_id.into(),
            deployment_secret: None,
            write_lock: Mutex::new(()),
            broadcast_tx: broadcast::channel(DEFAULT_BROADCAST_SIZE).0,
        };
        world.migrate().await?;
        Ok(world)
    }

    /// Enables central per-run key derivation via HKDF-SHA256 (§4.A, §4.I).
    pub fn with_encryption(mut self, deployment_secret: [u8; 32]) -> Self {
        self.deployment_secret = Some(deployment_secret);
        self
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                run_id TEXT NOT NULL,
                event_id INTEGER NOT NULL,
                correlation_id TEXT,
                event_data BLOB NOT NULL,
                created_at TEXT NOT NULL,
                spec_version INTEGER NOT NULL,
                digest BLOB NOT NULL,
                PRIMARY KEY (run_id, event_id)
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS states (
                run_id TEXT PRIMARY KEY,
                state_data BLOB NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hook_tokens (
                token TEXT PRIMARY KEY,
                hook_id TEXT NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hook_owner (
                hook_id TEXT PRIMARY KEY,
                hook_data BLOB NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS counters (
                run_id TEXT PRIMARY KEY,
                next_event_id INTEGER NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Subscribe to the live event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.broadcast_tx.subscribe()
    }

    async fn load_state(&self, run_id: &RunId) -> anyhow::Result<RunState> {
        let row = sqlx::query("SELECT state_data FROM states WHERE run_id = ?")
            .bind(run_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let bytes: Vec<u8> = row.get("state_data");
                Ok(rmp_serde::from_slice(&bytes)?)
            }
            None => Ok(RunState::default()),
        }
    }
}

#[async_trait]
impl World for SqliteWorld {
    async fn append(
        &self,
        run_id: &RunId,
        correlation_id: Option<CorrelationId>,
        data: EventData,
        spec_version: u32,
    ) -> Result<AppendOutcome, WorldError> {
        let _guard = self.write_lock.lock().await;

        let mut state = self.load_state(run_id).await.map_err(WorldError::Other)?;

        let hook_token_taken = match &data {
            EventData::HookCreated { token, .. } => {
                sqlx::query("SELECT 1 FROM hook_tokens WHERE token = ?")
                    .bind(token)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| WorldError::Other(e.into()))?
                    .is_some()
            }
            _ => false,
        };

        let outcome = apply_event(&mut state, run_id, correlation_id.as_ref(), data, hook_token_taken)
            .map_err(WorldError::Api)?;

        let next_event_id = {
            let row = sqlx::query("SELECT next_event_id FROM counters WHERE run_id = ?")
                .bind(run_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| WorldError::Other(e.into()))?;
            row.map(|r| r.get::<i64, _>("next_event_id")).unwrap_or(0) + 1
        };

        let event = build_event(
            next_event_id as u64,
            run_id.clone(),
            correlation_id,
            outcome.event_data,
            spec_version,
        )
        .map_err(WorldError::Other)?;

        let mut tx = self.pool.begin().await.map_err(|e| WorldError::Other(e.into()))?;

        let event_bytes = rmp_serde::to_vec_named(&event).map_err(|e| WorldError::Other(e.into()))?;
        sqlx::query(
            "INSERT INTO events (run_id, event_id, correlation_id, event_data, created_at, spec_version, digest) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(run_id.as_str())
        .bind(next_event_id)
        .bind(event.correlation_id.as_ref().map(|c| c.to_string()))
        .bind(&event_bytes)
        .bind(event.created_at.to_rfc3339())
        .bind(event.spec_version as i64)
        .bind(&event.digest[..])
        .execute(&mut *tx)
        .await
        .map_err(|e| WorldError::Other(e.into()))?;

        sqlx::query("INSERT INTO counters (run_id, next_event_id) VALUES (?, ?) ON CONFLICT(run_id) DO UPDATE SET next_event_id = excluded.next_event_id")
            .bind(run_id.as_str())
            .bind(next_event_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| WorldError::Other(e.into()))?;

        let state_bytes = rmp_serde::to_vec_named(&state).map_err(|e| WorldError::Other(e.into()))?;
        sqlx::query("INSERT INTO states (run_id, state_data) VALUES (?, ?) ON CONFLICT(run_id) DO UPDATE SET state_data = excluded.state_data")
            .bind(run_id.as_str())
            .bind(&state_bytes)
            .execute(&mut *tx)
            .await
            .map_err(|e| WorldError::Other(e.into()))?;

        if let Some(hook) = &outcome.hook {
            let hook_bytes = rmp_serde::to_vec_named(hook).map_err(|e| WorldError::Other(e.into()))?;
            sqlx::query("INSERT INTO hook_owner (hook_id, hook_data) VALUES (?, ?) ON CONFLICT(hook_id) DO UPDATE SET hook_data = excluded.hook_data")
                .bind(hook.hook_id.to_string())
                .bind(&hook_bytes)
                .execute(&mut *tx)
                .await
                .map_err(|e| WorldError::Other(e.into()))?;
            match hook.status {
                wkf_types::HookStatus::Live => {
                    sqlx::query("INSERT INTO hook_tokens (token, hook_id) VALUES (?, ?)")
                        .bind(&hook.token)
                        .bind(hook.hook_id.to_string())
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| WorldError::Other(e.into()))?;
                }
                wkf_types::HookStatus::Disposed | wkf_types::HookStatus::Conflicted => {
                    sqlx::query("DELETE FROM hook_tokens WHERE token = ?")
                        .bind(&hook.token)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| WorldError::Other(e.into()))?;
                }
            }
        }

        tx.commit().await.map_err(|e| WorldError::Other(e.into()))?;

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
        let rows = sqlx::query("SELECT event_data FROM events WHERE run_id = ? ORDER BY event_id ASC")
            .bind(run_id.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let bytes: Vec<u8> = row.get("event_data");
                Ok(rmp_serde::from_slice(&bytes)?)
            })
            .collect()
    }

    async fn get_run(&self, run_id: &RunId) -> anyhow::Result<Option<Run>> {
        Ok(self.load_state(run_id).await?.run)
    }

    async fn get_step(&self, step_id: &CorrelationId) -> anyhow::Result<Option<Step>> {
        let run_id = run_id_from_correlation(step_id)?;
        Ok(self.load_state(&run_id).await?.steps.get(step_id).cloned())
    }

    async fn get_hook(&self, hook_id: &CorrelationId) -> anyhow::Result<Option<Hook>> {
        let row = sqlx::query("SELECT hook_data FROM hook_owner WHERE hook_id = ?")
            .bind(hook_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let bytes: Vec<u8> = row.get("hook_data");
                Ok(Some(rmp_serde::from_slice(&bytes)?))
            }
            None => Ok(None),
        }
    }

    async fn get_hook_by_token(&self, token: &str) -> anyhow::Result<Option<Hook>> {
        let row = sqlx::query("SELECT hook_id FROM hook_tokens WHERE token = ?")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let hook_id = CorrelationId(row.get("hook_id"));
        self.get_hook(&hook_id).await
    }

    async fn get_wait(&self, wait_id: &CorrelationId) -> anyhow::Result<Option<Wait>> {
        let run_id = run_id_from_correlation(wait_id)?;
        Ok(self.load_state(&run_id).await?.waits.get(wait_id).cloned())
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
        SerializedData { spec_version: 2, encrypted: false, bytes: vec![4, 5, 6] }
    }

    fn run_id() -> RunId {
        RunId::new("wrun_01HV0000000000000000000020").unwrap()
    }

    #[tokio::test]
    async fn basic_append_and_read() {
        let world = SqliteWorld::in_memory("dep-1").await.unwrap();
        let id = run_id();
        world
            .append(&id, None, EventData::RunCreated { workflow_name: "wf".into(), input: input() }, 2)
            .await
            .unwrap();
        let run = world.get_run(&id).await.unwrap().unwrap();
        assert_eq!(run.workflow_name, "wf");
        assert_eq!(world.list_events(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_terminal_event_conflicts() {
        let world = SqliteWorld::in_memory("dep-1").await.unwrap();
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
        assert!(matches!(err, WorldError::Api(api) if api.is_gone() || api.is_conflict()));
    }

    #[tokio::test]
    async fn hook_by_token_round_trips() {
        let world = SqliteWorld::in_memory("dep-1").await.unwrap();
        let id = run_id();
        world
            .append(&id, None, EventData::RunCreated { workflow_name: "wf".into(), input: input() }, 2)
            .await
            .unwrap();
        let hook_id = CorrelationId::derive(&id, "hook", 0);
        world
            .append(&id, Some(hook_id.clone()), EventData::HookCreated { token: "t-1".into(), metadata: None }, 2)
            .await
            .unwrap();
        let hook = world.get_hook_by_token("t-1").await.unwrap().unwrap();
        assert_eq!(hook.hook_id, hook_id);
    }
}
