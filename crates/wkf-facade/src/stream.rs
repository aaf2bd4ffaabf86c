//! Streaming side-channel interface (§6: `writeToStream`/`readFromStream`).
//!
//! The governing design notes treat this side-channel as an external
//! collaborator — out of scope for the execution core — referenced only
//! where the orchestrator or a run handle writes to or reads from it. This
//! module therefore defines the seam as a trait, not an implementation: a
//! `World` backend that wants to offer log/progress streaming to
//! [`crate::Run::get_readable`] implements [`StreamSink`] itself.

use async_trait::async_trait;
use wkf_types::RunId;

/// A namespaced, append-only byte-chunk stream scoped to one run.
#[async_trait]
pub trait StreamSink: Send + Sync {
    /// Append `chunk` to `name`'s stream for `run_id`.
    async fn write_to_stream(&self, name: &str, run_id: &RunId, chunk: Vec<u8>) -> anyhow::Result<()>;

    /// Read chunks from `name`'s stream for `run_id`, starting at
    /// `start_index` (0 if `None`).
    async fn read_from_stream(
        &self,
        name: &str,
        run_id: &RunId,
        start_index: Option<u64>,
    ) -> anyhow::Result<Vec<Vec<u8>>>;
}
