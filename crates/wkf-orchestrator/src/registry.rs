//! Process-wide registry of workflow functions (§2.2, §9 "global
//! `globalThis.__private_workflows` registry").
//!
//! Grounded directly on `toka-kernel`'s opcode-handler registry: a
//! `once_cell::sync::Lazy<RwLock<HashMap<...>>>` populated by `register` and
//! consulted by `lookup`, kept deliberately opaque so callers never reach
//! into the map directly. The only generalization from that source is the
//! value type: handlers here are workflow futures, not synchronous state
//! transitions.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use wkf_types::{SerializedData, WorkflowError};

use crate::context::OrchestratorContext;
use crate::invocation::Interrupt;

/// The future a registered workflow function returns, borrowing the
/// context it was handed for its whole lifetime (every consumer factory
/// call needs `&mut OrchestratorContext`).
pub type WorkflowFuture<'a> = Pin<Box<dyn Future<Output = Result<SerializedData, Interrupt>> + Send + 'a>>;

/// A registered workflow function: given its per-invocation context and
/// serialized arguments, drives user code to completion or suspension.
pub type WorkflowFn =
    Arc<dyn for<'a> Fn(&'a mut OrchestratorContext, SerializedData) -> WorkflowFuture<'a> + Send + Sync>;

static REGISTRY: Lazy<RwLock<HashMap<String, WorkflowFn>>> = Lazy::new(|| RwLock::new(HashMap::new()));

/// Register `handler` under `workflow_name`, replacing any prior entry.
///
/// Workflows call this once at process start (typically from a
/// `#[ctor]`-style init or plain top-level call before `start()` is ever
/// invoked); it is not meant to be called per-run.
pub fn register(workflow_name: impl Into<String>, handler: WorkflowFn) -> Result<(), WorkflowError> {
    REGISTRY
        .write()
        .map_err(|_| WorkflowError::Misconfigured("workflow registry lock poisoned".to_string()))?
        .insert(workflow_name.into(), handler);
    Ok(())
}

/// Look up the handler registered under `workflow_name`.
///
/// A missing entry is a misconfiguration (§4.H step 1: "Absent → fatal
/// misconfiguration error"), not a retryable condition.
pub fn lookup(workflow_name: &str) -> Result<WorkflowFn, WorkflowError> {
    let registry = REGISTRY
        .read()
        .map_err(|_| WorkflowError::Misconfigured("workflow registry lock poisoned".to_string()))?;
    registry
        .get(workflow_name)
        .cloned()
        .ok_or_else(|| WorkflowError::Misconfigured(format!("no workflow registered under {workflow_name}")))
}
