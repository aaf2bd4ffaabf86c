//! Retry and backoff helpers shared by the suspension handler and the step
//! handler (§4.F step 5, §4.G "Retry/backoff"), grounded on
//! `toka-agent-runtime`'s `calculate_retry_delay` exponential-backoff shape.

use std::future::Future;
use std::time::Duration;

use wkf_world_core::WorldError;

/// Fixed backoff schedule for transient 5xx errors from a `World` call:
/// three attempts at 500ms, 1s, 2s before giving up (§4.G "Retry/backoff").
const SERVER_ERROR_DELAYS: [Duration; 3] =
    [Duration::from_millis(500), Duration::from_secs(1), Duration::from_secs(2)];

/// Retry `op` on a transient 5xx [`WorldError`], sleeping through
/// [`SERVER_ERROR_DELAYS`] between attempts. Any other error, or a 5xx that
/// survives the last attempt, is returned to the caller.
pub async fn with_server_error_retry<F, Fut, T>(mut op: F) -> Result<T, WorldError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, WorldError>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(WorldError::Api(api)) if api.is_server_error() && attempt < SERVER_ERROR_DELAYS.len() => {
                tracing::warn!(attempt, status = api.status, "server error, retrying after backoff");
                tokio::time::sleep(SERVER_ERROR_DELAYS[attempt]).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// What [`with_throttle_retry`] asks the caller to do.
pub enum ThrottleOutcome<T> {
    /// The call succeeded, possibly after one retry.
    Ready(T),
    /// Still throttled after the retry; the caller should give up on this
    /// delivery and reschedule itself after `retry_after_secs`.
    Reschedule(u64),
}

/// Default backoff offered to the caller when a second 429 doesn't carry its
/// own `retryAfter`.
const DEFAULT_THROTTLE_RESCHEDULE_SECS: u64 = 30;

/// Handle a 429 from `op` the way the step handler does (§4.G
/// "Throttle handling"): on a `retryAfter` of ten seconds or less, sleep then
/// retry once; otherwise, or if the retry is throttled again, ask the caller
/// to reschedule the whole delivery after the reported delay.
pub async fn with_throttle_retry<F, Fut, T>(mut op: F) -> Result<ThrottleOutcome<T>, WorldError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, WorldError>>,
{
    match op().await {
        Ok(value) => Ok(ThrottleOutcome::Ready(value)),
        Err(WorldError::Api(api)) if api.is_throttled() => {
            let retry_after = api.retry_after.unwrap_or(Duration::from_secs(DEFAULT_THROTTLE_RESCHEDULE_SECS));
            if retry_after > Duration::from_secs(10) {
                return Ok(ThrottleOutcome::Reschedule(retry_after.as_secs().max(1)));
            }
            tokio::time::sleep(retry_after).await;
            match op().await {
                Ok(value) => Ok(ThrottleOutcome::Ready(value)),
                Err(WorldError::Api(api)) if api.is_throttled() => {
                    let next = api.retry_after.unwrap_or(Duration::from_secs(DEFAULT_THROTTLE_RESCHEDULE_SECS));
                    Ok(ThrottleOutcome::Reschedule(next.as_secs().max(1)))
                }
                Err(err) => Err(err),
            }
        }
        Err(err) => Err(err),
    }
}

/// Exponential backoff for consecutive `hook_conflict` observations on the
/// same run (§9 Open Question 2): base 500ms, factor 2, capped at 30s.
pub fn hook_conflict_backoff_seconds(consecutive_conflicts: u32) -> u64 {
    let millis = 500u64.saturating_mul(1u64 << consecutive_conflicts.min(16));
    (millis / 1000).clamp(1, 30)
}
