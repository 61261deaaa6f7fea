//! Sync engine for the offline order queue.
//!
//! Drives one "drain pass" over a theater's queue-eligible records against
//! the remote order endpoint. Submissions are serialized per theater to
//! preserve order and avoid overwhelming the backend from a single kiosk;
//! per-record failures are absorbed into the record and the returned summary
//! so one bad order never blocks the rest of the batch.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::OrderApi;
use crate::db::DbState;
use crate::error::QueueError;
use crate::store::{self, QueueStatus, QueuedOrder, StatusPatch};

/// Delays between transient-failure retries within a single submission.
/// This short inner loop rides out a network blip; a sustained outage is the
/// queue-level retry-on-next-drain policy's job.
const SUBMIT_BACKOFF: &[Duration] = &[
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];
const SUBMIT_BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Summary of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub succeeded: usize,
    pub failed: usize,
    pub total: usize,
}

/// Per-item progress callback: (current 1-based, total, record, error when
/// the submission failed).
pub type ProgressFn<'a> = &'a (dyn Fn(usize, usize, &QueuedOrder, Option<&str>) + Send + Sync);

// ---------------------------------------------------------------------------
// Drain passes
// ---------------------------------------------------------------------------

/// Drain all queue-eligible records for the theater, oldest-first.
///
/// Records whose `attempts` reached `max_attempts` are left for the explicit
/// retry-failed path so a permanently rejected order stops churning every
/// cycle. Fails with `Offline` before touching any record when the server is
/// unreachable.
pub async fn drain(
    db: &DbState,
    api: &dyn OrderApi,
    theater_id: &str,
    token: &str,
    max_attempts: i64,
    on_progress: Option<ProgressFn<'_>>,
) -> Result<SyncResult, QueueError> {
    if !api.check_health().await {
        return Err(QueueError::Offline);
    }
    drain_eligible(
        db,
        api,
        theater_id,
        token,
        &[QueueStatus::Pending, QueueStatus::Failed],
        Some(max_attempts),
        on_progress,
    )
    .await
}

/// Drain only `failed` records, including ones past the attempt cap. For
/// explicit staff-triggered "retry failed orders" actions.
pub async fn retry_failed_only(
    db: &DbState,
    api: &dyn OrderApi,
    theater_id: &str,
    token: &str,
    on_progress: Option<ProgressFn<'_>>,
) -> Result<SyncResult, QueueError> {
    if !api.check_health().await {
        return Err(QueueError::Offline);
    }
    drain_eligible(
        db,
        api,
        theater_id,
        token,
        &[QueueStatus::Failed],
        None,
        on_progress,
    )
    .await
}

async fn drain_eligible(
    db: &DbState,
    api: &dyn OrderApi,
    theater_id: &str,
    token: &str,
    statuses: &[QueueStatus],
    attempt_cap: Option<i64>,
    on_progress: Option<ProgressFn<'_>>,
) -> Result<SyncResult, QueueError> {
    let eligible = store::list_eligible(db, theater_id, statuses, attempt_cap)?;
    let total = eligible.len();
    let mut result = SyncResult {
        total,
        ..Default::default()
    };

    if total == 0 {
        store::set_last_sync_time(db, theater_id, &Utc::now().to_rfc3339())?;
        return Ok(result);
    }

    info!(theater_id, total, "Draining offline order queue");

    for (idx, order) in eligible.iter().enumerate() {
        let current = idx + 1;

        // One submission per record per pass: losing the claim means a
        // concurrent pass already owns it.
        if !store::claim_for_sync(db, theater_id, &order.queue_id)? {
            debug!(
                queue_id = %order.queue_id,
                "Record claimed by another drain; skipping"
            );
            continue;
        }

        match submit_with_backoff(api, token, &order.payload).await {
            Ok(_remote) => {
                let patch = StatusPatch {
                    status: Some(QueueStatus::Synced),
                    last_error: Some(None),
                    synced_at: Some(Some(Utc::now().to_rfc3339())),
                    ..Default::default()
                };
                apply_patch(db, theater_id, &order.queue_id, &patch)?;
                result.succeeded += 1;
                if let Some(progress) = on_progress {
                    progress(current, total, order, None);
                }
            }
            Err(e) => {
                warn!(
                    queue_id = %order.queue_id,
                    attempts = order.attempts + 1,
                    "Order submission failed: {e}"
                );
                let patch = StatusPatch {
                    status: Some(QueueStatus::Failed),
                    attempts: Some(order.attempts + 1),
                    last_error: Some(Some(e.clone())),
                    ..Default::default()
                };
                apply_patch(db, theater_id, &order.queue_id, &patch)?;
                result.failed += 1;
                if let Some(progress) = on_progress {
                    progress(current, total, order, Some(&e));
                }
            }
        }
    }

    store::set_last_sync_time(db, theater_id, &Utc::now().to_rfc3339())?;
    Ok(result)
}

/// Write a post-submission patch. A record that vanished mid-drain (store
/// cleared concurrently) is logged and skipped, not fatal.
fn apply_patch(
    db: &DbState,
    theater_id: &str,
    queue_id: &str,
    patch: &StatusPatch,
) -> Result<(), QueueError> {
    match store::update_status(db, theater_id, queue_id, patch) {
        Ok(()) => Ok(()),
        Err(QueueError::NotFound(id)) => {
            warn!(queue_id = %id, "Queue record vanished mid-drain; skipping update");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Single-submission retry
// ---------------------------------------------------------------------------

/// Submit one order, retrying transient network failures with short capped
/// delays. Permanent rejections (validation, auth) return immediately.
async fn submit_with_backoff(
    api: &dyn OrderApi,
    token: &str,
    payload: &Value,
) -> Result<Value, String> {
    let mut last_err = String::new();

    for attempt in 0..=SUBMIT_BACKOFF.len() {
        if attempt > 0 {
            let delay = SUBMIT_BACKOFF[attempt - 1].min(SUBMIT_BACKOFF_CAP);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying submission");
            tokio::time::sleep(delay).await;
        }

        match api.submit_order(token, payload).await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if !is_transient_submit_error(&e) {
                    return Err(e);
                }
                last_err = e;
            }
        }
    }

    Err(last_err)
}

/// Network blips and server-side hiccups are worth an immediate retry;
/// anything else (validation, auth, rejection) is not.
fn is_transient_submit_error(error: &str) -> bool {
    let lower = error.to_lowercase();
    lower.contains("timed out")
        || lower.contains("cannot reach")
        || lower.contains("network error")
        || lower.contains("server error")
        || lower.contains("http 502")
        || lower.contains("http 503")
        || lower.contains("http 504")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_error_classification() {
        assert!(is_transient_submit_error(
            "Connection to https://orders.example.com timed out"
        ));
        assert!(is_transient_submit_error("Order server error (HTTP 503)"));
        assert!(is_transient_submit_error(
            "Cannot reach order server at https://orders.example.com"
        ));

        assert!(!is_transient_submit_error(
            "Access token is invalid or expired (HTTP 401)"
        ));
        assert!(!is_transient_submit_error("Invalid seat reference"));
    }

    #[test]
    fn test_sync_result_serializes_camel_case() {
        let result = SyncResult {
            succeeded: 2,
            failed: 1,
            total: 3,
        };
        let json = serde_json::to_value(result).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "succeeded": 2, "failed": 1, "total": 3 })
        );
    }
}
