//! Tenant-scoped durable queue store.
//!
//! Every operation is keyed by `theater_id`, so queues for different theaters
//! never contend. Records move through `pending -> syncing -> synced/failed`;
//! only the sync engine transitions them, the presentation layer reads.

use chrono::Utc;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, warn};
use uuid::Uuid;

use crate::db::{self, DbState};
use crate::error::{storage_err, QueueError};

const LAST_SYNC_CATEGORY: &str = "sync";

/// Lifecycle state of a queued order.
///
/// `pending` and `failed` are both drain-eligible; `syncing` is the in-flight
/// claim marker for one drain pass; `synced` is terminal and retained for
/// recent history until pruned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Syncing => "syncing",
            QueueStatus::Synced => "synced",
            QueueStatus::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> QueueStatus {
        match raw {
            "pending" => QueueStatus::Pending,
            "syncing" => QueueStatus::Syncing,
            "synced" => QueueStatus::Synced,
            "failed" => QueueStatus::Failed,
            other => {
                warn!(status = other, "Unknown queue status, treating as pending");
                QueueStatus::Pending
            }
        }
    }
}

/// One durably queued order.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOrder {
    pub queue_id: String,
    pub theater_id: String,
    pub payload: Value,
    pub status: QueueStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: String,
    pub synced_at: Option<String>,
}

/// Partial update applied by the sync engine. `None` fields are left as-is.
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    pub status: Option<QueueStatus>,
    pub attempts: Option<i64>,
    pub last_error: Option<Option<String>>,
    pub synced_at: Option<Option<String>>,
}

const SELECT_COLUMNS: &str =
    "queue_id, theater_id, payload, status, attempts, last_error, created_at, synced_at";

// ---------------------------------------------------------------------------
// Enqueue / read
// ---------------------------------------------------------------------------

/// Durably append a new order for `theater_id` with a fresh `queue_id`.
///
/// Accepts any JSON payload; validation belongs to the controller. Fails only
/// when persistence itself is unavailable.
pub fn append(db: &DbState, theater_id: &str, payload: &Value) -> Result<QueuedOrder, QueueError> {
    let conn = db.conn.lock().map_err(storage_err)?;

    let queue_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    let payload_text = serde_json::to_string(payload)
        .map_err(|e| storage_err(format!("serialize order payload: {e}")))?;

    conn.execute(
        "INSERT INTO order_queue (queue_id, theater_id, payload, status, attempts, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?4)",
        params![queue_id, theater_id, payload_text, now],
    )
    .map_err(|e| storage_err(format!("enqueue order: {e}")))?;

    Ok(QueuedOrder {
        queue_id,
        theater_id: theater_id.to_string(),
        payload: payload.clone(),
        status: QueueStatus::Pending,
        attempts: 0,
        last_error: None,
        created_at: now,
        synced_at: None,
    })
}

/// All records for the theater, oldest-first.
pub fn list(db: &DbState, theater_id: &str) -> Result<Vec<QueuedOrder>, QueueError> {
    let conn = db.conn.lock().map_err(storage_err)?;
    collect_orders(
        &conn,
        theater_id,
        &format!(
            "SELECT {SELECT_COLUMNS} FROM order_queue
             WHERE theater_id = ?1
             ORDER BY created_at ASC, id ASC"
        ),
    )
}

/// Drain-eligible records, oldest-first.
///
/// `attempt_cap` excludes records that have exhausted their automatic
/// retries; pass `None` to include them (explicit retry-failed path).
pub fn list_eligible(
    db: &DbState,
    theater_id: &str,
    statuses: &[QueueStatus],
    attempt_cap: Option<i64>,
) -> Result<Vec<QueuedOrder>, QueueError> {
    let conn = db.conn.lock().map_err(storage_err)?;

    let status_list = statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    let attempts_clause = match attempt_cap {
        Some(cap) => format!("AND attempts < {cap}"),
        None => String::new(),
    };

    collect_orders(
        &conn,
        theater_id,
        &format!(
            "SELECT {SELECT_COLUMNS} FROM order_queue
             WHERE theater_id = ?1
               AND status IN ({status_list})
               {attempts_clause}
             ORDER BY created_at ASC, id ASC"
        ),
    )
}

/// Run a queue query and map rows into `QueuedOrder`s.
///
/// A row whose payload no longer parses is corruption; per the store's
/// failure semantics that means total loss of the tenant's queue — log it,
/// reset the theater's queue to empty, and return the empty queue instead of
/// propagating a parse error upward.
fn collect_orders(
    conn: &rusqlite::Connection,
    theater_id: &str,
    query: &str,
) -> Result<Vec<QueuedOrder>, QueueError> {
    let mut stmt = conn.prepare(query).map_err(storage_err)?;

    type Row = (
        String,
        String,
        String,
        String,
        i64,
        Option<String>,
        String,
        Option<String>,
    );

    let rows: Vec<Row> = stmt
        .query_map(params![theater_id], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
            ))
        })
        .map_err(storage_err)?
        .filter_map(|r| r.ok())
        .collect();

    let mut orders = Vec::with_capacity(rows.len());
    for (queue_id, theater, payload_text, status, attempts, last_error, created_at, synced_at) in
        rows
    {
        let payload: Value = match serde_json::from_str(&payload_text) {
            Ok(v) => v,
            Err(e) => {
                error!(
                    theater_id,
                    queue_id = %queue_id,
                    "Corrupt queue payload ({e}); resetting theater queue"
                );
                reset_theater_queue(conn, theater_id);
                return Ok(Vec::new());
            }
        };
        orders.push(QueuedOrder {
            queue_id,
            theater_id: theater,
            payload,
            status: QueueStatus::parse(&status),
            attempts,
            last_error,
            created_at,
            synced_at,
        });
    }

    Ok(orders)
}

fn reset_theater_queue(conn: &rusqlite::Connection, theater_id: &str) {
    let _ = conn.execute(
        "DELETE FROM order_queue WHERE theater_id = ?1",
        params![theater_id],
    );
}

// ---------------------------------------------------------------------------
// Status transitions
// ---------------------------------------------------------------------------

/// Atomically merge a partial update into the matching record.
pub fn update_status(
    db: &DbState,
    theater_id: &str,
    queue_id: &str,
    patch: &StatusPatch,
) -> Result<(), QueueError> {
    let conn = db.conn.lock().map_err(storage_err)?;
    let now = Utc::now().to_rfc3339();

    let mut sets: Vec<String> = vec!["updated_at = ?1".into()];
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(now)];

    if let Some(status) = patch.status {
        values.push(Box::new(status.as_str().to_string()));
        sets.push(format!("status = ?{}", values.len()));
    }
    if let Some(attempts) = patch.attempts {
        values.push(Box::new(attempts));
        sets.push(format!("attempts = ?{}", values.len()));
    }
    if let Some(ref last_error) = patch.last_error {
        values.push(Box::new(last_error.clone()));
        sets.push(format!("last_error = ?{}", values.len()));
    }
    if let Some(ref synced_at) = patch.synced_at {
        values.push(Box::new(synced_at.clone()));
        sets.push(format!("synced_at = ?{}", values.len()));
    }

    values.push(Box::new(theater_id.to_string()));
    let theater_idx = values.len();
    values.push(Box::new(queue_id.to_string()));
    let queue_idx = values.len();

    let sql = format!(
        "UPDATE order_queue SET {} WHERE theater_id = ?{theater_idx} AND queue_id = ?{queue_idx}",
        sets.join(", ")
    );

    let changed = conn
        .execute(&sql, rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())))
        .map_err(|e| storage_err(format!("update queue record: {e}")))?;

    if changed == 0 {
        return Err(QueueError::NotFound(queue_id.to_string()));
    }
    Ok(())
}

/// Claim a record for submission: `pending|failed -> syncing` as one guarded
/// UPDATE. Returns false when another drain already moved it — the caller
/// must then skip the record for this pass.
pub fn claim_for_sync(
    db: &DbState,
    theater_id: &str,
    queue_id: &str,
) -> Result<bool, QueueError> {
    let conn = db.conn.lock().map_err(storage_err)?;
    let now = Utc::now().to_rfc3339();

    let changed = conn
        .execute(
            "UPDATE order_queue SET status = 'syncing', updated_at = ?1
             WHERE theater_id = ?2 AND queue_id = ?3
               AND status IN ('pending', 'failed')",
            params![now, theater_id, queue_id],
        )
        .map_err(|e| storage_err(format!("claim queue record: {e}")))?;

    Ok(changed == 1)
}

/// Put records left `syncing` by a crash back into `pending`.
///
/// Called once at controller startup; an interrupted drain must never leave
/// a record stuck out of the drain-eligible set.
pub fn requeue_stuck_syncing(db: &DbState, theater_id: &str) -> Result<usize, QueueError> {
    let conn = db.conn.lock().map_err(storage_err)?;
    conn.execute(
        "UPDATE order_queue SET status = 'pending', updated_at = datetime('now')
         WHERE theater_id = ?1 AND status = 'syncing'",
        params![theater_id],
    )
    .map_err(|e| storage_err(format!("requeue stuck records: {e}")))
}

// ---------------------------------------------------------------------------
// Counts and sync bookkeeping
// ---------------------------------------------------------------------------

/// Records the UI should count as "not yet on the server": queue-eligible
/// only, so an in-flight record is not double-reported mid-drain.
pub fn pending_count(db: &DbState, theater_id: &str) -> Result<i64, QueueError> {
    count_with_statuses(db, theater_id, "('pending', 'failed')")
}

/// Records that failed their last submission.
pub fn failed_count(db: &DbState, theater_id: &str) -> Result<i64, QueueError> {
    count_with_statuses(db, theater_id, "('failed')")
}

fn count_with_statuses(
    db: &DbState,
    theater_id: &str,
    status_list: &str,
) -> Result<i64, QueueError> {
    let conn = db.conn.lock().map_err(storage_err)?;
    let query = format!(
        "SELECT COUNT(*) FROM order_queue WHERE theater_id = ?1 AND status IN {status_list}"
    );
    Ok(conn
        .query_row(&query, params![theater_id], |row| row.get(0))
        .unwrap_or(0))
}

/// Timestamp of the last completed drain attempt for the theater, if any.
pub fn last_sync_time(db: &DbState, theater_id: &str) -> Option<String> {
    let conn = db.conn.lock().ok()?;
    db::get_setting(&conn, LAST_SYNC_CATEGORY, &format!("last_sync:{theater_id}"))
}

pub fn set_last_sync_time(
    db: &DbState,
    theater_id: &str,
    when: &str,
) -> Result<(), QueueError> {
    let conn = db.conn.lock().map_err(storage_err)?;
    db::set_setting(&conn, LAST_SYNC_CATEGORY, &format!("last_sync:{theater_id}"), when)
}

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

/// Delete synced records older than `keep`, bounding storage growth while
/// leaving recent sync history visible to staff.
pub fn prune_synced(
    db: &DbState,
    theater_id: &str,
    keep: chrono::Duration,
) -> Result<usize, QueueError> {
    let conn = db.conn.lock().map_err(storage_err)?;
    let cutoff = (Utc::now() - keep).to_rfc3339();

    conn.execute(
        "DELETE FROM order_queue
         WHERE theater_id = ?1 AND status = 'synced' AND synced_at < ?2",
        params![theater_id, cutoff],
    )
    .map_err(|e| storage_err(format!("prune synced records: {e}")))
}
