//! Offline queue controller: the per-session façade a kiosk order screen
//! binds to.
//!
//! Owns the auto-sync background task and connectivity observation for one
//! theater, guards against overlapping drains, and translates store/sync
//! state into a single status snapshot for the presentation layer.

use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::OrderApi;
use crate::db::{self, DbState};
use crate::error::QueueError;
use crate::store::{self, QueuedOrder};
use crate::sync::{self, ProgressFn, SyncResult};

/// Automatic drains stop retrying a record after this many attempts; the
/// explicit retry-failed action still picks it up.
const DEFAULT_MAX_ATTEMPTS: i64 = 10;

const ORDER_COUNTER_CATEGORY: &str = "orders";

/// Snapshot of queue and connectivity state for the order screen.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub pending_count: i64,
    pub failed_count: i64,
    pub last_sync_time: Option<String>,
    pub sync_error: Option<String>,
    pub sync_progress: Option<SyncProgress>,
}

/// Position within the drain currently in flight.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub current: usize,
    pub total: usize,
}

/// Completion callback for auto-sync cycles.
pub type CompleteFn = Box<dyn Fn(&SyncResult) + Send + Sync>;

/// Owned per-item progress callback for auto-sync cycles.
pub type OwnedProgressFn = Box<dyn Fn(usize, usize, &QueuedOrder, Option<&str>) + Send + Sync>;

pub struct OfflineQueueController {
    db: Arc<DbState>,
    api: Arc<dyn OrderApi>,
    theater_id: String,
    max_attempts: i64,
    is_syncing: Arc<AtomicBool>,
    is_online: Arc<AtomicBool>,
    sync_error: Arc<Mutex<Option<String>>>,
    sync_progress: Arc<Mutex<Option<SyncProgress>>>,
}

impl OfflineQueueController {
    /// Build a controller for one theater session.
    ///
    /// Records left `syncing` by a crash are put back into `pending` here so
    /// an interrupted drain can never strand an order.
    pub fn new(db: Arc<DbState>, api: Arc<dyn OrderApi>, theater_id: impl Into<String>) -> Self {
        let theater_id = theater_id.into();

        match store::requeue_stuck_syncing(&db, &theater_id) {
            Ok(0) => {}
            Ok(requeued) => warn!(
                theater_id = %theater_id,
                requeued, "Requeued orders left in-flight by a previous session"
            ),
            Err(e) => warn!(theater_id = %theater_id, "Startup requeue failed: {e}"),
        }

        Self {
            db,
            api,
            theater_id,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            is_syncing: Arc::new(AtomicBool::new(false)),
            is_online: Arc::new(AtomicBool::new(false)),
            sync_error: Arc::new(Mutex::new(None)),
            sync_progress: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: i64) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn theater_id(&self) -> &str {
        &self.theater_id
    }

    // -----------------------------------------------------------------------
    // Order intake
    // -----------------------------------------------------------------------

    /// Queue an order locally. Works with zero connectivity — that is the
    /// entire point of the subsystem.
    ///
    /// Stamps a sequential per-theater order number and the theater id into
    /// the payload before it is persisted.
    pub fn enqueue_order(&self, payload: &Value) -> Result<QueuedOrder, QueueError> {
        let items_ok = payload
            .get("items")
            .and_then(Value::as_array)
            .map(|items| !items.is_empty())
            .unwrap_or(false);
        if !items_ok {
            return Err(QueueError::InvalidOrder(
                "order has no line items".to_string(),
            ));
        }

        // Stamp before acquiring the store's lock: next_order_number takes
        // the connection lock itself and std::sync::Mutex is not reentrant.
        let order_number = self.next_order_number();

        let mut stamped = payload.clone();
        if let Some(obj) = stamped.as_object_mut() {
            obj.insert("orderNumber".to_string(), Value::String(order_number));
            obj.insert(
                "theaterId".to_string(),
                Value::String(self.theater_id.clone()),
            );
        }

        let queued = store::append(&self.db, &self.theater_id, &stamped)?;
        info!(
            theater_id = %self.theater_id,
            queue_id = %queued.queue_id,
            "Order queued locally"
        );
        Ok(queued)
    }

    /// Generate a sequential order number in format ORD-DDMMYYYY-NNNNN.
    ///
    /// Uses `local_settings` (category='orders') as a persistent per-theater
    /// counter; the date component makes numbers readable on receipts.
    fn next_order_number(&self) -> String {
        let date_display = chrono::Local::now().format("%d%m%Y").to_string();
        let key = format!("order_counter:{}", self.theater_id);

        let conn = match self.db.conn.lock() {
            Ok(c) => c,
            Err(_) => return format!("ORD-{date_display}-00000"),
        };

        let current: i64 = db::get_setting(&conn, ORDER_COUNTER_CATEGORY, &key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let next = current + 1;
        let _ = db::set_setting(&conn, ORDER_COUNTER_CATEGORY, &key, &next.to_string());

        format!("ORD-{date_display}-{next:05}")
    }

    // -----------------------------------------------------------------------
    // Views
    // -----------------------------------------------------------------------

    /// Read-only view of the theater's queue, oldest-first.
    pub fn queue(&self) -> Result<Vec<QueuedOrder>, QueueError> {
        store::list(&self.db, &self.theater_id)
    }

    /// Current queue and connectivity snapshot.
    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            is_online: self.is_online.load(Ordering::SeqCst),
            is_syncing: self.is_syncing.load(Ordering::SeqCst),
            pending_count: store::pending_count(&self.db, &self.theater_id).unwrap_or(0),
            failed_count: store::failed_count(&self.db, &self.theater_id).unwrap_or(0),
            last_sync_time: store::last_sync_time(&self.db, &self.theater_id),
            sync_error: self.sync_error.lock().ok().and_then(|g| g.clone()),
            sync_progress: self.sync_progress.lock().ok().and_then(|g| *g),
        }
    }

    /// Delete synced records older than `keep`. Explicit maintenance; synced
    /// history is otherwise retained for the screen to show.
    pub fn prune_synced(&self, keep: chrono::Duration) -> Result<usize, QueueError> {
        store::prune_synced(&self.db, &self.theater_id, keep)
    }

    // -----------------------------------------------------------------------
    // Sync entry points
    // -----------------------------------------------------------------------

    /// One-shot drain outside the timer cadence.
    ///
    /// If a drain is already running this is a no-op returning an empty
    /// summary — never a second concurrent drain for the theater.
    pub async fn manual_sync(
        &self,
        token: &str,
        on_progress: Option<ProgressFn<'_>>,
    ) -> Result<SyncResult, QueueError> {
        self.run_guarded(token, on_progress, false).await
    }

    /// Resubmit only failed orders, including ones past the attempt cap.
    pub async fn retry_failed(
        &self,
        token: &str,
        on_progress: Option<ProgressFn<'_>>,
    ) -> Result<SyncResult, QueueError> {
        self.run_guarded(token, on_progress, true).await
    }

    async fn run_guarded(
        &self,
        token: &str,
        on_progress: Option<ProgressFn<'_>>,
        failed_only: bool,
    ) -> Result<SyncResult, QueueError> {
        if self
            .is_syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(theater_id = %self.theater_id, "Sync already in progress; ignoring");
            return Ok(SyncResult::default());
        }

        let progress_state = Arc::clone(&self.sync_progress);
        let recorder = move |current: usize, total: usize, order: &QueuedOrder, err: Option<&str>| {
            if let Ok(mut guard) = progress_state.lock() {
                *guard = Some(SyncProgress { current, total });
            }
            if let Some(cb) = on_progress {
                cb(current, total, order, err);
            }
        };

        let outcome = if failed_only {
            sync::retry_failed_only(
                &self.db,
                self.api.as_ref(),
                &self.theater_id,
                token,
                Some(&recorder),
            )
            .await
        } else {
            sync::drain(
                &self.db,
                self.api.as_ref(),
                &self.theater_id,
                token,
                self.max_attempts,
                Some(&recorder),
            )
            .await
        };

        if let Ok(mut guard) = self.sync_progress.lock() {
            *guard = None;
        }
        self.is_syncing.store(false, Ordering::SeqCst);
        self.note_sync_outcome(&outcome);
        outcome
    }

    fn note_sync_outcome(&self, outcome: &Result<SyncResult, QueueError>) {
        match outcome {
            Ok(result) => {
                self.set_online(true);
                let error = if result.failed > 0 {
                    Some(format!(
                        "{} of {} orders failed to sync",
                        result.failed, result.total
                    ))
                } else {
                    None
                };
                if let Ok(mut guard) = self.sync_error.lock() {
                    *guard = error;
                }
            }
            // Offline is advisory: the queue is intact and staff can see the
            // connection state, so it does not become a sync error.
            Err(QueueError::Offline) => self.set_online(false),
            Err(e) => {
                if let Ok(mut guard) = self.sync_error.lock() {
                    *guard = Some(e.to_string());
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Connectivity
    // -----------------------------------------------------------------------

    /// Probe the server and record the connectivity transition. A transition
    /// to online only updates the reported state; draining stays on the
    /// normal cadence so a fleet of kiosks does not stampede at reconnect.
    pub async fn check_connectivity(&self) -> bool {
        let online = self.api.check_health().await;
        self.set_online(online);
        online
    }

    fn set_online(&self, online: bool) {
        let was = self.is_online.swap(online, Ordering::SeqCst);
        if was != online {
            if online {
                info!(theater_id = %self.theater_id, "Network restored; queued orders sync on the next cycle");
            } else {
                info!(theater_id = %self.theater_id, "Network offline; orders will queue locally");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Auto-sync loop
    // -----------------------------------------------------------------------

    /// Start the recurring background drain. Each tick probes connectivity,
    /// and drains only while online; every completed drain invokes
    /// `on_complete` with its summary.
    pub fn start_auto_sync(
        self: Arc<Self>,
        token: impl Into<String>,
        interval: Duration,
        on_complete: Option<CompleteFn>,
        on_progress: Option<OwnedProgressFn>,
    ) -> AutoSyncHandle {
        let is_running = Arc::new(AtomicBool::new(true));
        let running = Arc::clone(&is_running);
        let ctrl = self;
        let token = token.into();

        let task = tokio::spawn(async move {
            info!(
                theater_id = %ctrl.theater_id,
                interval_secs = interval.as_secs(),
                "Auto-sync loop started"
            );

            loop {
                tokio::time::sleep(interval).await;

                if !running.load(Ordering::SeqCst) {
                    info!(theater_id = %ctrl.theater_id, "Auto-sync loop stopped");
                    break;
                }

                if !ctrl.check_connectivity().await {
                    continue;
                }

                match ctrl.manual_sync(&token, on_progress.as_deref()).await {
                    Ok(result) => {
                        if result.total > 0 {
                            info!(
                                theater_id = %ctrl.theater_id,
                                succeeded = result.succeeded,
                                failed = result.failed,
                                "Auto-sync cycle complete"
                            );
                        }
                        if let Some(cb) = &on_complete {
                            cb(&result);
                        }
                    }
                    // Connectivity dropped between the probe and the drain.
                    Err(QueueError::Offline) => {}
                    Err(e) => warn!(theater_id = %ctrl.theater_id, "Auto-sync cycle failed: {e}"),
                }
            }
        });

        AutoSyncHandle { is_running, task }
    }
}

/// Cancellation handle for the auto-sync loop.
///
/// Stopping cancels future ticks only — an in-flight drain runs to
/// completion so no record is left `syncing`.
pub struct AutoSyncHandle {
    is_running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl AutoSyncHandle {
    /// Idempotent; safe to call on an already-stopped handle.
    pub fn stop(&self) {
        if self.is_running.swap(false, Ordering::SeqCst) {
            debug!("Auto-sync stop requested");
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst) && !self.task.is_finished()
    }
}

impl Drop for AutoSyncHandle {
    fn drop(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::OrderApi;
    use crate::db::DbState;
    use crate::store::{QueueStatus, StatusPatch};
    use async_trait::async_trait;
    use chrono::Utc;
    use rusqlite::Connection;
    use std::collections::VecDeque;

    fn test_db() -> Arc<DbState> {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        crate::db::run_migrations_for_test(&conn);
        Arc::new(DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        })
    }

    /// In-memory order server with scripted submission responses.
    struct ScriptedApi {
        healthy: AtomicBool,
        responses: Mutex<VecDeque<Result<Value, String>>>,
        submissions: Mutex<Vec<Value>>,
        submit_delay: Option<Duration>,
    }

    impl ScriptedApi {
        fn healthy() -> Self {
            Self {
                healthy: AtomicBool::new(true),
                responses: Mutex::new(VecDeque::new()),
                submissions: Mutex::new(Vec::new()),
                submit_delay: None,
            }
        }

        fn offline() -> Self {
            let api = Self::healthy();
            api.healthy.store(false, Ordering::SeqCst);
            api
        }

        fn with_responses(responses: Vec<Result<Value, String>>) -> Self {
            let api = Self::healthy();
            *api.responses.lock().unwrap() = VecDeque::from(responses);
            api
        }

        fn with_submit_delay(mut self, delay: Duration) -> Self {
            self.submit_delay = Some(delay);
            self
        }

        fn submissions(&self) -> Vec<Value> {
            self.submissions.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OrderApi for ScriptedApi {
        async fn submit_order(&self, _token: &str, payload: &Value) -> Result<Value, String> {
            if let Some(delay) = self.submit_delay {
                tokio::time::sleep(delay).await;
            }
            self.submissions.lock().unwrap().push(payload.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(serde_json::json!({ "id": "remote-1" })))
        }

        async fn check_health(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    fn order_payload(name: &str) -> Value {
        serde_json::json!({
            "customerName": name,
            "items": [{ "productId": "prod-popcorn", "quantity": 1 }],
            "paymentMethod": "cash",
            "totalAmount": 150.0
        })
    }

    fn controller(api: ScriptedApi) -> OfflineQueueController {
        OfflineQueueController::new(test_db(), Arc::new(api), "theater-1")
    }

    #[test]
    fn test_enqueue_works_offline_and_stamps_order_number() {
        let ctrl = controller(ScriptedApi::offline());

        let first = ctrl.enqueue_order(&order_payload("Asha")).unwrap();
        let second = ctrl.enqueue_order(&order_payload("Bala")).unwrap();
        assert_ne!(first.queue_id, second.queue_id);

        let queue = ctrl.queue().unwrap();
        assert_eq!(queue.len(), 2);

        let first_number = queue[0]
            .payload
            .get("orderNumber")
            .and_then(Value::as_str)
            .unwrap();
        let second_number = queue[1]
            .payload
            .get("orderNumber")
            .and_then(Value::as_str)
            .unwrap();
        assert!(first_number.starts_with("ORD-"));
        assert!(first_number.ends_with("-00001"));
        assert!(second_number.ends_with("-00002"));
        assert_eq!(
            queue[0].payload.get("theaterId").and_then(Value::as_str),
            Some("theater-1")
        );

        let status = ctrl.status();
        assert_eq!(status.pending_count, 2);
        assert!(!status.is_online);
    }

    #[test]
    fn test_enqueue_rejects_order_without_items() {
        let ctrl = controller(ScriptedApi::offline());

        let empty = ctrl.enqueue_order(&serde_json::json!({ "customerName": "Asha", "items": [] }));
        assert!(matches!(empty, Err(QueueError::InvalidOrder(_))));

        let missing = ctrl.enqueue_order(&serde_json::json!({ "customerName": "Asha" }));
        assert!(matches!(missing, Err(QueueError::InvalidOrder(_))));

        assert_eq!(ctrl.status().pending_count, 0);
    }

    #[tokio::test]
    async fn test_manual_sync_offline_is_rejected_without_touching_queue() {
        let ctrl = controller(ScriptedApi::offline());
        ctrl.enqueue_order(&order_payload("Asha")).unwrap();

        let outcome = ctrl.manual_sync("token", None).await;
        assert!(matches!(outcome, Err(QueueError::Offline)));

        let queue = ctrl.queue().unwrap();
        assert_eq!(queue[0].status, QueueStatus::Pending);
        assert_eq!(queue[0].attempts, 0);
        assert!(!ctrl.status().is_online);
    }

    /// Two orders queued offline; connectivity returns; the server accepts
    /// the first and rejects the second.
    #[tokio::test]
    async fn test_manual_sync_partial_failure_end_state() {
        let api = ScriptedApi::with_responses(vec![
            Ok(serde_json::json!({ "id": "remote-a" })),
            Err("Order validation failed (HTTP 400)".to_string()),
        ]);
        let ctrl = controller(api);

        let a = ctrl.enqueue_order(&order_payload("Asha")).unwrap();
        let b = ctrl.enqueue_order(&order_payload("Bala")).unwrap();

        let result = ctrl.manual_sync("token", None).await.unwrap();
        assert_eq!(
            result,
            SyncResult {
                succeeded: 1,
                failed: 1,
                total: 2
            }
        );

        let queue = ctrl.queue().unwrap();
        let order_a = queue.iter().find(|o| o.queue_id == a.queue_id).unwrap();
        let order_b = queue.iter().find(|o| o.queue_id == b.queue_id).unwrap();

        assert_eq!(order_a.status, QueueStatus::Synced);
        assert!(order_a.synced_at.is_some());
        assert_eq!(order_b.status, QueueStatus::Failed);
        assert_eq!(order_b.attempts, 1);
        assert_eq!(
            order_b.last_error.as_deref(),
            Some("Order validation failed (HTTP 400)")
        );

        let status = ctrl.status();
        assert_eq!(status.pending_count, 1);
        assert!(status.is_online);
        assert!(status.last_sync_time.is_some());
        assert_eq!(
            status.sync_error.as_deref(),
            Some("1 of 2 orders failed to sync")
        );
        assert!(status.sync_progress.is_none());
    }

    #[tokio::test]
    async fn test_orders_submitted_oldest_first() {
        let api = Arc::new(ScriptedApi::healthy());
        let ctrl =
            OfflineQueueController::new(test_db(), Arc::clone(&api) as Arc<dyn OrderApi>, "t-1");

        ctrl.enqueue_order(&order_payload("First")).unwrap();
        ctrl.enqueue_order(&order_payload("Second")).unwrap();
        ctrl.enqueue_order(&order_payload("Third")).unwrap();

        ctrl.manual_sync("token", None).await.unwrap();

        let names: Vec<String> = api
            .submissions()
            .iter()
            .map(|p| {
                p.get("customerName")
                    .and_then(Value::as_str)
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(names, vec!["First", "Second", "Third"]);
    }

    #[tokio::test]
    async fn test_second_drain_after_full_success_submits_nothing() {
        let api = Arc::new(ScriptedApi::healthy());
        let ctrl =
            OfflineQueueController::new(test_db(), Arc::clone(&api) as Arc<dyn OrderApi>, "t-1");

        ctrl.enqueue_order(&order_payload("Asha")).unwrap();
        let first = ctrl.manual_sync("token", None).await.unwrap();
        assert_eq!(first.succeeded, 1);

        let second = ctrl.manual_sync("token", None).await.unwrap();
        assert_eq!(second, SyncResult::default());
        assert_eq!(api.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_failed_skips_pending_and_synced() {
        let api = Arc::new(ScriptedApi::healthy());
        let ctrl =
            OfflineQueueController::new(test_db(), Arc::clone(&api) as Arc<dyn OrderApi>, "t-1");

        let synced = ctrl.enqueue_order(&order_payload("Synced")).unwrap();
        let failed = ctrl.enqueue_order(&order_payload("Failed")).unwrap();
        ctrl.enqueue_order(&order_payload("Pending")).unwrap();

        store::update_status(
            &ctrl.db,
            "t-1",
            &synced.queue_id,
            &StatusPatch {
                status: Some(QueueStatus::Synced),
                synced_at: Some(Some(Utc::now().to_rfc3339())),
                ..Default::default()
            },
        )
        .unwrap();
        store::update_status(
            &ctrl.db,
            "t-1",
            &failed.queue_id,
            &StatusPatch {
                status: Some(QueueStatus::Failed),
                attempts: Some(3),
                last_error: Some(Some("Order validation failed (HTTP 400)".into())),
                ..Default::default()
            },
        )
        .unwrap();

        let result = ctrl.retry_failed("token", None).await.unwrap();
        assert_eq!(
            result,
            SyncResult {
                succeeded: 1,
                failed: 0,
                total: 1
            }
        );

        // Only the failed order went out; the pending one waits for a drain
        let sent = api.submissions();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].get("customerName").and_then(Value::as_str),
            Some("Failed")
        );

        let queue = ctrl.queue().unwrap();
        let still_pending = queue
            .iter()
            .filter(|o| o.status == QueueStatus::Pending)
            .count();
        assert_eq!(still_pending, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_manual_sync_runs_exactly_one_drain() {
        let api = Arc::new(
            ScriptedApi::healthy().with_submit_delay(Duration::from_millis(200)),
        );
        let ctrl = Arc::new(OfflineQueueController::new(
            test_db(),
            Arc::clone(&api) as Arc<dyn OrderApi>,
            "t-1",
        ));

        ctrl.enqueue_order(&order_payload("Asha")).unwrap();

        let first = {
            let ctrl = Arc::clone(&ctrl);
            tokio::spawn(async move { ctrl.manual_sync("token", None).await })
        };

        // Let the first drain claim the guard, then race a second call
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = ctrl.manual_sync("token", None).await.unwrap();
        assert_eq!(second, SyncResult::default());

        let first = first.await.unwrap().unwrap();
        assert_eq!(first.succeeded, 1);
        assert_eq!(api.submissions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_sync_drains_on_cadence_and_stop_is_idempotent() {
        let api = Arc::new(ScriptedApi::healthy());
        let ctrl = Arc::new(OfflineQueueController::new(
            test_db(),
            Arc::clone(&api) as Arc<dyn OrderApi>,
            "t-1",
        ));
        ctrl.enqueue_order(&order_payload("Asha")).unwrap();

        let completions: Arc<Mutex<Vec<SyncResult>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&completions);
        let handle = ctrl.start_auto_sync(
            "token",
            Duration::from_secs(30),
            Some(Box::new(move |result: &SyncResult| {
                sink.lock().unwrap().push(*result);
            })),
            None,
        );

        // First tick fires after the interval elapses
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(api.submissions().len(), 1);
        {
            let seen = completions.lock().unwrap();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].succeeded, 1);
        }

        handle.stop();
        handle.stop();
        assert!(!handle.is_running());

        // No further drains after stop
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(api.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_connectivity_transitions_update_status() {
        let api = Arc::new(ScriptedApi::healthy());
        let ctrl =
            OfflineQueueController::new(test_db(), Arc::clone(&api) as Arc<dyn OrderApi>, "t-1");

        assert!(!ctrl.status().is_online);
        assert!(ctrl.check_connectivity().await);
        assert!(ctrl.status().is_online);

        api.healthy.store(false, Ordering::SeqCst);
        assert!(!ctrl.check_connectivity().await);
        assert!(!ctrl.status().is_online);
    }
}
