//! Local SQLite database layer for Marquee POS.
//!
//! Uses rusqlite with WAL mode so queued orders survive kiosk restarts and
//! power loss. Provides schema migrations, settings helpers, and shared
//! connection state for the queue store and sync engine.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::error::{storage_err, QueueError};

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Initialize the database at `{data_dir}/kiosk.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once — a kiosk with an unreadable queue
/// file must come back up with an empty queue rather than refuse to boot.
pub fn init(data_dir: &Path) -> Result<DbState, QueueError> {
    fs::create_dir_all(data_dir)
        .map_err(|e| storage_err(format!("Failed to create data dir: {e}")))?;

    let db_path = data_dir.join("kiosk.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                // Also remove WAL/SHM files if present
                let wal = db_path.with_extension("db-wal");
                let shm = db_path.with_extension("db-shm");
                let _ = fs::remove_file(&wal);
                let _ = fs::remove_file(&shm);
            }
            open_and_configure(&db_path)
                .map_err(|e| storage_err(format!("Database open failed after retry: {e}")))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), QueueError> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| storage_err(format!("create schema_version: {e}")))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: queue and settings tables.
fn migrate_v1(conn: &Connection) -> Result<(), QueueError> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- order_queue (theater-scoped offline order queue)
        CREATE TABLE IF NOT EXISTS order_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            queue_id TEXT NOT NULL,
            theater_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TEXT NOT NULL,
            synced_at TEXT,
            updated_at TEXT NOT NULL,
            UNIQUE(theater_id, queue_id)
        );

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| storage_err(format!("migration v1: {e}")))?;
    Ok(())
}

/// Migration v2: indexes for the drain query and pending counts.
fn migrate_v2(conn: &Connection) -> Result<(), QueueError> {
    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_order_queue_theater_status
            ON order_queue(theater_id, status);
        CREATE INDEX IF NOT EXISTS idx_order_queue_theater_created
            ON order_queue(theater_id, created_at);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| storage_err(format!("migration v2: {e}")))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Read a setting value, or None if missing.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings \
         WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Upsert a setting value.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), QueueError> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at) \
         VALUES (?1, ?2, ?3, datetime('now')) \
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET \
            setting_value = excluded.setting_value, updated_at = excluded.updated_at",
        params![category, key, value],
    )
    .map_err(|e| storage_err(format!("set setting {category}/{key}: {e}")))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("test migrations");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        conn
    }

    #[test]
    fn test_migrations_apply_and_are_idempotent() {
        let conn = test_conn();
        run_migrations(&conn).expect("first run");
        run_migrations(&conn).expect("second run");

        let version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);

        // Queue table exists and accepts a row
        conn.execute(
            "INSERT INTO order_queue (queue_id, theater_id, payload, created_at, updated_at)
             VALUES ('q-1', 't-1', '{}', datetime('now'), datetime('now'))",
            [],
        )
        .unwrap();
    }

    #[test]
    fn test_settings_roundtrip_and_overwrite() {
        let conn = test_conn();
        run_migrations(&conn).unwrap();

        assert_eq!(get_setting(&conn, "sync", "last_sync:t-1"), None);

        set_setting(&conn, "sync", "last_sync:t-1", "2026-08-01T10:00:00Z").unwrap();
        assert_eq!(
            get_setting(&conn, "sync", "last_sync:t-1").as_deref(),
            Some("2026-08-01T10:00:00Z")
        );

        set_setting(&conn, "sync", "last_sync:t-1", "2026-08-02T09:30:00Z").unwrap();
        assert_eq!(
            get_setting(&conn, "sync", "last_sync:t-1").as_deref(),
            Some("2026-08-02T09:30:00Z")
        );
    }

    #[test]
    fn test_init_recovers_from_corrupt_database_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kiosk.db"), b"definitely not sqlite").unwrap();

        let db = init(dir.path()).expect("init after corruption");
        let conn = db.conn.lock().unwrap();
        let version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_queue_id_unique_per_theater() {
        let conn = test_conn();
        run_migrations(&conn).unwrap();

        conn.execute(
            "INSERT INTO order_queue (queue_id, theater_id, payload, created_at, updated_at)
             VALUES ('q-dup', 't-1', '{}', datetime('now'), datetime('now'))",
            [],
        )
        .unwrap();

        // Same queue_id in the same theater is rejected
        let dup = conn.execute(
            "INSERT INTO order_queue (queue_id, theater_id, payload, created_at, updated_at)
             VALUES ('q-dup', 't-1', '{}', datetime('now'), datetime('now'))",
            [],
        );
        assert!(dup.is_err());

        // Same queue_id in another theater is fine
        conn.execute(
            "INSERT INTO order_queue (queue_id, theater_id, payload, created_at, updated_at)
             VALUES ('q-dup', 't-2', '{}', datetime('now'), datetime('now'))",
            [],
        )
        .unwrap();
    }
}
