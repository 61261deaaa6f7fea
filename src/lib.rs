//! Marquee POS — offline order queue core for theater kiosk terminals.
//!
//! A kiosk must be able to take orders with zero connectivity: orders are
//! durably queued in local SQLite, drained to the theater order server when
//! the network allows, and retried across restarts without loss or
//! duplication.
//!
//! The crate is split along those lines:
//! - [`db`] / [`store`]: durable, theater-scoped queue persistence
//! - [`api`]: the order server client behind the [`api::OrderApi`] trait
//! - [`sync`]: one sequential drain pass with per-record failure absorption
//! - [`controller`]: the per-session façade an order screen binds to —
//!   auto-sync timer, connectivity observation, status snapshot
//!
//! The host application owns authentication: sync entry points take an
//! opaque bearer token and surface auth rejections as ordinary submission
//! failures.

use std::path::Path;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod controller;
pub mod db;
pub mod error;
pub mod store;
pub mod sync;

pub use api::{HttpOrderApi, OrderApi};
pub use controller::{AutoSyncHandle, OfflineQueueController, SyncStatus};
pub use error::QueueError;
pub use store::{QueueStatus, QueuedOrder};
pub use sync::SyncResult;

/// Initialize structured logging (console, plus a rolling daily file when a
/// log directory is given). Call once at host-application startup.
pub fn init_logging(log_dir: Option<&Path>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,marquee_pos=debug"));

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).ok();
            let file_appender = tracing_appender::rolling::daily(dir, "kiosk");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            let file_layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_target(true))
                .with(file_layer)
                .init();

            // Keep the guard alive for the lifetime of the process — dropping
            // it flushes logs. Leaked intentionally since the kiosk runs
            // until process exit.
            std::mem::forget(guard);
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_target(true))
                .init();
        }
    }
}
