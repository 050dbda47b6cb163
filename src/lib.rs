//! Embedded persistence for a monitoring client: metric metadata, metric
//! data points, aggregated instance data, notifications and annotations in a
//! single SQLite file, with an in-process cache of metric metadata and
//! instance display names.

pub mod config;
pub mod db;
pub mod errors;
pub mod models;

pub use config::{JournalMode, StoreConfig, SyncMode};
pub use db::{Cursor, CursorRow, Database, Record};
pub use errors::{StoreError, StoreResult};
pub use models::{
    AggregationType, Annotation, BatchOutcome, InstanceData, InstanceDeletion, Metric, MetricData, Notification,
    RowFailure, DATABASE_VERSION, RETENTION_NOT_SUPPORTED,
};

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Installs a JSON subscriber writing to `<log_dir>/store.log.<date>`.
/// `RUST_LOG` overrides the default `info` filter.
pub fn init_tracing(log_dir: &Path) -> StoreResult<()> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "store.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| StoreError::Internal(error.to_string()))
}
