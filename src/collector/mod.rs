//! pg_stat_statements collection.
//!
//! One `StatementsCollector` per monitored backend target. A refresh is
//! triggered by an inbound API request (pull-based, no background polling):
//! detect the schema shape if needed, fetch all cumulative counters in a
//! single query, then diff + append under the store lock. Overlapping
//! requests queue on the backend lock, which is held until the snapshot is
//! appended so snapshots enter the store in capture order; the store lock
//! itself only covers diff + append, never a database round trip.

pub mod delta;
pub mod mock;
pub mod schema;
pub mod snapshot;

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::connector::{Connector, ConnectorError};
use delta::ReportRecord;
use schema::SchemaInfo;
use snapshot::{Snapshot, SnapshotStore};

/// Error type for a refresh attempt.
#[derive(Debug)]
pub enum CollectError {
    /// pg_stat_statements is not installed in the target database.
    ExtensionNotInstalled,
    /// Connection or query failure; safe to retry, nothing was stored.
    BackendUnavailable(String),
}

impl std::fmt::Display for CollectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectError::ExtensionNotInstalled => {
                write!(f, "pg_stat_statements is not installed in the target database")
            }
            CollectError::BackendUnavailable(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for CollectError {}

impl From<ConnectorError> for CollectError {
    fn from(e: ConnectorError) -> Self {
        CollectError::BackendUnavailable(e.to_string())
    }
}

/// Result of one successful refresh.
pub struct StatementsReport {
    /// Capture instant of the snapshot this report was built from.
    pub captured_at: DateTime<Utc>,
    /// Statements with activity since the previous snapshot (everything on
    /// the first snapshot).
    pub data: Vec<ReportRecord>,
}

struct BackendState {
    connector: Box<dyn Connector + Send>,
    schema: Option<SchemaInfo>,
}

impl BackendState {
    fn ensure_schema(&mut self) -> Result<SchemaInfo, CollectError> {
        // A cached "not installed" answer is re-probed so the endpoint
        // recovers once the extension is created on the target.
        if let Some(info) = self.schema
            && info.extension_installed
        {
            return Ok(info);
        }
        let info = schema::detect(self.connector.as_mut())?;
        debug!(
            version = info.server_version_num,
            installed = info.extension_installed,
            "backend schema detected"
        );
        self.schema = Some(info);
        Ok(info)
    }

    fn fetch_snapshot(&mut self) -> Result<Snapshot, CollectError> {
        let info = self.ensure_schema()?;
        if !info.extension_installed {
            return Err(CollectError::ExtensionNotInstalled);
        }

        let query = info.variant.statements_query();
        let captured_at = Utc::now();
        if let Err(e) = self.connector.execute(&query) {
            // The failure may be a lost connection or a dropped extension;
            // re-detect on the next refresh.
            self.schema = None;
            self.connector.close();
            return Err(e.into());
        }
        let raw = self.connector.get_rows();
        Snapshot::parse(captured_at, raw, info.variant)
    }
}

/// Stateful snapshot collector for one monitored backend.
pub struct StatementsCollector {
    backend: Mutex<BackendState>,
    store: Mutex<SnapshotStore>,
}

impl StatementsCollector {
    pub fn new(connector: Box<dyn Connector + Send>) -> Self {
        Self {
            backend: Mutex::new(BackendState {
                connector,
                schema: None,
            }),
            store: Mutex::new(SnapshotStore::new()),
        }
    }

    /// Takes a new snapshot and reports the statements active since the
    /// previous one. On failure the snapshot store is left untouched, so
    /// the next successful refresh still diffs against the last good
    /// snapshot.
    pub fn refresh(&self) -> Result<StatementsReport, CollectError> {
        let mut backend = self.backend.lock().unwrap();
        let snapshot = backend.fetch_snapshot()?;
        let captured_at = snapshot.captured_at;

        // The backend guard stays alive until the snapshot is appended, so
        // overlapping refreshes cannot append out of capture order.
        let mut store = self.store.lock().unwrap();
        drop(backend);
        let data = delta::diff(&snapshot, store.current());
        store.append(snapshot);

        Ok(StatementsReport { captured_at, data })
    }

    /// Drops the connection, the cached schema and both stored snapshots.
    pub fn reset(&self) {
        let mut backend = self.backend.lock().unwrap();
        backend.connector.close();
        backend.schema = None;
        drop(backend);
        self.store.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::SqlValue;
    use super::mock::{MockBackend, SharedBackend};
    use std::sync::Arc;

    fn calls_for<'a>(report: &'a StatementsReport, query: &str) -> Option<i64> {
        report
            .data
            .iter()
            .find(|r| r.get("query").and_then(SqlValue::as_str) == Some(query))
            .and_then(|r| r.get("calls"))
            .and_then(SqlValue::as_i64)
    }

    #[test]
    fn refresh_fails_when_extension_missing() {
        let collector = StatementsCollector::new(Box::new(MockBackend::pg12()));
        match collector.refresh() {
            Err(CollectError::ExtensionNotInstalled) => {}
            other => panic!("expected ExtensionNotInstalled, got {:?}", other.map(|r| r.data)),
        }
    }

    #[test]
    fn refresh_recovers_after_extension_is_created() {
        let backend = SharedBackend::new(MockBackend::pg12());
        let collector = StatementsCollector::new(Box::new(backend.clone()));

        assert!(matches!(
            collector.refresh(),
            Err(CollectError::ExtensionNotInstalled)
        ));

        backend.lock().create_extension();
        let report = collector.refresh().unwrap();
        assert_eq!(
            calls_for(&report, "CREATE EXTENSION pg_stat_statements"),
            Some(1)
        );
    }

    #[test]
    fn first_refresh_reports_everything_then_only_activity() {
        let backend = SharedBackend::new(MockBackend::pg12());
        backend.lock().create_extension();
        backend.lock().run("postgres", "app", "SELECT $1+$2");
        let collector = StatementsCollector::new(Box::new(backend.clone()));

        let first = collector.refresh().unwrap();
        assert_eq!(first.data.len(), 2);

        // no activity at all: nothing to report
        let second = collector.refresh().unwrap();
        assert!(second.data.is_empty());

        backend.lock().run("postgres", "app", "SELECT $1+$2");
        let third = collector.refresh().unwrap();
        assert_eq!(third.data.len(), 1);
        assert_eq!(calls_for(&third, "SELECT $1+$2"), Some(2));
    }

    #[test]
    fn failed_refresh_leaves_store_untouched() {
        let backend = SharedBackend::new(MockBackend::pg12());
        backend.lock().create_extension();
        let collector = StatementsCollector::new(Box::new(backend.clone()));
        collector.refresh().unwrap();

        backend.lock().fail_queries(true);
        assert!(matches!(
            collector.refresh(),
            Err(CollectError::BackendUnavailable(_))
        ));

        // next successful refresh still diffs against the last good snapshot:
        // the enabling statement stayed dormant and stays suppressed
        backend.lock().fail_queries(false);
        backend.lock().run("postgres", "app", "SELECT 1");
        let report = collector.refresh().unwrap();
        assert_eq!(report.data.len(), 1);
        assert_eq!(calls_for(&report, "SELECT 1"), Some(1));
    }

    #[test]
    fn reset_forgets_snapshots_and_schema() {
        let backend = SharedBackend::new(MockBackend::pg13());
        backend.lock().create_extension();
        let collector = StatementsCollector::new(Box::new(backend.clone()));
        collector.refresh().unwrap();

        collector.reset();

        // full emission again: the store restarted empty
        let report = collector.refresh().unwrap();
        assert_eq!(
            calls_for(&report, "CREATE EXTENSION pg_stat_statements"),
            Some(1)
        );
    }

    #[test]
    fn unreachable_backend_is_a_backend_unavailable_error() {
        let backend = SharedBackend::new(MockBackend::pg12());
        backend.lock().create_extension();
        backend.lock().fail_connect(true);
        let collector = StatementsCollector::new(Box::new(backend.clone()));

        assert!(matches!(
            collector.refresh(),
            Err(CollectError::BackendUnavailable(_))
        ));

        backend.lock().fail_connect(false);
        let report = collector.refresh().unwrap();
        assert_eq!(
            calls_for(&report, "CREATE EXTENSION pg_stat_statements"),
            Some(1)
        );
    }

    #[test]
    fn dropped_extension_is_rediscovered_on_the_next_refresh() {
        let backend = SharedBackend::new(MockBackend::pg12());
        backend.lock().create_extension();
        let collector = StatementsCollector::new(Box::new(backend.clone()));
        collector.refresh().unwrap();

        backend.lock().drop_extension();
        // the cached schema still says installed; the failing query drops it
        assert!(matches!(
            collector.refresh(),
            Err(CollectError::BackendUnavailable(_))
        ));
        // re-detection now reports the extension as missing
        assert!(matches!(
            collector.refresh(),
            Err(CollectError::ExtensionNotInstalled)
        ));
    }

    // Snapshots must enter the store in capture order even when refreshes
    // overlap; the backend guard is held until the append for exactly that
    // reason.
    #[test]
    fn concurrent_refreshes_append_in_capture_order() {
        let backend = SharedBackend::new(MockBackend::pg12());
        backend.lock().create_extension();
        let collector = Arc::new(StatementsCollector::new(Box::new(backend.clone())));

        let mut handles = Vec::new();
        for t in 0..4 {
            let collector = Arc::clone(&collector);
            let backend = backend.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..25 {
                    backend
                        .lock()
                        .run("postgres", "app", &format!("SELECT {t} + {i}"));
                    collector.refresh().unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let store = collector.store.lock().unwrap();
        let current = store.current().unwrap();
        let previous = store.previous().unwrap();
        assert!(current.captured_at >= previous.captured_at);
    }

    #[test]
    fn snapshot_timestamps_do_not_go_backwards() {
        let backend = SharedBackend::new(MockBackend::pg12());
        backend.lock().create_extension();
        let collector = StatementsCollector::new(Box::new(backend.clone()));

        let first = collector.refresh().unwrap();
        backend.lock().run("postgres", "app", "SELECT 1");
        let second = collector.refresh().unwrap();
        assert!(second.captured_at >= first.captured_at);
    }
}
