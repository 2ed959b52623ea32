//! Scripted backend scenarios for tests.
//!
//! `MockBackend` plays the role of a PostgreSQL instance with (or without)
//! the pg_stat_statements extension: it answers the version probe, the
//! extension catalog probe and the statistics query with rows built from the
//! same descriptor tables the parser reads. Statement executions are
//! recorded with [`MockBackend::run`], bumping cumulative counters exactly
//! like the real extension does.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::schema::{FieldKind, SchemaVariant};
use crate::connector::{Connector, ConnectorError, Row, SqlValue};

struct MockStatement {
    datname: String,
    rolname: String,
    query: String,
    queryid: i64,
    calls: i64,
}

pub struct MockBackend {
    server_version_num: i32,
    extension_installed: bool,
    statements: Vec<MockStatement>,
    next_queryid: i64,
    connected: bool,
    fail_connect: bool,
    fail_queries: bool,
    rows: Vec<Row>,
}

impl MockBackend {
    pub fn with_version(server_version_num: i32) -> Self {
        Self {
            server_version_num,
            extension_installed: false,
            statements: Vec::new(),
            next_queryid: 1000,
            connected: false,
            fail_connect: false,
            fail_queries: false,
            rows: Vec::new(),
        }
    }

    /// A PostgreSQL 12.3 backend (legacy column set).
    pub fn pg12() -> Self {
        Self::with_version(120003)
    }

    /// A PostgreSQL 13.4 backend (split exec/plan families, WAL counters).
    pub fn pg13() -> Self {
        Self::with_version(130004)
    }

    /// Marks the extension as installed without recording any statement,
    /// as if it had been enabled before the agent ever looked.
    pub fn with_extension(mut self) -> Self {
        self.extension_installed = true;
        self
    }

    pub fn variant(&self) -> SchemaVariant {
        SchemaVariant::for_version(self.server_version_num)
    }

    /// Installs the extension. The enabling statement itself shows up in the
    /// statistics view, as observed on a real backend.
    pub fn create_extension(&mut self) {
        self.extension_installed = true;
        self.run("postgres", "postgres", "CREATE EXTENSION pg_stat_statements");
    }

    pub fn drop_extension(&mut self) {
        self.extension_installed = false;
        self.statements.clear();
    }

    /// Records one execution of `query`, bumping its cumulative counters.
    pub fn run(&mut self, datname: &str, rolname: &str, query: &str) {
        if !self.extension_installed {
            return;
        }
        if let Some(s) = self
            .statements
            .iter_mut()
            .find(|s| s.datname == datname && s.rolname == rolname && s.query == query)
        {
            s.calls += 1;
            return;
        }
        let queryid = self.next_queryid;
        self.next_queryid += 1;
        self.statements.push(MockStatement {
            datname: datname.to_string(),
            rolname: rolname.to_string(),
            query: query.to_string(),
            queryid,
            calls: 1,
        });
    }

    /// Evicts a statement from the statistics cache, as the extension does
    /// under entry pressure. A later `run` restarts its counters.
    pub fn evict(&mut self, query: &str) {
        self.statements.retain(|s| s.query != query);
    }

    pub fn fail_connect(&mut self, fail: bool) {
        self.fail_connect = fail;
    }

    pub fn fail_queries(&mut self, fail: bool) {
        self.fail_queries = fail;
    }

    fn statement_row(&self, s: &MockStatement) -> Row {
        let mut row = BTreeMap::new();
        for field in self.variant().fields() {
            let value = match field.name {
                "datname" => SqlValue::Text(s.datname.clone()),
                "rolname" => SqlValue::Text(s.rolname.clone()),
                "query" => SqlValue::Text(s.query.clone()),
                "queryid" => SqlValue::Int(s.queryid),
                "dbid" => SqlValue::Int(16384),
                "userid" => SqlValue::Int(10),
                "calls" => SqlValue::Int(s.calls),
                "plans" => SqlValue::Int(s.calls),
                "rows" => SqlValue::Int(s.calls),
                // deterministic derived counters are enough for the tests
                _ => match field.kind {
                    FieldKind::BigInt => SqlValue::Int(s.calls * 2),
                    FieldKind::Double => SqlValue::Float(s.calls as f64 * 0.25),
                    FieldKind::Text => SqlValue::Text(String::new()),
                },
            };
            row.insert(field.name.to_string(), value);
        }
        row
    }
}

impl Connector for MockBackend {
    fn connect(&mut self) -> Result<(), ConnectorError> {
        if self.fail_connect {
            return Err(ConnectorError::Connection("connection refused".to_string()));
        }
        self.connected = true;
        Ok(())
    }

    fn execute(&mut self, sql: &str) -> Result<(), ConnectorError> {
        self.connect()?;
        if self.fail_queries {
            self.rows.clear();
            return Err(ConnectorError::Query(
                "FATAL: terminating connection due to administrator command".to_string(),
            ));
        }

        self.rows = if sql.contains("server_version_num") {
            let mut row = BTreeMap::new();
            row.insert(
                "server_version_num".to_string(),
                SqlValue::Text(self.server_version_num.to_string()),
            );
            vec![row]
        } else if sql.contains("pg_extension") {
            if self.extension_installed {
                let mut row = BTreeMap::new();
                row.insert("extversion".to_string(), SqlValue::Text("1.7".to_string()));
                vec![row]
            } else {
                Vec::new()
            }
        } else if sql.contains("pg_stat_statements") {
            if !self.extension_installed {
                self.rows.clear();
                return Err(ConnectorError::Query(
                    "ERROR: relation \"pg_stat_statements\" does not exist".to_string(),
                ));
            }
            let rows: Vec<Row> = self
                .statements
                .iter()
                .map(|s| self.statement_row(s))
                .collect();
            rows
        } else {
            Vec::new()
        };
        Ok(())
    }

    fn get_rows(&mut self) -> Vec<Row> {
        std::mem::take(&mut self.rows)
    }

    fn close(&mut self) {
        self.connected = false;
        self.rows.clear();
    }
}

/// Clonable handle so tests can keep driving the backend after the collector
/// took ownership of a connector to it.
#[derive(Clone)]
pub struct SharedBackend(Arc<Mutex<MockBackend>>);

impl SharedBackend {
    pub fn new(backend: MockBackend) -> Self {
        Self(Arc::new(Mutex::new(backend)))
    }

    pub fn lock(&self) -> MutexGuard<'_, MockBackend> {
        self.0.lock().unwrap()
    }
}

impl Connector for SharedBackend {
    fn connect(&mut self) -> Result<(), ConnectorError> {
        self.lock().connect()
    }

    fn execute(&mut self, sql: &str) -> Result<(), ConnectorError> {
        self.lock().execute(sql)
    }

    fn get_rows(&mut self) -> Vec<Row> {
        self.lock().get_rows()
    }

    fn close(&mut self) {
        self.lock().close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_bumps_cumulative_calls() {
        let mut backend = MockBackend::pg12();
        backend.create_extension();
        backend.run("postgres", "app", "SELECT 1");
        backend.run("postgres", "app", "SELECT 1");
        backend.run("postgres", "app", "SELECT 2");

        backend.execute("SELECT ... FROM pg_stat_statements s").unwrap();
        let rows = backend.get_rows();
        assert_eq!(rows.len(), 3); // CREATE EXTENSION + two distinct queries
        let calls: Vec<i64> = rows
            .iter()
            .filter_map(|r| r.get("calls").and_then(SqlValue::as_i64))
            .collect();
        assert_eq!(calls, [1, 2, 1]);
    }

    #[test]
    fn rows_carry_the_variant_column_set() {
        let mut backend = MockBackend::pg13().with_extension();
        backend.run("postgres", "app", "SELECT 1");
        backend.execute("SELECT ... FROM pg_stat_statements s").unwrap();
        let rows = backend.get_rows();
        let keys: std::collections::BTreeSet<&str> =
            rows[0].keys().map(String::as_str).collect();
        let expected: std::collections::BTreeSet<&str> =
            SchemaVariant::Modern.expected_keys().into_iter().collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn extension_probe_reflects_installation_state() {
        let mut backend = MockBackend::pg12();
        backend
            .execute("SELECT extversion FROM pg_extension WHERE extname = 'pg_stat_statements'")
            .unwrap();
        assert!(backend.get_rows().is_empty());

        backend.create_extension();
        backend
            .execute("SELECT extversion FROM pg_extension WHERE extname = 'pg_stat_statements'")
            .unwrap();
        assert_eq!(backend.get_rows().len(), 1);
    }

    #[test]
    fn statements_query_fails_without_the_extension() {
        let mut backend = MockBackend::pg12();
        assert!(matches!(
            backend.execute("SELECT ... FROM pg_stat_statements s"),
            Err(ConnectorError::Query(_))
        ));

        backend.create_extension();
        backend.drop_extension();
        assert!(matches!(
            backend.execute("SELECT ... FROM pg_stat_statements s"),
            Err(ConnectorError::Query(_))
        ));
    }

    #[test]
    fn evict_then_run_restarts_counters() {
        let mut backend = MockBackend::pg12().with_extension();
        backend.run("postgres", "app", "SELECT 1");
        backend.run("postgres", "app", "SELECT 1");
        backend.evict("SELECT 1");
        backend.run("postgres", "app", "SELECT 1");

        backend.execute("... pg_stat_statements s ...").unwrap();
        let rows = backend.get_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("calls"), Some(&SqlValue::Int(1)));
    }
}
