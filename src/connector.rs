//! Backend connector.
//!
//! The collector talks to PostgreSQL through the `Connector` trait: open a
//! connection, run SQL, read back the resulting rows as ordered
//! column-name → value mappings. `PgConnector` is the production
//! implementation over the synchronous `postgres` client; tests script the
//! backend with [`crate::collector::mock::MockBackend`].

use std::collections::BTreeMap;

use postgres::types::Type;
use postgres::{Client, NoTls};
use serde::Serialize;

/// A single result cell. Version-dependent column sets are handled
/// generically, so values stay tagged instead of landing in per-column
/// struct fields. Serializes untagged (plain JSON numbers/strings).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// One result row: column name → value.
pub type Row = BTreeMap<String, SqlValue>;

/// Error type for backend access.
#[derive(Debug)]
pub enum ConnectorError {
    /// Connection failed.
    Connection(String),
    /// Query execution failed.
    Query(String),
}

impl std::fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectorError::Connection(msg) => write!(f, "PostgreSQL: {}", msg),
            ConnectorError::Query(msg) => write!(f, "PostgreSQL query error: {}", msg),
        }
    }
}

impl std::error::Error for ConnectorError {}

/// Backend access contract used by the collector.
///
/// One implementation per backend kind; the collector owns exactly one
/// connector per monitored target and issues a single statistics query per
/// refresh through it.
pub trait Connector {
    /// Ensures the connection is established. Idempotent when already
    /// connected.
    fn connect(&mut self) -> Result<(), ConnectorError>;

    /// Runs a query, buffering its result rows. Reconnects first if needed.
    fn execute(&mut self, sql: &str) -> Result<(), ConnectorError>;

    /// Takes the rows buffered by the last successful `execute`, in backend
    /// order. A second call returns an empty sequence.
    fn get_rows(&mut self) -> Vec<Row>;

    /// Drops the connection. A later `execute` reconnects.
    fn close(&mut self);
}

/// Synchronous PostgreSQL connector.
///
/// Connection parameters come from the standard environment variables:
/// - PGHOST (default: localhost)
/// - PGPORT (default: 5432)
/// - PGUSER (default: $USER)
/// - PGPASSWORD (default: empty)
/// - PGDATABASE (default: same as PGUSER)
pub struct PgConnector {
    connection_string: String,
    client: Option<Client>,
    rows: Vec<Row>,
}

impl PgConnector {
    /// Creates a connector from environment variables.
    pub fn from_env() -> Result<Self, ConnectorError> {
        let user = std::env::var("PGUSER")
            .or_else(|_| std::env::var("USER"))
            .map_err(|_| ConnectorError::Connection("PGUSER or USER not set".to_string()))?;

        let host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
        let port = std::env::var("PGPORT").unwrap_or_else(|_| "5432".to_string());
        let password = std::env::var("PGPASSWORD").unwrap_or_default();
        let database = std::env::var("PGDATABASE").unwrap_or_else(|_| user.clone());

        Ok(Self::with_connection_string(build_connection_string(
            &host, &port, &user, &password, &database,
        )))
    }

    /// Creates a connector with an explicit libpq-style connection string.
    pub fn with_connection_string(connection_string: String) -> Self {
        Self {
            connection_string,
            client: None,
            rows: Vec::new(),
        }
    }
}

impl Connector for PgConnector {
    fn connect(&mut self) -> Result<(), ConnectorError> {
        if self.client.is_some() {
            return Ok(());
        }
        match Client::connect(&self.connection_string, NoTls) {
            Ok(client) => {
                self.client = Some(client);
                Ok(())
            }
            Err(e) => Err(ConnectorError::Connection(format_postgres_error(&e))),
        }
    }

    fn execute(&mut self, sql: &str) -> Result<(), ConnectorError> {
        self.connect()?;
        let Some(client) = self.client.as_mut() else {
            return Err(ConnectorError::Connection("not connected".to_string()));
        };
        match client.query(sql, &[]) {
            Ok(rows) => {
                let mut out = Vec::with_capacity(rows.len());
                for row in &rows {
                    out.push(convert_row(row)?);
                }
                self.rows = out;
                Ok(())
            }
            Err(e) => {
                // The session may be broken; force a reconnect on the next call.
                self.client = None;
                self.rows.clear();
                Err(ConnectorError::Query(format_postgres_error(&e)))
            }
        }
    }

    fn get_rows(&mut self) -> Vec<Row> {
        std::mem::take(&mut self.rows)
    }

    fn close(&mut self) {
        self.client = None;
        self.rows.clear();
    }
}

/// Assembles a libpq key=value connection string, omitting the password
/// parameter when empty.
pub(crate) fn build_connection_string(
    host: &str,
    port: &str,
    user: &str,
    password: &str,
    database: &str,
) -> String {
    if password.is_empty() {
        format!(
            "host={} port={} user={} dbname={}",
            host, port, user, database
        )
    } else {
        format!(
            "host={} port={} user={} password={} dbname={}",
            host, port, user, password, database
        )
    }
}

/// Converts a typed `postgres` row into the generic name → value mapping.
///
/// Integer families (including oid) collapse to `Int`, float families to
/// `Float`; everything else is read as text.
fn convert_row(row: &postgres::Row) -> Result<Row, ConnectorError> {
    let mut out = BTreeMap::new();
    for (idx, col) in row.columns().iter().enumerate() {
        let ty = col.type_();
        let value = if *ty == Type::INT8 {
            SqlValue::Int(get_cell::<i64>(row, idx, col.name())?)
        } else if *ty == Type::INT4 {
            SqlValue::Int(get_cell::<i32>(row, idx, col.name())? as i64)
        } else if *ty == Type::INT2 {
            SqlValue::Int(get_cell::<i16>(row, idx, col.name())? as i64)
        } else if *ty == Type::OID {
            SqlValue::Int(get_cell::<u32>(row, idx, col.name())? as i64)
        } else if *ty == Type::FLOAT8 {
            SqlValue::Float(get_cell::<f64>(row, idx, col.name())?)
        } else if *ty == Type::FLOAT4 {
            SqlValue::Float(get_cell::<f32>(row, idx, col.name())? as f64)
        } else {
            SqlValue::Text(get_cell::<String>(row, idx, col.name())?)
        };
        out.insert(col.name().to_string(), value);
    }
    Ok(out)
}

fn get_cell<'a, T: postgres::types::FromSql<'a>>(
    row: &'a postgres::Row,
    idx: usize,
    name: &str,
) -> Result<T, ConnectorError> {
    row.try_get(idx)
        .map_err(|e| ConnectorError::Query(format!("column {}: {}", name, e)))
}

/// Formats a PostgreSQL error message for logs and API error bodies.
pub(crate) fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!("{}: {}", db_error.severity(), db_error.message())
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else {
            msg
        }
    }
}
