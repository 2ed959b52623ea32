//! Snapshot model and the two-deep snapshot store.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use super::CollectError;
use super::schema::SchemaVariant;
use crate::connector::{Row, SqlValue};

/// Identity of one tracked statement. Stable across snapshots for the same
/// logical statement while the backend keeps it in its statistics cache.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StatementKey {
    pub datname: String,
    pub rolname: String,
    pub queryid: i64,
}

/// One statement's cumulative counters plus identity/passthrough columns,
/// keyed by the static column names of the detected variant.
#[derive(Clone, Debug)]
pub struct StatementRow {
    pub key: StatementKey,
    pub columns: BTreeMap<&'static str, SqlValue>,
}

impl StatementRow {
    pub fn calls(&self) -> i64 {
        self.columns
            .get("calls")
            .and_then(SqlValue::as_i64)
            .unwrap_or(0)
    }
}

/// One atomic capture of all current cumulative counters.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub captured_at: DateTime<Utc>,
    /// Rows in backend order.
    pub rows: Vec<StatementRow>,
}

impl Snapshot {
    /// Builds a snapshot from raw connector rows using the variant's
    /// descriptor table. Zero rows is valid (extension enabled, nothing
    /// recorded yet). A missing column means the backend does not match the
    /// detected schema.
    pub fn parse(
        captured_at: DateTime<Utc>,
        raw: Vec<Row>,
        variant: SchemaVariant,
    ) -> Result<Self, CollectError> {
        let mut rows = Vec::with_capacity(raw.len());
        for row in &raw {
            rows.push(parse_row(row, variant)?);
        }
        Ok(Snapshot { captured_at, rows })
    }

    /// Lookup index over this snapshot's rows.
    pub fn index(&self) -> HashMap<&StatementKey, &StatementRow> {
        self.rows.iter().map(|r| (&r.key, r)).collect()
    }
}

fn parse_row(row: &Row, variant: SchemaVariant) -> Result<StatementRow, CollectError> {
    let mut columns = BTreeMap::new();
    for field in variant.fields() {
        let value = row.get(field.name).ok_or_else(|| {
            CollectError::BackendUnavailable(format!(
                "malformed statements row: missing column {}",
                field.name
            ))
        })?;
        columns.insert(field.name, value.clone());
    }

    let key = StatementKey {
        datname: column_text(&columns, "datname")?,
        rolname: column_text(&columns, "rolname")?,
        queryid: columns
            .get("queryid")
            .and_then(SqlValue::as_i64)
            .ok_or_else(|| {
                CollectError::BackendUnavailable(
                    "malformed statements row: queryid is not an integer".to_string(),
                )
            })?,
    };

    Ok(StatementRow { key, columns })
}

fn column_text(
    columns: &BTreeMap<&'static str, SqlValue>,
    name: &'static str,
) -> Result<String, CollectError> {
    columns
        .get(name)
        .and_then(SqlValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            CollectError::BackendUnavailable(format!(
                "malformed statements row: {} is not text",
                name
            ))
        })
}

/// Holds the two most recent snapshots of one monitored backend.
///
/// Not persisted: after a process restart the first refresh has no previous
/// snapshot and reports every statement in full.
#[derive(Default)]
pub struct SnapshotStore {
    current: Option<Snapshot>,
    previous: Option<Snapshot>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `snapshot` as current and shifts the prior current to
    /// previous; anything older is dropped.
    pub fn append(&mut self, snapshot: Snapshot) {
        self.previous = self.current.take();
        self.current = Some(snapshot);
    }

    pub fn current(&self) -> Option<&Snapshot> {
        self.current.as_ref()
    }

    pub fn previous(&self) -> Option<&Snapshot> {
        self.previous.as_ref()
    }

    pub fn clear(&mut self) {
        self.current = None;
        self.previous = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn raw_row(variant: SchemaVariant, query: &str, calls: i64) -> Row {
        let mut row = Row::new();
        for field in variant.fields() {
            let value = match field.name {
                "datname" => SqlValue::Text("postgres".to_string()),
                "rolname" => SqlValue::Text("app".to_string()),
                "query" => SqlValue::Text(query.to_string()),
                "queryid" => SqlValue::Int(query.len() as i64),
                "calls" => SqlValue::Int(calls),
                _ => match field.kind {
                    super::super::schema::FieldKind::BigInt => SqlValue::Int(0),
                    super::super::schema::FieldKind::Double => SqlValue::Float(0.0),
                    super::super::schema::FieldKind::Text => SqlValue::Text(String::new()),
                },
            };
            row.insert(field.name.to_string(), value);
        }
        row
    }

    #[test]
    fn parse_builds_keys_and_exact_column_set() {
        let variant = SchemaVariant::Legacy;
        let snap = Snapshot::parse(
            ts(100),
            vec![raw_row(variant, "SELECT 1", 3)],
            variant,
        )
        .unwrap();

        assert_eq!(snap.rows.len(), 1);
        let row = &snap.rows[0];
        assert_eq!(row.key.datname, "postgres");
        assert_eq!(row.key.rolname, "app");
        assert_eq!(row.calls(), 3);
        let keys: std::collections::BTreeSet<&str> = row.columns.keys().copied().collect();
        assert_eq!(keys, variant.expected_keys());
    }

    #[test]
    fn parse_accepts_zero_rows() {
        let snap = Snapshot::parse(ts(100), Vec::new(), SchemaVariant::Modern).unwrap();
        assert!(snap.rows.is_empty());
    }

    #[test]
    fn parse_rejects_missing_column() {
        let variant = SchemaVariant::Legacy;
        let mut row = raw_row(variant, "SELECT 1", 1);
        row.remove("total_time");
        let err = Snapshot::parse(ts(100), vec![row], variant).unwrap_err();
        assert!(err.to_string().contains("total_time"), "{err}");
    }

    #[test]
    fn store_keeps_exactly_two_snapshots() {
        let variant = SchemaVariant::Legacy;
        let mut store = SnapshotStore::new();
        assert!(store.current().is_none());
        assert!(store.previous().is_none());

        for i in 0..3 {
            let snap = Snapshot::parse(
                ts(100 + i),
                vec![raw_row(variant, "SELECT 1", i + 1)],
                variant,
            )
            .unwrap();
            store.append(snap);
        }

        assert_eq!(store.current().unwrap().captured_at, ts(102));
        assert_eq!(store.previous().unwrap().captured_at, ts(101));
    }

    #[test]
    fn clear_drops_both_snapshots() {
        let variant = SchemaVariant::Legacy;
        let mut store = SnapshotStore::new();
        store.append(Snapshot::parse(ts(1), vec![raw_row(variant, "q", 1)], variant).unwrap());
        store.clear();
        assert!(store.current().is_none());
        assert!(store.previous().is_none());
    }
}
