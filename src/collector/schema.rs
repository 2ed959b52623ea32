//! Backend schema detection and version-dependent field sets.
//!
//! PostgreSQL 13 split the single `{total,min,max,mean,stddev}_time` family
//! of pg_stat_statements into separate execution-time and plan-time families
//! and added WAL counters and plan counts. The variant is resolved once per
//! connection from `server_version_num`; everything downstream (query
//! building, row parsing, response key sets) iterates the variant's
//! descriptor table instead of branching per column name.

use std::collections::BTreeSet;

use crate::connector::{Connector, ConnectorError, SqlValue};

pub(crate) const VERSION_QUERY: &str = "SHOW server_version_num";

pub(crate) const EXTENSION_QUERY: &str =
    "SELECT extversion FROM pg_extension WHERE extname = 'pg_stat_statements'";

/// Value shape of one output column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    BigInt,
    Double,
    Text,
}

/// One output column of the statements report.
#[derive(Clone, Copy, Debug)]
pub struct FieldDef {
    pub name: &'static str,
    pub kind: FieldKind,
    /// Cumulative counter (diff-tracked) vs identity/passthrough field.
    pub counter: bool,
}

const fn counter(name: &'static str, kind: FieldKind) -> FieldDef {
    FieldDef {
        name,
        kind,
        counter: true,
    }
}

const fn passthrough(name: &'static str, kind: FieldKind) -> FieldDef {
    FieldDef {
        name,
        kind,
        counter: false,
    }
}

/// Columns present on every supported backend version.
const COMMON_FIELDS: &[FieldDef] = &[
    passthrough("datname", FieldKind::Text),
    passthrough("rolname", FieldKind::Text),
    passthrough("query", FieldKind::Text),
    passthrough("dbid", FieldKind::BigInt),
    passthrough("userid", FieldKind::BigInt),
    passthrough("queryid", FieldKind::BigInt),
    counter("calls", FieldKind::BigInt),
    counter("rows", FieldKind::BigInt),
    counter("shared_blks_hit", FieldKind::BigInt),
    counter("shared_blks_read", FieldKind::BigInt),
    counter("shared_blks_dirtied", FieldKind::BigInt),
    counter("shared_blks_written", FieldKind::BigInt),
    counter("local_blks_hit", FieldKind::BigInt),
    counter("local_blks_read", FieldKind::BigInt),
    counter("local_blks_dirtied", FieldKind::BigInt),
    counter("local_blks_written", FieldKind::BigInt),
    counter("temp_blks_read", FieldKind::BigInt),
    counter("temp_blks_written", FieldKind::BigInt),
    counter("blk_read_time", FieldKind::Double),
    counter("blk_write_time", FieldKind::Double),
];

/// Pre-13: a single time-aggregate family.
const LEGACY_FIELDS: &[FieldDef] = &[
    counter("total_time", FieldKind::Double),
    counter("min_time", FieldKind::Double),
    counter("max_time", FieldKind::Double),
    counter("mean_time", FieldKind::Double),
    counter("stddev_time", FieldKind::Double),
];

/// 13+: split exec/plan time families, plan counts and WAL counters.
const MODERN_FIELDS: &[FieldDef] = &[
    counter("plans", FieldKind::BigInt),
    counter("total_plan_time", FieldKind::Double),
    counter("min_plan_time", FieldKind::Double),
    counter("max_plan_time", FieldKind::Double),
    counter("mean_plan_time", FieldKind::Double),
    counter("stddev_plan_time", FieldKind::Double),
    counter("total_exec_time", FieldKind::Double),
    counter("min_exec_time", FieldKind::Double),
    counter("max_exec_time", FieldKind::Double),
    counter("mean_exec_time", FieldKind::Double),
    counter("stddev_exec_time", FieldKind::Double),
    counter("wal_records", FieldKind::BigInt),
    counter("wal_fpi", FieldKind::BigInt),
    counter("wal_bytes", FieldKind::BigInt),
];

/// Shape of the pg_stat_statements view on the connected backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchemaVariant {
    /// PostgreSQL < 13.
    Legacy,
    /// PostgreSQL >= 13.
    Modern,
}

impl SchemaVariant {
    pub fn for_version(server_version_num: i32) -> Self {
        if server_version_num >= 130000 {
            SchemaVariant::Modern
        } else {
            SchemaVariant::Legacy
        }
    }

    fn extra_fields(self) -> &'static [FieldDef] {
        match self {
            SchemaVariant::Legacy => LEGACY_FIELDS,
            SchemaVariant::Modern => MODERN_FIELDS,
        }
    }

    /// All output columns for this variant, in query order.
    pub fn fields(self) -> impl Iterator<Item = &'static FieldDef> {
        COMMON_FIELDS.iter().chain(self.extra_fields())
    }

    /// Exact key set of every emitted record for this variant.
    pub fn expected_keys(self) -> BTreeSet<&'static str> {
        self.fields().map(|f| f.name).collect()
    }

    /// The single per-refresh statistics query: all cumulative counters
    /// joined with database and role names.
    pub fn statements_query(self) -> String {
        let cols = self
            .fields()
            .map(|f| select_expr(f.name))
            .collect::<Vec<_>>()
            .join(",\n                ");
        format!(
            r#"
            SELECT
                {cols}
            FROM pg_stat_statements s
            JOIN pg_database d ON d.oid = s.dbid
            JOIN pg_roles r ON r.oid = s.userid
        "#
        )
    }
}

fn select_expr(name: &'static str) -> String {
    match name {
        "datname" => "d.datname::text AS datname".to_string(),
        "rolname" => "r.rolname::text AS rolname".to_string(),
        // numeric in the view; the JSON contract wants an integer
        "wal_bytes" => "s.wal_bytes::bigint AS wal_bytes".to_string(),
        _ => format!("s.{name}"),
    }
}

/// Detected backend shape, cached per connection.
#[derive(Clone, Copy, Debug)]
pub struct SchemaInfo {
    pub server_version_num: i32,
    pub extension_installed: bool,
    pub variant: SchemaVariant,
}

/// Probes the backend: server version, then the extension catalog entry.
pub fn detect(connector: &mut dyn Connector) -> Result<SchemaInfo, ConnectorError> {
    connector.execute(VERSION_QUERY)?;
    let server_version_num = connector
        .get_rows()
        .first()
        .and_then(|row| row.get("server_version_num"))
        .and_then(version_num)
        .ok_or_else(|| {
            ConnectorError::Query("server_version_num: unexpected result".to_string())
        })?;

    connector.execute(EXTENSION_QUERY)?;
    let extension_installed = !connector.get_rows().is_empty();

    Ok(SchemaInfo {
        server_version_num,
        extension_installed,
        variant: SchemaVariant::for_version(server_version_num),
    })
}

fn version_num(value: &SqlValue) -> Option<i32> {
    match value {
        SqlValue::Int(n) => i32::try_from(*n).ok(),
        SqlValue::Text(s) => s.trim().parse().ok(),
        SqlValue::Float(_) => None,
    }
}
