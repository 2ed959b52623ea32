//! statsnap — pg_stat_statements monitoring agent.
//!
//! Exposes PostgreSQL per-statement execution statistics over a
//! session-authenticated HTTP API:
//! - `connector` — backend access seam (trait + synchronous `postgres` impl)
//! - `collector` — schema detection, snapshot store, activity diffing
//! - `web` — axum router, session middleware, `GET /statements`
//!
//! Each `GET /statements` request takes a fresh snapshot of the cumulative
//! counters and reports the statements that saw activity since the previous
//! snapshot. The endpoint is pull-based: nothing polls in the background.

pub mod collector;
pub mod connector;
pub mod web;

/// Crate version, exposed in the daemon's `--version` output.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
