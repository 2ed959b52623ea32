use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use statsnap::collector::StatementsCollector;
use statsnap::connector::{Connector, PgConnector};
use statsnap::web;
use statsnap::web::auth::{FileSessions, SessionValidator};

// ============================================================
// CLI
// ============================================================

#[derive(Parser)]
#[command(
    name = "statsnapd",
    about = "pg_stat_statements monitoring agent",
    version = statsnap::VERSION
)]
struct Args {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:2345", env = "STATSNAP_LISTEN")]
    listen: String,

    /// File with valid session tokens, one per line (maintained by the
    /// login service).
    #[arg(long, env = "STATSNAP_SESSION_FILE")]
    session_file: PathBuf,

    /// libpq-style connection string for the monitored backend.
    /// Defaults to the standard PG* environment variables.
    #[arg(long, env = "STATSNAP_CONNINFO")]
    conninfo: Option<String>,
}

// ============================================================
// Main
// ============================================================

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "statsnap=info,statsnapd=info".parse().unwrap()),
        )
        .init();

    let mut connector = match &args.conninfo {
        Some(conninfo) => PgConnector::with_connection_string(conninfo.clone()),
        None => match PgConnector::from_env() {
            Ok(connector) => connector,
            Err(e) => {
                eprintln!("{e}");
                process::exit(1);
            }
        },
    };

    // Startup probe only; the endpoint answers 500 until the backend is up.
    if let Err(e) = connector.connect() {
        warn!(error = %e, "backend not reachable at startup, will retry on demand");
    }

    let collector = Arc::new(StatementsCollector::new(Box::new(connector)));
    let sessions: Arc<dyn SessionValidator> =
        Arc::new(FileSessions::new(args.session_file.clone()));

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
        .block_on(serve(args, collector, sessions));
}

async fn serve(
    args: Args,
    collector: Arc<StatementsCollector>,
    sessions: Arc<dyn SessionValidator>,
) {
    let app = web::build_router(collector, sessions);

    let addr: SocketAddr = args.listen.parse().expect("invalid listen address");
    info!(%addr, version = statsnap::VERSION, "listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");

    axum::serve(listener, app).await.expect("server error");
}
