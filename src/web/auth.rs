//! Session authentication middleware.
//!
//! Every request (apart from the health probe) must carry an `X-Session`
//! header holding an opaque token issued by the external login subsystem.
//! The agent never interprets token contents; it only asks the configured
//! `SessionValidator` whether the token names a live session.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use tracing::{debug, warn};

/// Request header carrying the session token.
pub const SESSION_HEADER: &str = "X-Session";

/// Validates opaque session tokens.
pub trait SessionValidator: Send + Sync {
    fn validate(&self, token: &str) -> bool;
}

/// Fixed token set; used by tests and embedders that manage sessions
/// themselves.
pub struct StaticSessions(HashSet<String>);

impl StaticSessions {
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        Self(tokens.into_iter().collect())
    }
}

impl SessionValidator for StaticSessions {
    fn validate(&self, token: &str) -> bool {
        self.0.contains(token)
    }
}

/// Tokens maintained by the login subsystem in a file, one per line.
///
/// The file is read on every validation so newly issued or revoked sessions
/// take effect without restarting the agent.
pub struct FileSessions {
    path: PathBuf,
}

impl FileSessions {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl SessionValidator for FileSessions {
    fn validate(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents.lines().any(|line| line.trim() == token),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read session file");
                false
            }
        }
    }
}

fn unauthorized_json() -> axum::response::Response {
    axum::response::Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"error":"unauthorized"}"#))
        .unwrap()
}

pub(crate) async fn session_auth_middleware(
    State(validator): State<Arc<dyn SessionValidator>>,
    req: Request,
    next: Next,
) -> axum::response::Response {
    let path = req.uri().path().to_owned();

    // Health probe stays reachable for supervisors without a session.
    if path == "/health" {
        return next.run(req).await;
    }

    let token = match req.headers().get(SESSION_HEADER).map(|v| v.to_str()) {
        Some(Ok(t)) => t,
        Some(Err(_)) => {
            warn!(path = %path, "auth failed: invalid session header encoding");
            return unauthorized_json();
        }
        None => {
            warn!(path = %path, "auth failed: no session header");
            return unauthorized_json();
        }
    };

    if !validator.validate(token) {
        warn!(path = %path, "auth failed: invalid session");
        return unauthorized_json();
    }

    debug!(path = %path, "session validated");
    next.run(req).await
}
