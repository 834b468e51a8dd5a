use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub const DEFAULT_CALLBACK_PATH: &str = "/oauth/callback";
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Code and state delivered by the browser redirect.
#[derive(Debug, Clone)]
pub struct AuthCode {
    pub code: String,
    pub state: Option<String>,
}

struct CallbackState {
    code: Mutex<Option<AuthCode>>,
    /// Set by the broker once the code has been exchanged and tokens are on
    /// disk. `/wait-for-auth` reports 200 only from this point, so a sibling
    /// that sees 200 can trust the credential store.
    complete: AtomicBool,
    code_arrived: Notify,
    completed: Notify,
    auth_timeout: Duration,
}

/// Single-process HTTP server bound to `127.0.0.1`, owned by the broker.
///
/// Serves the OAuth redirect at the callback path and the `/wait-for-auth`
/// coordination endpoint for sibling processes. Siblings never receive the
/// code itself over HTTP; the 200/202 distinction is a bare completion
/// signal and the code moves from handler to broker through shared state.
pub struct CallbackServer {
    port: u16,
    state: Arc<CallbackState>,
    shutdown: CancellationToken,
}

impl CallbackServer {
    /// Bind to `127.0.0.1:<port>`, falling back to an OS-assigned port when
    /// `port` is 0 or already taken. The resolved port is available from
    /// [`CallbackServer::port`].
    pub async fn bind(port: u16, callback_path: &str, auth_timeout: Duration) -> Result<Self> {
        let state = Arc::new(CallbackState {
            code: Mutex::new(None),
            complete: AtomicBool::new(false),
            code_arrived: Notify::new(),
            completed: Notify::new(),
            auth_timeout,
        });

        let listener = match tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
            Ok(l) => l,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                debug!("callback port {port} is taken, letting the OS pick one");
                tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?
            }
            Err(e) => return Err(e.into()),
        };
        let actual_port = listener
            .local_addr()
            .map_err(|e| Error::Transport(format!("failed to resolve callback port: {e}")))?
            .port();

        let router = Router::new()
            .route(callback_path, get(handle_callback))
            .route("/wait-for-auth", get(handle_wait_for_auth))
            .with_state(state.clone());

        let shutdown = CancellationToken::new();
        let serve_shutdown = shutdown.clone();
        tokio::spawn(async move {
            info!("callback server listening on 127.0.0.1:{actual_port}");
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    serve_shutdown.cancelled().await;
                })
                .await;
            if let Err(e) = result {
                warn!("callback server terminated: {e}");
            }
        });

        Ok(Self {
            port: actual_port,
            state,
            shutdown,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Block until the browser redirect delivers an authorization code.
    pub async fn await_code(&self) -> AuthCode {
        loop {
            let arrived = self.state.code_arrived.notified();
            if let Some(code) = self.state.code.lock().unwrap_or_else(|e| e.into_inner()).clone() {
                return code;
            }
            arrived.await;
        }
    }

    /// Whether a code has been delivered yet (used by the placeholder
    /// listener assertions in tests; siblings probe over HTTP instead).
    pub fn code_received(&self) -> bool {
        self.state
            .code
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Mark the authorization finished: the broker calls this after token
    /// exchange has persisted the bundle, releasing sibling long-polls.
    pub fn complete(&self) {
        self.state.complete.store(true, Ordering::SeqCst);
        self.state.completed.notify_waiters();
    }

    /// Stop accepting connections. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn handle_callback(
    State(state): State<Arc<CallbackState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(code) = params.get("code").filter(|c| !c.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Missing authorization code").into_response();
    };

    {
        let mut slot = state.code.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(AuthCode {
            code: code.clone(),
            state: params.get("state").cloned(),
        });
    }
    state.code_arrived.notify_waiters();
    info!("authorization code received on callback");

    Html(CALLBACK_HTML).into_response()
}

#[derive(serde::Deserialize)]
struct WaitQuery {
    poll: Option<String>,
}

async fn handle_wait_for_auth(
    State(state): State<Arc<CallbackState>>,
    Query(query): Query<WaitQuery>,
) -> Response {
    let finished = || state.complete.load(Ordering::SeqCst);

    // Health probe: report immediately.
    if query.poll.as_deref() == Some("false") {
        return if finished() {
            (StatusCode::OK, "Authentication completed").into_response()
        } else {
            (StatusCode::ACCEPTED, "Authentication in progress").into_response()
        };
    }

    // Long poll: hold the request open up to the auth timeout. Callers are
    // expected to retry on 202.
    let completed = state.completed.notified();
    if finished() {
        return (StatusCode::OK, "Authentication completed").into_response();
    }
    let _ = tokio::time::timeout(state.auth_timeout, completed).await;

    if finished() {
        (StatusCode::OK, "Authentication completed").into_response()
    } else {
        (StatusCode::ACCEPTED, "Authentication in progress").into_response()
    }
}

const CALLBACK_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Authorization Complete</title>
    <style>
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            height: 100vh;
            margin: 0;
            background-color: #fafafa;
        }
        .card {
            text-align: center;
            padding: 2rem 3rem;
            background: white;
            border-radius: 8px;
            box-shadow: 0 2px 6px rgba(0,0,0,0.12);
        }
        h1 { color: #16a34a; }
        p { color: #555; margin-top: 1rem; }
    </style>
</head>
<body>
    <div class="card">
        <h1>Authorization complete</h1>
        <p>You can close this window and return to your application.</p>
    </div>
    <script>window.close();</script>
</body>
</html>"#;
