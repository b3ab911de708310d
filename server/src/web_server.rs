//! Axum gateway: WS at /ws (one connection handler per upgrade), REST views
//! of the registry at /api/sessions, the tmux snapshot at /api/tmux/sessions,
//! and /api/health. Binds to 127.0.0.1 only. Shutdown cancels the tmux
//! monitor first, then closes every live session.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::{delete, get},
    Json, Router,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use trex_core::config::Config;
use trex_core::cwd::{CwdDetector, ProcCwdDetector};
use trex_core::protocol::SessionInfo;
use trex_core::pty::{NativePtySystem, PtySystem};
use trex_core::registry::SessionRegistry;
use trex_core::tmux::{spawn_monitor, MonitorHandle, TmuxCommandDetector};

use crate::auth::PrincipalResolver;
use crate::connection::{serve_socket, ConnectionContext};

/// Shared gateway state, cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    registry: Arc<SessionRegistry>,
    pty_system: Arc<dyn PtySystem>,
    cwd_detector: Arc<dyn CwdDetector>,
    monitor: MonitorHandle,
    auth: Arc<dyn PrincipalResolver>,
    config: Arc<Config>,
    next_conn_id: Arc<AtomicU64>,
}

impl AppState {
    fn principal(&self, headers: &HeaderMap) -> String {
        self.auth.resolve(headers).unwrap_or_default()
    }

    fn connection_ctx(&self) -> ConnectionContext {
        ConnectionContext {
            registry: self.registry.clone(),
            pty_system: self.pty_system.clone(),
            cwd_detector: self.cwd_detector.clone(),
            monitor: self.monitor.clone(),
            config: self.config.clone(),
        }
    }
}

/// Run the gateway to completion (ctrl-c). The caller picks the principal
/// resolver; `NoAuth` for unauthenticated deployments.
pub async fn run_gateway(config: Config, auth: Arc<dyn PrincipalResolver>) -> anyhow::Result<()> {
    let registry = Arc::new(SessionRegistry::new());
    let shutdown = CancellationToken::new();
    let monitor = spawn_monitor(
        registry.clone(),
        Arc::new(TmuxCommandDetector::default()),
        config.tmux_poll,
        shutdown.clone(),
    );
    let monitor_handle = monitor.clone();
    let state = AppState {
        registry: registry.clone(),
        pty_system: Arc::new(NativePtySystem),
        cwd_detector: Arc::new(ProcCwdDetector),
        monitor,
        auth,
        config: Arc::new(config.clone()),
        next_conn_id: Arc::new(AtomicU64::new(1)),
    };

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/sessions", get(list_sessions_handler))
        .route("/api/sessions/{id}", delete(delete_session_handler))
        .route("/api/tmux/sessions", get(tmux_sessions_handler))
        .route("/api/health", get(health_handler))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "trex gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Monitor first, then sessions; outstanding writes are abandoned.
    monitor_handle.stop();
    for session in registry.list() {
        session.close_gracefully().await;
        registry.delete(session.id());
    }
    info!("trex gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}

async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let auth_user = state.principal(&headers);
    let conn_id = state.next_conn_id.fetch_add(1, Ordering::SeqCst);
    let ctx = state.connection_ctx();
    ws.on_upgrade(move |socket| serve_socket(socket, ctx, auth_user, conn_id))
}

async fn list_sessions_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Json<Vec<SessionInfo>> {
    let principal = state.principal(&headers);
    Json(session_infos(&state.registry, &principal))
}

async fn delete_session_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> StatusCode {
    let principal = state.principal(&headers);
    delete_session(&state.registry, &principal, &id).await
}

/// GET /api/tmux/sessions response body.
#[derive(serde::Serialize)]
struct TmuxSessionsResponse {
    available: bool,
    sessions: Vec<trex_core::protocol::TmuxSessionDescriptor>,
}

async fn tmux_sessions_handler(State(state): State<AppState>) -> Json<TmuxSessionsResponse> {
    Json(TmuxSessionsResponse {
        available: state.monitor.tmux_available(),
        sessions: state.monitor.latest_sessions(),
    })
}

#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Owner-filtered snapshot, ordered by session ordinal for stable output.
fn session_infos(registry: &SessionRegistry, principal: &str) -> Vec<SessionInfo> {
    let mut infos: Vec<SessionInfo> = registry
        .list_by_owner(principal)
        .iter()
        .map(|s| s.info())
        .collect();
    infos.sort_by_key(|info| info.id.trim_start_matches('s').parse::<u64>().unwrap_or(0));
    infos
}

/// Close and remove one session. Ownership mismatch is rendered as not
/// found so foreign principals cannot probe for existence.
async fn delete_session(
    registry: &Arc<SessionRegistry>,
    principal: &str,
    id: &str,
) -> StatusCode {
    let Some(session) = registry.get(id) else {
        return StatusCode::NOT_FOUND;
    };
    if !principal.is_empty() && session.owner() != principal {
        return StatusCode::NOT_FOUND;
    }
    session.close_gracefully().await;
    registry.delete(id);
    info!(session = id, "session deleted via rest");
    StatusCode::NO_CONTENT
}
