// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wires every component into one `axum::Router` and runs it: `AppState`
//! holds the shared handles each handler needs, `build_router` lays out the
//! route table from spec §6, and `serve` is the process-level entry point
//! with graceful shutdown.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        State,
    },
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use tokio::signal;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use vibetunnel_protocol::NodeMode;

use crate::{
    auth, buffers,
    config::Config,
    federation::{self, Federation, UpstreamProxies},
    store::SessionStore,
    terminal::TerminalRegistry,
    watcher::ControlDirWatcher,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: SessionStore,
    pub terminals: TerminalRegistry,
    pub watcher: ControlDirWatcher,
    pub federation: Federation,
    pub buffer_hub: buffers::BufferHub,
    pub upstream_proxies: UpstreamProxies,
    /// The bearer token this node minted for itself when registering with an
    /// HQ, per spec §4.8: "the remote's auth layer accepts exactly that
    /// bearer". `None` until registration completes (or permanently, on a
    /// node that isn't acting as a remote at all).
    pub own_remote_token: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn node_mode(&self) -> NodeMode {
        if self.config.hq_mode {
            NodeMode::Hq
        } else if self.config.hq_url.is_some() {
            NodeMode::Remote
        } else {
            NodeMode::Standalone
        }
    }

    /// Builds and encodes the current grid snapshot for a locally-hosted
    /// session, used both to answer `GET /sessions/:id/snapshot` and to greet
    /// a freshly-subscribed `/buffers` client. Returns `None` for a session
    /// this node does not host (the caller is expected to have already ruled
    /// out the federated case).
    pub async fn snapshot_now(&self, id: &str) -> Option<Vec<u8>> {
        if !self.store.exists(id) {
            return None;
        }
        let row = self.store.get(id).ok().flatten()?;
        let model = self.terminals.acquire(id, row.width, row.height);
        let snapshot = model.grid_snapshot();
        self.terminals.release(id);
        Some(snapshot.encode())
    }
}

/// Assembles the full route table. `/api/health` is mounted outside the auth
/// layer; everything else under `/api` and the `/buffers` WebSocket sit
/// behind [`auth::require_auth`].
pub fn build_router(state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/api/sessions", get(crate::api::list_sessions).post(crate::api::create_session))
        .route("/api/sessions/multistream", get(crate::api::multistream))
        .route("/api/sessions/:id", get(crate::api::get_session).delete(crate::api::kill_session))
        .route("/api/sessions/:id/stream", get(crate::api::stream_session))
        .route("/api/sessions/:id/snapshot", get(crate::api::session_snapshot))
        .route("/api/sessions/:id/input", post(crate::api::send_input))
        .route("/api/sessions/:id/resize", post(crate::api::resize_session))
        .route("/api/sessions/:id/cleanup", post(crate::api::cleanup_session).delete(crate::api::cleanup_session))
        .route("/api/cleanup-exited", post(crate::api::cleanup_exited))
        .route("/api/remotes", get(crate::api::list_remotes))
        .route("/api/remotes/register", post(crate::api::register_remote))
        .route("/api/remotes/:id", delete(crate::api::unregister_remote))
        .route("/api/remotes/:name/refresh-sessions", post(crate::api::refresh_remote_sessions))
        .route("/buffers", get(buffers_upgrade))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_auth));

    Router::new()
        .route("/api/health", get(crate::api::health))
        .merge(authenticated)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn buffers_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket: WebSocket| buffers::handle_socket(socket, state))
}

/// Process entry point: builds every component's shared state, starts its
/// background tasks, binds the listener, and serves until a Ctrl-C/SIGTERM
/// with a bounded grace period for in-flight connections.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let store = SessionStore::new(config.control_root())?;
    let terminals = TerminalRegistry::new(store.clone(), config.scrollback_lines(), config.debounce());
    let watcher = ControlDirWatcher::new();
    watcher.clone().spawn(store.clone());
    let federation = Federation::new();

    for remote in &config.remotes {
        let (_summary, created) = federation.register(vibetunnel_protocol::RegisterRemoteRequest {
            id: remote.id.clone(),
            name: remote.name.clone(),
            url: remote.url.clone(),
            token: remote.token.clone(),
        })?;
        if created {
            federation::spawn_remote_monitor(federation.clone(), remote.id.clone());
        }
    }

    let state = AppState {
        config: Arc::new(config.clone()),
        store,
        terminals,
        watcher,
        federation,
        buffer_hub: buffers::BufferHub::new(),
        upstream_proxies: UpstreamProxies::new(),
        own_remote_token: Arc::new(RwLock::new(None)),
    };

    if let Some(hq_url) = config.hq_url.clone() {
        spawn_hq_registration(hq_url, state.clone());
    }

    let addr = format!("{}:{}", config.bind_addr, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, mode = ?state.node_mode(), "vibetunnel listening");

    let router = build_router(state);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received, draining in-flight requests");
        let _ = shutdown_tx.send(true);
    });

    let mut grace_rx = shutdown_rx.clone();
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        let _ = shutdown_rx.clone().wait_for(|v| *v).await;
    });

    tokio::select! {
        res = server => res?,
        _ = async { let _ = grace_rx.wait_for(|v| *v).await; tokio::time::sleep(SHUTDOWN_GRACE).await; } => {
            info!(grace = ?SHUTDOWN_GRACE, "grace period elapsed, forcing shutdown");
        }
    }
    Ok(())
}

fn spawn_hq_registration(hq_url: String, state: AppState) {
    tokio::spawn(async move {
        let id = uuid::Uuid::new_v4().to_string();
        let name = state.config.remote_name.clone().unwrap_or_else(|| id.clone());
        let token = uuid::Uuid::new_v4().to_string();
        let self_url = match &state.config.remote_url {
            Some(url) => url.clone(),
            None => {
                if state.config.bind_addr == "0.0.0.0" || state.config.bind_addr == "::" {
                    tracing::warn!(
                        bind_addr = %state.config.bind_addr,
                        "hq_url is set but remote_url is not; advertising the wildcard bind address, which the hq likely cannot reach"
                    );
                }
                format!("http://{}:{}", state.config.bind_addr, state.config.port)
            }
        };

        if let Err(e) = federation::register_with_hq(
            &hq_url,
            state.config.username.as_deref(),
            state.config.password.as_deref(),
            &id,
            &name,
            &self_url,
            &token,
        )
        .await
        {
            tracing::warn!(error = %e, "failed to register with hq at startup");
            return;
        }
        *state.own_remote_token.write().unwrap() = Some(token.clone());
        info!(%hq_url, %name, "registered with hq");

        signal::ctrl_c().await.ok();
        let _ = federation::unregister_from_hq(&hq_url, state.config.username.as_deref(), state.config.password.as_deref(), &id).await;
    });
}

async fn wait_for_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate()).expect("failed to install sigterm handler").recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
