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

//! The Session API (C9): the axum handlers behind every route in the
//! external HTTP surface. Each verb does the minimum of its own work and
//! otherwise composes C1 (PTY Host), C2 (Session Store), C4 (Terminal
//! Model), C6/C7 (fan-out) and C8 (federation).

use std::{collections::HashMap, convert::Infallible, time::Instant};

use axum::{
    extract::{Path, Query, RawQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use chrono::Utc;
use futures::stream::{Stream, StreamExt};
use serde_derive::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::warn;
use uuid::Uuid;
use vibetunnel_protocol::{
    CleanupExitedResponse, CreateSessionRequest, CreateSessionResponse, HealthResponse, InputRequest, RegisterRemoteRequest,
    RegisterRemoteResponse, RemoteCleanupResult, RemoteDescriptor, RemoteSummary, ResizeRequest, ResizeResponse, SessionRow,
    SessionSource, SessionStatus, SimpleSuccessResponse, StreamEvent, StreamHeader,
};

use crate::{
    consts::{SSE_HEARTBEAT_INTERVAL, TAIL_POLL_INTERVAL},
    error::{VtError, VtResult},
    federation, keys, pty, store,
    server::AppState,
    textstream,
};

enum Location {
    Local,
    Remote(RemoteDescriptor),
}

async fn locate(state: &AppState, id: &str) -> VtResult<Location> {
    if state.store.exists(id) {
        return Ok(Location::Local);
    }
    if let Some(remote) = state.federation.owner_of(id) {
        return Ok(Location::Remote(remote));
    }
    Err(VtError::SessionNotFound)
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", timestamp: Utc::now(), mode: state.node_mode() })
}

pub async fn list_sessions(State(state): State<AppState>) -> VtResult<Json<Vec<SessionRow>>> {
    let mut rows = state.store.list().map_err(VtError::Internal)?;
    for row in &mut rows {
        row.source = Some(SessionSource::Local);
    }
    if state.config.hq_mode {
        rows.extend(state.federation.list_all_remote_sessions().await);
    }
    Ok(Json(rows))
}

/// Expands a leading `~`, then falls back to `$HOME` (with a warning) if the
/// resolved path is not an accessible directory, per spec §4.9's Create bullet.
fn resolve_working_dir(requested: Option<&str>) -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/".to_string());
    let raw = requested.unwrap_or(&home).to_string();

    let expanded = if raw == "~" {
        home.clone()
    } else if let Some(rest) = raw.strip_prefix("~/") {
        format!("{home}/{rest}")
    } else {
        raw
    };

    if std::path::Path::new(&expanded).is_dir() {
        expanded
    } else {
        warn!(requested = %expanded, fallback = %home, "working directory inaccessible, falling back to home");
        home
    }
}

pub async fn create_session(State(state): State<AppState>, Json(req): Json<CreateSessionRequest>) -> VtResult<Json<CreateSessionResponse>> {
    if let Some(remote_id) = req.remote_id.clone() {
        let remote = state.federation.descriptor(&remote_id).ok_or_else(|| VtError::InvalidRequest(format!("unknown remote: {remote_id}")))?;
        let resp = federation::remote_create_session(&state.federation.client(), &remote, &req)
            .await
            .map_err(|e| VtError::RemoteUnreachable(e.to_string()))?;
        state.federation.mark_owned(&remote_id, resp.session_id.clone());
        return Ok(Json(resp));
    }

    if req.command.is_empty() {
        return Err(VtError::InvalidRequest("command must not be empty".into()));
    }

    let id = Uuid::new_v4().to_string();
    let cols = req.cols.unwrap_or(80);
    let rows = req.rows.unwrap_or(24);
    let term = req.term.clone().unwrap_or_else(|| "xterm-256color".to_string());
    let cwd = resolve_working_dir(req.working_dir.as_deref());
    let name = req.name.clone().unwrap_or_else(|| id.clone());

    let row = store::new_session_row(id.clone(), name, req.command.clone(), cwd.clone(), term.clone(), cols, rows);
    state.store.create_session_dir(&row).map_err(VtError::Internal)?;
    state
        .store
        .append_stream_out(&id, &serde_json::to_string(&StreamHeader::new(cols, rows)).expect("StreamHeader serializes"))
        .map_err(VtError::Internal)?;

    let env: HashMap<String, String> = std::env::vars().collect();
    let start = Instant::now();

    let out_store = state.store.clone();
    let out_id = id.clone();
    let exit_store = state.store.clone();
    let exit_id = id.clone();

    let handle = pty::spawn(
        pty::SpawnArgs { argv: &row.cmdline, cwd: &cwd, env: &env, cols, rows, term: &term, resize_disabled: state.config.resize_disabled },
        move |bytes| {
            let line = StreamEvent::Output { at: start.elapsed().as_secs_f64(), data: String::from_utf8_lossy(bytes).into_owned() }.to_line();
            let _ = out_store.append_stream_out(&out_id, &line);
        },
        move |code| {
            let line = StreamEvent::Exit { at: start.elapsed().as_secs_f64(), code, session_id: exit_id.clone() }.to_line();
            let _ = exit_store.append_stream_out(&exit_id, &line);
            if let Ok(Some(mut row)) = exit_store.get(&exit_id) {
                row.status = SessionStatus::Exited;
                row.exit_code = Some(code);
                let _ = exit_store.write_session_json(&row);
            }
            exit_store.remove_live(&exit_id);
        },
    )?;

    let mut row = row;
    row.pid = handle.pid.map(|p| p as i32);
    row.status = SessionStatus::Running;
    state.store.write_session_json(&row).map_err(VtError::Internal)?;
    state.store.register_live(id.clone(), handle);

    Ok(Json(CreateSessionResponse { session_id: id }))
}

pub async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> VtResult<Json<SessionRow>> {
    if let Some(row) = state.store.get(&id).map_err(VtError::Internal)? {
        return Ok(Json(row));
    }
    if let Some(remote) = state.federation.owner_of(&id) {
        if let Some(row) = federation::remote_get_session(&state.federation.client(), &remote, &id).await.map_err(|e| VtError::RemoteUnreachable(e.to_string()))? {
            return Ok(Json(row));
        }
    }
    Err(VtError::SessionNotFound)
}

pub async fn kill_session(State(state): State<AppState>, Path(id): Path<String>) -> VtResult<Json<SimpleSuccessResponse>> {
    match locate(&state, &id).await? {
        Location::Local => {
            store::kill_or_already_exited(&state.store, &id).await?;
            Ok(Json(SimpleSuccessResponse { success: true, message: None }))
        }
        Location::Remote(remote) => {
            federation::remote_kill_session(&state.federation.client(), &remote, &id).await?;
            state.federation.forget_owned(&id);
            Ok(Json(SimpleSuccessResponse { success: true, message: None }))
        }
    }
}

pub async fn cleanup_session(State(state): State<AppState>, Path(id): Path<String>) -> VtResult<StatusCode> {
    match locate(&state, &id).await? {
        Location::Local => {
            state.store.remove_session(&id).map_err(VtError::Internal)?;
            Ok(StatusCode::NO_CONTENT)
        }
        Location::Remote(remote) => {
            federation::remote_cleanup_session(&state.federation.client(), &remote, &id).await.map_err(|e| VtError::RemoteUnreachable(e.to_string()))?;
            state.federation.forget_owned(&id);
            Ok(StatusCode::NO_CONTENT)
        }
    }
}

pub async fn cleanup_exited(State(state): State<AppState>) -> VtResult<Json<CleanupExitedResponse>> {
    let local_cleaned = state.store.remove_all_exited().map_err(VtError::Internal)?;

    let remote_results = if state.config.hq_mode {
        let remotes: Vec<RemoteDescriptor> = state.federation.remote_ids().into_iter().filter_map(|id| state.federation.descriptor(&id)).collect();
        let client = state.federation.client();
        let fed = state.federation.clone();
        let futures = remotes.into_iter().map(|remote| {
            let client = client.clone();
            let fed = fed.clone();
            async move {
                match federation::remote_cleanup_exited(&client, &remote).await {
                    Ok(cleaned) => {
                        for id in &cleaned {
                            fed.forget_owned(id);
                        }
                        RemoteCleanupResult { remote_name: remote.name.clone(), cleaned, error: None }
                    }
                    Err(e) => RemoteCleanupResult { remote_name: remote.name.clone(), cleaned: Vec::new(), error: Some(e.to_string()) },
                }
            }
        });
        futures::future::join_all(futures).await
    } else {
        Vec::new()
    };

    Ok(Json(CleanupExitedResponse { success: true, local_cleaned, remote_results }))
}

fn payload_bytes(req: &InputRequest) -> VtResult<Vec<u8>> {
    match req.kind.as_deref() {
        Some(name) if name != "text" => keys::translate(name),
        _ => {
            let text = req.normalize().map_err(|e| VtError::InvalidRequest(e.to_string()))?;
            Ok(text.as_bytes().to_vec())
        }
    }
}

pub async fn send_input(State(state): State<AppState>, Path(id): Path<String>, Json(req): Json<InputRequest>) -> VtResult<StatusCode> {
    let bytes = payload_bytes(&req)?;
    match locate(&state, &id).await? {
        Location::Local => {
            let handle = state.store.live_handle(&id).ok_or(VtError::SessionNotFound)?;
            handle.write(&bytes)?;
            Ok(StatusCode::NO_CONTENT)
        }
        Location::Remote(remote) => {
            federation::remote_input(&state.federation.client(), &remote, &id, &req).await.map_err(|e| VtError::RemoteUnreachable(e.to_string()))?;
            Ok(StatusCode::NO_CONTENT)
        }
    }
}

pub async fn resize_session(State(state): State<AppState>, Path(id): Path<String>, Json(req): Json<ResizeRequest>) -> VtResult<Json<ResizeResponse>> {
    match locate(&state, &id).await? {
        Location::Local => {
            let handle = state.store.live_handle(&id).ok_or(VtError::SessionNotFound)?;
            handle.resize(req.cols, req.rows)?;
            state
                .store
                .append_stream_out(&id, &StreamEvent::Resize { at: 0.0, cols: req.cols, rows: req.rows }.to_line())
                .map_err(VtError::Internal)?;
            if let Ok(Some(mut row)) = state.store.get(&id) {
                row.width = req.cols;
                row.height = req.rows;
                let _ = state.store.write_session_json(&row);
            }
            Ok(Json(ResizeResponse { success: true, cols: Some(req.cols), rows: Some(req.rows), error: None }))
        }
        Location::Remote(remote) => {
            let resp = federation::remote_resize(&state.federation.client(), &remote, &id, req).await.map_err(|e| VtError::RemoteUnreachable(e.to_string()))?;
            Ok(Json(resp))
        }
    }
}

pub async fn stream_session(State(state): State<AppState>, Path(id): Path<String>) -> VtResult<impl IntoResponse> {
    let sse = textstream::stream_session(state.store.clone(), id, state.config.max_stream_file_bytes)?;
    Ok((
        [(header::CACHE_CONTROL, "no-cache"), (header::HeaderName::from_static("x-accel-buffering"), "no")],
        sse,
    ))
}

#[derive(Deserialize)]
pub struct SnapshotQuery {
    format: Option<String>,
}

pub async fn session_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<SnapshotQuery>,
) -> VtResult<Response> {
    let wants_cast = query.format.as_deref() == Some("cast")
        || headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()).map(|v| v.contains("text/plain")).unwrap_or(false);

    match locate(&state, &id).await? {
        Location::Local => {
            if wants_cast {
                let contents = tokio::fs::read_to_string(state.store.stream_out_path(&id)).await.map_err(VtError::FileSystemError)?;
                Ok(([(header::CONTENT_TYPE, "text/plain")], contents).into_response())
            } else {
                let bytes = state.snapshot_now(&id).await.ok_or(VtError::SessionNotFound)?;
                Ok(([(header::CONTENT_TYPE, "application/octet-stream")], bytes).into_response())
            }
        }
        Location::Remote(remote) => {
            let (content_type, bytes) =
                federation::remote_snapshot(&state.federation.client(), &remote, &id, wants_cast).await.map_err(|e| VtError::RemoteUnreachable(e.to_string()))?;
            Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
        }
    }
}

fn parse_session_ids(query: &str) -> Vec<String> {
    let mut ids = Vec::new();
    for pair in query.split('&') {
        let Some((key, value)) = pair.split_once('=') else { continue };
        if key != "session_id" {
            continue;
        }
        for part in value.split(',') {
            if !part.is_empty() {
                ids.push(part.to_string());
            }
        }
    }
    ids
}

struct TaggedTail {
    store: crate::store::SessionStore,
    id: String,
    pos: u64,
    carry: String,
}

/// One session's contribution to a `multistream` response: every line of its
/// `stream-out`, tagged with its session id so a client fanning many ids into
/// one connection can attribute each event, per spec §4.9's "Multistream".
fn tagged_stream(store: crate::store::SessionStore, id: String) -> impl Stream<Item = Result<Event, Infallible>> {
    let state = TaggedTail { store, id, pos: 0, carry: String::new() };
    futures::stream::unfold(state, move |mut state| async move {
        loop {
            let path = state.store.stream_out_path(&state.id);
            let mut file = match tokio::fs::File::open(&path).await {
                Ok(f) => f,
                Err(_) => return None,
            };
            let len = match file.metadata().await {
                Ok(m) => m.len(),
                Err(_) => return None,
            };
            if len < state.pos {
                return None;
            }
            if len == state.pos {
                tokio::time::sleep(TAIL_POLL_INTERVAL).await;
                continue;
            }
            if file.seek(std::io::SeekFrom::Start(state.pos)).await.is_err() {
                return None;
            }
            let mut buf = Vec::new();
            if file.read_to_end(&mut buf).await.is_err() {
                return None;
            }
            state.pos += buf.len() as u64;
            state.carry.push_str(&String::from_utf8_lossy(&buf));

            if let Some(idx) = state.carry.find('\n') {
                let line = state.carry[..idx].to_string();
                state.carry.replace_range(..=idx, "");
                let payload = serde_json::json!({"sessionId": state.id, "line": line});
                let event = Event::default().data(payload.to_string());
                return Some((Ok(event), state));
            }
        }
    })
}

pub async fn multistream(State(state): State<AppState>, RawQuery(query): RawQuery) -> VtResult<impl IntoResponse> {
    let ids = parse_session_ids(query.as_deref().unwrap_or(""));
    if ids.is_empty() {
        return Err(VtError::InvalidRequest("at least one session_id is required".into()));
    }
    for id in &ids {
        if !state.store.exists(id) {
            return Err(VtError::InvalidRequest(format!("unknown session: {id}")));
        }
    }

    let streams: Vec<_> = ids.into_iter().map(|id| tagged_stream(state.store.clone(), id)).collect();
    let merged = futures::stream::select_all(streams.into_iter().map(Box::pin));
    Ok(Sse::new(merged).keep_alive(KeepAlive::new().interval(SSE_HEARTBEAT_INTERVAL)))
}

pub async fn list_remotes(State(state): State<AppState>) -> VtResult<Json<Vec<RemoteSummary>>> {
    if !state.config.hq_mode {
        return Err(VtError::NotHq);
    }
    Ok(Json(state.federation.list()))
}

pub async fn register_remote(State(state): State<AppState>, Json(req): Json<RegisterRemoteRequest>) -> VtResult<Json<RegisterRemoteResponse>> {
    let (summary, created) = state.federation.register(req)?;
    if created {
        federation::spawn_remote_monitor(state.federation.clone(), summary.id.clone());
    }
    Ok(Json(RegisterRemoteResponse { success: true, remote: summary }))
}

pub async fn unregister_remote(State(state): State<AppState>, Path(id): Path<String>) -> VtResult<Json<SimpleSuccessResponse>> {
    state.federation.unregister(&id);
    Ok(Json(SimpleSuccessResponse { success: true, message: None }))
}

#[derive(Deserialize, Default)]
pub struct RefreshSessionsRequest {
    #[allow(dead_code)]
    action: Option<String>,
    #[serde(rename = "sessionId")]
    #[allow(dead_code)]
    session_id: Option<String>,
}

#[derive(Serialize)]
pub struct RefreshSessionsResponse {
    success: bool,
    #[serde(rename = "sessionCount")]
    session_count: usize,
}

pub async fn refresh_remote_sessions(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: axum::body::Bytes,
) -> VtResult<Json<RefreshSessionsResponse>> {
    let _req: RefreshSessionsRequest = if body.is_empty() { RefreshSessionsRequest::default() } else { serde_json::from_slice(&body).unwrap_or_default() };
    let session_count = state.federation.refresh_sessions_by_name(&name).await?;
    Ok(Json(RefreshSessionsResponse { success: true, session_count }))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn working_dir_falls_back_to_home_when_missing() {
        std::env::set_var("HOME", "/tmp");
        let resolved = resolve_working_dir(Some("/definitely/does/not/exist"));
        assert_eq!(resolved, "/tmp");
    }

    #[test]
    fn working_dir_expands_tilde() {
        std::env::set_var("HOME", "/tmp");
        let resolved = resolve_working_dir(Some("~/"));
        assert!(resolved.starts_with("/tmp"));
    }

    #[test]
    fn parses_comma_and_repeated_session_ids() {
        let ids = parse_session_ids("session_id=a,b&session_id=c&other=x");
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn payload_bytes_translates_named_keys() {
        let req = InputRequest { input: None, text: None, kind: Some("enter".to_string()) };
        assert_eq!(payload_bytes(&req).unwrap(), b"\r".to_vec());
    }

    #[test]
    fn payload_bytes_uses_raw_text_by_default() {
        let req = InputRequest { input: Some("hi".to_string()), text: None, kind: None };
        assert_eq!(payload_bytes(&req).unwrap(), b"hi".to_vec());
    }
}
