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

//! HQ ↔ remote federation (C8): the remote registry, the session-ownership
//! map, the HTTP proxy client used to forward requests to a remote, and the
//! outbound `/buffers` WebSocket proxy an HQ dials to the owning remote on a
//! client's behalf.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use tracing::{instrument, warn};
use vibetunnel_protocol::{
    CreateSessionRequest, CreateSessionResponse, InputRequest, RegisterRemoteRequest, RemoteDescriptor, RemoteSummary,
    ResizeRequest, ResizeResponse, SessionRow,
};

use crate::{
    buffers::BufferHub,
    consts::{HEALTH_BACKOFF_CAP, HEALTH_CHECK_TIMEOUT, REMOTE_REFRESH_INTERVAL, REMOTE_REGISTER_TIMEOUT, REMOTE_REQUEST_TIMEOUT},
    error::VtError,
};

struct RemoteEntry {
    descriptor: RemoteDescriptor,
    healthy: bool,
    consecutive_failures: u32,
    session_ids: HashSet<String>,
}

fn summary(entry: &RemoteEntry) -> RemoteSummary {
    RemoteSummary {
        id: entry.descriptor.id.clone(),
        name: entry.descriptor.name.clone(),
        url: entry.descriptor.url.clone(),
        healthy: entry.healthy,
        session_count: entry.session_ids.len(),
    }
}

/// The HQ's view of the federation: every registered remote, its health, and
/// the sessions it currently owns. A single-writer/many-reader structure per
/// spec §5, implemented here with a plain `Mutex` since contention is low
/// (registration and the periodic per-remote refresh are the only writers).
#[derive(Clone)]
pub struct Federation {
    remotes: Arc<Mutex<HashMap<String, RemoteEntry>>>,
    name_index: Arc<Mutex<HashMap<String, String>>>,
    client: reqwest::Client,
}

impl Federation {
    pub fn new() -> Self {
        Federation {
            remotes: Arc::new(Mutex::new(HashMap::new())),
            name_index: Arc::new(Mutex::new(HashMap::new())),
            client: reqwest::Client::new(),
        }
    }

    /// Idempotent on an exact resubmission of the same `{id,name,url,token}`;
    /// conflicts (same id or name bound to a different identity) return
    /// `RemoteConflict`, surfaced by the API layer as `409`.
    #[instrument(skip(self, req), fields(remote_id = %req.id))]
    pub fn register(&self, req: RegisterRemoteRequest) -> Result<(RemoteSummary, bool), VtError> {
        let mut remotes = self.remotes.lock().unwrap();
        let mut names = self.name_index.lock().unwrap();

        if let Some(existing) = remotes.get(&req.id) {
            if existing.descriptor.name == req.name && existing.descriptor.url == req.url && existing.descriptor.bearer_token == req.token {
                return Ok((summary(existing), false));
            }
            return Err(VtError::RemoteConflict);
        }
        if let Some(existing_id) = names.get(&req.name) {
            if existing_id != &req.id {
                return Err(VtError::RemoteConflict);
            }
        }

        let descriptor = RemoteDescriptor { id: req.id.clone(), name: req.name.clone(), url: req.url.clone(), bearer_token: req.token };
        let entry = RemoteEntry { descriptor, healthy: true, consecutive_failures: 0, session_ids: HashSet::new() };
        let result = summary(&entry);
        names.insert(req.name, req.id.clone());
        remotes.insert(req.id, entry);
        Ok((result, true))
    }

    pub fn unregister(&self, id: &str) {
        let mut remotes = self.remotes.lock().unwrap();
        if let Some(entry) = remotes.remove(id) {
            self.name_index.lock().unwrap().remove(&entry.descriptor.name);
        }
    }

    pub fn list(&self) -> Vec<RemoteSummary> {
        self.remotes.lock().unwrap().values().map(summary).collect()
    }

    pub fn descriptor(&self, id: &str) -> Option<RemoteDescriptor> {
        self.remotes.lock().unwrap().get(id).map(|e| e.descriptor.clone())
    }

    pub fn descriptor_by_name(&self, name: &str) -> Option<RemoteDescriptor> {
        let id = self.name_index.lock().unwrap().get(name).cloned()?;
        self.descriptor(&id)
    }

    pub fn remote_ids(&self) -> Vec<String> {
        self.remotes.lock().unwrap().keys().cloned().collect()
    }

    /// The remote that currently owns `session_id`, if any and if healthy.
    /// A session id appears in at most one remote's ownership set at a time
    /// (invariant 5): this map is only ever written wholesale per remote by
    /// the refresh task, or incrementally by `mark_owned` right after a
    /// proxied create, so two remotes never race to claim the same id.
    pub fn owner_of(&self, session_id: &str) -> Option<RemoteDescriptor> {
        self.remotes
            .lock()
            .unwrap()
            .values()
            .find(|e| e.healthy && e.session_ids.contains(session_id))
            .map(|e| e.descriptor.clone())
    }

    pub fn mark_owned(&self, remote_id: &str, session_id: String) {
        if let Some(entry) = self.remotes.lock().unwrap().get_mut(remote_id) {
            entry.session_ids.insert(session_id);
        }
    }

    pub fn forget_owned(&self, session_id: &str) {
        for entry in self.remotes.lock().unwrap().values_mut() {
            entry.session_ids.remove(session_id);
        }
    }

    fn set_session_ids(&self, remote_id: &str, ids: HashSet<String>) {
        if let Some(entry) = self.remotes.lock().unwrap().get_mut(remote_id) {
            entry.session_ids = ids;
        }
    }

    fn mark_health(&self, remote_id: &str, healthy: bool) {
        if let Some(entry) = self.remotes.lock().unwrap().get_mut(remote_id) {
            if healthy {
                entry.healthy = true;
                entry.consecutive_failures = 0;
            } else {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= 3 {
                    entry.healthy = false;
                }
            }
        }
    }

    /// Aggregated listing of every healthy remote's sessions, annotated with
    /// `source`/`remoteId`/`remoteName` as spec §4.9's "List" verb requires.
    pub async fn list_all_remote_sessions(&self) -> Vec<SessionRow> {
        let remotes: Vec<RemoteDescriptor> =
            self.remotes.lock().unwrap().values().filter(|e| e.healthy).map(|e| e.descriptor.clone()).collect();
        let fetches = remotes.into_iter().map(|remote| {
            let client = self.client.clone();
            async move {
                match remote_list_sessions(&client, &remote).await {
                    Ok(rows) => rows
                        .into_iter()
                        .map(|mut row| {
                            row.source = Some(vibetunnel_protocol::SessionSource::Remote);
                            row.remote_id = Some(remote.id.clone());
                            row.remote_name = Some(remote.name.clone());
                            row
                        })
                        .collect::<Vec<_>>(),
                    Err(e) => {
                        warn!(remote = %remote.name, error = %e, "failed to list sessions from remote");
                        Vec::new()
                    }
                }
            }
        });
        futures::future::join_all(fetches).await.into_iter().flatten().collect()
    }

    pub fn client(&self) -> reqwest::Client {
        self.client.clone()
    }

    /// Forces an out-of-band session-ownership refresh for the remote named
    /// `name`, returning its session count once done. Backs
    /// `POST /api/remotes/:name/refresh-sessions`.
    pub async fn refresh_sessions_by_name(&self, name: &str) -> Result<usize, VtError> {
        let remote = self.descriptor_by_name(name).ok_or(VtError::SessionNotFound)?;
        let rows = remote_list_sessions(&self.client, &remote).await.map_err(|e| VtError::RemoteUnreachable(e.to_string()))?;
        let ids: HashSet<String> = rows.into_iter().map(|r| r.id).collect();
        let count = ids.len();
        self.set_session_ids(&remote.id, ids);
        self.mark_health(&remote.id, true);
        Ok(count)
    }
}

impl Default for Federation {
    fn default() -> Self {
        Self::new()
    }
}

async fn remote_health(client: &reqwest::Client, remote: &RemoteDescriptor) -> bool {
    client
        .get(format!("{}/api/health", remote.url))
        .timeout(HEALTH_CHECK_TIMEOUT)
        .send()
        .await
        .map(|r| r.status().is_success())
        .unwrap_or(false)
}

pub async fn remote_list_sessions(client: &reqwest::Client, remote: &RemoteDescriptor) -> anyhow::Result<Vec<SessionRow>> {
    let resp = client
        .get(format!("{}/api/sessions", remote.url))
        .bearer_auth(&remote.bearer_token)
        .timeout(REMOTE_REQUEST_TIMEOUT)
        .send()
        .await?
        .error_for_status()?;
    Ok(resp.json().await?)
}

pub async fn remote_get_session(client: &reqwest::Client, remote: &RemoteDescriptor, id: &str) -> anyhow::Result<Option<SessionRow>> {
    let resp = client
        .get(format!("{}/api/sessions/{id}", remote.url))
        .bearer_auth(&remote.bearer_token)
        .timeout(REMOTE_REQUEST_TIMEOUT)
        .send()
        .await?;
    if resp.status() == reqwest::StatusCode::NOT_FOUND {
        return Ok(None);
    }
    Ok(Some(resp.error_for_status()?.json().await?))
}

pub async fn remote_create_session(
    client: &reqwest::Client,
    remote: &RemoteDescriptor,
    req: &CreateSessionRequest,
) -> anyhow::Result<CreateSessionResponse> {
    let resp = client
        .post(format!("{}/api/sessions", remote.url))
        .bearer_auth(&remote.bearer_token)
        .json(req)
        .timeout(REMOTE_REQUEST_TIMEOUT)
        .send()
        .await?
        .error_for_status()?;
    Ok(resp.json().await?)
}

pub async fn remote_kill_session(client: &reqwest::Client, remote: &RemoteDescriptor, id: &str) -> Result<(), VtError> {
    let resp = client
        .delete(format!("{}/api/sessions/{id}", remote.url))
        .bearer_auth(&remote.bearer_token)
        .timeout(REMOTE_REQUEST_TIMEOUT)
        .send()
        .await
        .map_err(|e| VtError::RemoteUnreachable(e.to_string()))?;
    match resp.status() {
        reqwest::StatusCode::OK => Ok(()),
        reqwest::StatusCode::GONE => Err(VtError::SessionAlreadyExited),
        reqwest::StatusCode::NOT_FOUND => Err(VtError::SessionNotFound),
        other => Err(VtError::RemoteUnreachable(format!("remote returned {other}"))),
    }
}

pub async fn remote_cleanup_session(client: &reqwest::Client, remote: &RemoteDescriptor, id: &str) -> anyhow::Result<()> {
    client
        .post(format!("{}/api/sessions/{id}/cleanup", remote.url))
        .bearer_auth(&remote.bearer_token)
        .timeout(REMOTE_REQUEST_TIMEOUT)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

pub async fn remote_input(client: &reqwest::Client, remote: &RemoteDescriptor, id: &str, req: &InputRequest) -> anyhow::Result<()> {
    client
        .post(format!("{}/api/sessions/{id}/input", remote.url))
        .bearer_auth(&remote.bearer_token)
        .json(req)
        .timeout(REMOTE_REQUEST_TIMEOUT)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

pub async fn remote_resize(client: &reqwest::Client, remote: &RemoteDescriptor, id: &str, req: ResizeRequest) -> anyhow::Result<ResizeResponse> {
    let resp = client
        .post(format!("{}/api/sessions/{id}/resize", remote.url))
        .bearer_auth(&remote.bearer_token)
        .json(&req)
        .timeout(REMOTE_REQUEST_TIMEOUT)
        .send()
        .await?
        .error_for_status()?;
    Ok(resp.json().await?)
}

pub async fn remote_cleanup_exited(client: &reqwest::Client, remote: &RemoteDescriptor) -> anyhow::Result<Vec<String>> {
    #[derive(serde::Deserialize)]
    struct LocalCleanup {
        #[serde(rename = "localCleaned")]
        local_cleaned: Vec<String>,
    }
    let resp = client
        .post(format!("{}/api/cleanup-exited", remote.url))
        .bearer_auth(&remote.bearer_token)
        .timeout(REMOTE_REQUEST_TIMEOUT)
        .send()
        .await?
        .error_for_status()?;
    let body: LocalCleanup = resp.json().await?;
    Ok(body.local_cleaned)
}

/// Spawns the per-remote health-check + session-refresh loop (spec §4.8: "a
/// periodic refresh task ... parallel across remotes"). Terminates on its
/// own once the remote is unregistered.
pub fn spawn_remote_monitor(fed: Federation, remote_id: String) {
    tokio::spawn(async move {
        let mut backoff = Duration::from_secs(1);
        loop {
            let Some(remote) = fed.descriptor(&remote_id) else { return };
            let healthy = remote_health(&fed.client, &remote).await;
            fed.mark_health(&remote_id, healthy);

            if healthy {
                backoff = Duration::from_secs(1);
                match remote_list_sessions(&fed.client, &remote).await {
                    Ok(rows) => fed.set_session_ids(&remote_id, rows.into_iter().map(|r| r.id).collect()),
                    Err(e) => warn!(remote = %remote.name, error = %e, "session refresh failed despite a healthy probe"),
                }
                tokio::time::sleep(REMOTE_REFRESH_INTERVAL).await;
            } else {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(HEALTH_BACKOFF_CAP);
            }
        }
    });
}

/// Registers this node with an upstream HQ at startup. Called from the
/// binary's `main` (or `server::serve`) when `hq_url` is configured.
pub async fn register_with_hq(
    hq_url: &str,
    hq_username: Option<&str>,
    hq_password: Option<&str>,
    id: &str,
    name: &str,
    self_url: &str,
    token: &str,
) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let mut req = client
        .post(format!("{hq_url}/api/remotes/register"))
        .json(&RegisterRemoteRequest { id: id.to_string(), name: name.to_string(), url: self_url.to_string(), token: token.to_string() })
        .timeout(REMOTE_REGISTER_TIMEOUT);
    if let (Some(u), Some(p)) = (hq_username, hq_password) {
        req = req.basic_auth(u, Some(p));
    }
    req.send().await?.error_for_status()?;
    Ok(())
}

pub async fn unregister_from_hq(hq_url: &str, hq_username: Option<&str>, hq_password: Option<&str>, id: &str) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let mut req = client.delete(format!("{hq_url}/api/remotes/{id}")).timeout(REMOTE_REQUEST_TIMEOUT);
    if let (Some(u), Some(p)) = (hq_username, hq_password) {
        req = req.basic_auth(u, Some(p));
    }
    req.send().await?.error_for_status()?;
    Ok(())
}

/// Dedupes outbound `/buffers` subscriptions an HQ opens to remotes: many
/// local clients subscribing to the same remote-owned session share one
/// upstream connection (spec §4.7 "Proxying").
#[derive(Clone, Default)]
pub struct UpstreamProxies {
    active: Arc<Mutex<HashSet<String>>>,
}

impl UpstreamProxies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure_subscribed(&self, hub: BufferHub, remote: RemoteDescriptor, session_id: String) {
        let mut active = self.active.lock().unwrap();
        if active.contains(&session_id) {
            return;
        }
        active.insert(session_id.clone());
        drop(active);

        let active_set = self.active.clone();
        tokio::spawn(async move {
            if let Err(e) = run_upstream(hub, &remote, &session_id).await {
                warn!(session = %session_id, remote = %remote.name, error = %e, "upstream /buffers proxy ended");
            }
            active_set.lock().unwrap().remove(&session_id);
        });
    }
}

async fn run_upstream(hub: BufferHub, remote: &RemoteDescriptor, session_id: &str) -> anyhow::Result<()> {
    use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Message as WsMessage};

    // http(s):// -> ws(s):// by replacing the leading "http" token; works for
    // both "http" and "https" since the latter contains the former verbatim.
    let ws_url = format!("{}/buffers", remote.url.replacen("http", "ws", 1));
    let mut request = ws_url.into_client_request()?;
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {}", remote.bearer_token).parse()?,
    );
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await?;

    let subscribe = serde_json::json!({"type": "subscribe", "sessionId": session_id}).to_string();
    ws.send(WsMessage::Text(subscribe)).await?;

    while let Some(msg) = ws.next().await {
        match msg? {
            WsMessage::Binary(bytes) => hub.publish(session_id, bytes),
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}
