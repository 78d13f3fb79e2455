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

//! The Buffer Fan-out: the single `/buffers` WebSocket endpoint that pushes
//! binary grid snapshots to every client subscribed to a session, per spec
//! §4.7. Grounded on the WS-split/task-pair pattern in
//! `attractor-web/src/server/terminal.rs` — one task forwards outbound
//! frames, another consumes inbound JSON control messages.

use std::{collections::HashSet, sync::Arc, time::Instant};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde_derive::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};
use vibetunnel_protocol::BufferFrame;

use crate::{
    consts::{TERMINAL_IDLE_TIMEOUT, WS_PING_INTERVAL, WS_SEND_QUEUE_DEPTH},
    server::AppState,
};

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientMessage {
    Subscribe {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Unsubscribe {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Ping,
}

#[derive(Serialize, Debug)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ServerMessage {
    Connected { version: &'static str },
    Pong,
}

/// What the outbound task forwards to the socket: either a pre-encoded
/// binary snapshot frame, or a JSON control reply (currently only `pong`).
#[derive(Clone)]
pub enum Outbound {
    Frame(Vec<u8>),
    Control(String),
    Ping,
    Close,
}

/// Handles one `/buffers` connection end to end: greets the client, then
/// runs the inbound-control and outbound-frame halves concurrently until
/// either side closes.
#[instrument(skip_all)]
pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    let greeting = serde_json::to_string(&ServerMessage::Connected { version: "1" }).unwrap();
    if sink.send(Message::Text(greeting)).await.is_err() {
        return;
    }

    let (tx, mut rx) = mpsc::channel::<Outbound>(WS_SEND_QUEUE_DEPTH);
    let subscriptions: Arc<std::sync::Mutex<HashSet<String>>> = Arc::new(std::sync::Mutex::new(HashSet::new()));
    let last_pong: Arc<std::sync::Mutex<Instant>> = Arc::new(std::sync::Mutex::new(Instant::now()));

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Outbound::Close);
            let ws_msg = match msg {
                Outbound::Frame(bytes) => Message::Binary(bytes),
                Outbound::Control(text) => Message::Text(text),
                Outbound::Ping => Message::Ping(Vec::new()),
                Outbound::Close => Message::Close(None),
            };
            if sink.send(ws_msg).await.is_err() || is_close {
                break;
            }
        }
    });

    let recv_subs = subscriptions.clone();
    let recv_state = state.clone();
    let recv_tx = tx.clone();
    let recv_last_pong = last_pong.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = stream.next().await {
            match msg {
                Message::Text(text) => {
                    handle_control_message(&text, &recv_subs, &recv_state, &recv_tx).await;
                }
                Message::Pong(_) => {
                    *recv_last_pong.lock().unwrap() = Instant::now();
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Server-initiated keepalive per spec §5: ping every WS_PING_INTERVAL and
    // close once two consecutive pings go by without a pong in between.
    let ping_tx = tx.clone();
    let mut ping_task = tokio::spawn(async move {
        let mut missed = 0u32;
        loop {
            tokio::time::sleep(WS_PING_INTERVAL).await;
            if ping_tx.send(Outbound::Ping).await.is_err() {
                break;
            }
            if last_pong.lock().unwrap().elapsed() >= WS_PING_INTERVAL {
                missed += 1;
                if missed >= 2 {
                    warn!("closing /buffers connection after two missed pongs");
                    let _ = ping_tx.send(Outbound::Close).await;
                    break;
                }
            } else {
                missed = 0;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {}
        _ = &mut recv_task => {}
        _ = &mut ping_task => {}
    }
    send_task.abort();
    recv_task.abort();
    ping_task.abort();

    for id in subscriptions.lock().unwrap().drain() {
        state.buffer_hub.unsubscribe(&id, &tx);
    }
}

async fn handle_control_message(
    text: &str,
    subscriptions: &Arc<std::sync::Mutex<HashSet<String>>>,
    state: &AppState,
    tx: &mpsc::Sender<Outbound>,
) {
    let parsed: Result<ClientMessage, _> = serde_json::from_str(text);
    match parsed {
        Ok(ClientMessage::Subscribe { session_id }) => {
            let is_new = subscriptions.lock().unwrap().insert(session_id.clone());
            if is_new {
                state.buffer_hub.subscribe(session_id.clone(), tx.clone());
                if let Some(bytes) = state.snapshot_now(&session_id).await {
                    let _ = tx.try_send(Outbound::Frame(encode_frame(&session_id, bytes)));
                } else if let Some(remote) = state.federation.owner_of(&session_id) {
                    state.upstream_proxies.ensure_subscribed(state.buffer_hub.clone(), remote, session_id.clone());
                }
                ensure_forwarder(state, &session_id);
            }
        }
        Ok(ClientMessage::Unsubscribe { session_id }) => {
            if subscriptions.lock().unwrap().remove(&session_id) {
                state.buffer_hub.unsubscribe(&session_id, tx);
            }
        }
        Ok(ClientMessage::Ping) => {
            let pong = serde_json::to_string(&ServerMessage::Pong).unwrap();
            let _ = tx.try_send(Outbound::Control(pong));
        }
        Err(e) => warn!(error = %e, "malformed /buffers control message"),
    }
}

/// Tracks, per session id, which clients' outbound channels want frames for
/// it. A session with no subscribers is simply absent from the map.
#[derive(Clone, Default)]
pub struct BufferHub {
    inner: Arc<std::sync::Mutex<std::collections::HashMap<String, Vec<mpsc::Sender<Outbound>>>>>,
    forwarding: Arc<std::sync::Mutex<HashSet<String>>>,
}

impl BufferHub {
    pub fn new() -> Self {
        BufferHub::default()
    }

    pub fn subscribe(&self, session_id: String, tx: mpsc::Sender<Outbound>) {
        self.inner.lock().unwrap().entry(session_id).or_default().push(tx);
    }

    pub fn unsubscribe(&self, session_id: &str, tx: &mpsc::Sender<Outbound>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(list) = inner.get_mut(session_id) {
            list.retain(|t| !t.same_channel(tx));
            if list.is_empty() {
                inner.remove(session_id);
            }
        }
    }

    pub fn has_subscribers(&self, session_id: &str) -> bool {
        self.inner.lock().unwrap().get(session_id).map(|v| !v.is_empty()).unwrap_or(false)
    }

    /// Pushes a pre-encoded frame to every current subscriber of
    /// `session_id`. Uses `try_send` so a client with a full queue loses the
    /// oldest-equivalent frame rather than stalling every other session's
    /// fan-out (spec §4.7 backpressure: snapshots are idempotent so a
    /// dropped frame is superseded by the next one).
    #[instrument(skip(self, bytes))]
    pub fn publish(&self, session_id: &str, bytes: Vec<u8>) {
        let senders = {
            let inner = self.inner.lock().unwrap();
            match inner.get(session_id) {
                Some(list) => list.clone(),
                None => return,
            }
        };
        for tx in senders {
            if tx.try_send(Outbound::Frame(bytes.clone())).is_err() {
                debug!(session = %session_id, "dropping buffer frame, client queue full or closed");
            }
        }
    }
}

pub fn encode_frame(session_id: &str, snapshot: Vec<u8>) -> Vec<u8> {
    BufferFrame { session_id: session_id.to_string(), snapshot }.encode()
}

/// Starts the per-session task that pushes a frame to every `/buffers`
/// subscriber of `session_id` whenever C4 raises its debounced "changed"
/// signal, per spec §4.7. At most one forwarder runs per session at a time;
/// it exits (and releases the terminal model) once the last subscriber
/// unsubscribes, matching the idle-teardown behaviour the model itself
/// already provides.
fn ensure_forwarder(state: &AppState, session_id: &str) {
    {
        let mut forwarding = state.buffer_hub.forwarding.lock().unwrap();
        if forwarding.contains(session_id) {
            return;
        }
        forwarding.insert(session_id.to_string());
    }

    let state = state.clone();
    let id = session_id.to_string();
    tokio::spawn(async move {
        let Ok(Some(row)) = state.store.get(&id) else {
            state.buffer_hub.forwarding.lock().unwrap().remove(&id);
            return;
        };
        let model = state.terminals.acquire(&id, row.width, row.height);
        let mut changed = model.subscribe_changed();

        loop {
            tokio::select! {
                res = changed.changed() => {
                    if res.is_err() {
                        break;
                    }
                    if !state.buffer_hub.has_subscribers(&id) {
                        break;
                    }
                    let bytes = encode_frame(&id, model.grid_snapshot().encode());
                    state.buffer_hub.publish(&id, bytes);
                }
                _ = tokio::time::sleep(TERMINAL_IDLE_TIMEOUT) => {
                    if !state.buffer_hub.has_subscribers(&id) {
                        break;
                    }
                }
            }
        }

        state.terminals.release(&id);
        state.buffer_hub.forwarding.lock().unwrap().remove(&id);
    });
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_only_subscribed_clients() {
        let hub = BufferHub::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        hub.subscribe("s1".into(), tx_a.clone());
        hub.subscribe("s2".into(), tx_b.clone());

        hub.publish("s1", vec![1, 2, 3]);

        match rx_a.try_recv().unwrap() {
            Outbound::Frame(bytes) => assert_eq!(bytes, vec![1, 2, 3]),
            _ => panic!("expected a frame"),
        }
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_removes_the_session_entry_once_empty() {
        let hub = BufferHub::new();
        let (tx, _rx) = mpsc::channel(4);
        hub.subscribe("s1".into(), tx.clone());
        assert!(hub.has_subscribers("s1"));
        hub.unsubscribe("s1", &tx);
        assert!(!hub.has_subscribers("s1"));
    }
}
