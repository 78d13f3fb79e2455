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

//! The Text Stream Fan-out: an append-only, asciinema-compatible SSE view of
//! a session's `stream-out`, per spec §4.6. Every subscriber tails the file
//! independently from byte zero, so a late attacher always replays the full
//! history before seeing anything new — there is no shared broadcast buffer
//! to get out of sync with the file that remains the single source of truth.

use std::{collections::VecDeque, convert::Infallible, time::Instant};

use axum::response::sse::{Event, KeepAlive, Sse};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::{stream::Stream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::warn;

use crate::{
    consts::{SSE_HEARTBEAT_INTERVAL, TAIL_POLL_INTERVAL},
    error::VtError,
    store::SessionStore,
};

struct TailState {
    path: std::path::PathBuf,
    pos: u64,
    carry: String,
    pending: VecDeque<String>,
    last_emit: Instant,
    max_bytes: Option<u64>,
    truncated: bool,
}

/// Builds the SSE response for `GET /api/sessions/:id/stream`. The returned
/// stream never terminates on its own (short of truncation or a vanished
/// file) — it is up to the client, or axum's connection teardown on client
/// disconnect, to end it.
pub fn stream_session(
    store: SessionStore,
    id: String,
    max_stream_file_bytes: Option<u64>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, VtError> {
    if !store.exists(&id) {
        return Err(VtError::SessionNotFound);
    }

    let state = TailState {
        path: store.stream_out_path(&id),
        pos: 0,
        carry: String::new(),
        pending: VecDeque::new(),
        last_emit: Instant::now(),
        max_bytes: max_stream_file_bytes,
        truncated: false,
    };

    let events = futures::stream::unfold(state, move |state| {
        let id = id.clone();
        async move { next_event(state, id).await }
    })
    .map(Ok);

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(SSE_HEARTBEAT_INTERVAL)))
}

async fn next_event(mut state: TailState, id: String) -> Option<(Event, TailState)> {
    loop {
        if let Some(line) = state.pending.pop_front() {
            state.last_emit = Instant::now();
            return Some((Event::default().data(BASE64.encode(line)), state));
        }
        if state.truncated {
            return None;
        }

        match refill(&mut state).await {
            Ok(true) => continue,
            Ok(false) => {
                tokio::time::sleep(TAIL_POLL_INTERVAL).await;
                if state.last_emit.elapsed() >= SSE_HEARTBEAT_INTERVAL {
                    state.last_emit = Instant::now();
                    return Some((Event::default().comment("heartbeat"), state));
                }
            }
            Err(()) => {
                warn!(session = %id, "stream-out truncated or exceeded the configured maximum, closing stream");
                return None;
            }
        }
    }
}

/// Reads whatever new bytes are available, splitting complete lines into
/// `pending`. Returns `Ok(true)` if at least one new line became available,
/// `Ok(false)` if there was nothing new (or only a partial line), and
/// `Err(())` on truncation or a configured size overrun.
async fn refill(state: &mut TailState) -> Result<bool, ()> {
    let mut file = match tokio::fs::File::open(&state.path).await {
        Ok(f) => f,
        Err(_) => return Ok(false),
    };
    let len = file.metadata().await.map_err(|_| ())?.len();
    if let Some(max) = state.max_bytes {
        if len > max {
            state.truncated = true;
            return Err(());
        }
    }
    if len < state.pos {
        state.truncated = true;
        return Err(());
    }
    if len == state.pos {
        return Ok(false);
    }

    file.seek(std::io::SeekFrom::Start(state.pos)).await.map_err(|_| ())?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await.map_err(|_| ())?;
    state.pos += buf.len() as u64;
    state.carry.push_str(&String::from_utf8_lossy(&buf));

    let mut found_any = false;
    while let Some(idx) = state.carry.find('\n') {
        let line = state.carry[..idx].to_string();
        state.carry.replace_range(..=idx, "");
        if !line.is_empty() {
            state.pending.push_back(line);
            found_any = true;
        }
    }
    Ok(found_any)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::new_session_row;
    use tempfile::tempdir;

    #[tokio::test]
    async fn replays_history_in_file_order() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf()).unwrap();
        let id = uuid::Uuid::new_v4().to_string();
        let row = new_session_row(id.clone(), "t".into(), vec!["sh".into()], "/tmp".into(), "xterm".into(), 80, 24);
        store.create_session_dir(&row).unwrap();
        store.append_stream_out(&id, "line-one").unwrap();
        store.append_stream_out(&id, "line-two").unwrap();

        let mut state = TailState {
            path: store.stream_out_path(&id),
            pos: 0,
            carry: String::new(),
            pending: VecDeque::new(),
            last_emit: Instant::now(),
            max_bytes: None,
            truncated: false,
        };

        assert!(refill(&mut state).await.unwrap());
        assert_eq!(state.pending.pop_front().unwrap(), "line-one");
        assert_eq!(state.pending.pop_front().unwrap(), "line-two");
    }

    #[tokio::test]
    async fn truncation_is_reported_as_an_error() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf()).unwrap();
        let id = uuid::Uuid::new_v4().to_string();
        let row = new_session_row(id.clone(), "t".into(), vec!["sh".into()], "/tmp".into(), "xterm".into(), 80, 24);
        store.create_session_dir(&row).unwrap();
        store.append_stream_out(&id, "line-one").unwrap();

        let mut state = TailState {
            path: store.stream_out_path(&id),
            pos: 1000, // pretend we'd already read past the file's current length
            carry: String::new(),
            pending: VecDeque::new(),
            last_emit: Instant::now(),
            max_bytes: None,
            truncated: false,
        };
        assert!(refill(&mut state).await.is_err());
    }

    #[test]
    fn unknown_session_is_not_found() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf()).unwrap();
        let err = stream_session(store, "11111111-1111-1111-1111-111111111111".into(), None).unwrap_err();
        assert!(matches!(err, VtError::SessionNotFound));
    }
}
