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

//! The Control-Dir Watcher: notices directories an external process (the
//! forwarding CLI mentioned in spec §4.3) dropped into the control root
//! without going through this node's own Session API, and makes them visible
//! as ordinary sessions once their `session.json` shows up.
//!
//! [`SessionStore::list`]/`get` already scan the control root on demand, so a
//! directory with a valid `session.json` is already "registered" the moment
//! it is readable — this watcher's job is to notice the *new* ones promptly
//! (rather than waiting for the next client-initiated list) and broadcast
//! their arrival so other subsystems (e.g. a UI wanting live updates) can
//! react without polling.

use std::{collections::HashSet, time::Instant};

use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    consts::{WATCHER_SCAN_INTERVAL, WATCHER_SESSION_JSON_TIMEOUT},
    store::SessionStore,
};

/// Announces newly-discovered externally-created sessions. Lagging
/// subscribers simply miss old announcements; the store's own listing
/// remains the source of truth.
#[derive(Clone)]
pub struct ControlDirWatcher {
    discovered_tx: broadcast::Sender<String>,
}

impl ControlDirWatcher {
    pub fn new() -> Self {
        let (discovered_tx, _) = broadcast::channel(64);
        ControlDirWatcher { discovered_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.discovered_tx.subscribe()
    }

    /// Spawns the background scan loop. Runs until the process exits; there
    /// is no explicit shutdown handle since the watcher holds no resources
    /// worth releasing early (it never creates anything, only reads).
    #[instrument(skip_all)]
    pub fn spawn(self, store: SessionStore) {
        tokio::spawn(async move {
            let mut known: HashSet<String> = store.list().map(|rows| rows.into_iter().map(|r| r.id).collect()).unwrap_or_default();

            loop {
                tokio::time::sleep(WATCHER_SCAN_INTERVAL).await;

                let entries = match std::fs::read_dir(store.root()) {
                    Ok(entries) => entries,
                    Err(e) => {
                        warn!(error = %e, "control dir watcher: could not scan control root");
                        continue;
                    }
                };

                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if known.contains(&name) || Uuid::parse_str(&name).is_err() {
                        continue;
                    }

                    let store = store.clone();
                    let tx = self.discovered_tx.clone();
                    let id = name.clone();
                    known.insert(name);
                    tokio::spawn(await_and_announce(store, id, tx));
                }
            }
        });
    }
}

impl Default for ControlDirWatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Polls for `session.json` inside a freshly-noticed directory for up to
/// [`WATCHER_SESSION_JSON_TIMEOUT`], announcing the session id once it is
/// readable. Gives up silently if the directory never gets a valid
/// `session.json` in time (it may have been a transient mkdir from an
/// unrelated process).
async fn await_and_announce(store: SessionStore, id: String, tx: broadcast::Sender<String>) {
    let deadline = Instant::now() + WATCHER_SESSION_JSON_TIMEOUT;
    loop {
        match store.read_session_json(&id) {
            Ok(Some(_)) => {
                info!(session = %id, "control dir watcher: discovered externally-created session");
                let _ = tx.send(id);
                return;
            }
            Ok(None) => {}
            Err(e) => debug!(session = %id, error = %e, "control dir watcher: session.json not yet readable"),
        }
        if Instant::now() >= deadline {
            debug!(session = %id, "control dir watcher: gave up waiting for session.json");
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::new_session_row;
    use tempfile::tempdir;

    #[tokio::test]
    async fn announces_externally_created_session() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf()).unwrap();
        let watcher = ControlDirWatcher::new();
        let mut rx = watcher.subscribe();
        watcher.clone().spawn(store.clone());

        let id = Uuid::new_v4().to_string();
        let row = new_session_row(
            id.clone(),
            "external".into(),
            vec!["sh".into()],
            "/tmp".into(),
            "xterm".into(),
            80,
            24,
        );
        // Simulate an external forwarding CLI creating the directory itself.
        store.create_session_dir(&row).unwrap();

        let announced = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv()).await;
        assert_eq!(announced.unwrap().unwrap(), id);
    }
}
