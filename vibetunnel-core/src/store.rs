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

//! The Session Store: owns the on-disk control directory, the atomic
//! `session.json` writes, and zombie reconciliation. In-memory it also keeps
//! a table of live [`crate::pty::PtyHandle`]s for sessions this node itself
//! spawned, mirroring the daemon's `shells: Arc<Mutex<HashMap<...>>>` table.

use std::{
    collections::HashMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use vibetunnel_protocol::{SessionRow, SessionStatus};

use crate::{error::VtError, pty::PtyHandle};

const SESSION_JSON: &str = "session.json";
const STREAM_OUT: &str = "stream-out";
const STDIN_FIFO: &str = "stdin";
const CONTROL_FIFO: &str = "control";

/// Live, in-process state for a session this node spawned: the PTY handle
/// plus anything else that only makes sense while the process is running.
pub struct LiveSession {
    pub handle: PtyHandle,
}

#[derive(Clone)]
pub struct SessionStore {
    root: PathBuf,
    live: Arc<Mutex<HashMap<String, LiveSession>>>,
}

impl SessionStore {
    pub fn new(root: PathBuf) -> anyhow::Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(SessionStore { root, live: Arc::new(Mutex::new(HashMap::new())) })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Creates the session directory and its FIFO placeholders, and persists
    /// the initial `session.json`. Unix FIFOs are used when available;
    /// non-Unix platforms fall back to plain files so the directory layout
    /// invariant still holds.
    #[instrument(skip(self, row))]
    pub fn create_session_dir(&self, row: &SessionRow) -> anyhow::Result<()> {
        let dir = self.session_dir(&row.id);
        fs::create_dir_all(&dir)?;
        make_fifo_or_file(&dir.join(STDIN_FIFO))?;
        make_fifo_or_file(&dir.join(CONTROL_FIFO))?;
        fs::File::create(dir.join(STREAM_OUT))?;
        self.write_session_json(row)?;
        Ok(())
    }

    /// Writes `session.json` atomically via temp-file-then-rename so that
    /// concurrent readers never observe a torn write.
    pub fn write_session_json(&self, row: &SessionRow) -> anyhow::Result<()> {
        let dir = self.session_dir(&row.id);
        let final_path = dir.join(SESSION_JSON);
        let tmp_path = dir.join(format!(".{SESSION_JSON}.tmp-{}", Uuid::new_v4()));

        let json = serde_json::to_vec_pretty(row)?;
        {
            let mut f = fs::File::create(&tmp_path)?;
            f.write_all(&json)?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    pub fn read_session_json(&self, id: &str) -> anyhow::Result<Option<SessionRow>> {
        let path = self.session_dir(id).join(SESSION_JSON);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    pub fn stream_out_path(&self, id: &str) -> PathBuf {
        self.session_dir(id).join(STREAM_OUT)
    }

    pub fn append_stream_out(&self, id: &str, line: &str) -> anyhow::Result<()> {
        let mut f = fs::OpenOptions::new().append(true).create(true).open(self.stream_out_path(id))?;
        writeln!(f, "{line}")?;
        Ok(())
    }

    pub fn register_live(&self, id: String, handle: PtyHandle) {
        self.live.lock().unwrap().insert(id, LiveSession { handle });
    }

    pub fn live_handle(&self, id: &str) -> Option<PtyHandle> {
        self.live.lock().unwrap().get(id).map(|s| s.handle.clone())
    }

    pub fn remove_live(&self, id: &str) {
        self.live.lock().unwrap().remove(id);
    }

    /// Enumerates every session directory whose name is a syntactically
    /// valid UUID and which contains a readable `session.json`, performing
    /// zombie reconciliation along the way: a row claiming `running` whose
    /// pid is not live is rewritten to `exited` with exit code 1. Sorted
    /// newest-first by `startedAt`.
    #[instrument(skip(self))]
    pub fn list(&self) -> anyhow::Result<Vec<SessionRow>> {
        let mut rows = Vec::new();
        if !self.root.exists() {
            return Ok(rows);
        }
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if Uuid::parse_str(&name).is_err() {
                continue;
            }
            match self.read_session_json(&name) {
                Ok(Some(mut row)) => {
                    self.reconcile_if_zombie(&mut row);
                    rows.push(row);
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!(session = %name, error = %e, "skipping unreadable session.json");
                }
            }
        }
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(rows)
    }

    pub fn get(&self, id: &str) -> anyhow::Result<Option<SessionRow>> {
        let mut row = self.read_session_json(id)?;
        if let Some(row) = row.as_mut() {
            self.reconcile_if_zombie(row);
        }
        Ok(row)
    }

    fn reconcile_if_zombie(&self, row: &mut SessionRow) {
        if row.status != SessionStatus::Running {
            return;
        }
        let live = self.live.lock().unwrap().contains_key(&row.id);
        let pid_alive = row.pid.map(pid_is_alive).unwrap_or(false);
        if live || pid_alive {
            return;
        }
        info!(session = %row.id, "reconciling zombie session to exited");
        row.status = SessionStatus::Exited;
        row.exit_code = Some(1);
        if let Err(e) = self.write_session_json(row) {
            warn!(session = %row.id, error = %e, "failed to persist zombie reconciliation");
        }
    }

    /// Deletes a session directory recursively. A best-effort `SIGTERM` is
    /// sent to any still-running local process first. Missing directories
    /// are treated as already-removed, not an error.
    #[instrument(skip(self))]
    pub fn remove_session(&self, id: &str) -> anyhow::Result<()> {
        if let Some(live) = self.live.lock().unwrap().remove(id) {
            live.handle.kill();
        }
        let dir = self.session_dir(id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Cleans every row whose status is `exited`, returning the ids that
    /// were removed.
    #[instrument(skip(self))]
    pub fn remove_all_exited(&self) -> anyhow::Result<Vec<String>> {
        let mut cleaned = Vec::new();
        for row in self.list()? {
            if row.status == SessionStatus::Exited {
                self.remove_session(&row.id)?;
                cleaned.push(row.id);
            }
        }
        Ok(cleaned)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.session_dir(id).join(SESSION_JSON).exists()
    }
}

/// Kills the child of a running session without touching its on-disk
/// directory, so a subsequent `GET` still reports the row (now `exited`,
/// via the reader thread's own exit callback) and a subsequent `DELETE`
/// reports it as already exited rather than not found. The directory is
/// only ever removed by an explicit cleanup call.
pub async fn kill_or_already_exited(store: &SessionStore, id: &str) -> Result<(), VtError> {
    let row = store.get(id).map_err(VtError::Internal)?.ok_or(VtError::SessionNotFound)?;
    if row.status == SessionStatus::Exited {
        return Err(VtError::SessionAlreadyExited);
    }
    if let Some(live) = store.live_handle(id) {
        tokio::task::spawn_blocking(move || live.kill()).await.map_err(|e| VtError::Internal(e.into()))?;
    }
    Ok(())
}

#[cfg(unix)]
fn pid_is_alive(pid: i32) -> bool {
    // Signal 0 performs no action but still validates that the process
    // exists and is reachable; this is the conventional Unix liveness check.
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: i32) -> bool {
    false
}

#[cfg(unix)]
fn make_fifo_or_file(path: &Path) -> anyhow::Result<()> {
    use nix::{sys::stat::Mode, unistd::mkfifo};
    if path.exists() {
        return Ok(());
    }
    mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_fifo_or_file(path: &Path) -> anyhow::Result<()> {
    fs::File::create(path)?;
    Ok(())
}

pub fn new_session_row(
    id: String,
    name: String,
    cmdline: Vec<String>,
    cwd: String,
    term: String,
    width: u32,
    height: u32,
) -> SessionRow {
    SessionRow {
        id,
        name,
        cmdline,
        cwd,
        pid: None,
        status: SessionStatus::Starting,
        exit_code: None,
        started_at: Utc::now(),
        term,
        width,
        height,
        env: None,
        source: None,
        remote_id: None,
        remote_name: None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    fn sample_row(id: &str) -> SessionRow {
        new_session_row(
            id.to_string(),
            "test".to_string(),
            vec!["sh".to_string()],
            "/tmp".to_string(),
            "xterm".to_string(),
            80,
            24,
        )
    }

    #[test]
    fn create_and_read_round_trips() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf()).unwrap();
        let id = Uuid::new_v4().to_string();
        let row = sample_row(&id);
        store.create_session_dir(&row).unwrap();

        let back = store.get(&id).unwrap().unwrap();
        assert_eq!(back.id, id);
        assert_eq!(back.status, SessionStatus::Starting);
    }

    #[test]
    fn listing_contains_exactly_one_row_per_session() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf()).unwrap();
        let id1 = Uuid::new_v4().to_string();
        let id2 = Uuid::new_v4().to_string();
        store.create_session_dir(&sample_row(&id1)).unwrap();
        store.create_session_dir(&sample_row(&id2)).unwrap();

        let rows = store.list().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.id == id1));
        assert!(rows.iter().any(|r| r.id == id2));
    }

    #[test]
    fn zombie_row_is_reconciled_to_exited() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf()).unwrap();
        let id = Uuid::new_v4().to_string();
        let mut row = sample_row(&id);
        row.status = SessionStatus::Running;
        row.pid = Some(i32::MAX - 1); // exceedingly unlikely to be a live pid
        store.create_session_dir(&row).unwrap();

        let back = store.get(&id).unwrap().unwrap();
        assert_eq!(back.status, SessionStatus::Exited);
        assert_eq!(back.exit_code, Some(1));
    }

    #[test]
    fn remove_all_exited_only_cleans_exited_rows() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf()).unwrap();
        let exited_id = Uuid::new_v4().to_string();
        let mut exited = sample_row(&exited_id);
        exited.status = SessionStatus::Exited;
        exited.exit_code = Some(0);
        store.create_session_dir(&exited).unwrap();

        let running_id = Uuid::new_v4().to_string();
        let mut running = sample_row(&running_id);
        running.status = SessionStatus::Starting;
        store.create_session_dir(&running).unwrap();

        let cleaned = store.remove_all_exited().unwrap();
        assert_eq!(cleaned, vec![exited_id.clone()]);
        assert!(!store.exists(&exited_id));
        assert!(store.exists(&running_id));
    }

    #[test]
    fn missing_directory_is_not_an_error_on_remove() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf()).unwrap();
        store.remove_session("11111111-1111-1111-1111-111111111111").unwrap();
    }
}
