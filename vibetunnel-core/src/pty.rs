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

//! The PTY Host: spawns child processes under a pseudo-terminal, relays
//! their output to a callback, enforces resize, and delivers exit exactly
//! once to every observer.

use std::{
    collections::HashMap,
    io::{Read, Write},
    sync::{Arc, Mutex},
    time::Duration,
};

use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tracing::{error, info, instrument, warn};

use crate::{error::VtError, keys};

const MIN_DIM: u32 = 1;
const MAX_DIM: u32 = 1000;
const KILL_GRACE: Duration = Duration::from_secs(3);

/// Notifies every waiter of a child's exit status exactly once. Grounded on
/// the daemon's `ExitNotifier`: a `Condvar` guarding an `Option<i32>` slot.
#[derive(Debug, Default)]
pub struct ExitNotifier {
    slot: Mutex<Option<i32>>,
    cond: std::sync::Condvar,
}

impl ExitNotifier {
    pub fn new() -> Self {
        ExitNotifier { slot: Mutex::new(None), cond: std::sync::Condvar::new() }
    }

    pub fn notify_exit(&self, status: i32) {
        let mut slot = self.slot.lock().unwrap();
        if slot.is_some() {
            return;
        }
        *slot = Some(status);
        self.cond.notify_all();
    }

    pub fn wait(&self, timeout: Option<Duration>) -> Option<i32> {
        let slot = self.slot.lock().unwrap();
        if slot.is_some() {
            return *slot;
        }
        match timeout {
            Some(t) => {
                let (status, res) =
                    self.cond.wait_timeout_while(slot, t, |s| s.is_none()).unwrap();
                if res.timed_out() {
                    None
                } else {
                    *status
                }
            }
            None => *self.cond.wait_while(slot, |s| s.is_none()).unwrap(),
        }
    }

    pub fn try_get(&self) -> Option<i32> {
        *self.slot.lock().unwrap()
    }
}

/// A live PTY-backed child process. Cloning shares the handle: all clones
/// observe the same process and the same `ExitNotifier`.
#[derive(Clone)]
pub struct PtyHandle {
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn Child + Send>>>,
    pub pid: Option<u32>,
    pub exit_notifier: Arc<ExitNotifier>,
    resize_disabled: bool,
}

impl PtyHandle {
    /// Forwards bytes verbatim to the child's stdin. The PTY Host MUST NOT
    /// transform the payload; special-key translation happens before this
    /// call, in [`translate_key`] / at the API boundary.
    pub fn write(&self, bytes: &[u8]) -> Result<(), VtError> {
        let mut w = self.writer.lock().unwrap();
        w.write_all(bytes).map_err(VtError::FileSystemError)?;
        w.flush().map_err(VtError::FileSystemError)?;
        Ok(())
    }

    pub fn resize(&self, cols: u32, rows: u32) -> Result<(), VtError> {
        if self.resize_disabled {
            return Err(VtError::ResizeDisabled);
        }
        if !(MIN_DIM..=MAX_DIM).contains(&cols) || !(MIN_DIM..=MAX_DIM).contains(&rows) {
            return Err(VtError::InvalidDimensions(cols, rows));
        }
        let master = self.master.lock().unwrap();
        master
            .resize(PtySize { rows: rows as u16, cols: cols as u16, pixel_width: 0, pixel_height: 0 })
            .map_err(|e| VtError::Internal(anyhow::anyhow!("resize failed: {e}")))
    }

    /// Sends `SIGTERM`, then `SIGKILL` after [`KILL_GRACE`] if the child is
    /// still alive. Idempotent once the child has exited.
    pub fn kill(&self) {
        if self.exit_notifier.try_get().is_some() {
            return;
        }
        let sent_term = match self.pid {
            Some(pid) => signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok(),
            None => false,
        };
        if sent_term && self.exit_notifier.wait(Some(KILL_GRACE)).is_some() {
            return;
        }
        if !sent_term {
            warn!(pid = ?self.pid, "no pid to SIGTERM, escalating straight to SIGKILL");
        } else {
            warn!(pid = ?self.pid, "child did not exit after SIGTERM grace period, sending SIGKILL");
        }
        let mut child = self.child.lock().unwrap();
        let _ = child.kill();
    }

    pub fn is_alive(&self) -> bool {
        self.exit_notifier.try_get().is_none()
    }
}

pub struct SpawnArgs<'a> {
    pub argv: &'a [String],
    pub cwd: &'a str,
    pub env: &'a HashMap<String, String>,
    pub cols: u32,
    pub rows: u32,
    pub term: &'a str,
    pub resize_disabled: bool,
}

/// Spawns a child process attached to a fresh pseudo-terminal and starts a
/// dedicated background thread that blocks on reads from the master side,
/// forwarding each chunk to `on_output`. Exactly one exit record is produced:
/// a final call to `on_output`'s companion `on_exit` callback once the reader
/// loop observes EOF and the child-reaper thread records the exit status.
#[instrument(skip_all, fields(argv = ?args.argv))]
pub fn spawn(
    args: SpawnArgs<'_>,
    on_output: impl Fn(&[u8]) + Send + 'static,
    on_exit: impl FnOnce(i32) + Send + 'static,
) -> Result<PtyHandle, VtError> {
    if !(MIN_DIM..=MAX_DIM).contains(&args.cols) || !(MIN_DIM..=MAX_DIM).contains(&args.rows) {
        return Err(VtError::InvalidDimensions(args.cols, args.rows));
    }

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize { rows: args.rows as u16, cols: args.cols as u16, pixel_width: 0, pixel_height: 0 })
        .map_err(|e| VtError::PtyCreationFailed(e.to_string()))?;

    let mut cmd = CommandBuilder::new(&args.argv[0]);
    cmd.args(&args.argv[1..]);
    cmd.cwd(args.cwd);
    cmd.env_clear();
    for (k, v) in args.env {
        cmd.env(k, v);
    }
    cmd.env("TERM", args.term);

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| VtError::PtyCreationFailed(e.to_string()))?;
    let pid = child.process_id();
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| VtError::PtyCreationFailed(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| VtError::PtyCreationFailed(e.to_string()))?;

    let exit_notifier = Arc::new(ExitNotifier::new());
    let child = Arc::new(Mutex::new(child));

    spawn_reader_thread(reader, on_output, exit_notifier.clone(), child.clone(), on_exit);

    Ok(PtyHandle {
        master: Arc::new(Mutex::new(pair.master)),
        writer: Arc::new(Mutex::new(writer)),
        child,
        pid,
        exit_notifier,
        resize_disabled: args.resize_disabled,
    })
}

fn spawn_reader_thread(
    mut reader: Box<dyn Read + Send>,
    on_output: impl Fn(&[u8]) + Send + 'static,
    exit_notifier: Arc<ExitNotifier>,
    child: Arc<Mutex<Box<dyn Child + Send>>>,
    on_exit: impl FnOnce(i32) + Send + 'static,
) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 16 * 1024];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => on_output(&buf[..n]),
                Err(e) => {
                    error!("pty read error, treating as eof: {}", e);
                    break;
                }
            }
        }

        let status = {
            let mut child = child.lock().unwrap();
            match child.wait() {
                Ok(status) => status.exit_code() as i32,
                Err(e) => {
                    error!("error waiting on child, reporting synthetic exit code 1: {}", e);
                    1
                }
            }
        };

        info!(exit_code = status, "session child exited");
        exit_notifier.notify_exit(status);
        on_exit(status);
    });
}

/// Translates a special key name into the VT100 byte sequence a shell
/// expects, per the external-interface key table.
pub fn translate_key(name: &str) -> Result<Vec<u8>, VtError> {
    keys::translate(name)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_out_of_bounds_dimensions_before_spawn() {
        let env = HashMap::new();
        let args = SpawnArgs {
            argv: &["true".to_string()],
            cwd: "/",
            env: &env,
            cols: 0,
            rows: 24,
            term: "xterm",
            resize_disabled: false,
        };
        let err = spawn(args, |_| {}, |_| {}).unwrap_err();
        assert!(matches!(err, VtError::InvalidDimensions(0, 24)));
    }

    #[test]
    fn exit_notifier_fires_once() {
        let notifier = ExitNotifier::new();
        notifier.notify_exit(0);
        notifier.notify_exit(1); // should be ignored, first write wins
        assert_eq!(notifier.try_get(), Some(0));
        assert_eq!(notifier.wait(Some(Duration::from_millis(10))), Some(0));
    }
}
