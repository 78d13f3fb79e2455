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

//! vibetunnel-core implements the VibeTunnel server: PTY hosting (C1),
//! on-disk session persistence (C2), the control-dir watcher (C3), VT100
//! terminal emulation (C4), SSE/WebSocket fan-out (C6/C7), HQ/remote
//! federation (C8), and the HTTP session API (C9) that composes them.
//!
//! [`run`] is the process-level entry point a wrapping binary calls after
//! parsing its own command-line flags; everything else is exposed for
//! integration tests that want to drive individual components directly.

use std::io;

use tracing_subscriber::fmt::format::FmtSpan;

pub mod api;
pub mod auth;
pub mod buffers;
pub mod config;
pub mod consts;
pub mod error;
pub mod federation;
pub mod keys;
pub mod pty;
pub mod server;
pub mod store;
pub mod terminal;
pub mod textstream;
pub mod watcher;

pub use config::{read_config, Config};
pub use error::VtError;
pub use server::{serve, AppState};

/// Installs a `tracing-subscriber` formatter at the given verbosity. `0` maps
/// to `INFO`, `1` to `DEBUG`, and anything higher to `TRACE`, matching the
/// teacher's own `-v`/`-vv` convention.
pub fn init_logging(verbose: u8, log_file: Option<&str>) -> anyhow::Result<()> {
    let trace_level = if verbose == 0 {
        tracing::Level::INFO
    } else if verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };

    match log_file {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            tracing_subscriber::fmt()
                .with_max_level(trace_level)
                .with_thread_ids(true)
                .with_target(false)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_max_level(trace_level)
                .with_thread_ids(true)
                .with_target(false)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_writer(io::stderr)
                .init();
        }
    }

    Ok(())
}

/// Reads configuration (explicit file, `~/.config/vibetunnel/config.toml`,
/// then environment overrides per spec §6), installs logging, and runs the
/// server until a shutdown signal. This is the single entry point the
/// `vibetunnel` binary crate calls.
pub async fn run(config_file: Option<String>, verbose: u8, log_file: Option<String>) -> anyhow::Result<()> {
    init_logging(verbose, log_file.as_deref())?;
    let config = read_config(&config_file)?;
    serve(config).await
}
