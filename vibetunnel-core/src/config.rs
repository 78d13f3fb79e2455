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

use std::{env, fs, path::PathBuf};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{info, instrument};

#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({})", config_path);
        let config_str = fs::read_to_string(config_path).context("reading config toml")?;
        config = toml::from_str(&config_str).context("parsing config file")?;
    } else if let Some(home) = dirs_home() {
        let mut config_path = PathBuf::from(home);
        config_path.push(".config");
        config_path.push("vibetunnel");
        config_path.push("config.toml");
        if config_path.exists() {
            let config_str = fs::read_to_string(&config_path).context("reading config toml")?;
            config = toml::from_str(&config_str).context("parsing config file")?;
        }
    }

    config.apply_env_overrides();
    Ok(config)
}

fn dirs_home() -> Option<String> {
    env::var("HOME").ok()
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    /// Address to bind the HTTP/WebSocket server to.
    pub bind_addr: String,

    /// Port to listen on. Overridden by the `PORT` env var.
    pub port: u16,

    /// Root of the on-disk control directory (one subdirectory per session).
    /// Overridden by `VIBETUNNEL_CONTROL_DIR`.
    pub control_dir: Option<String>,

    /// Basic-auth username required on every `/api/*` request except
    /// `/api/health`. Overridden by `VIBETUNNEL_USERNAME`.
    pub username: Option<String>,

    /// Basic-auth password. Overridden by `VIBETUNNEL_PASSWORD`.
    pub password: Option<String>,

    /// Whether this node operates as a federation headquarters, aggregating
    /// a set of remote nodes under one API surface.
    pub hq_mode: bool,

    /// Statically-known remotes to proxy to when operating as an HQ. Remotes
    /// may also self-register at runtime via `POST /api/remotes/register`.
    pub remotes: Vec<RemoteConfig>,

    /// When set, this node registers itself with the named HQ at startup and
    /// accepts exactly the resulting bearer token on subsequent requests.
    pub hq_url: Option<String>,

    /// The name this node reports to its HQ when `hq_url` is set.
    pub remote_name: Option<String>,

    /// The base URL this node advertises to its HQ when registering, e.g.
    /// `http://10.0.0.5:4020`. Overridden by `VIBETUNNEL_REMOTE_URL`.
    /// Required in practice whenever `bind_addr` is a non-routable wildcard
    /// address like the `0.0.0.0` default: the HQ proxies requests back to
    /// whatever URL it was given, and it cannot reach a remote at its own
    /// bind address.
    pub remote_url: Option<String>,

    /// The number of lines of scrollback the terminal model keeps per
    /// session. By default, 10000 lines.
    pub scrollback_lines: Option<usize>,

    /// How long the terminal model waits after a dirty signal before it
    /// raises a "changed" notification, in milliseconds. By default, 50ms.
    pub debounce_ms: Option<u64>,

    /// When true, `POST /sessions/:id/resize` always reports
    /// `resize_disabled_by_server` instead of performing the resize.
    pub resize_disabled: bool,

    /// A defensive cap on `stream-out` file size; attaching to a larger file
    /// reports `StreamTruncated` instead of tailing it. `None` means
    /// unbounded, matching the specification's default posture.
    pub max_stream_file_bytes: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: "0.0.0.0".to_string(),
            port: 4020,
            control_dir: None,
            username: None,
            password: None,
            hq_mode: false,
            remotes: Vec::new(),
            hq_url: None,
            remote_name: None,
            remote_url: None,
            scrollback_lines: None,
            debounce_ms: None,
            resize_disabled: false,
            max_stream_file_bytes: None,
        }
    }
}

impl Config {
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("VIBETUNNEL_USERNAME") {
            self.username = Some(v);
        }
        if let Ok(v) = env::var("VIBETUNNEL_PASSWORD") {
            self.password = Some(v);
        }
        if let Ok(v) = env::var("VIBETUNNEL_CONTROL_DIR") {
            self.control_dir = Some(v);
        }
        if let Ok(v) = env::var("VIBETUNNEL_REMOTE_URL") {
            self.remote_url = Some(v);
        }
        if let Ok(v) = env::var("PORT") {
            if let Ok(port) = v.parse() {
                self.port = port;
            } else {
                tracing::warn!("ignoring malformed PORT env var: {}", v);
            }
        }
    }

    pub fn control_root(&self) -> PathBuf {
        match &self.control_dir {
            Some(dir) => PathBuf::from(dir),
            None => {
                let base = env::var("XDG_STATE_HOME")
                    .or_else(|_| env::var("HOME").map(|h| format!("{h}/.local/state")))
                    .unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(base).join("vibetunnel")
            }
        }
    }

    pub fn scrollback_lines(&self) -> usize {
        self.scrollback_lines.unwrap_or(10_000)
    }

    pub fn debounce(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.debounce_ms.unwrap_or(50))
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct RemoteConfig {
    pub id: String,
    pub name: String,
    pub url: String,
    pub token: String,
}

#[cfg(test)]
mod test {
    use super::*;
    use ntest::timeout;

    #[test]
    #[timeout(30000)]
    fn parse() -> anyhow::Result<()> {
        let cases = vec![
            r#"
            bind_addr = "127.0.0.1"
            port = 4020
            "#,
            r#"
            bind_addr = "0.0.0.0"
            port = 8080
            hq_mode = true

            [[remotes]]
            id = "r1"
            name = "worker-1"
            url = "http://10.0.0.2:4020"
            token = "deadbeef"
            "#,
            r#"
            bind_addr = "0.0.0.0"
            port = 4020
            resize_disabled = true
            debounce_ms = 25
            scrollback_lines = 5000
            "#,
        ];

        for case in cases.into_iter() {
            let _: Config = toml::from_str(case)?;
        }

        Ok(())
    }

    #[test]
    fn env_overrides_take_precedence() {
        std::env::set_var("VIBETUNNEL_USERNAME", "alice");
        std::env::set_var("PORT", "9999");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.username.as_deref(), Some("alice"));
        assert_eq!(config.port, 9999);
        std::env::remove_var("VIBETUNNEL_USERNAME");
        std::env::remove_var("PORT");
    }
}
