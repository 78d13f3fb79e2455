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

use std::time::Duration;

/// How often C6/C3/C4's file tailers poll for new bytes when they aren't
/// otherwise woken. Bounded by spec §4.6 ("periodic poll (≤ 100 ms)").
pub const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(80);

/// How long an SSE subscription may sit idle before a heartbeat comment is
/// sent, per spec §5's "Stream heartbeats: ≤ 30 s".
pub const SSE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How long the Control-Dir Watcher waits for a newly-created directory's
/// `session.json` to appear before giving up on it, per spec §4.3.
pub const WATCHER_SESSION_JSON_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the Control-Dir Watcher scans the control root for new
/// directories.
pub const WATCHER_SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// How long a Terminal Model may go without a subscriber before it tears
/// down its file handle and releases its grid (spec §4.4).
pub const TERMINAL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// HQ → remote default request timeout (spec §5).
pub const REMOTE_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// HQ → remote registration request timeout (spec §5).
pub const REMOTE_REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Inter-node health check timeout (spec §5).
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on the per-remote session-ownership refresh cadence
/// (spec §4.8: "≤ 15 s, per remote").
pub const REMOTE_REFRESH_INTERVAL: Duration = Duration::from_secs(15);

/// Health-check backoff starts at 1s and doubles up to this cap (spec §5).
pub const HEALTH_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// WebSocket ping cadence for `/buffers` clients (spec §5).
pub const WS_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Bounded per-client outbound frame queue depth on `/buffers` (spec §4.7's
/// backpressure policy: oldest same-session frames may be dropped once full).
pub const WS_SEND_QUEUE_DEPTH: usize = 32;
