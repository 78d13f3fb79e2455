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

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};

/// Lifecycle status of a session, as persisted in `session.json`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Exited,
}

/// The on-disk metadata for a session, written atomically to
/// `<control_root>/<id>/session.json`. Field names match the wire schema in
/// the external interface section of the specification exactly, so this type
/// also doubles as the JSON body returned by the session API.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub name: String,
    pub cmdline: Vec<String>,
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none", rename = "exitCode")]
    pub exit_code: Option<i32>,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    pub term: String,
    pub width: u32,
    pub height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,

    /// Present only on aggregated (HQ) listings; absent for purely local rows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SessionSource>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "remoteId")]
    pub remote_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "remoteName")]
    pub remote_name: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionSource {
    Local,
    Remote,
}

impl SessionRow {
    pub fn is_running(&self) -> bool {
        self.status == SessionStatus::Running
    }
}

/// The request body for `POST /api/sessions`.
#[derive(Deserialize, Debug, Clone)]
pub struct CreateSessionRequest {
    pub command: Vec<String>,
    #[serde(rename = "workingDir")]
    pub working_dir: Option<String>,
    pub name: Option<String>,
    pub cols: Option<u32>,
    pub rows: Option<u32>,
    pub term: Option<String>,
    pub spawn_terminal: Option<bool>,
    #[serde(rename = "remoteId")]
    pub remote_id: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct CreateSessionResponse {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

/// Accepts either `input` or `text` for the same byte payload, and an
/// optional `type` discriminator (`"text"` default, or a named special key).
/// Populating both `input` and `text` is rejected at the boundary.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct InputRequest {
    pub input: Option<String>,
    pub text: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

impl InputRequest {
    /// Normalises the `input`/`text` aliasing into a single payload string.
    /// Returns `Err` if both fields were populated, matching §9's guidance to
    /// reject payloads with mutually exclusive fields set.
    pub fn normalize(&self) -> Result<&str, &'static str> {
        match (&self.input, &self.text) {
            (Some(_), Some(_)) => Err("input and text are mutually exclusive"),
            (Some(s), None) => Ok(s.as_str()),
            (None, Some(s)) => Ok(s.as_str()),
            (None, None) => Err("one of input or text is required"),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
pub struct ResizeRequest {
    pub cols: u32,
    pub rows: u32,
}

#[derive(Serialize, Debug, Clone)]
pub struct ResizeResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cols: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct SimpleSuccessResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct CleanupExitedResponse {
    pub success: bool,
    #[serde(rename = "localCleaned")]
    pub local_cleaned: Vec<String>,
    #[serde(rename = "remoteResults")]
    pub remote_results: Vec<RemoteCleanupResult>,
}

#[derive(Serialize, Debug, Clone)]
pub struct RemoteCleanupResult {
    #[serde(rename = "remoteName")]
    pub remote_name: String,
    pub cleaned: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub mode: NodeMode,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    Standalone,
    Hq,
    Remote,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn input_request_normalize() {
        let both = InputRequest { input: Some("a".into()), text: Some("b".into()), kind: None };
        assert!(both.normalize().is_err());

        let neither = InputRequest::default();
        assert!(neither.normalize().is_err());

        let input_only = InputRequest { input: Some("hello".into()), text: None, kind: None };
        assert_eq!(input_only.normalize().unwrap(), "hello");

        let text_only = InputRequest { input: None, text: Some("world".into()), kind: None };
        assert_eq!(text_only.normalize().unwrap(), "world");
    }

    #[test]
    fn session_row_round_trips_through_json() {
        let row = SessionRow {
            id: "11111111-1111-1111-1111-111111111111".into(),
            name: "devserver".into(),
            cmdline: vec!["sh".into(), "-c".into(), "echo hi".into()],
            cwd: "/tmp".into(),
            pid: Some(1234),
            status: SessionStatus::Running,
            exit_code: None,
            started_at: Utc::now(),
            term: "xterm-256color".into(),
            width: 80,
            height: 24,
            env: None,
            source: None,
            remote_id: None,
            remote_name: None,
        };
        let json = serde_json::to_string(&row).unwrap();
        let back: SessionRow = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, row.id);
        assert_eq!(back.status, SessionStatus::Running);
    }
}
