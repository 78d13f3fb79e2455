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

//! The typed error boundary for the HTTP surface. Everything below this
//! layer speaks `anyhow::Result`; handlers convert into one of these
//! variants at the edge, and [`VtError::into_response`] turns that into the
//! status code and body shape the external interface promises.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VtError {
    #[error("failed to create pty: {0}")]
    PtyCreationFailed(String),

    #[error("session not found")]
    SessionNotFound,

    #[error("session already exited")]
    SessionAlreadyExited,

    #[error("resize disabled by server")]
    ResizeDisabled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown key name: {0}")]
    UnknownKey(String),

    #[error("invalid dimensions: {0}x{1}")]
    InvalidDimensions(u32, u32),

    #[error("authentication required")]
    AuthRequired,

    #[error("authentication rejected")]
    AuthRejected,

    #[error("remote unreachable: {0}")]
    RemoteUnreachable(String),

    #[error("remote already registered under a different identity")]
    RemoteConflict,

    #[error("filesystem error: {0}")]
    FileSystemError(#[from] std::io::Error),

    #[error("this operation is HQ-only")]
    NotHq,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for VtError {
    fn into_response(self) -> Response {
        use VtError::*;
        let (status, body) = match &self {
            PtyCreationFailed(msg) => (StatusCode::INTERNAL_SERVER_ERROR, json!({"error": msg})),
            SessionNotFound => (StatusCode::NOT_FOUND, json!({"error": "session not found"})),
            SessionAlreadyExited => (
                StatusCode::GONE,
                json!({"success": true, "message": "Session already exited"}),
            ),
            ResizeDisabled => (
                StatusCode::OK,
                json!({"success": false, "error": "resize_disabled_by_server"}),
            ),
            InvalidRequest(msg) => (StatusCode::BAD_REQUEST, json!({"error": msg})),
            UnknownKey(name) => (StatusCode::BAD_REQUEST, json!({"error": format!("unknown key: {name}")})),
            InvalidDimensions(cols, rows) => (
                StatusCode::BAD_REQUEST,
                json!({"error": format!("invalid dimensions: {cols}x{rows}")}),
            ),
            AuthRequired | AuthRejected => (StatusCode::UNAUTHORIZED, json!({"error": "authentication required"})),
            RemoteUnreachable(msg) => (StatusCode::SERVICE_UNAVAILABLE, json!({"error": msg})),
            RemoteConflict => (StatusCode::CONFLICT, json!({"error": "remote already registered"})),
            FileSystemError(e) => (StatusCode::INTERNAL_SERVER_ERROR, json!({"error": e.to_string()})),
            NotHq => (StatusCode::NOT_FOUND, json!({"error": "not operating as an HQ node"})),
            Internal(e) => (StatusCode::INTERNAL_SERVER_ERROR, json!({"error": e.to_string()})),
        };

        if !matches!(self, ResizeDisabled) {
            tracing::debug!(error = %self, status = %status, "request failed");
        }

        (status, Json(body)).into_response()
    }
}

pub type VtResult<T> = Result<T, VtError>;
