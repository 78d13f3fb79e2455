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

//! The authentication boundary: every `/api/*` request except `/api/health`
//! must carry either valid Basic credentials, or — on a node acting as a
//! federation remote — the exact bearer token it was handed at registration
//! time, per spec §6.

use axum::{
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::server::AppState;

const REALM: &str = r#"Basic realm="VibeTunnel""#;

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, [(header::WWW_AUTHENTICATE, REALM)], "authentication required").into_response()
}

/// Runs in front of every `/api/*` route except `/api/health`, which is
/// mounted outside this layer entirely (spec §6: "never requires auth").
///
/// A node with no configured username/password accepts every request
/// unauthenticated, matching the teacher's own posture of treating an absent
/// credential as "auth not configured" rather than "always reject". Bearer
/// tokens are only ever accepted by a node acting as a *remote* (one that
/// registered with an HQ), and only the exact token it minted for itself at
/// registration time — an HQ never accepts a bearer on its own boundary, per
/// spec §4.8.
pub async fn require_auth<B>(State(state): State<AppState>, request: Request<B>, next: Next<B>) -> Response {
    if !state.config.hq_mode {
        if let Some(expected) = state.own_remote_token.read().unwrap().clone() {
            if bearer_token(&request).as_deref() == Some(expected.as_str()) {
                return next.run(request).await;
            }
        }
    }

    if let (Some(expected_user), Some(expected_pass)) = (state.config.username.as_deref(), state.config.password.as_deref()) {
        if let Some(creds) = basic_credentials(&request) {
            if creds.0 == expected_user && creds.1 == expected_pass {
                return next.run(request).await;
            }
        }
        return unauthorized();
    }

    next.run(request).await
}

fn basic_credentials<B>(request: &Request<B>) -> Option<(String, String)> {
    let header = request.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

fn bearer_token<B>(request: &Request<B>) -> Option<String> {
    let header = request.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    header.strip_prefix("Bearer ").map(|s| s.to_string())
}

#[cfg(test)]
mod test {
    use super::*;
    use axum::http::Request;

    #[test]
    fn basic_credentials_decodes_user_and_pass() {
        let encoded = BASE64.encode("alice:secret");
        let req = Request::builder()
            .header(header::AUTHORIZATION, format!("Basic {encoded}"))
            .body(())
            .unwrap();
        let (user, pass) = basic_credentials(&req).unwrap();
        assert_eq!(user, "alice");
        assert_eq!(pass, "secret");
    }

    #[test]
    fn bearer_token_strips_prefix() {
        let req = Request::builder().header(header::AUTHORIZATION, "Bearer abc123").body(()).unwrap();
        assert_eq!(bearer_token(&req).unwrap(), "abc123");
    }

    #[test]
    fn missing_header_yields_none() {
        let req = Request::builder().body(()).unwrap();
        assert!(basic_credentials(&req).is_none());
        assert!(bearer_token(&req).is_none());
    }
}
