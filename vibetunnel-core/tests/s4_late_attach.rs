//! S4: a client that attaches to `/stream` after output has already been
//! produced still receives that output from the beginning, because the
//! SSE handler tails stream-out from byte 0 rather than from "now".

mod support;

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::StreamExt;
use serde_json::json;
use support::TestServer;
use vibetunnel_core::config::Config;

#[tokio::test]
async fn late_attach_replays_prior_output() {
    let server = TestServer::spawn(Config::default()).await;
    let client = reqwest::Client::new();

    let create: serde_json::Value = client
        .post(format!("{}/api/sessions", server.base_url))
        .json(&json!({"command": ["cat"]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = create["sessionId"].as_str().unwrap().to_string();

    client
        .post(format!("{}/api/sessions/{id}/input", server.base_url))
        .json(&json!({"text": "hello\n"}))
        .send()
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;

    let resp = client.get(format!("{}/api/sessions/{id}/stream", server.base_url)).send().await.unwrap();
    let mut stream = resp.bytes_stream();
    let mut saw_header = false;
    let mut saw_output = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline && !(saw_header && saw_output) {
        let Ok(Some(Ok(bytes))) = tokio::time::timeout(Duration::from_millis(500), stream.next()).await else { continue };
        for line in String::from_utf8_lossy(&bytes).lines() {
            let Some(b64) = line.strip_prefix("data:") else { continue };
            let decoded = BASE64.decode(b64.trim()).unwrap();
            let text = String::from_utf8(decoded).unwrap();
            if text.contains("\"version\"") {
                saw_header = true;
            }
            if text.contains("hello") {
                saw_output = true;
            }
        }
    }

    assert!(saw_header, "late attach should still see the asciinema header line");
    assert!(saw_output, "late attach should replay output produced before it connected");
}
