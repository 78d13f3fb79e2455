//! S1: create a session that echoes a line and exits; the SSE stream
//! eventually carries the output and a matching exit record, and the
//! session row settles on `status:"exited", exitCode:0`.

mod support;

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::StreamExt;
use serde_json::{json, Value};
use support::{eventually, TestServer};
use vibetunnel_core::config::Config;

#[tokio::test]
async fn create_echo_exit() {
    let server = TestServer::spawn(Config::default()).await;
    let client = reqwest::Client::new();

    let create: Value = client
        .post(format!("{}/api/sessions", server.base_url))
        .json(&json!({"command": ["sh", "-c", "echo hi"]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = create["sessionId"].as_str().unwrap().to_string();

    let resp = client.get(format!("{}/api/sessions/{id}/stream", server.base_url)).send().await.unwrap();
    assert_eq!(resp.headers().get("cache-control").unwrap(), "no-cache");
    assert_eq!(resp.headers().get("x-accel-buffering").unwrap(), "no");

    let mut lines: Vec<String> = Vec::new();
    let mut stream = resp.bytes_stream();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut saw_exit = false;
    while tokio::time::Instant::now() < deadline {
        let chunk = tokio::time::timeout(Duration::from_millis(500), stream.next()).await;
        let Ok(Some(Ok(bytes))) = chunk else { continue };
        for line in String::from_utf8_lossy(&bytes).lines() {
            let Some(b64) = line.strip_prefix("data:") else { continue };
            let decoded = BASE64.decode(b64.trim()).unwrap();
            let text = String::from_utf8(decoded).unwrap();
            let parsed: Value = serde_json::from_str(&text).unwrap();
            if parsed[1] == "x" {
                saw_exit = true;
            }
            lines.push(text);
        }
        if saw_exit {
            break;
        }
    }
    assert!(saw_exit, "expected an exit event in the stream, got: {lines:?}");

    let output_line = lines.iter().find(|l| l.contains("\"o\"")).expect("expected an output event");
    let parsed: Value = serde_json::from_str(output_line).unwrap();
    assert_eq!(parsed[2], "hi\r\n");

    let exit_line = lines.iter().find(|l| l.contains("\"x\"")).unwrap();
    let parsed: Value = serde_json::from_str(exit_line).unwrap();
    assert_eq!(parsed[2][0], "exit");
    assert_eq!(parsed[2][1], 0);
    assert_eq!(parsed[2][2], id);

    let row: Value = eventually(Duration::from_secs(5), || {
        let client = client.clone();
        let url = format!("{}/api/sessions/{id}", server.base_url);
        async move {
            let row: Value = client.get(url).send().await.ok()?.json().await.ok()?;
            (row["status"] == "exited").then_some(row)
        }
    })
    .await;
    assert_eq!(row["exitCode"], 0);
}
