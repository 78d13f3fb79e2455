//! S2: resizing a session changes the dimensions reported by the next
//! binary snapshot, unless the server has disabled resize, in which
//! case the snapshot keeps the session's original dimensions.

mod support;

use std::time::Duration;

use serde_json::json;
use support::{eventually, TestServer};
use vibetunnel_core::config::Config;
use vibetunnel_protocol::snapshot::GridSnapshot;

#[tokio::test]
async fn resize_changes_next_snapshot() {
    let server = TestServer::spawn(Config::default()).await;
    let client = reqwest::Client::new();

    let create: serde_json::Value = client
        .post(format!("{}/api/sessions", server.base_url))
        .json(&json!({"command": ["cat"], "cols": 80, "rows": 24}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = create["sessionId"].as_str().unwrap().to_string();

    let resp: serde_json::Value = client
        .post(format!("{}/api/sessions/{id}/resize", server.base_url))
        .json(&json!({"cols": 132, "rows": 40}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["success"], true);

    let snapshot = eventually(Duration::from_secs(5), || {
        let client = client.clone();
        let url = format!("{}/api/sessions/{id}/snapshot", server.base_url);
        async move {
            let bytes = client.get(url).header("accept", "application/octet-stream").send().await.ok()?.bytes().await.ok()?;
            let snap = GridSnapshot::decode(&bytes).ok()?;
            (snap.cols == 132 && snap.rows.len() == 40).then_some(snap)
        }
    })
    .await;
    assert_eq!(snapshot.cols, 132);
    assert_eq!(snapshot.rows.len(), 40);
}

#[tokio::test]
async fn resize_disabled_by_server_rejects_and_keeps_dimensions() {
    let mut config = Config::default();
    config.resize_disabled = true;
    let server = TestServer::spawn(config).await;
    let client = reqwest::Client::new();

    let create: serde_json::Value = client
        .post(format!("{}/api/sessions", server.base_url))
        .json(&json!({"command": ["cat"], "cols": 80, "rows": 24}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = create["sessionId"].as_str().unwrap().to_string();

    let resize_resp = client
        .post(format!("{}/api/sessions/{id}/resize", server.base_url))
        .json(&json!({"cols": 132, "rows": 40}))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resize_resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "resize_disabled_by_server");

    let bytes = client
        .get(format!("{}/api/sessions/{id}/snapshot", server.base_url))
        .header("accept", "application/octet-stream")
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    let snap = GridSnapshot::decode(&bytes).unwrap();
    assert_eq!(snap.cols, 80);
    assert_eq!(snap.rows.len(), 24);
}
