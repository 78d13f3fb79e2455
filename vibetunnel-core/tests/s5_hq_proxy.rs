//! S5: an HQ node transparently proxies a session it doesn't host itself.
//! Creating, listing, and writing input to a remote-owned session through
//! the HQ's own API reaches the remote node exactly as if the client had
//! talked to the remote directly.

mod support;

use std::time::Duration;

use serde_json::json;
use support::{eventually, TestServer};
use vibetunnel_core::config::Config;
use vibetunnel_protocol::RegisterRemoteRequest;

#[tokio::test]
async fn hq_proxies_create_list_and_input_to_remote() {
    let remote = TestServer::spawn(Config::default()).await;

    let mut hq_config = Config::default();
    hq_config.hq_mode = true;
    let hq = TestServer::spawn(hq_config).await;

    let (_summary, created) = hq
        .state
        .federation
        .register(RegisterRemoteRequest { id: "r1".into(), name: "r1".into(), url: remote.base_url.clone(), token: "test-token".into() })
        .unwrap();
    assert!(created);

    let client = reqwest::Client::new();

    let create: serde_json::Value = client
        .post(format!("{}/api/sessions", hq.base_url))
        .json(&json!({"command": ["cat"], "remoteId": "r1"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = create["sessionId"].as_str().unwrap().to_string();

    // The session must actually exist on the remote, not on the HQ.
    assert!(!hq.state.store.exists(&id));
    assert!(remote.state.store.exists(&id));

    let rows: Vec<serde_json::Value> = eventually(Duration::from_secs(5), || {
        let client = client.clone();
        let url = format!("{}/api/sessions", hq.base_url);
        let id = id.clone();
        async move {
            let rows: Vec<serde_json::Value> = client.get(url).send().await.ok()?.json().await.ok()?;
            rows.iter().any(|r| r["id"] == id).then_some(rows)
        }
    })
    .await;
    let row = rows.into_iter().find(|r| r["id"] == id).unwrap();
    assert_eq!(row["source"], "remote");
    assert_eq!(row["remoteName"], "r1");

    let input_resp = client
        .post(format!("{}/api/sessions/{id}/input", hq.base_url))
        .json(&json!({"text": "hello\n"}))
        .send()
        .await
        .unwrap();
    assert!(input_resp.status().is_success());

    eventually(Duration::from_secs(5), || {
        let path = remote.state.store.stream_out_path(&id);
        async move {
            let contents = tokio::fs::read_to_string(&path).await.ok()?;
            contents.contains("hello").then_some(())
        }
    })
    .await;
}
