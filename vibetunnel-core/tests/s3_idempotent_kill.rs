//! S3: killing a running session succeeds once, and a second kill on the
//! same id reports that it already exited rather than "not found".

mod support;

use std::time::Duration;

use serde_json::json;
use support::{eventually, TestServer};
use vibetunnel_core::config::Config;

#[tokio::test]
async fn second_kill_reports_already_exited() {
    let server = TestServer::spawn(Config::default()).await;
    let client = reqwest::Client::new();

    let create: serde_json::Value = client
        .post(format!("{}/api/sessions", server.base_url))
        .json(&json!({"command": ["sleep", "30"]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = create["sessionId"].as_str().unwrap().to_string();

    eventually(Duration::from_secs(2), || {
        let client = client.clone();
        let url = format!("{}/api/sessions/{id}", server.base_url);
        async move {
            let row: serde_json::Value = client.get(url).send().await.ok()?.json().await.ok()?;
            (row["status"] == "running").then_some(())
        }
    })
    .await;

    let first = client.delete(format!("{}/api/sessions/{id}", server.base_url)).send().await.unwrap();
    assert_eq!(first.status(), 200);
    let first_body: serde_json::Value = first.json().await.unwrap();
    assert_eq!(first_body["success"], true);

    let second = client.delete(format!("{}/api/sessions/{id}", server.base_url)).send().await.unwrap();
    assert_eq!(second.status(), 410);
    let second_body: serde_json::Value = second.json().await.unwrap();
    assert_eq!(second_body["success"], true);
    assert_eq!(second_body["message"], "Session already exited");

    let row: serde_json::Value = eventually(Duration::from_secs(5), || {
        let client = client.clone();
        let url = format!("{}/api/sessions/{id}", server.base_url);
        async move {
            let row: serde_json::Value = client.get(url).send().await.ok()?.json().await.ok()?;
            (row["status"] == "exited").then_some(row)
        }
    })
    .await;
    assert_eq!(row["status"], "exited");
}
