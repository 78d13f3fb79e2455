//! Test harness for the end-to-end scenarios in spec §8: builds the same
//! collaborators `server::serve` wires together, but binds an ephemeral
//! port and hands back a client base URL instead of blocking forever.

use std::time::Duration;

use tempfile::TempDir;
use vibetunnel_core::{
    buffers::BufferHub,
    config::Config,
    federation::{Federation, UpstreamProxies},
    server::{build_router, AppState},
    store::SessionStore,
    terminal::TerminalRegistry,
    watcher::ControlDirWatcher,
};

pub struct TestServer {
    pub base_url: String,
    pub ws_url: String,
    pub state: AppState,
    _dir: TempDir,
    _task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub async fn spawn(mut config: Config) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        config.control_dir = Some(dir.path().to_string_lossy().into_owned());
        config.bind_addr = "127.0.0.1".to_string();
        config.port = 0;

        let store = SessionStore::new(config.control_root()).expect("session store");
        let terminals = TerminalRegistry::new(store.clone(), config.scrollback_lines(), config.debounce());
        let watcher = ControlDirWatcher::new();
        watcher.clone().spawn(store.clone());

        let state = AppState {
            config: std::sync::Arc::new(config),
            store,
            terminals,
            watcher,
            federation: Federation::new(),
            buffer_hub: BufferHub::new(),
            upstream_proxies: UpstreamProxies::new(),
            own_remote_token: std::sync::Arc::new(std::sync::RwLock::new(None)),
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local addr");
        let router = build_router(state.clone());
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        TestServer {
            base_url: format!("http://{addr}"),
            ws_url: format!("ws://{addr}"),
            state,
            _dir: dir,
            _task: task,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self._task.abort();
    }
}

/// Polls `f` until it returns `Some`, or panics after `timeout` elapses.
pub async fn eventually<T, F, Fut>(timeout: Duration, mut f: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(v) = f().await {
            return v;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition did not become true within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
