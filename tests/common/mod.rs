//! Shared utilities for integration tests.
#![allow(dead_code)]

use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Bind an ephemeral local port.
pub fn local_listener() -> (std::net::TcpListener, SocketAddr) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// `/` answers immediately, `/slow` takes `slow` to answer.
pub fn test_router(slow: Duration) -> Router {
    Router::new()
        .route("/", get(|| async { "ok" }))
        .route(
            "/slow",
            get(move || async move {
                tokio::time::sleep(slow).await;
                "slow"
            }),
        )
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}

/// Poll `/` until the server answers.
pub async fn wait_until_serving(addr: SocketAddr) {
    let client = client();
    for _ in 0..100 {
        if let Ok(res) = client.get(format!("http://{}/", addr)).send().await {
            if res.status().is_success() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("server at {} never became ready", addr);
}

/// Captures the tracker handed to a constructor so the test can inspect it
/// after the run.
pub struct TrackerSlot<T>(Arc<OnceLock<T>>);

impl<T> Clone for TrackerSlot<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> TrackerSlot<T> {
    pub fn new() -> Self {
        Self(Arc::new(OnceLock::new()))
    }

    pub fn put(&self, tracker: T) {
        let _ = self.0.set(tracker);
    }

    pub fn get(&self) -> &T {
        self.0.get().expect("constructor never ran")
    }
}
