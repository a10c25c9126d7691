//! Monitoring API over HTTP.

mod common;

use std::sync::Arc;

use common::MockDirectory;
use lloadd::admin::setup_admin_router;
use lloadd::net::dialer::TcpDialer;
use lloadd::{Daemon, Shutdown};
use serde_json::Value;
use tokio::net::TcpListener;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn monitoring_requires_token_and_reports_state() {
    let directory = MockDirectory::start("dir-a").await;
    let daemon = Daemon::start(
        common::config(vec![common::backend("a", directory.uri())]),
        Arc::new(TcpDialer),
        Shutdown::new(),
    )
    .await
    .unwrap();
    common::wait_ready(&daemon).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let router = setup_admin_router(daemon.clone(), "test-key");
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

    let http = reqwest::Client::new();
    let denied = http.get(format!("{}/monitor/daemon", base)).send().await.unwrap();
    assert_eq!(denied.status(), reqwest::StatusCode::UNAUTHORIZED);

    let wrong = http
        .get(format!("{}/monitor/daemon", base))
        .bearer_auth("other")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), reqwest::StatusCode::UNAUTHORIZED);

    let get = |path: &'static str| {
        let request = http.get(format!("{}{}", base, path)).bearer_auth("test-key");
        async move {
            let response = request.send().await.unwrap();
            assert!(response.status().is_success());
            response.json::<Value>().await.unwrap()
        }
    };

    let summary = get("/monitor/daemon").await;
    assert_eq!(summary["tiers"], 1);
    assert_eq!(summary["backends"], 1);
    assert_eq!(summary["shutdown"], "running");

    let tiers = get("/monitor/tiers").await;
    assert_eq!(tiers[0]["name"], "main");
    assert_eq!(tiers[0]["backends"][0], "a");

    let backends = get("/monitor/backends").await;
    assert_eq!(backends[0]["name"], "a");
    assert!(backends[0]["active"].as_u64().unwrap() >= 1);

    let connections = get("/monitor/connections").await;
    assert!(connections["clients"].as_array().unwrap().is_empty());
    assert!(connections["upstream"].as_array().unwrap().len() >= 2);

    daemon.shutdown().await;
}
