//! Shutdown behaviour.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{LdapClient, MockDirectory};
use lloadd::lifecycle::ShutdownMode;
use lloadd::net::dialer::TcpDialer;
use lloadd::{Daemon, Shutdown};
use tokio::net::TcpStream;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn graceful_shutdown_lets_operations_finish() {
    let directory = MockDirectory::start_with_delay("slow", Duration::from_millis(300)).await;
    let shutdown = Shutdown::new();
    let daemon = Daemon::start(
        common::config(vec![common::backend("a", directory.uri())]),
        Arc::new(TcpDialer),
        shutdown.clone(),
    )
    .await
    .unwrap();
    common::wait_ready(&daemon).await;
    let addr = daemon.local_addrs()[0];

    let mut client = LdapClient::connect(addr).await;
    client.send(&common::search(1)).await;
    common::wait_until(|| {
        let seen = directory.requests() == 1;
        async move { seen }
    })
    .await;

    let stopping = daemon.clone();
    let stopped = tokio::spawn(async move { stopping.shutdown().await });

    let response = client.recv().await;
    assert_eq!(response.msgid(), 1);
    assert_eq!(response.result_code().unwrap(), 0);
    assert!(client.closed().await);

    tokio::time::timeout(Duration::from_secs(5), stopped)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(shutdown.mode(), ShutdownMode::Abrupt);
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_signal_cuts_the_grace_period() {
    let directory = MockDirectory::start_with_delay("stuck", Duration::from_secs(30)).await;
    let shutdown = Shutdown::new();
    let mut config = common::config(vec![common::backend("a", directory.uri())]);
    config.daemon.timeouts.shutdown_secs = 60;
    let daemon = Daemon::start(config, Arc::new(TcpDialer), shutdown.clone())
        .await
        .unwrap();
    common::wait_ready(&daemon).await;

    let mut client = LdapClient::connect(daemon.local_addrs()[0]).await;
    client.send(&common::search(1)).await;
    common::wait_until(|| {
        let seen = directory.requests() == 1;
        async move { seen }
    })
    .await;

    let started = Instant::now();
    let stopping = daemon.clone();
    let stopped = tokio::spawn(async move { stopping.shutdown().await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(shutdown.trigger(ShutdownMode::Abrupt));

    tokio::time::timeout(Duration::from_secs(5), stopped)
        .await
        .unwrap()
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(client.closed().await);
}
