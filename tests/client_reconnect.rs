//! Client reconnect policy tests: bounded attempt counting, fixed spacing,
//! counter reset on success, and explicit stop.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use common::{start_server, wait_until};
use tokio_test::assert_ok;
use roomcast::client::{Client, ClientConfig};

/// A TCP listener that accepts and immediately drops connections, so every
/// WebSocket handshake fails. Returns the address and an accept counter.
async fn refusing_server() -> (std::net::SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));

    let counter = accepted.clone();
    tokio::spawn(async move {
        loop {
            if let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        }
    });

    (addr, accepted)
}

#[tokio::test]
async fn test_reconnect_attempts_are_bounded_and_spaced() {
    let (addr, accepted) = refusing_server().await;

    let interval = Duration::from_millis(100);
    let client = Client::new(ClientConfig {
        url: format!("ws://{}/ws", addr),
        reconnect: true,
        reconnect_interval: interval,
        max_reconnect_attempts: 3,
    });

    let runner = client.clone();
    let started = Instant::now();
    let task = tokio::spawn(async move { runner.run().await });

    let result = timeout(Duration::from_secs(5), task)
        .await
        .expect("run() should stop after exhausting attempts")
        .expect("task should not panic");
    tokio_test::assert_ok!(result);

    // Initial attempt plus exactly 3 reconnects
    assert_eq!(accepted.load(Ordering::SeqCst), 4);
    // Each reconnect waits the fixed interval
    assert!(started.elapsed() >= interval * 3);

    // Exhaustion is terminal: no further attempts
    tokio::time::sleep(interval * 3).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_reconnect_disabled_gives_single_attempt() {
    let (addr, accepted) = refusing_server().await;

    let client = Client::new(ClientConfig {
        url: format!("ws://{}/ws", addr),
        reconnect: false,
        reconnect_interval: Duration::from_millis(50),
        max_reconnect_attempts: 10,
    });

    let runner = client.clone();
    let task = tokio::spawn(async move { runner.run().await });
    let result = timeout(Duration::from_secs(2), task)
        .await
        .expect("run() should stop without reconnecting")
        .expect("task should not panic");
    tokio_test::assert_ok!(result);

    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_counter_resets_after_successful_reconnect() {
    let (state, addr) = start_server().await;

    let client = Client::new(ClientConfig {
        url: format!("ws://{}/ws", addr),
        reconnect: true,
        reconnect_interval: Duration::from_millis(100),
        max_reconnect_attempts: 5,
    });

    let (connected_tx, mut connected_rx) = mpsc::unbounded_channel();
    client.on("connection", move |_| {
        let _ = connected_tx.send(());
    });

    let runner = client.clone();
    tokio::spawn(async move { runner.run().await });

    timeout(Duration::from_secs(2), connected_rx.recv())
        .await
        .expect("client should connect")
        .unwrap();

    // Kick the client; it must come back on its own
    state.hub.close_all("kicked");

    timeout(Duration::from_secs(3), connected_rx.recv())
        .await
        .expect("client should reconnect after the server closed it")
        .unwrap();

    let hub = state.hub.clone();
    wait_until(Duration::from_secs(2), || hub.stats().connections == 1).await;

    // Only consecutive failures count toward the maximum
    assert_eq!(client.reconnect_attempts(), 0);

    client.close();
}

#[tokio::test]
async fn test_close_disables_further_reconnect() {
    let (addr, accepted) = refusing_server().await;

    let interval = Duration::from_millis(50);
    let client = Client::new(ClientConfig {
        url: format!("ws://{}/ws", addr),
        reconnect: true,
        reconnect_interval: interval,
        max_reconnect_attempts: u32::MAX,
    });

    let runner = client.clone();
    let task = tokio::spawn(async move { runner.run().await });

    wait_until(Duration::from_secs(2), || {
        accepted.load(Ordering::SeqCst) >= 2
    })
    .await;
    client.close();

    timeout(Duration::from_secs(2), task)
        .await
        .expect("run() should stop after close()")
        .unwrap()
        .unwrap();

    let attempts_at_close = accepted.load(Ordering::SeqCst);
    tokio::time::sleep(interval * 4).await;
    assert_eq!(accepted.load(Ordering::SeqCst), attempts_at_close);
}
