#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use kafkaesque::{Connection, ConnectionConfig, Delivery, Position, Topic};
use tokio::sync::mpsc;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn create_temp_db_path(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

pub fn fast_config(config: ConnectionConfig) -> ConnectionConfig {
    config
        .with_tail_poll_interval(Duration::from_millis(20))
        .with_read_batch_size(4)
}

pub async fn connect_in_memory() -> Connection {
    Connection::open(fast_config(ConnectionConfig::in_memory()))
        .await
        .expect("connect in-memory store")
}

pub async fn connect_file(path: &PathBuf) -> Connection {
    Connection::open(fast_config(ConnectionConfig::file(path)))
        .await
        .expect("connect file store")
}

/// `{"number":n}`
pub fn message(n: u64) -> Vec<u8> {
    format!("{{\"number\":{}}}", n).into_bytes()
}

pub fn number(delivery: &Delivery) -> u64 {
    std::str::from_utf8(delivery.message())
        .expect("utf8 message")
        .trim_start_matches("{\"number\":")
        .trim_end_matches('}')
        .parse()
        .expect("numbered message")
}

pub async fn publish_numbers(topic: &Topic, event: &str, numbers: impl IntoIterator<Item = u64>) -> Vec<Position> {
    let mut positions = Vec::new();
    for n in numbers {
        let entry = topic.publish(event, message(n)).await.expect("publish");
        positions.push(entry.position);
    }
    positions
}

/// A subscription callback that forwards every delivery to a channel.
pub fn collector() -> (
    impl Fn(Delivery) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<Delivery>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback = move |delivery: Delivery| {
        let _ = tx.send(delivery);
    };
    (callback, rx)
}

pub async fn next_delivery(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Delivery {
    tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for a delivery")
        .expect("delivery channel closed")
}

/// Receives `count` deliveries, acknowledging each before taking the next.
pub async fn take_acking(rx: &mut mpsc::UnboundedReceiver<Delivery>, count: usize) -> Vec<u64> {
    let mut numbers = Vec::with_capacity(count);
    for _ in 0..count {
        let delivery = next_delivery(rx).await;
        numbers.push(number(&delivery));
        if let Some(ack) = delivery.ack {
            ack.ack().await.expect("ack");
        }
    }
    numbers
}

/// Asserts nothing is delivered for `window`.
pub async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Delivery>, window: Duration) {
    if let Ok(Some(delivery)) = tokio::time::timeout(window, rx.recv()).await {
        panic!(
            "unexpected delivery at position {} ({:?})",
            delivery.position(),
            std::str::from_utf8(delivery.message())
        );
    }
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
