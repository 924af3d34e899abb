//! Capped retention as seen through topics.

mod common;

use common::*;
use kafkaesque::{SubscribeOptions, SubscriberName, TopicOptions};

#[tokio::test]
async fn test_replay_starts_at_oldest_retained_entry() {
    let connection = connect_in_memory().await;
    let topic = connection
        .prepare_topic("test-capped", TopicOptions::default().with_max_entries(3))
        .await
        .unwrap();
    publish_numbers(&topic, "my-event", 1..=10).await;

    let (callback, mut rx) = collector();
    let subscription = topic
        .subscribe(
            "my-event",
            SubscribeOptions::durable(SubscriberName::new("late").unwrap()).with_replay(),
            callback,
        )
        .await
        .unwrap();
    assert_eq!(take_acking(&mut rx, 3).await, vec![8, 9, 10]);
    subscription.live().await.unwrap();

    connection.close().await;
}

#[tokio::test]
async fn test_positions_keep_increasing_after_eviction() {
    let (_dir, path) = create_temp_db_path("capped.db");

    let last = {
        let connection = connect_file(&path).await;
        let topic = connection
            .prepare_topic("test-capped-restart", TopicOptions::default().with_max_entries(1))
            .await
            .unwrap();
        let positions = publish_numbers(&topic, "my-event", 1..=5).await;
        connection.close().await;
        positions[4]
    };

    let connection = connect_file(&path).await;
    let topic = connection.topic("test-capped-restart").await.unwrap();
    let next = topic.publish("my-event", message(6)).await.unwrap();
    assert!(next.position > last);

    connection.close().await;
}

#[tokio::test]
async fn test_byte_bound_evicts_oldest() {
    let connection = connect_in_memory().await;
    // Event plus message come to 20 bytes per entry; room for two.
    let topic = connection
        .prepare_topic("test-bytes", TopicOptions::default().with_size_bytes(40))
        .await
        .unwrap();
    publish_numbers(&topic, "my-event", 1..=5).await;

    let (callback, mut rx) = collector();
    let _subscription = topic
        .subscribe(
            "my-event",
            SubscribeOptions::durable(SubscriberName::new("bytes").unwrap()).with_replay(),
            callback,
        )
        .await
        .unwrap();
    assert_eq!(take_acking(&mut rx, 2).await, vec![4, 5]);

    connection.close().await;
}
