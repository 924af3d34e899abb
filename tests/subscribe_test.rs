//! Transient subscriptions and live dispatch.

mod common;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use common::*;
use kafkaesque::{Delivery, EventFilter, SubscribeOptions, Subscription, SubscriptionState};

#[tokio::test]
async fn test_transient_subscriber_only_sees_new_entries() {
    let connection = connect_in_memory().await;
    let topic = connection.topic("test-subscribe").await.unwrap();
    publish_numbers(&topic, "my-event", [1, 2]).await;

    let (callback, mut rx) = collector();
    let subscription = topic
        .subscribe("my-event", SubscribeOptions::transient(), callback)
        .await
        .unwrap();
    assert_eq!(subscription.state(), SubscriptionState::Live);
    assert!(!subscription.is_durable());

    publish_numbers(&topic, "my-event", [3]).await;
    let delivery = next_delivery(&mut rx).await;
    assert_eq!(number(&delivery), 3);
    assert_eq!(delivery.event(), "my-event");
    assert!(delivery.ack.is_none());
    assert_quiet(&mut rx, Duration::from_millis(100)).await;

    connection.close().await;
}

#[tokio::test]
async fn test_transient_isolated_from_lagging_tail() {
    let connection = connect_in_memory().await;
    let topic = connection.topic("test-isolation").await.unwrap();

    // The first subscriber starts the tail; the second joins after more
    // entries were published and must not see them.
    let (first, mut first_rx) = collector();
    let _first = topic
        .subscribe(EventFilter::All, SubscribeOptions::transient(), first)
        .await
        .unwrap();
    publish_numbers(&topic, "my-event", 1..=5).await;

    let (second, mut second_rx) = collector();
    let _second = topic
        .subscribe(EventFilter::All, SubscribeOptions::transient(), second)
        .await
        .unwrap();
    publish_numbers(&topic, "my-event", [6]).await;

    for n in 1..=6 {
        assert_eq!(number(&next_delivery(&mut first_rx).await), n);
    }
    assert_eq!(number(&next_delivery(&mut second_rx).await), 6);
    assert_quiet(&mut second_rx, Duration::from_millis(100)).await;

    connection.close().await;
}

#[tokio::test]
async fn test_event_routing() {
    let connection = connect_in_memory().await;
    let topic = connection.topic("test-routing").await.unwrap();

    let (created, mut created_rx) = collector();
    let (all, mut all_rx) = collector();
    let (message, mut message_rx) = collector();
    let _created = topic
        .subscribe("created", SubscribeOptions::transient(), created)
        .await
        .unwrap();
    let _all = topic
        .subscribe(None::<&str>, SubscribeOptions::transient(), all)
        .await
        .unwrap();
    let _message = topic
        .subscribe("message", SubscribeOptions::transient(), message)
        .await
        .unwrap();

    publish_numbers(&topic, "created", [1]).await;
    publish_numbers(&topic, "deleted", [2]).await;

    assert_eq!(number(&next_delivery(&mut created_rx).await), 1);
    assert_quiet(&mut created_rx, Duration::from_millis(100)).await;

    for rx in [&mut all_rx, &mut message_rx] {
        let first = next_delivery(rx).await;
        let second = next_delivery(rx).await;
        assert_eq!((first.event(), number(&first)), ("created", 1));
        assert_eq!((second.event(), number(&second)), ("deleted", 2));
    }

    connection.close().await;
}

#[tokio::test]
async fn test_concurrent_publishers_are_seen_in_position_order() {
    let connection = connect_in_memory().await;
    let topic = connection.topic("test-ordering").await.unwrap();

    let (callback, mut rx) = collector();
    let _subscription = topic
        .subscribe("my-event", SubscribeOptions::transient(), callback)
        .await
        .unwrap();

    let mut publishers = Vec::new();
    for task in 0..5u64 {
        let topic = topic.clone();
        publishers.push(tokio::spawn(async move {
            for i in 0..10u64 {
                topic.publish("my-event", message(task * 100 + i)).await.unwrap();
            }
        }));
    }
    for publisher in publishers {
        publisher.await.unwrap();
    }

    let mut positions = Vec::new();
    for _ in 0..50 {
        positions.push(next_delivery(&mut rx).await.position());
    }
    assert!(positions.windows(2).all(|w| w[0] < w[1]));

    connection.close().await;
}

#[tokio::test]
async fn test_multiple_listeners_for_one_event() {
    let connection = connect_in_memory().await;
    let topic = connection.topic("test-fanout").await.unwrap();

    let mut receivers = Vec::new();
    let mut subscriptions = Vec::new();
    for _ in 0..3 {
        let (callback, rx) = collector();
        subscriptions.push(
            topic
                .subscribe("my-event", SubscribeOptions::transient(), callback)
                .await
                .unwrap(),
        );
        receivers.push(rx);
    }

    publish_numbers(&topic, "my-event", [1]).await;
    for rx in &mut receivers {
        assert_eq!(number(&next_delivery(rx).await), 1);
    }

    subscriptions[1].unsubscribe();
    publish_numbers(&topic, "my-event", [2]).await;
    assert_eq!(number(&next_delivery(&mut receivers[0]).await), 2);
    assert_eq!(number(&next_delivery(&mut receivers[2]).await), 2);
    assert_quiet(&mut receivers[1], Duration::from_millis(100)).await;

    connection.close().await;
}

#[tokio::test]
async fn test_unsubscribe_from_inside_callback() {
    let connection = connect_in_memory().await;
    let topic = connection.topic("test-self-unsubscribe").await.unwrap();

    let handle: Arc<OnceLock<Subscription>> = Arc::new(OnceLock::new());
    let (forward, mut rx) = collector();
    let cell = Arc::clone(&handle);
    let subscription = topic
        .subscribe("my-event", SubscribeOptions::transient(), move |delivery: Delivery| {
            forward(delivery);
            if let Some(subscription) = cell.get() {
                subscription.unsubscribe();
            }
        })
        .await
        .unwrap();
    handle.set(subscription.clone()).unwrap();

    publish_numbers(&topic, "my-event", [1, 2]).await;
    assert_eq!(number(&next_delivery(&mut rx).await), 1);
    assert_quiet(&mut rx, Duration::from_millis(150)).await;
    eventually(Duration::from_secs(1), Duration::from_millis(10), || {
        (subscription.state() == SubscriptionState::Cancelled).then_some(())
    })
    .await;

    // The tail keeps serving other subscribers.
    let (callback, mut other_rx) = collector();
    let _other = topic
        .subscribe("my-event", SubscribeOptions::transient(), callback)
        .await
        .unwrap();
    publish_numbers(&topic, "my-event", [3]).await;
    assert_eq!(number(&next_delivery(&mut other_rx).await), 3);

    connection.close().await;
}

#[tokio::test]
async fn test_entries_published_by_another_connection_are_tailed() {
    let (_dir, path) = create_temp_db_path("shared.db");
    let reader = connect_file(&path).await;
    let writer = connect_file(&path).await;

    let topic = reader.topic("test-shared").await.unwrap();
    let (callback, mut rx) = collector();
    let _subscription = topic
        .subscribe("my-event", SubscribeOptions::transient(), callback)
        .await
        .unwrap();

    // No local append wakes the reader's tail; the poll interval does.
    let remote = writer.topic("test-shared").await.unwrap();
    publish_numbers(&remote, "my-event", [1]).await;
    assert_eq!(number(&next_delivery(&mut rx).await), 1);

    writer.close().await;
    reader.close().await;
}
