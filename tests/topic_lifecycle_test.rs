//! Topic state machine, connection bootstrap and notices.

mod common;

use common::*;
use kafkaesque::{
    Connection, ConnectionConfig, Error, Notice, SubscribeOptions, SubscriberName, SubscriptionState, Topic,
    TopicName, TopicOptions, TopicState,
};

async fn next_notice(notices: &mut tokio::sync::broadcast::Receiver<Notice>) -> Notice {
    tokio::time::timeout(RECV_TIMEOUT, notices.recv())
        .await
        .expect("timed out waiting for a notice")
        .expect("notice channel closed")
}

#[tokio::test]
async fn test_create_fails_when_not_connected() {
    let connection = Connection::new(ConnectionConfig::in_memory());
    let topic = Topic::new(&connection, TopicName::new("orders").unwrap(), TopicOptions::default());
    let mut notices = topic.notices();

    let result = topic.initialize().await;
    assert!(matches!(result, Err(Error::NotConnected(_))));
    assert_eq!(topic.state(), TopicState::Uninitialized);
    assert!(notices.try_recv().is_err());

    let result = Topic::create(&connection, TopicName::new("orders").unwrap(), TopicOptions::default()).await;
    assert!(matches!(result, Err(Error::NotConnected(_))));
}

#[tokio::test]
async fn test_operations_fail_fast_before_initialize() {
    let connection = connect_in_memory().await;
    let topic = Topic::new(&connection, TopicName::new("early").unwrap(), TopicOptions::default());

    assert!(matches!(
        topic.publish("my-event", message(1)).await,
        Err(Error::NotConnected(_))
    ));
    let (callback, _rx) = collector();
    assert!(matches!(
        topic.subscribe("my-event", SubscribeOptions::transient(), callback).await,
        Err(Error::NotConnected(_))
    ));

    connection.close().await;
}

#[tokio::test]
async fn test_initialize_broadcasts_ready() {
    let connection = connect_in_memory().await;
    let topic = Topic::new(&connection, TopicName::new("ready").unwrap(), TopicOptions::default());
    let mut notices = topic.notices();

    topic.initialize().await.unwrap();
    assert_eq!(topic.state(), TopicState::Ready);
    assert_eq!(next_notice(&mut notices).await, Notice::Ready);

    // Initializing again changes nothing.
    topic.initialize().await.unwrap();
    assert!(notices.try_recv().is_err());

    connection.close().await;
}

#[tokio::test]
async fn test_publish_returns_stored_entry() {
    let connection = connect_in_memory().await;
    let topic = connection.topic("test-publish").await.unwrap();

    let first = topic.publish("my-event", message(1)).await.unwrap();
    let second = topic.publish("my-event", message(2)).await.unwrap();
    assert!(second.position > first.position);
    assert_eq!(first.event, "my-event");
    assert_eq!(first.message(), message(1).as_slice());
    assert!(first.timestamp_ms > 0);

    assert!(matches!(
        topic.publish("", message(3)).await,
        Err(Error::InvalidArgument(_))
    ));

    connection.close().await;
}

#[tokio::test]
async fn test_close_rejects_further_operations() {
    let connection = connect_in_memory().await;
    let topic = connection.topic("test-close").await.unwrap();
    let mut notices = topic.notices();

    let (callback, mut rx) = collector();
    let live = topic
        .subscribe("my-event", SubscribeOptions::transient(), callback)
        .await
        .unwrap();
    publish_numbers(&topic, "my-event", 1..=3).await;
    let (replay_callback, _replay_rx) = collector();
    let replaying = topic
        .subscribe(
            "my-event",
            SubscribeOptions::durable(SubscriberName::new("closing").unwrap()).with_replay(),
            replay_callback,
        )
        .await
        .unwrap();

    topic.close().await;
    topic.close().await;
    assert_eq!(topic.state(), TopicState::Closed);
    assert_eq!(live.state(), SubscriptionState::Cancelled);
    assert_eq!(replaying.state(), SubscriptionState::Cancelled);

    assert!(matches!(topic.publish("my-event", message(4)).await, Err(Error::Closed(_))));
    let (callback, _) = collector();
    assert!(matches!(
        topic.subscribe("my-event", SubscribeOptions::transient(), callback).await,
        Err(Error::Closed(_))
    ));
    assert!(matches!(
        topic.last_acknowledged(&SubscriberName::new("closing").unwrap()).await,
        Err(Error::Closed(_))
    ));

    loop {
        if next_notice(&mut notices).await == Notice::Closed {
            break;
        }
    }

    // Closing drops every listener, which closes the delivery channel.
    let drained = tokio::time::timeout(RECV_TIMEOUT, async { while rx.recv().await.is_some() {} }).await;
    assert!(drained.is_ok());

    connection.close().await;
}

#[tokio::test]
async fn test_closing_keeps_persisted_data() {
    let connection = connect_in_memory().await;
    let topic = connection.topic("test-reopen").await.unwrap();
    let name = SubscriberName::new("keeper").unwrap();

    let (callback, mut rx) = collector();
    let _subscription = topic
        .subscribe("my-event", SubscribeOptions::durable(name.clone()).with_replay(), callback)
        .await
        .unwrap();
    let positions = publish_numbers(&topic, "my-event", 1..=2).await;
    assert_eq!(take_acking(&mut rx, 2).await, vec![1, 2]);
    topic.close().await;

    let reopened = connection.topic("test-reopen").await.unwrap();
    assert_eq!(reopened.last_acknowledged(&name).await.unwrap(), Some(positions[1]));

    connection.close().await;
}

#[tokio::test]
async fn test_tail_failure_is_broadcast() {
    let connection = connect_in_memory().await;
    // Not cached by the connection, so closing the connection does not close it.
    let topic = Topic::create(&connection, TopicName::new("orphan").unwrap(), TopicOptions::default())
        .await
        .unwrap();
    let mut notices = topic.notices();

    let (callback, _rx) = collector();
    let _subscription = topic
        .subscribe("my-event", SubscribeOptions::transient(), callback)
        .await
        .unwrap();

    connection.close().await;
    assert!(!connection.connected());

    match next_notice(&mut notices).await {
        Notice::TailError { message } => assert!(!message.is_empty()),
        other => panic!("expected tail error, got {other:?}"),
    }
    let publish = topic.publish("my-event", message(1)).await;
    assert!(publish.as_ref().is_err_and(Error::is_store_error), "{publish:?}");
}

#[tokio::test]
async fn test_connect_to_unopenable_path_fails() {
    let (dir, _) = create_temp_db_path("unused.db");
    // A directory is not a database file.
    let connection = Connection::new(ConnectionConfig::file(dir.path()));
    let result = connection.connect().await;
    assert!(matches!(result, Err(Error::Sqlite(_))), "{result:?}");
    assert!(!connection.connected());
}
