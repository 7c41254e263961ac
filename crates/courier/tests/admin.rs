use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;
use courier::{ConfigError, Error, HandlerFailure, PubSub, PubSubConfig, Subject, handler_fn};
use courier_broker::ConnectionStatus;
use courier_broker_memory::MemoryBroker;

async fn connect(broker: &MemoryBroker) -> PubSub<MemoryBroker> {
    PubSub::connect(
        broker,
        PubSubConfig {
            connect_wait_ms: 50,
            ..Default::default()
        },
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_connect_fails_fast_on_bad_config() {
    let result = PubSub::connect(
        &MemoryBroker::new(),
        PubSubConfig {
            servers: Vec::new(),
            ..Default::default()
        },
    )
    .await;

    assert_matches!(result, Err(Error::InvalidConfig(ConfigError::NoServers)));
}

#[tokio::test]
async fn test_unsubscribe_deletes_durable_consumer() {
    let broker = MemoryBroker::new();
    let pubsub = connect(&broker).await;
    let subject = Subject::new("orders", "orders.created")
        .unwrap()
        .with_group("workers");

    let subscription = pubsub
        .subscribe(
            &subject,
            handler_fn(|_context, _payload: Bytes| async { Ok::<_, HandlerFailure>(()) }),
        )
        .await
        .unwrap();
    assert_eq!(
        broker.consumer_names("orders"),
        vec!["orders-orders-created-workers".to_string()]
    );

    subscription.stop();
    pubsub.unsubscribe(&subject, None).await.unwrap();

    assert!(broker.consumer_names("orders").is_empty());

    pubsub.close().await.unwrap();
}

#[tokio::test]
async fn test_unsubscribe_without_group_is_noop() {
    let broker = MemoryBroker::new();
    let pubsub = connect(&broker).await;

    pubsub
        .unsubscribe(&Subject::new("orders", "orders.created").unwrap(), Some("tag1"))
        .await
        .unwrap();

    pubsub.close().await.unwrap();
}

#[tokio::test]
async fn test_delete_stream_and_recreate() {
    let broker = MemoryBroker::new();
    let pubsub = connect(&broker).await;
    let subject = Subject::new("orders", "orders.created").unwrap();

    pubsub.publish(&subject, "one".to_string()).await.unwrap();
    assert!(pubsub.registry().cached(&subject).is_some());

    pubsub.delete_stream(&subject).await.unwrap();
    assert!(broker.stream("orders").is_none());
    assert!(pubsub.registry().cached(&subject).is_none());

    // The next publish provisions the stream again.
    pubsub.publish(&subject, "two".to_string()).await.unwrap();
    assert_eq!(broker.stream_messages("orders").len(), 1);

    pubsub.close().await.unwrap();
}

#[tokio::test]
async fn test_delete_all_streams() {
    let broker = MemoryBroker::new();
    let pubsub = connect(&broker).await;

    for (category, name) in [("orders", "orders.created"), ("billing", "billing.sent")] {
        let subject = Subject::new(category, name).unwrap();
        pubsub.publish(&subject, "x".to_string()).await.unwrap();
    }

    let mut names = pubsub.stream_names().await.unwrap();
    names.sort();
    assert_eq!(names, vec!["billing".to_string(), "orders".to_string()]);

    assert_eq!(pubsub.delete_all_streams().await.unwrap(), 2);
    assert!(pubsub.stream_names().await.unwrap().is_empty());
    assert!(
        pubsub
            .registry()
            .cached(&Subject::new("orders", "orders.created").unwrap())
            .is_none()
    );

    pubsub.close().await.unwrap();
}

#[tokio::test]
async fn test_bucket_strings() {
    let broker = MemoryBroker::new();
    let pubsub = connect(&broker).await;

    let bucket = pubsub.bucket("settings").await.unwrap();
    assert_eq!(bucket.name(), "settings");

    bucket.put_string("greeting", "hello").await.unwrap();
    assert_eq!(
        bucket.get_string("greeting").await.unwrap().as_deref(),
        Some("hello")
    );
    assert_eq!(bucket.get_string("missing").await.unwrap(), None);

    bucket
        .put("binary", Bytes::from_static(b"\xff\xfe"))
        .await
        .unwrap();
    assert_matches!(bucket.get_string("binary").await, Err(Error::Codec(_)));

    // Another handle on the same bucket sees the writes.
    let again = pubsub.bucket("settings").await.unwrap();
    assert_eq!(
        again.get("greeting").await.unwrap(),
        Some(Bytes::from_static(b"hello"))
    );

    pubsub.close().await.unwrap();
}

#[tokio::test]
async fn test_flush_and_close() {
    let broker = MemoryBroker::new();
    let pubsub = connect(&broker).await;

    pubsub.flush(Duration::from_secs(1)).await.unwrap();

    pubsub.close().await.unwrap();
    assert!(pubsub.is_closed());

    let result = pubsub
        .publish(&Subject::new("orders", "orders.created").unwrap(), "x".to_string())
        .await;
    assert_matches!(result, Err(Error::Shutdown));
}

#[tokio::test]
async fn test_publish_fails_when_connection_stays_down() {
    let broker = MemoryBroker::new();
    let pubsub = connect(&broker).await;

    broker.set_status_all(ConnectionStatus::Disconnected);

    let result = pubsub
        .publish(&Subject::new("orders", "orders.created").unwrap(), "x".to_string())
        .await;
    assert_matches!(result, Err(Error::ConnectionFailed(_)));

    broker.set_status_all(ConnectionStatus::Connected);
    pubsub.close().await.unwrap();
}
