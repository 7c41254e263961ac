//! In-memory (single process) implementation of the broker capability for local development and tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::cast_possible_truncation)]

mod connection;
mod delivery;
mod error;
mod key_value;
mod server;

pub use connection::MemoryConnection;
pub use delivery::MemoryDelivery;
pub use error::Error;
pub use key_value::MemoryKeyValue;
pub use server::MemoryBrokerOptions;

use server::Server;

use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;

use async_trait::async_trait;
use courier_broker::{Broker, ConnectOptions, ConnectionStatus, Envelope, StreamConfig};

/// An in-memory broker. Clones share the same streams, consumers and buckets.
#[derive(Clone)]
pub struct MemoryBroker {
    server: Arc<Server>,
}

impl MemoryBroker {
    /// Creates a broker with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(MemoryBrokerOptions::default())
    }

    /// Creates a broker with the given options.
    #[must_use]
    pub fn with_options(options: MemoryBrokerOptions) -> Self {
        Self {
            server: Arc::new(Server::new(options)),
        }
    }

    /// Makes subsequent `connect` calls fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.server.state.lock().refuse_connections = refuse;
    }

    /// Status that newly opened connections start in.
    pub fn set_initial_status(&self, status: ConnectionStatus) {
        self.server.state.lock().initial_status = status;
    }

    /// Forces the status of every open connection.
    pub fn set_status_all(&self, status: ConnectionStatus) {
        self.server.set_all_statuses(status);
    }

    /// Definition of stream `name`, without counting as an admin request.
    #[must_use]
    pub fn stream(&self, name: &str) -> Option<StreamConfig> {
        self.server.stream_config(name)
    }

    /// Every message stored in stream `name`.
    #[must_use]
    pub fn stream_messages(&self, name: &str) -> Vec<Envelope> {
        self.server.stream_messages(name)
    }

    /// Names of the consumers on stream `name`.
    #[must_use]
    pub fn consumer_names(&self, stream: &str) -> Vec<String> {
        self.server.consumer_names(stream)
    }

    /// Number of stream/consumer administration requests served so far.
    #[must_use]
    pub fn admin_requests(&self) -> usize {
        self.server.admin_requests()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for MemoryBroker {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("MemoryBroker")
            .field("options", &self.server.options)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Error = Error;
    type Connection = MemoryConnection;

    async fn connect(&self, options: &ConnectOptions) -> Result<Self::Connection, Self::Error> {
        let status = self.server.open_connection()?;

        Ok(MemoryConnection::new(
            options.name.clone(),
            self.server.clone(),
            status,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use assert_matches::assert_matches;
    use courier_broker::{
        BrokerError, Connection, ConsumerConfig, Deliveries, Delivery, Headers, KeyValue,
        PublishOptions, StorageType,
    };
    use futures::StreamExt;

    fn stream_config(name: &str, subjects: &[&str]) -> StreamConfig {
        StreamConfig {
            name: name.to_string(),
            subjects: subjects.iter().map(ToString::to_string).collect(),
            storage: StorageType::File,
            max_age: Duration::ZERO,
        }
    }

    fn consumer_config(stream: &str, filter: &str) -> ConsumerConfig {
        ConsumerConfig {
            stream: stream.to_string(),
            filter_subject: filter.to_string(),
            max_ack_pending: 100,
            ..Default::default()
        }
    }

    async fn next(
        deliveries: &mut Deliveries<MemoryDelivery, Error>,
    ) -> Option<MemoryDelivery> {
        tokio::time::timeout(Duration::from_millis(500), deliveries.next())
            .await
            .ok()
            .flatten()
            .map(|d| d.expect("delivery error"))
    }

    async fn connected() -> (MemoryBroker, MemoryConnection) {
        let broker = MemoryBroker::new();
        let connection = broker
            .connect(&ConnectOptions::default())
            .await
            .expect("Failed to connect");
        (broker, connection)
    }

    #[tokio::test]
    async fn test_add_stream_is_idempotent_for_identical_config() {
        let (_, connection) = connected().await;

        connection
            .add_stream(stream_config("orders", &["orders.created"]))
            .await
            .expect("Failed to add stream");

        // Same definition again succeeds
        assert!(connection
            .add_stream(stream_config("orders", &["orders.created"]))
            .await
            .is_ok());

        // Different definition reports already-exists
        let err = connection
            .add_stream(stream_config("orders", &["orders.updated"]))
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_publish_requires_capturing_stream() {
        let (_, connection) = connected().await;

        let result = connection
            .publish(
                Envelope::new("nowhere", Headers::new(), "x"),
                PublishOptions::default(),
            )
            .await;

        assert_matches!(result, Err(Error::NoStreamForSubject(_)));
    }

    #[tokio::test]
    async fn test_expected_stream_mismatch() {
        let (_, connection) = connected().await;
        connection
            .add_stream(stream_config("orders", &["orders.created"]))
            .await
            .unwrap();

        let result = connection
            .publish(
                Envelope::new("orders.created", Headers::new(), "x"),
                PublishOptions {
                    expected_stream: Some("payments".to_string()),
                    ..Default::default()
                },
            )
            .await;

        assert_matches!(result, Err(Error::WrongStream { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_message_id_is_discarded() {
        let (broker, connection) = connected().await;
        connection
            .add_stream(stream_config("orders", &["orders.created"]))
            .await
            .unwrap();

        let options = PublishOptions {
            message_id: Some("id-1".to_string()),
            ..Default::default()
        };
        let first = connection
            .publish(Envelope::new("orders.created", Headers::new(), "x"), options.clone())
            .await
            .unwrap();
        let second = connection
            .publish(Envelope::new("orders.created", Headers::new(), "x"), options)
            .await
            .unwrap();

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.sequence, second.sequence);
        assert_eq!(broker.stream_messages("orders").len(), 1);
    }

    #[tokio::test]
    async fn test_deliver_last_starts_at_most_recent_message() {
        let (_, connection) = connected().await;
        connection
            .add_stream(stream_config("orders", &["orders.created"]))
            .await
            .unwrap();

        for payload in ["one", "two"] {
            connection
                .publish(
                    Envelope::new("orders.created", Headers::new(), payload),
                    PublishOptions::default(),
                )
                .await
                .unwrap();
        }

        let mut deliveries = connection
            .consume(consumer_config("orders", "orders.created"))
            .await
            .unwrap();

        let delivery = next(&mut deliveries).await.expect("no delivery");
        assert_eq!(delivery.envelope().payload, "two");
        delivery.ack_sync().await.unwrap();

        assert!(next(&mut deliveries).await.is_none());
    }

    #[tokio::test]
    async fn test_nak_with_delay_redelivers() {
        let (_, connection) = connected().await;
        connection
            .add_stream(stream_config("orders", &["orders.created"]))
            .await
            .unwrap();
        let mut deliveries = connection
            .consume(consumer_config("orders", "orders.created"))
            .await
            .unwrap();

        connection
            .publish(
                Envelope::new("orders.created", Headers::new(), "x"),
                PublishOptions::default(),
            )
            .await
            .unwrap();

        let first = next(&mut deliveries).await.expect("no delivery");
        assert_eq!(first.delivery_count(), 1);
        first
            .nak_with_delay(Duration::from_millis(50))
            .await
            .unwrap();

        let second = next(&mut deliveries).await.expect("no redelivery");
        assert_eq!(second.delivery_count(), 2);
        assert_eq!(second.sequence(), first.sequence());
        second.ack_sync().await.unwrap();

        assert!(next(&mut deliveries).await.is_none());
    }

    #[tokio::test]
    async fn test_unsettled_delivery_redelivered_after_ack_wait() {
        let broker = MemoryBroker::with_options(MemoryBrokerOptions {
            ack_wait: Duration::from_millis(50),
            ..Default::default()
        });
        let connection = broker.connect(&ConnectOptions::default()).await.unwrap();
        connection
            .add_stream(stream_config("orders", &["orders.created"]))
            .await
            .unwrap();
        let mut deliveries = connection
            .consume(consumer_config("orders", "orders.created"))
            .await
            .unwrap();

        connection
            .publish(
                Envelope::new("orders.created", Headers::new(), "x"),
                PublishOptions::default(),
            )
            .await
            .unwrap();

        // Left unsettled
        let first = next(&mut deliveries).await.expect("no delivery");
        let second = next(&mut deliveries).await.expect("no redelivery");
        assert_eq!(first.sequence(), second.sequence());
        assert_eq!(second.delivery_count(), 2);
    }

    #[tokio::test]
    async fn test_max_ack_pending_applies_backpressure() {
        let (_, connection) = connected().await;
        connection
            .add_stream(stream_config("orders", &["orders.created"]))
            .await
            .unwrap();
        let mut deliveries = connection
            .consume(ConsumerConfig {
                max_ack_pending: 1,
                ..consumer_config("orders", "orders.created")
            })
            .await
            .unwrap();

        for payload in ["one", "two"] {
            connection
                .publish(
                    Envelope::new("orders.created", Headers::new(), payload),
                    PublishOptions::default(),
                )
                .await
                .unwrap();
        }

        let first = next(&mut deliveries).await.expect("no delivery");
        assert!(next(&mut deliveries).await.is_none());

        first.ack_sync().await.unwrap();
        let second = next(&mut deliveries).await.expect("no delivery after ack");
        assert_eq!(second.envelope().payload, "two");
    }

    #[tokio::test]
    async fn test_queue_group_members_share_deliveries() {
        let (_, connection) = connected().await;
        connection
            .add_stream(stream_config("orders", &["orders.created"]))
            .await
            .unwrap();

        let config = ConsumerConfig {
            durable_name: Some("orders-workers".to_string()),
            deliver_group: Some("workers".to_string()),
            ..consumer_config("orders", "orders.created")
        };
        let mut first_member = connection.consume(config.clone()).await.unwrap();
        let mut second_member = connection.consume(config).await.unwrap();

        for payload in ["one", "two"] {
            connection
                .publish(
                    Envelope::new("orders.created", Headers::new(), payload),
                    PublishOptions::default(),
                )
                .await
                .unwrap();
        }

        let a = next(&mut first_member).await.expect("first member idle");
        let b = next(&mut second_member).await.expect("second member idle");
        assert_ne!(a.sequence(), b.sequence());
    }

    #[tokio::test]
    async fn test_durable_without_group_cannot_bind_twice() {
        let (_, connection) = connected().await;
        connection
            .add_stream(stream_config("orders", &["orders.created"]))
            .await
            .unwrap();

        let config = ConsumerConfig {
            durable_name: Some("solo".to_string()),
            ..consumer_config("orders", "orders.created")
        };
        let _bound = connection.consume(config.clone()).await.unwrap();

        assert_matches!(
            connection.consume(config).await.err(),
            Some(Error::ConsumerInUse(_))
        );
    }

    #[tokio::test]
    async fn test_delete_consumer() {
        let (broker, connection) = connected().await;
        connection
            .add_stream(stream_config("orders", &["orders.created"]))
            .await
            .unwrap();
        let _deliveries = connection
            .consume(ConsumerConfig {
                durable_name: Some("solo".to_string()),
                ..consumer_config("orders", "orders.created")
            })
            .await
            .unwrap();

        assert_eq!(broker.consumer_names("orders"), vec!["solo".to_string()]);
        connection.delete_consumer("orders", "solo").await.unwrap();
        assert!(broker.consumer_names("orders").is_empty());

        let err = connection
            .delete_consumer("orders", "solo")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_operations() {
        let (_, connection) = connected().await;
        connection.close().await.unwrap();

        assert_eq!(connection.status(), ConnectionStatus::Closed);
        assert_matches!(
            connection.stream_names().await,
            Err(Error::NotConnected(ConnectionStatus::Closed))
        );
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(true);

        assert_matches!(
            broker.connect(&ConnectOptions::default()).await,
            Err(Error::ConnectionRefused)
        );
    }

    #[tokio::test]
    async fn test_key_value_round_trip() {
        let (_, connection) = connected().await;
        let bucket = connection.key_value("settings").await.unwrap();

        assert_eq!(bucket.get("missing").await.unwrap(), None);

        let first = bucket.put("mode", "fast".into()).await.unwrap();
        let second = bucket.put("mode", "slow".into()).await.unwrap();
        assert!(second > first);
        assert_eq!(bucket.get("mode").await.unwrap(), Some("slow".into()));
    }
}
