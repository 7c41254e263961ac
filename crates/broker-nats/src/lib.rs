//! NATS JetStream implementation of the broker crate.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Client sessions with a NATS server.
pub mod connection;

/// JetStream messages handed to push consumers.
pub mod delivery;

mod error;

/// JetStream key/value buckets.
pub mod key_value;

pub use connection::NatsConnection;
pub use delivery::NatsDelivery;
pub use error::Error;
pub use key_value::NatsKeyValue;

use async_trait::async_trait;
use courier_broker::{Broker, ConnectOptions};
use tracing::debug;

/// Opens connections to a NATS server with JetStream enabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct NatsBroker;

impl NatsBroker {
    /// Creates a new NATS broker.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Broker for NatsBroker {
    type Error = Error;
    type Connection = NatsConnection;

    async fn connect(&self, options: &ConnectOptions) -> Result<Self::Connection, Self::Error> {
        let mut connect_options = async_nats::ConnectOptions::new();

        if let Some(name) = &options.name {
            connect_options = connect_options.name(name);
        }

        if let Some((username, password)) = &options.credentials {
            connect_options = connect_options.user_and_password(username.clone(), password.clone());
        }

        let servers = options.servers.join(",");
        debug!(%servers, "connecting to nats");

        let client = connect_options.connect(servers).await?;

        Ok(NatsConnection::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use courier_broker::{
        Connection, ConnectionStatus, ConsumerConfig, Delivery, Envelope, Headers, KeyValue,
        PublishOptions, StorageType, StreamConfig,
    };
    use futures::StreamExt;
    use std::time::Duration;

    fn local_options() -> ConnectOptions {
        ConnectOptions {
            servers: vec!["localhost:4222".to_string()],
            name: Some("courier-test".to_string()),
            credentials: None,
        }
    }

    fn unique(prefix: &str) -> String {
        format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
    }

    #[tokio::test]
    #[ignore = "requires a running NATS server"]
    async fn test_stream_lifecycle() {
        let connection = NatsBroker::new()
            .connect(&local_options())
            .await
            .expect("Failed to connect to NATS");

        assert_eq!(connection.status(), ConnectionStatus::Connected);

        let name = unique("lifecycle");
        let config = StreamConfig {
            name: name.clone(),
            subjects: vec![format!("{name}.a")],
            storage: StorageType::Memory,
            max_age: Duration::from_secs(60),
        };

        // Create, then read back
        connection.add_stream(config.clone()).await.unwrap();
        let info = connection.stream_info(&name).await.unwrap().unwrap();
        assert!(info.has_subject(&format!("{name}.a")));

        // Extend the subject list
        let mut extended = info.clone();
        extended.subjects.push(format!("{name}.b"));
        let updated = connection.update_stream(extended).await.unwrap();
        assert_eq!(updated.subjects.len(), 2);

        assert!(connection.stream_names().await.unwrap().contains(&name));

        connection.delete_stream(&name).await.unwrap();
        assert!(connection.stream_info(&name).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires a running NATS server"]
    async fn test_publish_and_consume() {
        let connection = NatsBroker::new()
            .connect(&local_options())
            .await
            .expect("Failed to connect to NATS");

        let name = unique("consume");
        let subject = format!("{name}.x");
        connection
            .add_stream(StreamConfig {
                name: name.clone(),
                subjects: vec![subject.clone()],
                storage: StorageType::Memory,
                max_age: Duration::from_secs(60),
            })
            .await
            .unwrap();

        let mut headers = Headers::new();
        headers.insert("trace-id", "abc");
        let ack = connection
            .publish(
                Envelope::new(subject.clone(), headers, Bytes::from_static(b"hello")),
                PublishOptions {
                    message_id: Some("m1".to_string()),
                    expected_stream: Some(name.clone()),
                },
            )
            .await
            .unwrap();
        assert_eq!(ack.stream, name);

        let mut deliveries = connection
            .consume(ConsumerConfig {
                stream: name.clone(),
                filter_subject: subject.clone(),
                durable_name: Some("d1".to_string()),
                max_ack_pending: 10,
                ..Default::default()
            })
            .await
            .unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(5), deliveries.next())
            .await
            .expect("timed out")
            .unwrap()
            .unwrap();

        assert_eq!(delivery.envelope().payload, Bytes::from_static(b"hello"));
        assert_eq!(delivery.envelope().headers.get("trace-id"), Some("abc"));
        assert_eq!(delivery.delivery_count(), 1);
        delivery.ack_sync().await.unwrap();

        connection.delete_stream(&name).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a running NATS server"]
    async fn test_key_value() {
        let connection = NatsBroker::new()
            .connect(&local_options())
            .await
            .expect("Failed to connect to NATS");

        let bucket = connection.key_value(&unique("bucket")).await.unwrap();

        bucket.put("k", Bytes::from_static(b"v")).await.unwrap();
        assert_eq!(
            bucket.get("k").await.unwrap(),
            Some(Bytes::from_static(b"v"))
        );
        assert_eq!(bucket.get("missing").await.unwrap(), None);
    }
}
