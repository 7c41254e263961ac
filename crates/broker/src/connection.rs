use crate::consumer::ConsumerConfig;
use crate::delivery::Delivery;
use crate::envelope::Envelope;
use crate::error::BrokerError;
use crate::key_value::KeyValue;
use crate::stream::{PublishAck, PublishOptions, StreamConfig};

use std::fmt::Debug;

use async_trait::async_trait;
use futures::stream::BoxStream;

/// Stream of deliveries for one consumer subscription.
pub type Deliveries<D, E> = BoxStream<'static, Result<D, E>>;

/// Health of a connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionStatus {
    /// Handshake still in progress.
    Pending,

    /// Connected and usable.
    Connected,

    /// Lost; the backend may be reconnecting.
    Disconnected,

    /// Closed by the owner.
    Closed,
}

/// Options for opening a connection.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnectOptions {
    /// Broker addresses.
    pub servers: Vec<String>,

    /// Connection display name.
    pub name: Option<String>,

    /// Username and password.
    pub credentials: Option<(String, String)>,
}

/// One session with the broker, together with its messaging context.
#[async_trait]
pub trait Connection
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the connection.
    type Error: BrokerError;

    /// Deliveries produced by consumers on this connection.
    type Delivery: Delivery<Error = Self::Error>;

    /// Key/value buckets on this connection.
    type KeyValue: KeyValue<Error = Self::Error>;

    /// Current status.
    fn status(&self) -> ConnectionStatus;

    /// Flushes buffered outbound data.
    async fn flush(&self) -> Result<(), Self::Error>;

    /// Closes the connection.
    async fn close(&self) -> Result<(), Self::Error>;

    /// Reads the definition of stream `name`, or `None` if it does not exist.
    async fn stream_info(&self, name: &str) -> Result<Option<StreamConfig>, Self::Error>;

    /// Creates a stream.
    async fn add_stream(&self, config: StreamConfig) -> Result<StreamConfig, Self::Error>;

    /// Replaces the definition of an existing stream.
    async fn update_stream(&self, config: StreamConfig) -> Result<StreamConfig, Self::Error>;

    /// Deletes a stream and its consumers.
    async fn delete_stream(&self, name: &str) -> Result<(), Self::Error>;

    /// Names of every stream.
    async fn stream_names(&self) -> Result<Vec<String>, Self::Error>;

    /// Publishes an envelope and waits for the broker's acknowledgement.
    async fn publish(
        &self,
        envelope: Envelope,
        options: PublishOptions,
    ) -> Result<PublishAck, Self::Error>;

    /// Creates (or binds to) a push consumer and starts receiving its deliveries.
    async fn consume(
        &self,
        config: ConsumerConfig,
    ) -> Result<Deliveries<Self::Delivery, Self::Error>, Self::Error>;

    /// Deletes a durable consumer.
    async fn delete_consumer(&self, stream: &str, consumer: &str) -> Result<(), Self::Error>;

    /// Creates or binds the key/value bucket `bucket`.
    async fn key_value(&self, bucket: &str) -> Result<Self::KeyValue, Self::Error>;
}
