//! Abstract capability surface of a persistent, subject-based message broker.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Connections are sessions with the broker.
pub mod connection;

/// Consumers are broker-side cursors over a stream.
pub mod consumer;

/// Deliveries are messages handed to a consumer, awaiting ack or nak.
pub mod delivery;

/// Envelopes are the routable unit of publishing.
pub mod envelope;

/// Errors raised by broker backends.
pub mod error;

/// Key/value buckets backed by the broker.
pub mod key_value;

/// Streams are durable, append-only logs for a set of subjects.
pub mod stream;

pub use connection::{ConnectOptions, Connection, ConnectionStatus, Deliveries};
pub use consumer::{AckPolicy, ConsumerConfig, DeliverPolicy};
pub use delivery::Delivery;
pub use envelope::{Envelope, Headers};
pub use error::BrokerError;
pub use key_value::KeyValue;
pub use stream::{PublishAck, PublishOptions, StorageType, StreamConfig};

use async_trait::async_trait;
use std::fmt::Debug;

/// A broker that can open connections.
#[async_trait]
pub trait Broker
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the broker.
    type Error: BrokerError;

    /// The connection type produced by the broker.
    type Connection: Connection<Error = Self::Error>;

    /// Opens one session with the broker.
    async fn connect(&self, options: &ConnectOptions) -> Result<Self::Connection, Self::Error>;
}
