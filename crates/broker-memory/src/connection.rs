use crate::delivery::MemoryDelivery;
use crate::error::Error;
use crate::key_value::MemoryKeyValue;
use crate::server::Server;

use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;

use async_trait::async_trait;
use courier_broker::{
    Connection, ConnectionStatus, ConsumerConfig, Deliveries, Envelope, PublishAck,
    PublishOptions, StreamConfig,
};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

/// A session with a [`crate::MemoryBroker`].
#[derive(Clone)]
pub struct MemoryConnection {
    name: Option<String>,
    server: Arc<Server>,
    status: Arc<Mutex<ConnectionStatus>>,
}

impl MemoryConnection {
    pub(crate) const fn new(
        name: Option<String>,
        server: Arc<Server>,
        status: Arc<Mutex<ConnectionStatus>>,
    ) -> Self {
        Self {
            name,
            server,
            status,
        }
    }

    /// Forces the status of this connection, simulating an outage or recovery.
    pub fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock() = status;
    }

    fn ensure_connected(&self) -> Result<(), Error> {
        match *self.status.lock() {
            ConnectionStatus::Connected => Ok(()),
            other => Err(Error::NotConnected(other)),
        }
    }
}

impl Debug for MemoryConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("MemoryConnection")
            .field("name", &self.name)
            .field("status", &*self.status.lock())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    type Error = Error;
    type Delivery = MemoryDelivery;
    type KeyValue = MemoryKeyValue;

    fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    async fn flush(&self) -> Result<(), Self::Error> {
        self.ensure_connected()
    }

    async fn close(&self) -> Result<(), Self::Error> {
        debug!(name = ?self.name, "closing memory connection");
        *self.status.lock() = ConnectionStatus::Closed;

        Ok(())
    }

    async fn stream_info(&self, name: &str) -> Result<Option<StreamConfig>, Self::Error> {
        self.ensure_connected()?;

        Ok(self.server.stream_info(name))
    }

    async fn add_stream(&self, config: StreamConfig) -> Result<StreamConfig, Self::Error> {
        self.ensure_connected()?;

        self.server.add_stream(config)
    }

    async fn update_stream(&self, config: StreamConfig) -> Result<StreamConfig, Self::Error> {
        self.ensure_connected()?;

        self.server.update_stream(config)
    }

    async fn delete_stream(&self, name: &str) -> Result<(), Self::Error> {
        self.ensure_connected()?;

        self.server.delete_stream(name)
    }

    async fn stream_names(&self) -> Result<Vec<String>, Self::Error> {
        self.ensure_connected()?;

        Ok(self.server.stream_names())
    }

    async fn publish(
        &self,
        envelope: Envelope,
        options: PublishOptions,
    ) -> Result<PublishAck, Self::Error> {
        self.ensure_connected()?;

        self.server.publish(envelope, options)
    }

    async fn consume(
        &self,
        config: ConsumerConfig,
    ) -> Result<Deliveries<Self::Delivery, Self::Error>, Self::Error> {
        self.ensure_connected()?;

        let (sender, receiver) = mpsc::unbounded_channel();
        self.server.attach(config, sender)?;

        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn delete_consumer(&self, stream: &str, consumer: &str) -> Result<(), Self::Error> {
        self.ensure_connected()?;

        self.server.delete_consumer(stream, consumer)
    }

    async fn key_value(&self, bucket: &str) -> Result<Self::KeyValue, Self::Error> {
        self.ensure_connected()?;

        Ok(MemoryKeyValue::new(self.server.clone(), bucket.to_string()))
    }
}
