use crate::error::Error;
use crate::server::Server;

use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use courier_broker::{Delivery, Envelope};
use tracing::trace;

/// A message handed to an in-memory consumer.
pub struct MemoryDelivery {
    server: Arc<Server>,
    stream: String,
    consumer: String,
    sequence: u64,
    envelope: Envelope,
    delivery_count: u64,
    settled: Arc<AtomicBool>,
}

impl MemoryDelivery {
    pub(crate) fn new(
        server: Arc<Server>,
        stream: String,
        consumer: String,
        sequence: u64,
        envelope: Envelope,
        delivery_count: u64,
    ) -> Self {
        Self {
            server,
            stream,
            consumer,
            sequence,
            envelope,
            delivery_count,
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn settled_flag(&self) -> Arc<AtomicBool> {
        self.settled.clone()
    }

    /// Stream sequence of the delivered message.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl Debug for MemoryDelivery {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("MemoryDelivery")
            .field("stream", &self.stream)
            .field("consumer", &self.consumer)
            .field("sequence", &self.sequence)
            .field("delivery_count", &self.delivery_count)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    type Error = Error;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn delivery_count(&self) -> u64 {
        self.delivery_count
    }

    async fn ack_sync(&self) -> Result<(), Self::Error> {
        if self.settled.swap(true, Ordering::SeqCst) {
            trace!(sequence = self.sequence, "delivery already settled");
            return Ok(());
        }

        self.server
            .settle(&self.stream, &self.consumer, self.sequence)
    }

    async fn nak_with_delay(&self, delay: Duration) -> Result<(), Self::Error> {
        if self.settled.swap(true, Ordering::SeqCst) {
            trace!(sequence = self.sequence, "delivery already settled");
            return Ok(());
        }

        self.server
            .release_later(&self.stream, &self.consumer, self.sequence, delay)
    }
}
