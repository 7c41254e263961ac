use crate::envelope::Envelope;
use crate::error::BrokerError;

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;

/// A message delivered to a consumer.
#[async_trait]
pub trait Delivery
where
    Self: Debug + Send + Sync + 'static,
{
    /// The error type for acknowledgements.
    type Error: BrokerError;

    /// The delivered envelope.
    fn envelope(&self) -> &Envelope;

    /// How many times this message has been delivered, this delivery included.
    fn delivery_count(&self) -> u64;

    /// Acknowledges and waits for the broker to confirm.
    async fn ack_sync(&self) -> Result<(), Self::Error>;

    /// Asks the broker to redeliver after `delay`.
    async fn nak_with_delay(&self, delay: Duration) -> Result<(), Self::Error>;
}
