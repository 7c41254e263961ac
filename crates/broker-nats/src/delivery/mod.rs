use crate::error::Error;

use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::time::Duration;

use async_nats::HeaderMap;
use async_nats::jetstream::{AckKind, Message};
use async_trait::async_trait;
use courier_broker::{Delivery, Envelope, Headers};

/// A JetStream message delivered to a push consumer.
pub struct NatsDelivery {
    delivery_count: u64,
    envelope: Envelope,
    message: Message,
}

impl NatsDelivery {
    pub(crate) fn new(message: Message) -> Self {
        let headers = message
            .headers
            .as_ref()
            .map(extract_headers)
            .unwrap_or_default();

        let delivery_count = message
            .info()
            .ok()
            .and_then(|info| u64::try_from(info.delivered).ok())
            .unwrap_or(1);

        let envelope = Envelope::new(
            message.subject.to_string(),
            headers,
            message.payload.clone(),
        );

        Self {
            delivery_count,
            envelope,
            message,
        }
    }
}

fn extract_headers(headers: &HeaderMap) -> Headers {
    let mut result = Headers::new();
    for (name, values) in headers.iter() {
        for value in values {
            result.append(name.to_string(), value.to_string());
        }
    }
    result
}

impl Debug for NatsDelivery {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("NatsDelivery")
            .field("subject", &self.envelope.subject)
            .field("delivery_count", &self.delivery_count)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Delivery for NatsDelivery {
    type Error = Error;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn delivery_count(&self) -> u64 {
        self.delivery_count
    }

    async fn ack_sync(&self) -> Result<(), Self::Error> {
        self.message.double_ack().await.map_err(Error::Ack)
    }

    async fn nak_with_delay(&self, delay: Duration) -> Result<(), Self::Error> {
        self.message
            .ack_with(AckKind::Nak(Some(delay)))
            .await
            .map_err(Error::Ack)
    }
}
