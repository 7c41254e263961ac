use crate::codec::Payload;
use crate::delay;
use crate::error::Error;
use crate::pool::ConnectionPool;
use crate::registry::StreamRegistry;
use crate::subject::Subject;
use crate::trace::TraceContext;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use courier_broker::{Broker, Connection, Envelope, Headers, PublishAck, PublishOptions};
use tracing::{debug, instrument};
use uuid::Uuid;

/// Header naming the consumers a message is meant for.
pub const TAG_HEADER: &str = "tag";

/// Optional extras of a publish.
#[derive(Clone, Debug, Default)]
pub struct PublishExtras {
    /// Trace to continue; a new one is started when absent.
    pub trace: Option<TraceContext>,

    /// Deliver no earlier than this long after publishing.
    pub delay: Option<Duration>,

    /// Only tag-specific subscribers for this tag (and untagged ones) handle it.
    pub tag: Option<String>,
}

/// Encodes payloads and publishes them to their category stream.
#[derive(Debug)]
pub struct Publisher<B>
where
    B: Broker,
{
    pool: Arc<ConnectionPool<B>>,
    registry: Arc<StreamRegistry<B>>,
}

impl<B> Publisher<B>
where
    B: Broker,
{
    /// Creates a publisher over a pool and registry.
    #[must_use]
    pub const fn new(pool: Arc<ConnectionPool<B>>, registry: Arc<StreamRegistry<B>>) -> Self {
        Self { pool, registry }
    }

    /// Publishes `payload` for immediate delivery.
    ///
    /// # Errors
    ///
    /// Fails on encoding, provisioning, connection or broker errors. Nothing is retried.
    pub async fn publish<T>(&self, subject: &Subject, payload: T) -> Result<PublishAck, Error<B::Error>>
    where
        T: Payload,
    {
        self.publish_with(subject, payload, PublishExtras::default())
            .await
    }

    /// Publishes `payload` so that delay subscribers handle it no earlier than `delay` from now.
    ///
    /// # Errors
    ///
    /// See [`Self::publish`].
    pub async fn publish_delay<T>(
        &self,
        subject: &Subject,
        payload: T,
        delay: Duration,
    ) -> Result<PublishAck, Error<B::Error>>
    where
        T: Payload,
    {
        self.publish_with(
            subject,
            payload,
            PublishExtras {
                delay: Some(delay),
                ..Default::default()
            },
        )
        .await
    }

    /// Publishes `payload` tagged for the subscribers of `tag`.
    ///
    /// # Errors
    ///
    /// See [`Self::publish`].
    pub async fn publish_with_tag<T>(
        &self,
        subject: &Subject,
        tag: &str,
        payload: T,
    ) -> Result<PublishAck, Error<B::Error>>
    where
        T: Payload,
    {
        self.publish_with(
            subject,
            payload,
            PublishExtras {
                tag: Some(tag.to_string()),
                ..Default::default()
            },
        )
        .await
    }

    /// Publishes with any combination of trace, delay and tag.
    ///
    /// # Errors
    ///
    /// See [`Self::publish`].
    #[instrument(skip_all, fields(category = subject.category(), subject = subject.name()))]
    pub async fn publish_with<T>(
        &self,
        subject: &Subject,
        payload: T,
        extras: PublishExtras,
    ) -> Result<PublishAck, Error<B::Error>>
    where
        T: Payload,
    {
        let payload = payload.encode()?;

        let trace = extras.trace.unwrap_or_default();
        let mut headers = Headers::new();
        trace.write_to(&mut headers);
        if let Some(delay) = extras.delay {
            delay::stamp(&mut headers, SystemTime::now(), delay);
        }
        if let Some(tag) = extras.tag.filter(|t| !t.is_empty()) {
            headers.insert(TAG_HEADER, tag);
        }

        self.registry.ensure_stream(subject).await?;
        let connection = self.pool.pick().await?;

        let options = PublishOptions {
            message_id: Some(Uuid::new_v4().to_string()),
            expected_stream: Some(subject.category().to_string()),
        };
        let ack = connection
            .publish(Envelope::new(subject.name(), headers, payload), options)
            .await
            .map_err(Error::Broker)?;

        debug!(trace_id = %trace, stream = %ack.stream, sequence = ack.sequence, "published");

        Ok(ack)
    }
}
