//! Pub/sub convenience layer over a persistent, subject-based message broker.
//!
//! [`PubSub`] owns a pool of broker connections and provisions streams on
//! first use. On top of the broker's primitives it adds tag-filtered fan-out
//! and delayed delivery, emulated with timing headers and delayed redelivery.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod bucket;
mod codec;
mod config;
pub mod delay;
mod error;
mod handler;
mod pool;
mod publisher;
mod registry;
mod subject;
mod subscriber;
mod trace;

pub use bucket::Bucket;
pub use codec::{CodecError, Json, Payload};
pub use config::{ConfigError, PubSubConfig, UndecodablePolicy};
pub use error::Error;
pub use handler::{FnHandler, Handler, HandlerError, HandlerFailure, handler_fn};
pub use pool::ConnectionPool;
pub use publisher::{PublishExtras, Publisher, TAG_HEADER};
pub use registry::StreamRegistry;
pub use subject::{Subject, SubjectError, normalize};
pub use subscriber::{Subscriber, Subscription};
pub use trace::{MessageContext, TRACE_ID_HEADER, TraceContext};

use std::sync::Arc;
use std::time::Duration;

use courier_broker::{Broker, Connection, PublishAck};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, instrument};

/// Bucket type of a broker's connections.
pub type BrokerBucket<B> = Bucket<<<B as Broker>::Connection as Connection>::KeyValue>;

/// The pub/sub service: a connection pool, a stream registry, and the
/// publisher and subscriber built on them.
///
/// Clones share the same pool, cache and subscriptions.
#[derive(Clone, Debug)]
pub struct PubSub<B>
where
    B: Broker,
{
    config: Arc<PubSubConfig>,
    pool: Arc<ConnectionPool<B>>,
    publisher: Arc<Publisher<B>>,
    registry: Arc<StreamRegistry<B>>,
    shutdown: CancellationToken,
    subscriber: Arc<Subscriber<B>>,
    task_tracker: TaskTracker,
}

impl<B> PubSub<B>
where
    B: Broker,
{
    /// Validates `config` and fills the connection pool.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration or when any connection cannot be
    /// opened healthy; no connection is left open in that case.
    pub async fn connect(broker: &B, config: PubSubConfig) -> Result<Self, Error<B::Error>> {
        let shutdown = CancellationToken::new();
        let task_tracker = TaskTracker::new();

        let pool = Arc::new(ConnectionPool::connect(broker, &config, shutdown.clone()).await?);
        let registry = Arc::new(StreamRegistry::new(pool.clone(), config.default_max_age()));
        let publisher = Arc::new(Publisher::new(pool.clone(), registry.clone()));
        let subscriber = Arc::new(Subscriber::new(
            pool.clone(),
            registry.clone(),
            &config,
            shutdown.clone(),
            task_tracker.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            pool,
            publisher,
            registry,
            shutdown,
            subscriber,
            task_tracker,
        })
    }

    /// The configuration the service was connected with.
    #[must_use]
    pub fn config(&self) -> &PubSubConfig {
        &self.config
    }

    /// The stream registry.
    #[must_use]
    pub fn registry(&self) -> &StreamRegistry<B> {
        &self.registry
    }

    /// Publishes `payload` to `subject`.
    ///
    /// # Errors
    ///
    /// See [`Publisher::publish`].
    pub async fn publish<T>(&self, subject: &Subject, payload: T) -> Result<PublishAck, Error<B::Error>>
    where
        T: Payload,
    {
        self.publisher.publish(subject, payload).await
    }

    /// Publishes `payload`, to be handled no earlier than `delay` from now.
    ///
    /// # Errors
    ///
    /// See [`Publisher::publish`].
    pub async fn publish_delay<T>(
        &self,
        subject: &Subject,
        payload: T,
        delay: Duration,
    ) -> Result<PublishAck, Error<B::Error>>
    where
        T: Payload,
    {
        self.publisher.publish_delay(subject, payload, delay).await
    }

    /// Publishes `payload` tagged `tag`.
    ///
    /// # Errors
    ///
    /// See [`Publisher::publish`].
    pub async fn publish_with_tag<T>(
        &self,
        subject: &Subject,
        tag: &str,
        payload: T,
    ) -> Result<PublishAck, Error<B::Error>>
    where
        T: Payload,
    {
        self.publisher.publish_with_tag(subject, tag, payload).await
    }

    /// Publishes with explicit trace, delay and tag.
    ///
    /// # Errors
    ///
    /// See [`Publisher::publish`].
    pub async fn publish_with<T>(
        &self,
        subject: &Subject,
        payload: T,
        extras: PublishExtras,
    ) -> Result<PublishAck, Error<B::Error>>
    where
        T: Payload,
    {
        self.publisher.publish_with(subject, payload, extras).await
    }

    /// Subscribes `handler` to `subject`.
    ///
    /// # Errors
    ///
    /// See [`Subscriber::subscribe`].
    pub async fn subscribe<T, H>(
        &self,
        subject: &Subject,
        handler: H,
    ) -> Result<Subscription, Error<B::Error>>
    where
        T: Payload,
        H: Handler<T>,
    {
        self.subscriber.subscribe(subject, handler).await
    }

    /// Subscribes `handler` to messages of `subject` tagged `tag`, or untagged.
    ///
    /// # Errors
    ///
    /// See [`Subscriber::subscribe`].
    pub async fn subscribe_with_tag<T, H>(
        &self,
        subject: &Subject,
        tag: &str,
        handler: H,
    ) -> Result<Subscription, Error<B::Error>>
    where
        T: Payload,
        H: Handler<T>,
    {
        self.subscriber
            .subscribe_with_tag(subject, tag, handler)
            .await
    }

    /// Subscribes `handler` to delayed messages of `subject`.
    ///
    /// # Errors
    ///
    /// See [`Subscriber::subscribe`].
    pub async fn subscribe_delay<T, H>(
        &self,
        subject: &Subject,
        wait_on_not_due: Duration,
        handler: H,
    ) -> Result<Subscription, Error<B::Error>>
    where
        T: Payload,
        H: Handler<T>,
    {
        self.subscriber
            .subscribe_delay(subject, wait_on_not_due, handler)
            .await
    }

    /// Deletes the durable consumer of `subject` and `tag`.
    ///
    /// # Errors
    ///
    /// See [`Subscriber::unsubscribe`].
    pub async fn unsubscribe(
        &self,
        subject: &Subject,
        tag: Option<&str>,
    ) -> Result<(), Error<B::Error>> {
        self.subscriber.unsubscribe(subject, tag).await
    }

    /// Deletes the category stream of `subject`.
    ///
    /// # Errors
    ///
    /// See [`StreamRegistry::delete_stream`].
    pub async fn delete_stream(&self, subject: &Subject) -> Result<(), Error<B::Error>> {
        self.registry.delete_stream(subject).await
    }

    /// Names of every stream on the broker.
    ///
    /// # Errors
    ///
    /// Fails when no healthy connection is available or the broker refuses.
    pub async fn stream_names(&self) -> Result<Vec<String>, Error<B::Error>> {
        self.pool
            .pick()
            .await?
            .stream_names()
            .await
            .map_err(Error::Broker)
    }

    /// Deletes every stream on the broker and empties the registry cache.
    ///
    /// # Errors
    ///
    /// Stops at the first stream that cannot be deleted.
    #[instrument(skip_all)]
    pub async fn delete_all_streams(&self) -> Result<usize, Error<B::Error>> {
        let names = self.stream_names().await?;

        for name in &names {
            self.registry.delete_category(name).await?;
        }
        self.registry.clear();

        info!(count = names.len(), "deleted all streams");

        Ok(names.len())
    }

    /// Creates or binds the key/value bucket `name`.
    ///
    /// # Errors
    ///
    /// Fails when no healthy connection is available or the broker refuses.
    pub async fn bucket(&self, name: &str) -> Result<BrokerBucket<B>, Error<B::Error>> {
        let store = self
            .pool
            .pick()
            .await?
            .key_value(name)
            .await
            .map_err(Error::Broker)?;

        Ok(Bucket::new(name.to_string(), store))
    }

    /// Flushes every pooled connection within `timeout`.
    ///
    /// # Errors
    ///
    /// See [`ConnectionPool::flush`].
    pub async fn flush(&self, timeout: Duration) -> Result<(), Error<B::Error>> {
        self.pool.flush(timeout).await
    }

    /// Stops every subscription, waits for running handlers, then closes the pool.
    ///
    /// # Errors
    ///
    /// See [`ConnectionPool::close`].
    #[instrument(skip_all)]
    pub async fn close(&self) -> Result<(), Error<B::Error>> {
        self.shutdown.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        self.pool.close().await?;
        info!("pub/sub closed");

        Ok(())
    }

    /// Whether [`Self::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
