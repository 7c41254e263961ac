use crate::codec::Payload;
use crate::config::{PubSubConfig, UndecodablePolicy};
use crate::delay::{self, Gate};
use crate::error::Error;
use crate::handler::Handler;
use crate::pool::ConnectionPool;
use crate::publisher::TAG_HEADER;
use crate::registry::StreamRegistry;
use crate::subject::Subject;
use crate::trace::{MessageContext, TraceContext};

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use courier_broker::{
    AckPolicy, Broker, BrokerError, Connection, ConsumerConfig, DeliverPolicy, Delivery,
};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, instrument, trace, warn};

/// A live subscription.
///
/// Dropping the handle leaves the subscription running; call [`Self::stop`]
/// or close the service to end it.
#[derive(Clone, Debug)]
pub struct Subscription {
    durable_name: Option<String>,
    subject: String,
    token: CancellationToken,
}

impl Subscription {
    /// Stops dispatching. In-flight handlers finish; a pending delay wait is cut short.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Whether the subscription has been stopped, directly or by service shutdown.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Durable consumer name, or `None` for an ephemeral consumer.
    #[must_use]
    pub fn durable_name(&self) -> Option<&str> {
        self.durable_name.as_deref()
    }

    /// Routable subject the subscription listens on.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

/// Registers consumers and runs their dispatch tasks.
#[derive(Debug)]
pub struct Subscriber<B>
where
    B: Broker,
{
    handler_concurrency: usize,
    handler_retry_wait: Duration,
    max_ack_pending: i64,
    pool: Arc<ConnectionPool<B>>,
    registry: Arc<StreamRegistry<B>>,
    shutdown: CancellationToken,
    task_tracker: TaskTracker,
    undecodable: UndecodablePolicy,
}

/// Per-subscription delivery processing.
struct Dispatcher<T, H> {
    handler: H,
    handler_retry_wait: Duration,
    tag: Option<String>,
    undecodable: UndecodablePolicy,
    wait_on_not_due: Option<Duration>,
    _payload: PhantomData<fn() -> T>,
}

impl<B> Subscriber<B>
where
    B: Broker,
{
    /// Creates a subscriber whose tasks end when `shutdown` is cancelled.
    #[must_use]
    pub fn new(
        pool: Arc<ConnectionPool<B>>,
        registry: Arc<StreamRegistry<B>>,
        config: &PubSubConfig,
        shutdown: CancellationToken,
        task_tracker: TaskTracker,
    ) -> Self {
        Self {
            handler_concurrency: config.handler_concurrency.max(1),
            handler_retry_wait: config.handler_retry_wait(),
            max_ack_pending: config.default_max_ack_pending,
            pool,
            registry,
            shutdown,
            task_tracker,
            undecodable: config.undecodable,
        }
    }

    /// Subscribes `handler` to every message of `subject`.
    ///
    /// # Errors
    ///
    /// Fails when the stream cannot be provisioned or the consumer cannot be registered.
    pub async fn subscribe<T, H>(
        &self,
        subject: &Subject,
        handler: H,
    ) -> Result<Subscription, Error<B::Error>>
    where
        T: Payload,
        H: Handler<T>,
    {
        self.start(subject, None, None, handler).await
    }

    /// Subscribes `handler` to messages tagged `tag`, and to untagged messages.
    ///
    /// Messages tagged for someone else are acknowledged without being handled.
    ///
    /// # Errors
    ///
    /// See [`Self::subscribe`].
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
        let tag = Some(tag.to_string()).filter(|t| !t.is_empty());
        self.start(subject, tag, None, handler).await
    }

    /// Subscribes `handler` to delayed messages, handling each once it is due.
    ///
    /// After redelivering a message that is not due, dispatch pauses for
    /// `wait_on_not_due`. Messages published without a delay are dropped.
    ///
    /// # Errors
    ///
    /// See [`Self::subscribe`].
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
        self.start(subject, None, Some(wait_on_not_due), handler)
            .await
    }

    /// Deletes the durable consumer of `subject` (and `tag`).
    ///
    /// Subjects without a group have no durable consumer; this is then a no-op.
    ///
    /// # Errors
    ///
    /// Fails when no healthy connection is available or the broker refuses.
    #[instrument(skip_all, fields(category = subject.category(), subject = subject.name()))]
    pub async fn unsubscribe(
        &self,
        subject: &Subject,
        tag: Option<&str>,
    ) -> Result<(), Error<B::Error>> {
        let Some(durable) = subject.durable_name(tag) else {
            debug!("ephemeral consumer, nothing to delete");
            return Ok(());
        };

        let connection = self.pool.pick().await?;
        connection
            .delete_consumer(subject.category(), &durable)
            .await
            .map_err(Error::Broker)?;

        info!(%durable, "consumer deleted");

        Ok(())
    }

    #[instrument(skip_all, fields(category = subject.category(), subject = subject.name(), tag = ?tag))]
    async fn start<T, H>(
        &self,
        subject: &Subject,
        tag: Option<String>,
        wait_on_not_due: Option<Duration>,
        handler: H,
    ) -> Result<Subscription, Error<B::Error>>
    where
        T: Payload,
        H: Handler<T>,
    {
        if self.shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }

        self.registry.ensure_stream(subject).await?;
        let connection = self.pool.pick().await?;

        let durable_name = subject.durable_name(tag.as_deref());
        let config = ConsumerConfig {
            stream: subject.category().to_string(),
            filter_subject: subject.name().to_string(),
            durable_name: durable_name.clone(),
            deliver_group: subject.group().map(ToString::to_string),
            deliver_policy: DeliverPolicy::Last,
            ack_policy: AckPolicy::Explicit,
            max_ack_pending: subject.max_ack_pending().unwrap_or(self.max_ack_pending),
        };

        let deliveries = connection.consume(config).await.map_err(Error::Broker)?;

        let token = self.shutdown.child_token();
        let dispatcher = Arc::new(Dispatcher {
            handler,
            handler_retry_wait: self.handler_retry_wait,
            tag,
            undecodable: self.undecodable,
            wait_on_not_due,
            _payload: PhantomData::<fn() -> T>,
        });
        let concurrency = self.handler_concurrency;
        let task_token = token.clone();
        let subject_name = subject.name().to_string();

        self.task_tracker.spawn(
            async move {
                deliveries
                    .take_until(task_token.clone().cancelled_owned())
                    .for_each_concurrent(concurrency, |result| {
                        let dispatcher = dispatcher.clone();
                        let token = task_token.clone();
                        async move {
                            match result {
                                Ok(delivery) => dispatcher.dispatch(delivery, &token).await,
                                Err(e) => warn!(error = %e, "delivery stream error"),
                            }
                        }
                    })
                    .await;

                debug!("dispatch stopped");
            }
            .instrument(info_span!("subscription", subject = %subject_name)),
        );

        info!(durable = ?durable_name, "subscribed");

        Ok(Subscription {
            durable_name,
            subject: subject.name().to_string(),
            token,
        })
    }
}

impl<T, H> Dispatcher<T, H>
where
    T: Payload,
    H: Handler<T>,
{
    async fn dispatch<D>(&self, delivery: D, token: &CancellationToken)
    where
        D: Delivery,
    {
        let envelope = delivery.envelope();
        let trace = TraceContext::from_headers(&envelope.headers);
        let span = info_span!("deliver", trace_id = %trace, subject = %envelope.subject);

        self.process(delivery, trace, token).instrument(span).await;
    }

    async fn process<D>(&self, delivery: D, trace: TraceContext, token: &CancellationToken)
    where
        D: Delivery,
    {
        let envelope = delivery.envelope();
        let message_tag = envelope.headers.get(TAG_HEADER).map(ToString::to_string);

        // The consumer belongs to this tag alone, so nothing else would settle it.
        if let (Some(wanted), Some(actual)) = (&self.tag, &message_tag) {
            if wanted != actual {
                trace!(%actual, "tagged for another consumer, skipping");
                ack(&delivery).await;
                return;
            }
        }

        if let Some(wait_on_not_due) = self.wait_on_not_due {
            match delay::gate(&envelope.headers, SystemTime::now()) {
                Gate::Due => {}
                Gate::Undelayed => {
                    warn!("no delay header on a delay subscription, dropping");
                    ack(&delivery).await;
                    return;
                }
                Gate::NotDue(remaining) => {
                    debug!(?remaining, "not due, redelivering later");
                    nak(&delivery, remaining).await;

                    tokio::select! {
                        () = token.cancelled() => {}
                        () = tokio::time::sleep(wait_on_not_due) => {}
                    }
                    return;
                }
            }
        }

        let payload = match T::decode(envelope.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                match self.undecodable {
                    UndecodablePolicy::Drop => {
                        error!(error = %e, "undecodable payload, dropping");
                        ack(&delivery).await;
                    }
                    UndecodablePolicy::Redeliver => {
                        error!(error = %e, "undecodable payload, redelivering later");
                        nak(&delivery, self.handler_retry_wait).await;
                    }
                }
                return;
            }
        };

        let context = MessageContext {
            trace,
            subject: envelope.subject.clone(),
            tag: message_tag,
            delivery_count: delivery.delivery_count(),
            headers: envelope.headers.clone(),
        };

        match self.handler.handle(context, payload).await {
            Ok(()) => ack(&delivery).await,
            Err(e) => {
                warn!(error = %e, "handler failed, redelivering later");
                nak(&delivery, self.handler_retry_wait).await;
            }
        }
    }
}

async fn ack<D>(delivery: &D)
where
    D: Delivery,
{
    if let Err(e) = delivery.ack_sync().await {
        warn!(error = %e, "failed to acknowledge");
    }
}

async fn nak<D>(delivery: &D, delay: Duration)
where
    D: Delivery,
{
    if let Err(e) = delivery.nak_with_delay(delay).await {
        if e.is_not_found() {
            debug!(error = %e, "consumer gone before nak");
        } else {
            warn!(error = %e, "failed to negative-acknowledge");
        }
    }
}
