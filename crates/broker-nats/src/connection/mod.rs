use crate::delivery::NatsDelivery;
use crate::error::{Error, is_consumer_not_found, is_stream_name_in_use, is_stream_not_found};
use crate::key_value::NatsKeyValue;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_nats::connection::State;
use async_nats::jetstream::Context as JetStreamContext;
use async_nats::jetstream::consumer::{
    AckPolicy as NatsAckPolicy, DeliverPolicy as NatsDeliverPolicy, PushConsumer, push,
};
use async_nats::jetstream::context::Publish;
use async_nats::jetstream::kv::Config as KvConfig;
use async_nats::jetstream::stream::{Config as NatsStreamConfig, StorageType as NatsStorageType};
use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use courier_broker::{
    AckPolicy, Connection, ConnectionStatus, ConsumerConfig, Deliveries, DeliverPolicy, Envelope,
    PublishAck, PublishOptions, StorageType, StreamConfig,
};
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, instrument};

/// A NATS client together with its JetStream context.
#[derive(Clone, Debug)]
pub struct NatsConnection {
    client: Client,
    closed: Arc<AtomicBool>,
    jetstream_context: JetStreamContext,
}

impl NatsConnection {
    pub(crate) fn new(client: Client) -> Self {
        let jetstream_context = async_nats::jetstream::new(client.clone());

        Self {
            client,
            closed: Arc::new(AtomicBool::new(false)),
            jetstream_context,
        }
    }

    /// The underlying NATS client.
    #[must_use]
    pub const fn client(&self) -> &Client {
        &self.client
    }
}

fn to_nats_stream_config(config: &StreamConfig) -> NatsStreamConfig {
    NatsStreamConfig {
        name: config.name.clone(),
        subjects: config.subjects.clone(),
        storage: match config.storage {
            StorageType::File => NatsStorageType::File,
            StorageType::Memory => NatsStorageType::Memory,
        },
        max_age: config.max_age,
        ..Default::default()
    }
}

fn from_nats_stream_config(config: &NatsStreamConfig) -> StreamConfig {
    StreamConfig {
        name: config.name.clone(),
        subjects: config.subjects.clone(),
        storage: match config.storage {
            NatsStorageType::Memory => StorageType::Memory,
            NatsStorageType::File => StorageType::File,
        },
        max_age: config.max_age,
    }
}

fn to_push_config(config: &ConsumerConfig, deliver_subject: String) -> push::Config {
    push::Config {
        deliver_subject,
        durable_name: config.durable_name.clone(),
        deliver_group: config.deliver_group.clone(),
        filter_subject: config.filter_subject.clone(),
        deliver_policy: match config.deliver_policy {
            DeliverPolicy::All => NatsDeliverPolicy::All,
            DeliverPolicy::Last => NatsDeliverPolicy::Last,
            DeliverPolicy::New => NatsDeliverPolicy::New,
        },
        ack_policy: match config.ack_policy {
            AckPolicy::Explicit => NatsAckPolicy::Explicit,
            AckPolicy::None => NatsAckPolicy::None,
        },
        max_ack_pending: config.max_ack_pending,
        ..Default::default()
    }
}

fn to_header_map(envelope: &Envelope) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, values) in envelope.headers.iter() {
        for value in values {
            headers.append(name, value.as_str());
        }
    }
    headers
}

#[async_trait]
impl Connection for NatsConnection {
    type Error = Error;
    type Delivery = NatsDelivery;
    type KeyValue = NatsKeyValue;

    fn status(&self) -> ConnectionStatus {
        if self.closed.load(Ordering::SeqCst) {
            return ConnectionStatus::Closed;
        }

        match self.client.connection_state() {
            State::Connected => ConnectionStatus::Connected,
            State::Pending => ConnectionStatus::Pending,
            State::Disconnected => ConnectionStatus::Disconnected,
        }
    }

    async fn flush(&self) -> Result<(), Self::Error> {
        self.client
            .flush()
            .await
            .map_err(|e| Error::Flush(Box::new(e)))
    }

    async fn close(&self) -> Result<(), Self::Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.client
            .drain()
            .await
            .map_err(|e| Error::Close(Box::new(e)))
    }

    async fn stream_info(&self, name: &str) -> Result<Option<StreamConfig>, Self::Error> {
        match self.jetstream_context.get_stream(name).await {
            Ok(stream) => Ok(Some(from_nats_stream_config(&stream.cached_info().config))),
            Err(e) if is_stream_not_found(&e) => Ok(None),
            Err(e) => Err(Error::Stream(Box::new(e))),
        }
    }

    #[instrument(skip(self), fields(stream = %config.name))]
    async fn add_stream(&self, config: StreamConfig) -> Result<StreamConfig, Self::Error> {
        match self
            .jetstream_context
            .create_stream(to_nats_stream_config(&config))
            .await
        {
            Ok(stream) => Ok(from_nats_stream_config(&stream.cached_info().config)),
            Err(e) if is_stream_name_in_use(&e) => {
                debug!(error = %e, "stream already exists");
                Err(Error::StreamNameInUse(config.name))
            }
            Err(e) => Err(Error::Stream(Box::new(e))),
        }
    }

    #[instrument(skip(self), fields(stream = %config.name))]
    async fn update_stream(&self, config: StreamConfig) -> Result<StreamConfig, Self::Error> {
        match self
            .jetstream_context
            .update_stream(to_nats_stream_config(&config))
            .await
        {
            Ok(info) => Ok(from_nats_stream_config(&info.config)),
            Err(e) if is_stream_not_found(&e) => Err(Error::StreamNotFound(config.name)),
            Err(e) => Err(Error::Stream(Box::new(e))),
        }
    }

    async fn delete_stream(&self, name: &str) -> Result<(), Self::Error> {
        match self.jetstream_context.delete_stream(name).await {
            Ok(_) => Ok(()),
            Err(e) if is_stream_not_found(&e) => Err(Error::StreamNotFound(name.to_string())),
            Err(e) => Err(Error::Stream(Box::new(e))),
        }
    }

    async fn stream_names(&self) -> Result<Vec<String>, Self::Error> {
        self.jetstream_context
            .stream_names()
            .try_collect()
            .await
            .map_err(|e| Error::Stream(Box::new(e)))
    }

    async fn publish(
        &self,
        envelope: Envelope,
        options: PublishOptions,
    ) -> Result<PublishAck, Self::Error> {
        let mut publish = Publish::build()
            .payload(envelope.payload.clone())
            .headers(to_header_map(&envelope));

        // Set after the headers so they are not overwritten.
        if let Some(message_id) = options.message_id {
            publish = publish.message_id(message_id);
        }
        if let Some(expected_stream) = options.expected_stream {
            publish = publish.expected_stream(expected_stream);
        }

        let ack = self
            .jetstream_context
            .send_publish(envelope.subject, publish)
            .await
            .map_err(|e| Error::Publish(e.kind()))?
            .await
            .map_err(|e| Error::Publish(e.kind()))?;

        Ok(PublishAck {
            stream: ack.stream,
            sequence: ack.sequence,
            duplicate: ack.duplicate,
        })
    }

    #[instrument(skip(self), fields(stream = %config.stream, durable = ?config.durable_name))]
    async fn consume(
        &self,
        config: ConsumerConfig,
    ) -> Result<Deliveries<Self::Delivery, Self::Error>, Self::Error> {
        let stream = match self.jetstream_context.get_stream(&config.stream).await {
            Ok(stream) => stream,
            Err(e) if is_stream_not_found(&e) => {
                return Err(Error::StreamNotFound(config.stream.clone()));
            }
            Err(e) => return Err(Error::Stream(Box::new(e))),
        };

        // Members of one durable must share a deliver subject.
        let consumer: PushConsumer = if let Some(durable) = &config.durable_name {
            let deliver_subject = format!("_courier.deliver.{}.{durable}", config.stream);
            stream
                .get_or_create_consumer(durable, to_push_config(&config, deliver_subject))
                .await
        } else {
            stream
                .create_consumer(to_push_config(&config, self.client.new_inbox()))
                .await
        }
        .map_err(|e| Error::Consumer(e.kind()))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| Error::ConsumerStream(e.kind()))?;

        Ok(messages
            .map(|message| {
                message
                    .map(NatsDelivery::new)
                    .map_err(|e| Error::Messages(Box::new(e)))
            })
            .boxed())
    }

    async fn delete_consumer(&self, stream: &str, consumer: &str) -> Result<(), Self::Error> {
        let stream_handle = match self.jetstream_context.get_stream(stream).await {
            Ok(stream) => stream,
            Err(e) if is_stream_not_found(&e) => {
                return Err(Error::StreamNotFound(stream.to_string()));
            }
            Err(e) => return Err(Error::Stream(Box::new(e))),
        };

        match stream_handle.delete_consumer(consumer).await {
            Ok(_) => Ok(()),
            Err(e) if is_consumer_not_found(&e) => {
                Err(Error::ConsumerNotFound(consumer.to_string()))
            }
            Err(e) => Err(Error::Consumer(e.kind())),
        }
    }

    async fn key_value(&self, bucket: &str) -> Result<Self::KeyValue, Self::Error> {
        let store = self
            .jetstream_context
            .create_or_update_key_value(KvConfig {
                bucket: bucket.to_string(),
                ..Default::default()
            })
            .await
            .map_err(|e| Error::KeyValue(Box::new(e)))?;

        Ok(NatsKeyValue::new(bucket.to_string(), store))
    }
}
