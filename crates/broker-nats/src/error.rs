use courier_broker::BrokerError;
use thiserror::Error;

/// Errors that can occur talking to NATS.
#[derive(Debug, Error)]
pub enum Error {
    /// Acknowledgement error.
    #[error("failed to acknowledge: {0}")]
    Ack(async_nats::Error),

    /// Close error.
    #[error("failed to close connection: {0}")]
    Close(async_nats::Error),

    /// Connect error.
    #[error("failed to connect: {0}")]
    Connect(#[from] async_nats::ConnectError),

    /// Consumer create, bind or delete error.
    #[error("consumer request failed: {0}")]
    Consumer(async_nats::jetstream::stream::ConsumerErrorKind),

    /// The consumer does not exist.
    #[error("consumer {0} not found")]
    ConsumerNotFound(String),

    /// Consumer stream error.
    #[error("consumer stream error: {0}")]
    ConsumerStream(async_nats::jetstream::consumer::StreamErrorKind),

    /// Flush error.
    #[error("failed to flush: {0}")]
    Flush(async_nats::Error),

    /// Key/value bucket error.
    #[error("key/value error: {0}")]
    KeyValue(async_nats::Error),

    /// Message stream error.
    #[error("failed to receive message: {0}")]
    Messages(async_nats::Error),

    /// Publish error.
    #[error("failed to publish: {0}")]
    Publish(async_nats::jetstream::context::PublishErrorKind),

    /// Stream administration error.
    #[error("stream request failed: {0}")]
    Stream(async_nats::Error),

    /// A stream with that name already exists with a different configuration.
    #[error("stream name {0} already in use")]
    StreamNameInUse(String),

    /// The stream does not exist.
    #[error("stream {0} not found")]
    StreamNotFound(String),
}

impl BrokerError for Error {
    fn is_already_exists(&self) -> bool {
        matches!(self, Self::StreamNameInUse(_))
    }

    fn is_not_found(&self) -> bool {
        matches!(self, Self::StreamNotFound(_) | Self::ConsumerNotFound(_))
    }
}

pub fn is_stream_not_found(error: &impl ToString) -> bool {
    error.to_string().contains("stream not found")
}

pub fn is_consumer_not_found(error: &impl ToString) -> bool {
    error.to_string().contains("consumer not found")
}

pub fn is_stream_name_in_use(error: &impl ToString) -> bool {
    let message = error.to_string();
    message.contains("already in use") || message.contains("existing")
}
