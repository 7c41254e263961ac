use courier_broker::{BrokerError, ConnectionStatus};
use thiserror::Error;

/// Errors raised by the in-memory broker.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum Error {
    /// The broker is refusing new connections.
    #[error("connection refused")]
    ConnectionRefused,

    /// The connection is not usable.
    #[error("connection is not connected (status: {0:?})")]
    NotConnected(ConnectionStatus),

    /// A durable consumer without a queue group is already bound.
    #[error("consumer {0} is already bound")]
    ConsumerInUse(String),

    /// A durable consumer is bound with a different queue group.
    #[error("consumer {0} is bound to a different deliver group")]
    ConsumerGroupMismatch(String),

    /// The consumer does not exist.
    #[error("consumer {0} not found")]
    ConsumerNotFound(String),

    /// The stream definition is invalid.
    #[error("invalid stream config: {0}")]
    InvalidStreamConfig(String),

    /// No stream captures the subject.
    #[error("no stream captures subject {0}")]
    NoStreamForSubject(String),

    /// A stream with that name already exists with a different definition.
    #[error("stream name {0} already in use with a different configuration")]
    StreamNameInUse(String),

    /// The stream does not exist.
    #[error("stream {0} not found")]
    StreamNotFound(String),

    /// A subject is already captured by another stream.
    #[error("subject {0} overlaps with another stream")]
    SubjectsOverlap(String),

    /// The subject resolved to a different stream than expected.
    #[error("expected stream {expected} but subject is captured by {actual}")]
    WrongStream {
        /// The stream the publisher expected.
        expected: String,
        /// The stream that captures the subject.
        actual: String,
    },
}

impl BrokerError for Error {
    fn is_already_exists(&self) -> bool {
        matches!(self, Self::StreamNameInUse(_))
    }

    fn is_not_found(&self) -> bool {
        matches!(self, Self::StreamNotFound(_) | Self::ConsumerNotFound(_))
    }
}
