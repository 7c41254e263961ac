use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::subject::SubjectError;

use std::time::Duration;

use courier_broker::BrokerError;
use thiserror::Error;

/// Errors raised by the pub/sub service.
#[derive(Debug, Error)]
pub enum Error<E>
where
    E: BrokerError,
{
    /// Error from the broker backend.
    #[error("broker error: {0}")]
    Broker(#[source] E),

    /// Payload could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The picked connection stayed unhealthy through the wait window.
    #[error("connection not healthy after waiting {0:?}")]
    ConnectionFailed(Duration),

    /// Flushing did not finish in time.
    #[error("flush did not finish within {0:?}")]
    FlushTimeout(Duration),

    /// Configuration rejected before connecting.
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// Subject rejected.
    #[error("invalid subject: {0}")]
    InvalidSubject(#[from] SubjectError),

    /// The pool holds no connection.
    #[error("no connection available")]
    NoConnection,

    /// A stream could not be created or updated.
    #[error("failed to provision stream {stream}: {source}")]
    Provision {
        /// Stream (category) name.
        stream: String,

        /// Broker error.
        #[source]
        source: E,
    },

    /// The service has been closed.
    #[error("service is shut down")]
    Shutdown,
}
