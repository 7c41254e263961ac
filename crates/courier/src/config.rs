use std::time::Duration;

use courier_broker::ConnectOptions;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_MAX_AGE_SECS: u64 = 31 * 24 * 60 * 60;

/// What the subscriber does with a payload the codec cannot decode.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UndecodablePolicy {
    /// Acknowledge the message and log it; it is never redelivered.
    #[default]
    Drop,

    /// Negative-acknowledge with the handler retry wait, like a handler error.
    Redeliver,
}

/// Reasons a configuration is rejected.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum ConfigError {
    /// Only one of username and password was given.
    #[error("username and password must be set together")]
    PartialCredentials,

    /// The server list is empty.
    #[error("at least one server is required")]
    NoServers,

    /// Handler concurrency is zero.
    #[error("handler concurrency must be at least 1")]
    ZeroHandlerConcurrency,

    /// Pool size is zero.
    #[error("pool size must be at least 1")]
    ZeroPoolSize,
}

/// Settings of a [`crate::PubSub`] service.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PubSubConfig {
    /// Number of connections opened by `connect`.
    pub pool_size: usize,

    /// Broker addresses.
    pub servers: Vec<String>,

    /// Connection display name.
    pub connection_name: String,

    /// Username, set together with `password`.
    pub username: Option<String>,

    /// Password, set together with `username`.
    pub password: Option<String>,

    /// How long an unhealthy connection is given to recover, in milliseconds.
    pub connect_wait_ms: u64,

    /// Redelivery delay after a handler error, in milliseconds.
    pub handler_retry_wait_ms: u64,

    /// Stream retention for subjects that set none, in seconds.
    pub default_max_age_secs: u64,

    /// In-flight bound for subjects that set none.
    pub default_max_ack_pending: i64,

    /// Deliveries handled concurrently per subscription.
    pub handler_concurrency: usize,

    /// Fate of undecodable payloads.
    pub undecodable: UndecodablePolicy,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            servers: vec!["nats://127.0.0.1:4222".to_string()],
            connection_name: "courier".to_string(),
            username: None,
            password: None,
            connect_wait_ms: 3_000,
            handler_retry_wait_ms: 5_000,
            default_max_age_secs: DEFAULT_MAX_AGE_SECS,
            default_max_ack_pending: 100,
            handler_concurrency: 1,
            undecodable: UndecodablePolicy::Drop,
        }
    }
}

impl PubSubConfig {
    /// Checks the settings without touching the broker.
    ///
    /// # Errors
    ///
    /// Returns the first rule the configuration breaks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::ZeroPoolSize);
        }

        if self.servers.is_empty() {
            return Err(ConfigError::NoServers);
        }

        if self.handler_concurrency == 0 {
            return Err(ConfigError::ZeroHandlerConcurrency);
        }

        if self.username.is_some() != self.password.is_some() {
            return Err(ConfigError::PartialCredentials);
        }

        Ok(())
    }

    /// Wait window for connection health checks.
    #[must_use]
    pub const fn connect_wait(&self) -> Duration {
        Duration::from_millis(self.connect_wait_ms)
    }

    /// Redelivery delay after a handler error.
    #[must_use]
    pub const fn handler_retry_wait(&self) -> Duration {
        Duration::from_millis(self.handler_retry_wait_ms)
    }

    /// Default stream retention.
    #[must_use]
    pub const fn default_max_age(&self) -> Duration {
        Duration::from_secs(self.default_max_age_secs)
    }

    /// Options handed to the broker for every pooled connection.
    #[must_use]
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            servers: self.servers.clone(),
            name: Some(self.connection_name.clone()),
            credentials: self.username.clone().zip(self.password.clone()),
        }
    }
}
