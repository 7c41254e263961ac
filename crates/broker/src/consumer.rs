use serde::{Deserialize, Serialize};

/// Where a new consumer starts reading.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliverPolicy {
    /// From the first message still in the stream.
    All,

    /// From the most recent message matching the filter.
    #[default]
    Last,

    /// Only messages published after the consumer was created.
    New,
}

/// How deliveries are acknowledged.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckPolicy {
    /// Every delivery must be acked individually.
    #[default]
    Explicit,

    /// Deliveries need no acknowledgement.
    None,
}

/// Definition of a push consumer bound to one stream.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ConsumerConfig {
    /// Stream the consumer is bound to.
    pub stream: String,

    /// Subject filter within the stream.
    pub filter_subject: String,

    /// Durable name; `None` creates an ephemeral consumer.
    pub durable_name: Option<String>,

    /// Queue group; members of one group share deliveries.
    pub deliver_group: Option<String>,

    /// Start position.
    pub deliver_policy: DeliverPolicy,

    /// Acknowledgement mode.
    pub ack_policy: AckPolicy,

    /// Bound on unacknowledged deliveries.
    pub max_ack_pending: i64,
}
