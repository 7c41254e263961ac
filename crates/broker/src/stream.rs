use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where a stream keeps its messages.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageType {
    /// Durable, file-backed storage.
    #[default]
    File,

    /// Volatile, memory-backed storage.
    Memory,
}

/// Broker-side definition of a stream.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct StreamConfig {
    /// Stream name.
    pub name: String,

    /// Subjects captured by the stream.
    pub subjects: Vec<String>,

    /// Storage mode.
    pub storage: StorageType,

    /// Retention; messages older than this are discarded. Zero keeps forever.
    pub max_age: Duration,
}

impl StreamConfig {
    /// Whether `subject` is listed verbatim in the subject list.
    #[must_use]
    pub fn has_subject(&self, subject: &str) -> bool {
        self.subjects.iter().any(|s| s == subject)
    }
}

/// Per-publish options.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PublishOptions {
    /// Deduplication-window message id.
    pub message_id: Option<String>,

    /// The stream the subject must resolve to; publish fails otherwise.
    pub expected_stream: Option<String>,
}

/// Broker acknowledgement of a publish.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PublishAck {
    /// Stream that stored the message.
    pub stream: String,

    /// Stream sequence of the message.
    pub sequence: u64,

    /// Whether the broker discarded the publish as a duplicate.
    pub duplicate: bool,
}
