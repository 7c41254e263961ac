use std::fmt::{Display, Formatter, Result as FmtResult};
use std::time::Duration;

use thiserror::Error;

const ILLEGAL: [char; 4] = ['.', '|', '*', '>'];

/// Reasons a subject is rejected.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum SubjectError {
    /// The category is empty.
    #[error("subject category must not be empty")]
    EmptyCategory,

    /// The routable name is empty.
    #[error("subject name must not be empty")]
    EmptyName,
}

/// Replaces characters reserved by the broker's subject syntax with `-`.
#[must_use]
pub fn normalize(raw: &str) -> String {
    raw.chars()
        .map(|c| if ILLEGAL.contains(&c) { '-' } else { c })
        .collect()
}

/// A routable subject together with the stream (category) that stores it.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Subject {
    category: String,
    name: String,
    group: Option<String>,
    max_age: Option<Duration>,
    max_ack_pending: Option<i64>,
}

impl Subject {
    /// Creates a subject named `name` in stream `category`.
    ///
    /// # Errors
    ///
    /// Fails when either part is empty.
    pub fn new(category: impl Into<String>, name: impl Into<String>) -> Result<Self, SubjectError> {
        let category = category.into();
        let name = name.into();

        if category.is_empty() {
            return Err(SubjectError::EmptyCategory);
        }

        if name.is_empty() {
            return Err(SubjectError::EmptyName);
        }

        Ok(Self {
            category,
            name,
            group: None,
            max_age: None,
            max_ack_pending: None,
        })
    }

    /// Makes subscribers of this subject compete within `group`.
    ///
    /// An empty group is the same as no group.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into()).filter(|g| !g.is_empty());
        self
    }

    /// Sets the retention of the category stream when it is created.
    #[must_use]
    pub const fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Sets the bound on unacknowledged deliveries per subscription.
    #[must_use]
    pub const fn with_max_ack_pending(mut self, max_ack_pending: i64) -> Self {
        self.max_ack_pending = Some(max_ack_pending);
        self
    }

    /// Stream name.
    #[must_use]
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Routable name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Competing-consumer group.
    #[must_use]
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Retention, if set.
    #[must_use]
    pub const fn max_age(&self) -> Option<Duration> {
        self.max_age
    }

    /// In-flight bound, if set.
    #[must_use]
    pub const fn max_ack_pending(&self) -> Option<i64> {
        self.max_ack_pending
    }

    /// Broker-legal identity: `category-name[-group]`, normalized.
    #[must_use]
    pub fn id(&self) -> String {
        let raw = match &self.group {
            Some(group) => format!("{}-{}-{group}", self.category, self.name),
            None => format!("{}-{}", self.category, self.name),
        };

        normalize(&raw)
    }

    /// Durable consumer name for a subscription, optionally tag-specific.
    ///
    /// Only grouped subjects get a durable; `None` means ephemeral.
    #[must_use]
    pub fn durable_name(&self, tag: Option<&str>) -> Option<String> {
        self.group.as_ref()?;

        Some(match tag.filter(|t| !t.is_empty()) {
            Some(tag) => format!("{}-{}", self.id(), normalize(tag)),
            None => self.id(),
        })
    }
}

impl Display for Subject {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}/{}", self.category, self.name)
    }
}
