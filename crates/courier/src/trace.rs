use std::fmt::{Display, Formatter, Result as FmtResult};

use courier_broker::Headers;
use uuid::Uuid;

/// Header carrying the trace id of a message.
pub const TRACE_ID_HEADER: &str = "trace-id";

/// Correlates a message with the work that produced and consumes it.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct TraceContext {
    trace_id: String,
}

impl TraceContext {
    /// Starts a new trace with a random id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
        }
    }

    /// Continues the trace `trace_id`; an empty id starts a new trace.
    #[must_use]
    pub fn with_id(trace_id: impl Into<String>) -> Self {
        let trace_id = trace_id.into();
        if trace_id.is_empty() {
            return Self::new();
        }

        Self { trace_id }
    }

    /// Reads the trace of a received message, starting a new one if absent.
    #[must_use]
    pub fn from_headers(headers: &Headers) -> Self {
        headers
            .get(TRACE_ID_HEADER)
            .map_or_else(Self::new, Self::with_id)
    }

    /// The trace id.
    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub(crate) fn write_to(&self, headers: &mut Headers) {
        headers.insert(TRACE_ID_HEADER, self.trace_id.clone());
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TraceContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.trace_id)
    }
}

/// What a handler knows about the delivery it is processing.
#[derive(Clone, Debug)]
pub struct MessageContext {
    /// Trace of the message.
    pub trace: TraceContext,

    /// Routable subject the message was published to.
    pub subject: String,

    /// Tag the message was published with, if any.
    pub tag: Option<String>,

    /// Delivery attempt, starting at 1.
    pub delivery_count: u64,

    /// Every header of the message.
    pub headers: Headers,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_headers_reads_trace_id() {
        let headers: Headers = [(TRACE_ID_HEADER, "abc")].into_iter().collect();

        assert_eq!(TraceContext::from_headers(&headers).trace_id(), "abc");
    }

    #[test]
    fn test_from_headers_generates_when_missing_or_empty() {
        let missing = TraceContext::from_headers(&Headers::new());
        assert!(Uuid::parse_str(missing.trace_id()).is_ok());

        let empty: Headers = [(TRACE_ID_HEADER, "")].into_iter().collect();
        assert!(!TraceContext::from_headers(&empty).trace_id().is_empty());
    }

    #[test]
    fn test_new_traces_differ() {
        assert_ne!(TraceContext::new(), TraceContext::new());
    }
}
