//! Delivery no earlier than a given instant, on a broker without native delays.
//!
//! The publisher stamps `pub-at` and `delay`, both decimal milliseconds. On every
//! delivery the subscriber compares `pub-at + delay` with the wall clock and
//! negative-acknowledges messages that are not due yet. Messages without a
//! `delay` header do not belong on a delay subscription and are dropped.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use courier_broker::Headers;
use tracing::warn;

/// Publish instant, milliseconds since the Unix epoch.
pub const PUB_AT_HEADER: &str = "pub-at";

/// Requested delay, milliseconds.
pub const DELAY_HEADER: &str = "delay";

const MIN_NAK_DELAY: Duration = Duration::from_millis(1);

/// Outcome of checking a delivery against its due time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Gate {
    /// The message may be handled now.
    Due,

    /// The message was published without a delay.
    Undelayed,

    /// The message must be redelivered after the given wait.
    NotDue(Duration),
}

fn epoch_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Records that the message published at `published_at` is due after `delay`.
pub fn stamp(headers: &mut Headers, published_at: SystemTime, delay: Duration) {
    headers.insert(PUB_AT_HEADER, epoch_millis(published_at).to_string());
    headers.insert(DELAY_HEADER, duration_millis(delay).to_string());
}

/// Decides whether a delivery is due at `now`.
///
/// Messages without a `delay` header are [`Gate::Undelayed`]. A missing
/// `pub-at` or an unreadable value makes the message due.
#[must_use]
pub fn gate(headers: &Headers, now: SystemTime) -> Gate {
    let Some(delay) = headers.get(DELAY_HEADER) else {
        return Gate::Undelayed;
    };
    let pub_at = headers.get(PUB_AT_HEADER).unwrap_or_default();

    let (Ok(pub_at), Ok(delay)) = (pub_at.parse::<u64>(), delay.parse::<u64>()) else {
        warn!(pub_at, delay, "unreadable delay headers, handling now");
        return Gate::Due;
    };

    let due_at = pub_at.saturating_add(delay);
    let now = epoch_millis(now);
    if now >= due_at {
        Gate::Due
    } else {
        Gate::NotDue(Duration::from_millis(due_at - now).max(MIN_NAK_DELAY))
    }
}
