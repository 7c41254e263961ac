use std::error::Error;

/// Marker trait for broker errors.
///
/// Backends classify their own errors so callers can react to idempotent
/// conditions without knowing the concrete backend.
pub trait BrokerError: Error + Send + Sync + 'static {
    /// Whether the error reports that the resource being created already exists.
    fn is_already_exists(&self) -> bool;

    /// Whether the error reports that the addressed resource does not exist.
    fn is_not_found(&self) -> bool {
        false
    }
}
