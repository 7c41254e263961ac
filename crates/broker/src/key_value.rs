use crate::error::BrokerError;

use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;

/// A key/value bucket.
#[async_trait]
pub trait KeyValue
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the bucket.
    type Error: BrokerError;

    /// Stores `value` under `key`, returning the new revision.
    async fn put(&self, key: &str, value: Bytes) -> Result<u64, Self::Error>;

    /// Reads the latest value of `key`.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, Self::Error>;
}
