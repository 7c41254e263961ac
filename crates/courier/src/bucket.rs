use crate::codec::Payload;
use crate::error::Error;

use bytes::Bytes;
use courier_broker::KeyValue;

/// A key/value bucket stored by the broker.
#[derive(Clone, Debug)]
pub struct Bucket<K>
where
    K: KeyValue,
{
    name: String,
    store: K,
}

impl<K> Bucket<K>
where
    K: KeyValue,
{
    pub(crate) const fn new(name: String, store: K) -> Self {
        Self { name, store }
    }

    /// Bucket name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stores `value` under `key`, returning the new revision.
    ///
    /// # Errors
    ///
    /// Fails when the broker rejects the write.
    pub async fn put(&self, key: &str, value: impl Into<Bytes>) -> Result<u64, Error<K::Error>> {
        self.store
            .put(key, value.into())
            .await
            .map_err(Error::Broker)
    }

    /// Latest value of `key`, or `None` if it was never written.
    ///
    /// # Errors
    ///
    /// Fails when the broker cannot be read.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>, Error<K::Error>> {
        self.store.get(key).await.map_err(Error::Broker)
    }

    /// Stores a string value.
    ///
    /// # Errors
    ///
    /// See [`Self::put`].
    pub async fn put_string(&self, key: &str, value: &str) -> Result<u64, Error<K::Error>> {
        self.put(key, value.to_string()).await
    }

    /// Reads a string value.
    ///
    /// # Errors
    ///
    /// Fails when the broker cannot be read or the value is not UTF-8.
    pub async fn get_string(&self, key: &str) -> Result<Option<String>, Error<K::Error>> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(String::decode(bytes)?)),
            None => Ok(None),
        }
    }
}
