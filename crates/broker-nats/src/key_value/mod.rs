use crate::error::Error;

use std::fmt::{Debug, Formatter, Result as FmtResult};

use async_nats::jetstream::kv::Store as KvStore;
use async_trait::async_trait;
use bytes::Bytes;
use courier_broker::KeyValue;

/// A JetStream key/value bucket.
#[derive(Clone)]
pub struct NatsKeyValue {
    bucket: String,
    store: KvStore,
}

impl NatsKeyValue {
    pub(crate) const fn new(bucket: String, store: KvStore) -> Self {
        Self { bucket, store }
    }
}

impl Debug for NatsKeyValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("NatsKeyValue")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl KeyValue for NatsKeyValue {
    type Error = Error;

    async fn put(&self, key: &str, value: Bytes) -> Result<u64, Self::Error> {
        self.store
            .put(key, value)
            .await
            .map_err(|e| Error::KeyValue(Box::new(e)))
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, Self::Error> {
        self.store
            .get(key)
            .await
            .map_err(|e| Error::KeyValue(Box::new(e)))
    }
}
