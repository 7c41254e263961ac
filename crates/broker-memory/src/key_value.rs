use crate::error::Error;
use crate::server::Server;

use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use courier_broker::KeyValue;

/// An in-memory key/value bucket.
#[derive(Clone)]
pub struct MemoryKeyValue {
    bucket: String,
    server: Arc<Server>,
}

impl MemoryKeyValue {
    pub(crate) fn new(server: Arc<Server>, bucket: String) -> Self {
        server.kv_create(&bucket);

        Self { bucket, server }
    }
}

impl Debug for MemoryKeyValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("MemoryKeyValue")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl KeyValue for MemoryKeyValue {
    type Error = Error;

    async fn put(&self, key: &str, value: Bytes) -> Result<u64, Self::Error> {
        Ok(self.server.kv_put(&self.bucket, key, value))
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, Self::Error> {
        Ok(self.server.kv_get(&self.bucket, key))
    }
}
