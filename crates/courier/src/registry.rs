use crate::error::Error;
use crate::pool::ConnectionPool;
use crate::subject::Subject;

use std::sync::Arc;
use std::time::Duration;

use courier_broker::{Broker, BrokerError, Connection, StorageType, StreamConfig};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// Maps subjects to the broker streams that store them, creating streams on demand.
///
/// Resolved streams are cached per subject id for the life of the registry.
#[derive(Debug)]
pub struct StreamRegistry<B>
where
    B: Broker,
{
    cache: DashMap<String, StreamConfig>,
    default_max_age: Duration,
    locks: DashMap<String, Arc<Mutex<()>>>,
    pool: Arc<ConnectionPool<B>>,
}

impl<B> StreamRegistry<B>
where
    B: Broker,
{
    /// Creates an empty registry.
    #[must_use]
    pub fn new(pool: Arc<ConnectionPool<B>>, default_max_age: Duration) -> Self {
        Self {
            cache: DashMap::new(),
            default_max_age,
            locks: DashMap::new(),
            pool,
        }
    }

    /// Makes sure the category stream of `subject` exists and captures its name.
    ///
    /// # Errors
    ///
    /// Fails when no healthy connection is available or the broker rejects
    /// the stream definition. Nothing is cached on failure.
    #[instrument(skip_all, fields(category = subject.category(), name = subject.name()))]
    pub async fn ensure_stream(&self, subject: &Subject) -> Result<(), Error<B::Error>> {
        let id = subject.id();
        if self.cache.contains_key(&id) {
            return Ok(());
        }

        let lock = Arc::clone(&self.locks.entry(subject.category().to_string()).or_default());
        let _guard = lock.lock().await;

        // Another task may have provisioned while we waited.
        if self.cache.contains_key(&id) {
            return Ok(());
        }

        let connection = self.pool.pick().await?;
        let stream = self
            .provision(&connection, subject)
            .await
            .map_err(|source| Error::Provision {
                stream: subject.category().to_string(),
                source,
            })?;

        self.cache.insert(id, stream);

        Ok(())
    }

    async fn provision(
        &self,
        connection: &B::Connection,
        subject: &Subject,
    ) -> Result<StreamConfig, B::Error> {
        if let Some(existing) = connection.stream_info(subject.category()).await? {
            return add_subject(connection, existing, subject.name()).await;
        }

        let config = StreamConfig {
            name: subject.category().to_string(),
            subjects: vec![subject.name().to_string()],
            storage: StorageType::File,
            max_age: subject.max_age().unwrap_or(self.default_max_age),
        };

        match connection.add_stream(config).await {
            Ok(created) => {
                info!(stream = %created.name, "stream created");
                Ok(created)
            }
            Err(e) if e.is_already_exists() => {
                debug!("stream created concurrently, re-reading");
                match connection.stream_info(subject.category()).await? {
                    Some(existing) => add_subject(connection, existing, subject.name()).await,
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Deletes the category stream of `subject` and forgets every subject cached for it.
    ///
    /// A stream that is already gone counts as deleted.
    ///
    /// # Errors
    ///
    /// Fails when no healthy connection is available or the broker refuses.
    #[instrument(skip_all, fields(category = subject.category()))]
    pub async fn delete_stream(&self, subject: &Subject) -> Result<(), Error<B::Error>> {
        self.delete_category(subject.category()).await
    }

    pub(crate) async fn delete_category(&self, category: &str) -> Result<(), Error<B::Error>> {
        let lock = Arc::clone(&self.locks.entry(category.to_string()).or_default());
        let _guard = lock.lock().await;

        let connection = self.pool.pick().await?;
        match connection.delete_stream(category).await {
            Ok(()) => info!(stream = %category, "stream deleted"),
            Err(e) if e.is_not_found() => debug!(stream = %category, "stream already gone"),
            Err(e) => return Err(Error::Broker(e)),
        }

        self.cache.retain(|_, stream| stream.name != category);

        // Only the map and this call hold the lock when nobody is waiting on it.
        self.locks
            .remove_if(category, |_, lock| Arc::strong_count(lock) <= 2);

        Ok(())
    }

    /// The stream cached for `subject`, if it has been provisioned.
    #[must_use]
    pub fn cached(&self, subject: &Subject) -> Option<StreamConfig> {
        self.cache.get(&subject.id()).map(|entry| entry.value().clone())
    }

    /// Forgets every cached stream, along with category locks nobody holds.
    pub fn clear(&self) {
        self.cache.clear();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

async fn add_subject<C>(
    connection: &C,
    mut stream: StreamConfig,
    name: &str,
) -> Result<StreamConfig, C::Error>
where
    C: Connection,
{
    if stream.has_subject(name) {
        return Ok(stream);
    }

    stream.subjects.push(name.to_string());
    let updated = connection.update_stream(stream).await?;
    info!(stream = %updated.name, subject = %name, "subject added to stream");

    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::PubSubConfig;

    use assert_matches::assert_matches;
    use courier_broker_memory::MemoryBroker;
    use futures::future::join_all;
    use tokio_util::sync::CancellationToken;

    const DEFAULT_MAX_AGE: Duration = Duration::from_secs(31 * 24 * 60 * 60);

    async fn registry(broker: &MemoryBroker) -> StreamRegistry<MemoryBroker> {
        let pool = ConnectionPool::connect(broker, &PubSubConfig::default(), CancellationToken::new())
            .await
            .unwrap();

        StreamRegistry::new(Arc::new(pool), DEFAULT_MAX_AGE)
    }

    #[tokio::test]
    async fn test_creates_stream_with_defaults() {
        let broker = MemoryBroker::new();
        let registry = registry(&broker).await;
        let subject = Subject::new("orders", "orders.created").unwrap();

        registry.ensure_stream(&subject).await.unwrap();

        let stream = broker.stream("orders").unwrap();
        assert_eq!(stream.subjects, vec!["orders.created".to_string()]);
        assert_eq!(stream.storage, StorageType::File);
        assert_eq!(stream.max_age, DEFAULT_MAX_AGE);
        assert_eq!(registry.cached(&subject), Some(stream));
    }

    #[tokio::test]
    async fn test_uses_subject_max_age() {
        let broker = MemoryBroker::new();
        let registry = registry(&broker).await;
        let subject = Subject::new("orders", "orders.created")
            .unwrap()
            .with_max_age(Duration::from_secs(60));

        registry.ensure_stream(&subject).await.unwrap();

        assert_eq!(broker.stream("orders").unwrap().max_age, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_appends_new_name_to_existing_stream() {
        let broker = MemoryBroker::new();
        let registry = registry(&broker).await;

        registry
            .ensure_stream(&Subject::new("orders", "orders.created").unwrap())
            .await
            .unwrap();
        registry
            .ensure_stream(&Subject::new("orders", "orders.paid").unwrap())
            .await
            .unwrap();

        assert_eq!(
            broker.stream("orders").unwrap().subjects,
            vec!["orders.created".to_string(), "orders.paid".to_string()]
        );
    }

    #[tokio::test]
    async fn test_cache_hit_skips_broker() {
        let broker = MemoryBroker::new();
        let registry = registry(&broker).await;
        let subject = Subject::new("orders", "orders.created").unwrap();

        registry.ensure_stream(&subject).await.unwrap();
        let requests = broker.admin_requests();

        registry.ensure_stream(&subject).await.unwrap();
        registry.ensure_stream(&subject).await.unwrap();

        assert_eq!(broker.admin_requests(), requests);
    }

    #[tokio::test]
    async fn test_concurrent_first_use_converges() {
        let broker = MemoryBroker::new();
        let registry = Arc::new(registry(&broker).await);

        let names: Vec<String> = (0..8).map(|i| format!("orders.n{i}")).collect();
        let calls = (0..32).map(|i| {
            let registry = registry.clone();
            let subject = Subject::new("orders", names[i % names.len()].clone()).unwrap();
            async move { registry.ensure_stream(&subject).await }
        });

        for result in join_all(calls).await {
            result.unwrap();
        }

        let stream = broker.stream("orders").unwrap();
        assert_eq!(stream.subjects.len(), names.len());
        for name in &names {
            assert!(stream.has_subject(name));
        }
    }

    #[tokio::test]
    async fn test_stream_created_elsewhere_is_adopted() {
        let broker = MemoryBroker::new();
        let first = registry(&broker).await;
        let second = registry(&broker).await;

        first
            .ensure_stream(&Subject::new("orders", "orders.created").unwrap())
            .await
            .unwrap();
        second
            .ensure_stream(&Subject::new("orders", "orders.paid").unwrap())
            .await
            .unwrap();

        assert_eq!(broker.stream("orders").unwrap().subjects.len(), 2);
    }

    #[tokio::test]
    async fn test_failure_leaves_cache_empty() {
        let broker = MemoryBroker::new();
        let registry = registry(&broker).await;

        // Subject lists may not overlap across streams.
        registry
            .ensure_stream(&Subject::new("orders", "shared").unwrap())
            .await
            .unwrap();
        let clashing = Subject::new("billing", "shared").unwrap();

        assert_matches!(
            registry.ensure_stream(&clashing).await,
            Err(Error::Provision { stream, .. }) if stream == "billing"
        );
        assert_eq!(registry.cached(&clashing), None);
    }

    #[tokio::test]
    async fn test_clear_drops_idle_locks() {
        let broker = MemoryBroker::new();
        let registry = registry(&broker).await;
        let subject = Subject::new("orders", "orders.created").unwrap();

        registry.ensure_stream(&subject).await.unwrap();
        assert_eq!(registry.locks.len(), 1);

        registry.clear();

        assert!(registry.locks.is_empty());
        assert_eq!(registry.cached(&subject), None);
    }

    #[tokio::test]
    async fn test_delete_evicts_whole_category() {
        let broker = MemoryBroker::new();
        let registry = registry(&broker).await;
        let created = Subject::new("orders", "orders.created").unwrap();
        let paid = Subject::new("orders", "orders.paid").unwrap();
        let other = Subject::new("billing", "billing.sent").unwrap();

        for subject in [&created, &paid, &other] {
            registry.ensure_stream(subject).await.unwrap();
        }

        registry.delete_stream(&created).await.unwrap();

        assert!(broker.stream("orders").is_none());
        assert_eq!(registry.cached(&created), None);
        assert_eq!(registry.cached(&paid), None);
        assert!(registry.cached(&other).is_some());

        assert!(!registry.locks.contains_key("orders"));
        assert!(registry.locks.contains_key("billing"));

        // Deleting again is not an error.
        registry.delete_stream(&paid).await.unwrap();

        // And the next use recreates it.
        registry.ensure_stream(&paid).await.unwrap();
        assert!(broker.stream("orders").unwrap().has_subject("orders.paid"));
    }
}
