use crate::config::PubSubConfig;
use crate::error::Error;

use std::time::Duration;

use courier_broker::{Broker, Connection, ConnectionStatus};
use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// A fixed set of broker connections, one of which is picked per operation.
#[derive(Clone, Debug)]
pub struct ConnectionPool<B>
where
    B: Broker,
{
    connect_wait: Duration,
    connections: Vec<B::Connection>,
    shutdown: CancellationToken,
}

/// Gives an unhealthy connection one wait window to recover.
async fn wait_until_connected<C, E>(
    connection: &C,
    wait: Duration,
    shutdown: &CancellationToken,
) -> Result<(), Error<E>>
where
    C: Connection<Error = E>,
    E: courier_broker::BrokerError,
{
    let status = connection.status();
    if status == ConnectionStatus::Connected {
        return Ok(());
    }

    debug!(?status, ?wait, "connection not ready, waiting once");
    tokio::select! {
        () = shutdown.cancelled() => return Err(Error::Shutdown),
        () = tokio::time::sleep(wait) => {}
    }

    if connection.status() == ConnectionStatus::Connected {
        Ok(())
    } else {
        Err(Error::ConnectionFailed(wait))
    }
}

impl<B> ConnectionPool<B>
where
    B: Broker,
{
    /// Opens `config.pool_size` connections, one after the other.
    ///
    /// Either every connection comes up healthy or none is left open.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, on a refused connection, or when a
    /// connection is not healthy within the wait window.
    #[instrument(skip_all, fields(pool_size = config.pool_size))]
    pub async fn connect(
        broker: &B,
        config: &PubSubConfig,
        shutdown: CancellationToken,
    ) -> Result<Self, Error<B::Error>> {
        config.validate()?;

        let options = config.connect_options();
        let connect_wait = config.connect_wait();
        let mut connections = Vec::with_capacity(config.pool_size);

        for index in 0..config.pool_size {
            let opened = match broker.connect(&options).await {
                Ok(connection) => {
                    match wait_until_connected(&connection, connect_wait, &shutdown).await {
                        Ok(()) => Ok(connection),
                        Err(e) => {
                            close_quietly(&connection).await;
                            Err(e)
                        }
                    }
                }
                Err(e) => Err(Error::Broker(e)),
            };

            match opened {
                Ok(connection) => {
                    debug!(index, "connection opened");
                    connections.push(connection);
                }
                Err(e) => {
                    warn!(index, error = %e, "connection failed, closing the partial pool");
                    for connection in &connections {
                        close_quietly(connection).await;
                    }
                    return Err(e);
                }
            }
        }

        info!(servers = ?options.servers, "connection pool ready");

        Ok(Self {
            connect_wait,
            connections,
            shutdown,
        })
    }

    /// Picks a connection uniformly at random.
    ///
    /// An unhealthy pick gets one wait window to recover; there is no fallback
    /// to another connection.
    ///
    /// # Errors
    ///
    /// Fails when the pool is empty or shut down, or the pick stays unhealthy.
    pub async fn pick(&self) -> Result<B::Connection, Error<B::Error>> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }

        if self.connections.is_empty() {
            return Err(Error::NoConnection);
        }

        let connection = self
            .connections
            .get(fastrand::usize(..self.connections.len()))
            .ok_or(Error::NoConnection)?;

        wait_until_connected(connection, self.connect_wait, &self.shutdown).await?;

        Ok(connection.clone())
    }

    /// Flushes every connection.
    ///
    /// # Errors
    ///
    /// Fails when any flush fails or they do not all finish within `timeout`.
    pub async fn flush(&self, timeout: Duration) -> Result<(), Error<B::Error>> {
        let flushes = try_join_all(self.connections.iter().map(|connection| connection.flush()));

        tokio::time::timeout(timeout, flushes)
            .await
            .map_err(|_| Error::FlushTimeout(timeout))?
            .map_err(Error::Broker)?;

        Ok(())
    }

    /// Closes every connection, reporting the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first close error; the remaining connections are still closed.
    pub async fn close(&self) -> Result<(), Error<B::Error>> {
        let mut first_error = None;

        for connection in &self.connections {
            if connection.status() == ConnectionStatus::Closed {
                continue;
            }

            if let Err(e) = connection.close().await {
                warn!(error = %e, "failed to close connection");
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), |e| Err(Error::Broker(e)))
    }

    /// Number of pooled connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether the pool holds no connection.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

async fn close_quietly<C>(connection: &C)
where
    C: Connection,
{
    if let Err(e) = connection.close().await {
        warn!(error = %e, "failed to close connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use courier_broker_memory::MemoryBroker;

    fn config(pool_size: usize) -> PubSubConfig {
        PubSubConfig {
            pool_size,
            connect_wait_ms: 50,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_connect_fills_pool() {
        let broker = MemoryBroker::new();

        let pool = ConnectionPool::connect(&broker, &config(3), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(pool.len(), 3);
        assert_eq!(pool.pick().await.unwrap().status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config() {
        let result =
            ConnectionPool::connect(&MemoryBroker::new(), &config(0), CancellationToken::new())
                .await;

        assert_matches!(result, Err(Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(true);

        let result = ConnectionPool::connect(&broker, &config(2), CancellationToken::new()).await;

        assert_matches!(result, Err(Error::Broker(_)));
    }

    #[tokio::test]
    async fn test_connect_times_out_unhealthy_connection() {
        let broker = MemoryBroker::new();
        broker.set_initial_status(ConnectionStatus::Pending);

        let result = ConnectionPool::connect(&broker, &config(2), CancellationToken::new()).await;

        assert_matches!(result, Err(Error::ConnectionFailed(_)));
    }

    #[tokio::test]
    async fn test_pick_fails_after_one_wait() {
        let broker = MemoryBroker::new();
        let pool = ConnectionPool::connect(&broker, &config(2), CancellationToken::new())
            .await
            .unwrap();

        broker.set_status_all(ConnectionStatus::Disconnected);

        let started = tokio::time::Instant::now();
        assert_matches!(pool.pick().await, Err(Error::ConnectionFailed(_)));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_pick_recovers_within_wait() {
        let broker = MemoryBroker::new();
        let pool = ConnectionPool::connect(
            &broker,
            &PubSubConfig {
                connect_wait_ms: 200,
                ..Default::default()
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

        broker.set_status_all(ConnectionStatus::Disconnected);
        let recovering = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            recovering.set_status_all(ConnectionStatus::Connected);
        });

        assert!(pool.pick().await.is_ok());
    }

    #[tokio::test]
    async fn test_pick_wait_is_cancellable() {
        let broker = MemoryBroker::new();
        let shutdown = CancellationToken::new();
        let pool = ConnectionPool::connect(
            &broker,
            &PubSubConfig {
                connect_wait_ms: 60_000,
                ..Default::default()
            },
            shutdown.clone(),
        )
        .await
        .unwrap();

        broker.set_status_all(ConnectionStatus::Disconnected);
        let canceller = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        assert_matches!(pool.pick().await, Err(Error::Shutdown));
    }

    #[tokio::test]
    async fn test_close_closes_every_connection() {
        let broker = MemoryBroker::new();
        let pool = ConnectionPool::connect(&broker, &config(2), CancellationToken::new())
            .await
            .unwrap();
        let connection = pool.pick().await.unwrap();

        pool.close().await.unwrap();

        assert_eq!(connection.status(), ConnectionStatus::Closed);
        pool.flush(Duration::from_secs(1)).await.unwrap_err();
    }
}
