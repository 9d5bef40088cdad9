use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::aio::PubSub;
use redis::Client;
use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::debug;
use tracing::info;

use super::StoreResult;
use crate::ConnectionRole;
use crate::EndpointConfig;
use crate::PoolConfig;
use crate::StoreError;

/// Bounded connections to one Redis endpoint.
///
/// Commands and subscriptions draw from separate limits so a burst of
/// change feeds cannot starve foreground calls.
pub struct RedisPool {
    role: ConnectionRole,
    client: Client,
    idle: Mutex<Vec<MultiplexedConnection>>,
    commands: Arc<Semaphore>,
    subscriptions: Arc<Semaphore>,
    connect_timeout: Duration,
}

impl std::fmt::Debug for RedisPool {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("RedisPool")
            .field("role", &self.role)
            .field("idle", &self.idle.lock().len())
            .field("available", &self.commands.available_permits())
            .finish()
    }
}

impl RedisPool {
    pub(crate) fn new(
        role: ConnectionRole,
        endpoint: &EndpointConfig,
        config: &PoolConfig,
    ) -> StoreResult<Arc<Self>> {
        let client = Client::open(endpoint.url()).map_err(|e| StoreError::connectivity(role, "OPEN", e))?;
        info!(%role, url = %endpoint.url(), "created connection pool");
        Ok(Arc::new(Self {
            role,
            client,
            idle: Mutex::new(Vec::new()),
            commands: Arc::new(Semaphore::new(config.max_connections)),
            subscriptions: Arc::new(Semaphore::new(config.max_subscriptions)),
            connect_timeout: config.connect_timeout(),
        }))
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    /// Checks out a command connection, opening one if none is idle
    pub(crate) async fn get(self: &Arc<Self>) -> StoreResult<PooledConnection> {
        let permit = self
            .commands
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StoreError::PoolClosed(self.role))?;

        let cached = self.idle.lock().pop();
        let conn = match cached {
            Some(conn) => conn,
            None => {
                debug!(role = %self.role, "opening command connection");
                self.with_connect_timeout(self.client.get_multiplexed_async_connection())
                    .await?
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.clone(),
            broken: false,
            _permit: permit,
        })
    }

    /// Opens a dedicated pub/sub connection. The permit must be held for as
    /// long as the connection lives.
    pub(crate) async fn subscribe(&self) -> StoreResult<(PubSub, OwnedSemaphorePermit)> {
        let permit = self
            .subscriptions
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StoreError::PoolClosed(self.role))?;
        debug!(role = %self.role, "opening subscription connection");
        let pubsub = self.with_connect_timeout(self.client.get_async_pubsub()).await?;
        Ok((pubsub, permit))
    }

    /// Refuses further checkouts and drops idle connections
    pub(crate) fn close(&self) {
        self.commands.close();
        self.subscriptions.close();
        self.idle.lock().clear();
        info!(role = %self.role, "connection pool closed");
    }

    async fn with_connect_timeout<T>(
        &self,
        connect: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> StoreResult<T> {
        match timeout(self.connect_timeout, connect).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(StoreError::connectivity(self.role, "CONNECT", e)),
            Err(_) => Err(StoreError::Timeout {
                connection: self.role,
                operation: "CONNECT",
                duration: self.connect_timeout,
            }),
        }
    }

    fn check_in(
        &self,
        conn: MultiplexedConnection,
    ) {
        if !self.commands.is_closed() {
            self.idle.lock().push(conn);
        }
    }
}

/// A checked-out command connection, returned to the pool on drop
pub(crate) struct PooledConnection {
    conn: Option<MultiplexedConnection>,
    pool: Arc<RedisPool>,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Marks the connection unusable so it is not returned to the pool
    pub(crate) fn discard(&mut self) {
        self.broken = true;
    }
}

impl Deref for PooledConnection {
    type Target = MultiplexedConnection;

    fn deref(&self) -> &Self::Target {
        // Only taken in drop
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !self.broken {
                self.pool.check_in(conn);
            }
        }
    }
}
