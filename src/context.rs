//! Process-wide handle owning configuration, schema, connections and the
//! active-lock registry.
//!
//! Built once at startup and shared by reference. Every client, feed and
//! lock is created from it; `shutdown` stops lock heartbeats, releases
//! non-persistent locks and closes the connection pools.

use std::sync::Arc;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::codec::PathCodec;
use crate::codec::QueryBuilder;
use crate::feed::ChangeFeed;
use crate::lock::DistributedLock;
use crate::lock::HeartbeatRegistry;
use crate::lock::LockOptions;
use crate::schema::SchemaCatalog;
use crate::store::InMemoryBackend;
use crate::store::KvBackend;
use crate::store::RedisBackend;
use crate::store::Scope;
use crate::store::ScopedBackends;
use crate::store::StoreClient;
use crate::ConnectionRole;
use crate::DalConfig;
use crate::Result;
use crate::StoreError;

pub struct DalContext {
    config: DalConfig,
    catalog: Arc<SchemaCatalog>,
    query: QueryBuilder,
    global: ScopedBackends,
    /// `None` when the local instance is disabled
    local: Option<ScopedBackends>,
    /// Pools to close on shutdown
    pools: Vec<Arc<RedisBackend>>,
    heartbeats: Arc<HeartbeatRegistry>,
}

impl std::fmt::Debug for DalContext {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("DalContext")
            .field("schema_version", &self.query.codec().template().version())
            .field("global", &self.global)
            .field("local", &self.local)
            .field("active_locks", &self.heartbeats.len())
            .finish_non_exhaustive()
    }
}

impl DalContext {
    /// Validates `config`, loads the schema catalog and creates the Redis
    /// pools. Connections are opened lazily on first use.
    ///
    /// A disabled replica falls back to the master. The master must be
    /// enabled; the local instance is optional.
    pub fn connect(config: DalConfig) -> Result<Self> {
        let config = config.validate()?;
        let catalog = Arc::new(SchemaCatalog::from_config(&config.schema)?);
        let query = Self::query_builder(&config, &catalog)?;

        let connections = &config.connections;
        let mut pools = Vec::new();
        let mut open = |role: ConnectionRole| -> Result<Option<Arc<RedisBackend>>> {
            let endpoint = connections.endpoint(role);
            if !endpoint.enabled {
                debug!(%role, "connection disabled");
                return Ok(None);
            }
            let backend = Arc::new(RedisBackend::new(role, endpoint, &connections.pool)?);
            info!(%role, url = %endpoint.url(), "connection pool created");
            pools.push(backend.clone());
            Ok(Some(backend))
        };

        let master = open(ConnectionRole::Master)?.ok_or(StoreError::Disabled(ConnectionRole::Master))?;
        let replica = match open(ConnectionRole::Replica)? {
            Some(replica) => replica,
            None => {
                warn!("replica disabled, reads go to the master");
                master.clone()
            }
        };
        let local = open(ConnectionRole::Local)?;

        let global = ScopedBackends {
            read: replica.clone(),
            write: master,
            subscribe: replica,
        };
        let local = local.map(|backend| ScopedBackends::single(backend as Arc<dyn KvBackend>));

        Ok(Self {
            config,
            catalog,
            query,
            global,
            local,
            pools,
            heartbeats: Arc::new(HeartbeatRegistry::new()),
        })
    }

    /// Context over in-process stores: one shared by the global connections,
    /// another one for the local instance.
    pub fn in_memory(config: DalConfig) -> Result<Self> {
        let config = config.validate()?;
        let catalog = Arc::new(SchemaCatalog::from_config(&config.schema)?);
        let query = Self::query_builder(&config, &catalog)?;

        let shared = InMemoryBackend::new();
        let global = ScopedBackends {
            read: Arc::new(shared.handle(ConnectionRole::Replica)),
            write: Arc::new(shared.handle(ConnectionRole::Master)),
            subscribe: Arc::new(shared.handle(ConnectionRole::Replica)),
        };
        let local = ScopedBackends::single(Arc::new(InMemoryBackend::new().handle(ConnectionRole::Local)));

        Ok(Self {
            config,
            catalog,
            query,
            global,
            local: Some(local),
            pools: Vec::new(),
            heartbeats: Arc::new(HeartbeatRegistry::new()),
        })
    }

    fn query_builder(
        config: &DalConfig,
        catalog: &SchemaCatalog,
    ) -> Result<QueryBuilder> {
        let template = catalog.template(&config.schema.version)?;
        info!(version = %template.version(), "schema template loaded");
        Ok(QueryBuilder::new(PathCodec::new(template)))
    }

    pub fn config(&self) -> &DalConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<SchemaCatalog> {
        &self.catalog
    }

    pub fn heartbeats(&self) -> &Arc<HeartbeatRegistry> {
        &self.heartbeats
    }

    fn backends(
        &self,
        scope: Scope,
    ) -> Result<ScopedBackends> {
        match scope {
            Scope::Global => Ok(self.global.clone()),
            Scope::Local => self
                .local
                .clone()
                .ok_or_else(|| StoreError::Disabled(ConnectionRole::Local).into()),
        }
    }

    pub fn store(
        &self,
        scope: Scope,
    ) -> Result<StoreClient> {
        Ok(StoreClient::new(
            self.backends(scope)?,
            self.query.clone(),
            self.config.retry.read,
        ))
    }

    pub fn change_feed(
        &self,
        scope: Scope,
    ) -> Result<ChangeFeed> {
        Ok(ChangeFeed::new(self.store(scope)?).with_retry(self.config.retry.subscribe))
    }

    /// Lock handle bound to the scope named in `options`
    pub fn lock(
        &self,
        options: LockOptions,
    ) -> Result<DistributedLock> {
        let client = self.store(options.scope)?;
        DistributedLock::new(&client, options, &self.config.lock, self.heartbeats.clone())
    }

    /// Stops heartbeats, releases non-persistent locks and closes the pools
    pub async fn shutdown(&self) -> Result<()> {
        self.heartbeats.shutdown().await?;
        for backend in &self.pools {
            backend.close();
        }
        info!("context shut down");
        Ok(())
    }
}
