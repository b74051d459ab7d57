//! Connection management keyed strictly by descriptor.
//!
//! Relational descriptors get a bounded sqlx pool, cached by an xxh3 hash of
//! every connection-relevant field. Document descriptors get a fresh client per
//! unit of work which the caller closes through [`ConnectionManager::release`]
//! (or [`DocumentSession::close`]).

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use futures::future::BoxFuture;
use mongodb::bson::doc;
use mongodb::options::{ClientOptions, Credential, Tls, TlsOptions};
use mongodb::{Client, Database};
use sea_orm::sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlSslMode};
use sea_orm::sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sea_orm::{
    ConnectionTrait, DatabaseBackend, DatabaseConnection, SqlxMySqlConnector, SqlxPostgresConnector,
};
use xxhash_rust::xxh3::xxh3_64;

use crate::config::{CredentialsCfg, DataConfig};
use crate::descriptor::{
    ConnectionDescriptor, Credentials, Deployment, DocumentDescriptor, Engine,
    RelationalDescriptor,
};
use crate::error::DataError;
use crate::pool_opts::{ApplyPoolOpts, PoolSizing};
use crate::secret::Secret;

/// Pooled relational connection. Dropping it returns nothing to close: the
/// pool stays cached in the manager.
#[derive(Debug, Clone)]
pub struct RelationalHandle {
    engine: Engine,
    conn: DatabaseConnection,
}

impl RelationalHandle {
    /// Wraps a connection opened outside the manager.
    #[must_use]
    pub fn new(engine: Engine, conn: DatabaseConnection) -> Self {
        Self { engine, conn }
    }

    #[must_use]
    pub fn engine(&self) -> Engine {
        self.engine
    }

    #[must_use]
    pub fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }

    #[must_use]
    pub fn backend(&self) -> DatabaseBackend {
        self.conn.get_database_backend()
    }
}

/// Document client scoped to one unit of work.
#[derive(Debug)]
pub struct DocumentSession {
    client: Client,
    db: Database,
}

impl DocumentSession {
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Shuts the client down, waiting for in-flight operations.
    pub async fn close(self) {
        self.client.shutdown().await;
    }
}

/// Handle returned by [`ConnectionManager::acquire`].
#[derive(Debug)]
pub enum DbHandle {
    Relational(RelationalHandle),
    Document(DocumentSession),
}

impl DbHandle {
    #[must_use]
    pub fn engine(&self) -> Engine {
        match self {
            Self::Relational(h) => h.engine,
            Self::Document(_) => Engine::MongoDb,
        }
    }
}

struct PoolEntry {
    engine: Engine,
    conn: DatabaseConnection,
    last_used: AtomicU64,
}

/// Owns the relational pool cache and opens document sessions.
pub struct ConnectionManager {
    config: DataConfig,
    pools: DashMap<u64, PoolEntry>,
    clock: AtomicU64,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(config: DataConfig) -> Self {
        Self {
            config,
            pools: DashMap::new(),
            clock: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> &DataConfig {
        &self.config
    }

    /// Number of relational pools currently cached.
    #[must_use]
    pub fn cached_pools(&self) -> usize {
        self.pools.len()
    }

    /// Acquires a handle for exactly this descriptor.
    ///
    /// # Errors
    /// - `DataError::Connection` when the backend is unreachable or rejects
    ///   the credentials
    /// - `DataError::ResourceExhausted` when no pool slot frees up in time
    pub async fn acquire(&self, descriptor: &ConnectionDescriptor) -> crate::Result<DbHandle> {
        match descriptor {
            ConnectionDescriptor::MySql(d) => self
                .relational(Engine::MySql, d)
                .await
                .map(DbHandle::Relational),
            ConnectionDescriptor::Postgres(d) => self
                .relational(Engine::Postgres, d)
                .await
                .map(DbHandle::Relational),
            ConnectionDescriptor::MongoDb(d) => self.open_document(d).await.map(DbHandle::Document),
        }
    }

    /// Releases a handle. Document clients are shut down; pooled relational
    /// connections stay cached.
    pub async fn release(&self, handle: DbHandle) {
        match handle {
            DbHandle::Relational(_) => {}
            DbHandle::Document(session) => session.close().await,
        }
    }

    /// Runs `f` with a handle and releases it whether `f` succeeds or fails.
    ///
    /// # Errors
    /// Propagates acquisition errors and whatever `f` returns.
    pub async fn with_handle<T, F>(
        &self,
        descriptor: &ConnectionDescriptor,
        f: F,
    ) -> crate::Result<T>
    where
        F: for<'h> FnOnce(&'h DbHandle) -> BoxFuture<'h, crate::Result<T>>,
    {
        let handle = self.acquire(descriptor).await?;
        let result = f(&handle).await;
        self.release(handle).await;
        result
    }

    /// Acquire, one no-op round trip, release.
    ///
    /// # Errors
    /// Same as [`ConnectionManager::acquire`], plus a failed round trip.
    pub async fn test_connection(&self, descriptor: &ConnectionDescriptor) -> crate::Result<()> {
        self.with_handle(descriptor, |handle| {
            Box::pin(async move {
                match handle {
                    DbHandle::Relational(h) => h
                        .conn
                        .ping()
                        .await
                        .map_err(|e| DataError::unavailable(h.engine, e.to_string())),
                    DbHandle::Document(s) => ping(&s.db).await,
                }
            })
        })
        .await
    }

    /// Closes every cached pool.
    pub async fn close_all(&self) {
        let keys: Vec<u64> = self.pools.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, entry)) = self.pools.remove(&key) {
                close_pool(entry).await;
            }
        }
        tracing::info!("all relational pools closed");
    }

    async fn relational(
        &self,
        engine: Engine,
        d: &RelationalDescriptor,
    ) -> crate::Result<RelationalHandle> {
        let credentials = self.effective_credentials(engine, d.credentials.as_ref());
        let key = pool_key(engine, d, credentials.as_ref());
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);

        if let Some(entry) = self.pools.get(&key) {
            entry.last_used.store(tick, Ordering::Relaxed);
            return Ok(RelationalHandle::new(engine, entry.conn.clone()));
        }

        let sizing = PoolSizing::resolve(&self.config.pool, d.options.connection_limit);
        let conn = connect_relational(engine, d, credentials.as_ref(), &sizing).await?;
        tracing::debug!(
            engine = %engine,
            host = %d.host,
            database = %d.database,
            max_conns = sizing.max_conns,
            "opened relational pool"
        );

        let cached = self.cache_pool(key, engine, conn, tick);
        Ok(RelationalHandle::new(engine, cached))
    }

    /// Caches a freshly opened pool, evicting first when the cache is full.
    /// If another request cached the same key meanwhile, that pool wins and
    /// `conn` is dropped.
    fn cache_pool(
        &self,
        key: u64,
        engine: Engine,
        conn: DatabaseConnection,
        tick: u64,
    ) -> DatabaseConnection {
        self.evict_if_full();
        let entry = self.pools.entry(key).or_insert_with(|| PoolEntry {
            engine,
            conn,
            last_used: AtomicU64::new(tick),
        });
        entry.conn.clone()
    }

    /// Forgets the least recently used pools. Handles already given out keep
    /// their pool alive; sqlx closes it when the last clone is dropped.
    fn evict_if_full(&self) {
        let limit = self.config.pool.max_pools.max(1);
        while self.pools.len() >= limit {
            let oldest = self
                .pools
                .iter()
                .min_by_key(|e| e.last_used.load(Ordering::Relaxed))
                .map(|e| *e.key());
            let Some(key) = oldest else { break };
            if let Some((_, entry)) = self.pools.remove(&key) {
                tracing::debug!(engine = %entry.engine, "evicting least recently used pool");
            }
        }
    }

    fn effective_credentials(
        &self,
        engine: Engine,
        supplied: Option<&Credentials>,
    ) -> Option<Credentials> {
        if let Some(c) = supplied {
            return Some(c.clone());
        }
        let local = &self.config.local_credentials;
        let fallback = match engine {
            Engine::MySql => local.mysql.as_ref(),
            Engine::Postgres => local.postgresql.as_ref(),
            Engine::MongoDb => local.mongodb.as_ref(),
        };
        fallback.map(|CredentialsCfg { username, password }| Credentials {
            username: username.clone(),
            password: password.clone(),
        })
    }

    /// Opens and pings a client for one unit of work.
    ///
    /// # Errors
    /// - `DataError::Connection` (`ServerMisconfigured`) for a managed cluster
    ///   when the server has no cluster credentials
    /// - `DataError::Connection` (`Unavailable`) when the ping fails
    pub async fn open_document(&self, d: &DocumentDescriptor) -> crate::Result<DocumentSession> {
        let cfg = &self.config.document;
        let (uri, credentials) = match &d.deployment {
            Deployment::ManagedCloud { cluster_host } => {
                let (username, password) = cfg.cluster_credentials().ok_or_else(|| {
                    DataError::misconfigured(
                        Engine::MongoDb,
                        "managed cluster credentials are not configured on the server",
                    )
                })?;
                (
                    format!("mongodb+srv://{cluster_host}/"),
                    Some(Credentials {
                        username: username.to_owned(),
                        password: Some(password.clone()),
                    }),
                )
            }
            Deployment::SelfHosted { host, port } => (
                format!("mongodb://{host}:{port}/"),
                self.effective_credentials(Engine::MongoDb, d.credentials.as_ref()),
            ),
        };

        let mut options = ClientOptions::parse(&uri)
            .await
            .map_err(|e| DataError::unavailable(Engine::MongoDb, e.to_string()))?;
        options.app_name = Some("tenantry".to_owned());
        options.server_selection_timeout = Some(cfg.connect_timeout);
        options.connect_timeout = Some(cfg.connect_timeout);
        options.max_pool_size = d.connection_limit;
        if d.ssl && !d.is_managed() {
            options.tls = Some(Tls::Enabled(TlsOptions::default()));
        }
        if let Some(c) = credentials {
            options.credential = Some(
                Credential::builder()
                    .username(c.username)
                    .password(c.password.as_ref().map(|p| p.expose().to_owned()))
                    .build(),
            );
        }

        let client = Client::with_options(options)
            .map_err(|e| DataError::unavailable(Engine::MongoDb, e.to_string()))?;
        let db = client.database(&d.database);
        if let Err(e) = ping(&db).await {
            client.shutdown().await;
            return Err(e);
        }
        tracing::debug!(host = %d.host(), database = %d.database, "document session opened");
        Ok(DocumentSession { client, db })
    }
}

async fn ping(db: &Database) -> crate::Result<()> {
    db.run_command(doc! { "ping": 1 })
        .await
        .map(|_| ())
        .map_err(|e| match DataError::from_mongo(&e) {
            err @ DataError::Connection { .. } => err,
            other => DataError::unavailable(Engine::MongoDb, other.to_string()),
        })
}

async fn close_pool(entry: PoolEntry) {
    if let Err(e) = entry.conn.close().await {
        tracing::warn!(engine = %entry.engine, error = %e, "failed to close pool");
    }
}

fn pool_key(engine: Engine, d: &RelationalDescriptor, credentials: Option<&Credentials>) -> u64 {
    let mut buf = Vec::with_capacity(128);
    let mut field = |bytes: &[u8]| {
        buf.extend_from_slice(bytes);
        buf.push(0);
    };
    field(engine.as_str().as_bytes());
    field(d.host.to_ascii_lowercase().as_bytes());
    field(&d.port.to_be_bytes());
    field(d.database.as_bytes());
    field(
        credentials
            .map(|c| c.username.as_str())
            .unwrap_or_default()
            .as_bytes(),
    );
    field(
        credentials
            .and_then(|c| c.password.as_ref())
            .map(Secret::expose)
            .unwrap_or_default()
            .as_bytes(),
    );
    field(&[u8::from(d.options.ssl)]);
    field(&d.options.connection_limit.unwrap_or_default().to_be_bytes());
    field(d.options.charset.as_deref().unwrap_or_default().as_bytes());
    xxh3_64(&buf)
}

fn connect_failure(engine: Engine, err: &sea_orm::sqlx::Error) -> DataError {
    match err {
        sea_orm::sqlx::Error::PoolTimedOut => DataError::ResourceExhausted {
            engine,
            message: "timed out waiting for a free connection".to_owned(),
        },
        other => DataError::unavailable(engine, other.to_string()),
    }
}

async fn connect_relational(
    engine: Engine,
    d: &RelationalDescriptor,
    credentials: Option<&Credentials>,
    sizing: &PoolSizing,
) -> crate::Result<DatabaseConnection> {
    let username = credentials.map(|c| c.username.as_str());
    let password = credentials
        .and_then(|c| c.password.as_ref())
        .map(Secret::expose);

    match engine {
        Engine::Postgres => {
            let mut opts = PgConnectOptions::new()
                .host(&d.host)
                .port(d.port)
                .database(&d.database)
                .ssl_mode(if d.options.ssl {
                    PgSslMode::Require
                } else {
                    PgSslMode::Prefer
                });
            if let Some(user) = username {
                opts = opts.username(user);
            }
            if let Some(pw) = password {
                opts = opts.password(pw);
            }
            if let Some(charset) = &d.options.charset {
                opts = opts.options([("client_encoding", charset.as_str())]);
            }
            let pool = PgPoolOptions::new()
                .apply(sizing)
                .connect_with(opts)
                .await
                .map_err(|e| connect_failure(engine, &e))?;
            Ok(SqlxPostgresConnector::from_sqlx_postgres_pool(pool))
        }
        Engine::MySql => {
            let mut opts = MySqlConnectOptions::new()
                .host(&d.host)
                .port(d.port)
                .database(&d.database)
                .ssl_mode(if d.options.ssl {
                    MySqlSslMode::Required
                } else {
                    MySqlSslMode::Preferred
                });
            if let Some(user) = username {
                opts = opts.username(user);
            }
            if let Some(pw) = password {
                opts = opts.password(pw);
            }
            if let Some(charset) = &d.options.charset {
                opts = opts.charset(charset);
            }
            let pool = MySqlPoolOptions::new()
                .apply(sizing)
                .connect_with(opts)
                .await
                .map_err(|e| connect_failure(engine, &e))?;
            Ok(SqlxMySqlConnector::from_sqlx_mysql_pool(pool))
        }
        Engine::MongoDb => Err(DataError::InvalidOperation(
            "document descriptors do not use relational pools".to_owned(),
        )),
    }
}
