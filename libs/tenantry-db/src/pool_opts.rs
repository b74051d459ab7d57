//! Pool sizing applied uniformly to every sqlx pool builder.

use std::time::Duration;

use crate::config::PoolCfg;

/// Effective pool knobs for one descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PoolSizing {
    pub max_conns: u32,
    pub min_conns: Option<u32>,
    pub acquire_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_lifetime: Option<Duration>,
}

impl PoolSizing {
    /// Server defaults, narrowed by the descriptor's own connection limit.
    pub fn resolve(cfg: &PoolCfg, connection_limit: Option<u32>) -> Self {
        let max_conns = connection_limit.unwrap_or(cfg.max_conns).max(1);
        Self {
            max_conns,
            min_conns: cfg.min_conns.map(|n| n.min(max_conns)),
            acquire_timeout: cfg.acquire_timeout,
            idle_timeout: cfg.idle_timeout,
            max_lifetime: cfg.max_lifetime,
        }
    }
}

/// Applies [`PoolSizing`] to a pool builder.
pub(crate) trait ApplyPoolOpts<T> {
    fn apply(self, sizing: &PoolSizing) -> Self;
}

macro_rules! impl_apply_pool_opts {
    ($builder:ty) => {
        impl ApplyPoolOpts<$builder> for $builder {
            fn apply(mut self, sizing: &PoolSizing) -> Self {
                self = self
                    .max_connections(sizing.max_conns)
                    .acquire_timeout(sizing.acquire_timeout)
                    .idle_timeout(sizing.idle_timeout)
                    .max_lifetime(sizing.max_lifetime)
                    .test_before_acquire(true);
                if let Some(n) = sizing.min_conns {
                    self = self.min_connections(n);
                }
                self
            }
        }
    };
}

impl_apply_pool_opts!(sea_orm::sqlx::postgres::PgPoolOptions);
impl_apply_pool_opts!(sea_orm::sqlx::mysql::MySqlPoolOptions);
impl_apply_pool_opts!(sea_orm::sqlx::sqlite::SqlitePoolOptions);
