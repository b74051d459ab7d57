//! Configuration of the data-access layer.
//!
//! Nothing here describes a tenant database: tenants send their own
//! descriptors with every request. These settings only cover server-side
//! policy (pool sizing, managed-cloud credentials, raw-statement policy).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::schema::DEFAULT_TENANT_FIELD;
use crate::secret::Secret;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DataConfig {
    /// Field/column carrying the tenant id in every tenant-scoped entity.
    pub tenant_field: String,
    pub pool: PoolCfg,
    pub document: DocumentCfg,
    pub raw: RawCfg,
    /// Credentials used when a descriptor omits them (local development).
    pub local_credentials: LocalCredentials,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            tenant_field: DEFAULT_TENANT_FIELD.to_owned(),
            pool: PoolCfg::default(),
            document: DocumentCfg::default(),
            raw: RawCfg::default(),
            local_credentials: LocalCredentials::default(),
        }
    }
}

/// Relational pool knobs; each driver applies the subset it supports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolCfg {
    /// Upper bound for a pool when the descriptor sets no connection limit.
    pub max_conns: u32,
    pub min_conns: Option<u32>,
    /// How long a request waits for a free slot before failing.
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub max_lifetime: Option<Duration>,
    /// Number of distinct descriptor pools kept open at once.
    pub max_pools: usize,
}

impl Default for PoolCfg {
    fn default() -> Self {
        Self {
            max_conns: 10,
            min_conns: None,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Some(Duration::from_secs(300)),
            max_lifetime: Some(Duration::from_secs(1800)),
            max_pools: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DocumentCfg {
    /// Host suffixes recognized as managed-cloud clusters.
    pub managed_domains: Vec<String>,
    /// Server-side credentials for managed clusters. Tenants never supply these.
    pub cluster_username: Option<String>,
    pub cluster_password: Option<Secret>,
    /// Database holding the users directory on managed clusters.
    pub directory_database: String,
    pub users_collection: String,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for DocumentCfg {
    fn default() -> Self {
        Self {
            managed_domains: vec!["mongodb.net".to_owned()],
            cluster_username: None,
            cluster_password: None,
            directory_database: "directory".to_owned(),
            users_collection: "users".to_owned(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl DocumentCfg {
    /// Returns the configured cluster credentials when both halves are present.
    #[must_use]
    pub fn cluster_credentials(&self) -> Option<(&str, &Secret)> {
        match (&self.cluster_username, &self.cluster_password) {
            (Some(user), Some(password)) if !user.is_empty() && !password.is_empty() => {
                Some((user.as_str(), password))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawPolicy {
    /// Reject statements that are not obviously scoped to the caller.
    #[default]
    Enforce,
    /// Log the rejection reason and execute anyway.
    AuditOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawCfg {
    pub enabled: bool,
    pub policy: RawPolicy,
}

impl Default for RawCfg {
    fn default() -> Self {
        Self {
            enabled: true,
            policy: RawPolicy::Enforce,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialsCfg {
    pub username: String,
    pub password: Option<Secret>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LocalCredentials {
    pub mysql: Option<CredentialsCfg>,
    pub postgresql: Option<CredentialsCfg>,
    pub mongodb: Option<CredentialsCfg>,
}
