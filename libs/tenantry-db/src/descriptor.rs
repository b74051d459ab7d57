//! Connection descriptors: the loosely-typed wire form and the validated,
//! engine-tagged form every other layer works with.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::secret::Secret;

/// Default `MongoDB` port for self-hosted deployments.
pub const DEFAULT_MONGO_PORT: u16 = 27017;

/// Supported engines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Engine {
    #[serde(rename = "mysql")]
    MySql,
    #[serde(rename = "postgresql")]
    Postgres,
    #[serde(rename = "mongodb")]
    MongoDb,
}

impl Engine {
    /// Parses the descriptor engine tag.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "mysql" => Some(Self::MySql),
            "postgresql" | "postgres" => Some(Self::Postgres),
            "mongodb" | "mongo" => Some(Self::MongoDb),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::Postgres => "postgresql",
            Self::MongoDb => "mongodb",
        }
    }

    #[must_use]
    pub fn is_relational(self) -> bool {
        matches!(self, Self::MySql | Self::Postgres)
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptor exactly as a client sent it. Nothing here is trusted.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDescriptor {
    #[serde(rename = "type", alias = "engine")]
    pub engine: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    #[serde(alias = "db", alias = "dbName")]
    pub database: Option<String>,
    #[serde(alias = "user")]
    pub username: Option<String>,
    pub password: Option<Secret>,
    #[serde(default)]
    pub ssl: bool,
    pub connection_limit: Option<u32>,
    pub charset: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<Secret>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelationalOptions {
    pub ssl: bool,
    pub connection_limit: Option<u32>,
    pub charset: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelationalDescriptor {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub credentials: Option<Credentials>,
    pub options: RelationalOptions,
}

/// Where a document database lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Deployment {
    /// Managed-hosting cluster. Connects with server-side credentials over SRV.
    ManagedCloud { cluster_host: String },
    /// Self-hosted or local instance. Validated syntactically only.
    SelfHosted { host: String, port: u16 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocumentDescriptor {
    pub deployment: Deployment,
    pub database: String,
    pub credentials: Option<Credentials>,
    pub ssl: bool,
    pub connection_limit: Option<u32>,
}

impl DocumentDescriptor {
    #[must_use]
    pub fn is_managed(&self) -> bool {
        matches!(self.deployment, Deployment::ManagedCloud { .. })
    }

    #[must_use]
    pub fn host(&self) -> &str {
        match &self.deployment {
            Deployment::ManagedCloud { cluster_host } => cluster_host,
            Deployment::SelfHosted { host, .. } => host,
        }
    }

    #[must_use]
    pub fn port(&self) -> Option<u16> {
        match self.deployment {
            Deployment::ManagedCloud { .. } => None,
            Deployment::SelfHosted { port, .. } => Some(port),
        }
    }
}

/// Validated descriptor, one variant per engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionDescriptor {
    MySql(RelationalDescriptor),
    Postgres(RelationalDescriptor),
    MongoDb(DocumentDescriptor),
}

impl ConnectionDescriptor {
    #[must_use]
    pub fn engine(&self) -> Engine {
        match self {
            Self::MySql(_) => Engine::MySql,
            Self::Postgres(_) => Engine::Postgres,
            Self::MongoDb(_) => Engine::MongoDb,
        }
    }

    #[must_use]
    pub fn host(&self) -> &str {
        match self {
            Self::MySql(d) | Self::Postgres(d) => &d.host,
            Self::MongoDb(d) => d.host(),
        }
    }

    #[must_use]
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::MySql(d) | Self::Postgres(d) => Some(d.port),
            Self::MongoDb(d) => d.port(),
        }
    }

    #[must_use]
    pub fn database(&self) -> &str {
        match self {
            Self::MySql(d) | Self::Postgres(d) => &d.database,
            Self::MongoDb(d) => &d.database,
        }
    }

    #[must_use]
    pub fn credentials(&self) -> Option<&Credentials> {
        match self {
            Self::MySql(d) | Self::Postgres(d) => d.credentials.as_ref(),
            Self::MongoDb(d) => d.credentials.as_ref(),
        }
    }

    /// Non-secret fields, safe to echo back to the caller.
    #[must_use]
    pub fn summary(&self) -> DescriptorSummary {
        DescriptorSummary {
            engine: self.engine(),
            host: self.host().to_owned(),
            port: self.port(),
            database: self.database().to_owned(),
        }
    }
}

/// Credentials never appear in the rendered form.
impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port() {
            Some(port) => write!(
                f,
                "{}://{}:{}/{}",
                self.engine(),
                self.host(),
                port,
                self.database()
            ),
            None => write!(f, "{}://{}/{}", self.engine(), self.host(), self.database()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DescriptorSummary {
    #[serde(rename = "type")]
    pub engine: Engine,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub database: String,
}
