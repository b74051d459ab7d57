//! Descriptor validation.
//!
//! [`validate`] is purely syntactic and never touches the network. The
//! managed-cloud admission path ([`Admission::admit`]) additionally requires
//! server-side cluster credentials and checks the users directory.

use std::sync::LazyLock;

use async_trait::async_trait;
use mongodb::bson::{Bson, Document, doc};
use regex::Regex;
use url::Url;

use crate::config::DocumentCfg;
use crate::descriptor::{
    ConnectionDescriptor, Credentials, DEFAULT_MONGO_PORT, Deployment, DocumentDescriptor, Engine,
    RawDescriptor, RelationalDescriptor, RelationalOptions,
};
use crate::error::{ConfigError, DataError};
use crate::manager::ConnectionManager;
use crate::tenant::TenantId;

const MAX_CONNECTION_LIMIT: u32 = 1000;
const MAX_HOST_LEN: usize = 253;
const SRV_SCHEME: &str = "mongodb+srv";
const STANDARD_SCHEME: &str = "mongodb";

#[allow(clippy::expect_used)] // good regex, it doesn't panic
static USERNAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_]{3,64}$").expect("static regex should not panic")
});
#[allow(clippy::expect_used)] // good regex, it doesn't panic
static DATABASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_$-]{1,64}$").expect("static regex should not panic")
});
#[allow(clippy::expect_used)] // good regex, it doesn't panic
static CHARSET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_]{1,32}$").expect("static regex should not panic")
});

/// Validates a client-supplied descriptor into its engine-tagged form.
///
/// # Errors
/// Returns `ConfigError` for a missing/unsupported engine tag, missing
/// host/port/database, or any field outside its allowed shape.
pub fn validate(
    raw: &RawDescriptor,
    document: &DocumentCfg,
) -> Result<ConnectionDescriptor, ConfigError> {
    let tag = non_blank(raw.engine.as_deref()).ok_or(ConfigError::MissingField("type"))?;
    let engine =
        Engine::from_tag(tag).ok_or_else(|| ConfigError::UnsupportedEngine(tag.to_owned()))?;

    let host = non_blank(raw.host.as_deref()).ok_or(ConfigError::MissingField("host"))?;
    let database =
        non_blank(raw.database.as_deref()).ok_or(ConfigError::MissingField("database"))?;
    if !DATABASE_RE.is_match(database) {
        return Err(invalid("database", "expected 1-64 characters of [A-Za-z0-9_$-]"));
    }

    if let Some(limit) = raw.connection_limit
        && (limit == 0 || limit > MAX_CONNECTION_LIMIT)
    {
        return Err(invalid(
            "connectionLimit",
            format!("must be between 1 and {MAX_CONNECTION_LIMIT}"),
        ));
    }

    match engine {
        Engine::MySql | Engine::Postgres => {
            let rel = validate_relational(raw, engine, host, database)?;
            Ok(if engine == Engine::MySql {
                ConnectionDescriptor::MySql(rel)
            } else {
                ConnectionDescriptor::Postgres(rel)
            })
        }
        Engine::MongoDb => validate_document(raw, host, database, document)
            .map(ConnectionDescriptor::MongoDb),
    }
}

fn validate_relational(
    raw: &RawDescriptor,
    engine: Engine,
    host: &str,
    database: &str,
) -> Result<RelationalDescriptor, ConfigError> {
    check_plain_host(host)?;
    let port = raw.port.ok_or(ConfigError::MissingField("port"))?;
    if port == 0 {
        return Err(invalid("port", "must be between 1 and 65535"));
    }

    let charset = match non_blank(raw.charset.as_deref()) {
        Some(c) if CHARSET_RE.is_match(c) => Some(c.to_owned()),
        Some(_) => return Err(invalid("charset", "expected [A-Za-z0-9_]")),
        None => None,
    };

    let credentials = credentials(raw)?;
    if engine == Engine::Postgres
        && let Some(c) = &credentials
        && c.username.len() > 63
    {
        return Err(invalid("username", "exceeds 63 characters"));
    }

    Ok(RelationalDescriptor {
        host: host.to_owned(),
        port,
        database: database.to_owned(),
        credentials,
        options: RelationalOptions {
            ssl: raw.ssl,
            connection_limit: raw.connection_limit,
            charset,
        },
    })
}

fn validate_document(
    raw: &RawDescriptor,
    host: &str,
    database: &str,
    cfg: &DocumentCfg,
) -> Result<DocumentDescriptor, ConfigError> {
    let deployment = classify_host(host, raw.port, &cfg.managed_domains)?;
    let credentials = credentials(raw)?;
    if let Some(c) = &credentials {
        validate_username(&c.username)?;
    }
    let ssl = raw.ssl || matches!(deployment, Deployment::ManagedCloud { .. });
    Ok(DocumentDescriptor {
        deployment,
        database: database.to_owned(),
        credentials,
        ssl,
        connection_limit: raw.connection_limit,
    })
}

/// Syntactic username rule shared by both document paths.
///
/// # Errors
/// Returns `ConfigError::InvalidField` unless the name is 3-64 characters of
/// `[a-zA-Z0-9_]`.
pub fn validate_username(username: &str) -> Result<(), ConfigError> {
    if USERNAME_RE.is_match(username) {
        Ok(())
    } else {
        Err(invalid(
            "username",
            "expected at least 3 characters of [a-zA-Z0-9_]",
        ))
    }
}

/// Classifies a document host as managed-cloud or self-hosted.
///
/// Accepts a bare host name or a `mongodb://` / `mongodb+srv://` connection
/// string. Userinfo inside a connection string is rejected: credentials travel
/// in their own fields.
///
/// # Errors
/// Returns `ConfigError::InvalidField` for malformed hosts.
pub fn classify_host(
    host: &str,
    port: Option<u16>,
    managed_domains: &[String],
) -> Result<Deployment, ConfigError> {
    if host.contains("://") {
        let url = Url::parse(host).map_err(|e| invalid("host", e.to_string()))?;
        if !url.username().is_empty() || url.password().is_some() {
            return Err(invalid(
                "host",
                "connection string must not embed credentials",
            ));
        }
        let name = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("host", "connection string has no host"))?;
        return match url.scheme() {
            SRV_SCHEME => Ok(Deployment::ManagedCloud {
                cluster_host: name.to_ascii_lowercase(),
            }),
            STANDARD_SCHEME => classify_host(name, url.port().or(port), managed_domains),
            other => Err(invalid("host", format!("unsupported scheme '{other}'"))),
        };
    }

    check_plain_host(host)?;
    let lowered = host.to_ascii_lowercase();
    let managed = managed_domains.iter().any(|domain| {
        let domain = domain.trim_start_matches('.').to_ascii_lowercase();
        lowered == domain || lowered.ends_with(&format!(".{domain}"))
    });
    if managed {
        return Ok(Deployment::ManagedCloud {
            cluster_host: lowered,
        });
    }

    let port = port.unwrap_or(DEFAULT_MONGO_PORT);
    if port == 0 {
        return Err(invalid("port", "must be between 1 and 65535"));
    }
    Ok(Deployment::SelfHosted {
        host: host.to_owned(),
        port,
    })
}

fn check_plain_host(host: &str) -> Result<(), ConfigError> {
    if host.len() > MAX_HOST_LEN {
        return Err(invalid("host", "too long"));
    }
    if host
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '/' | '@' | '?' | '#'))
    {
        return Err(invalid("host", "must be a host name or address"));
    }
    Ok(())
}

fn credentials(raw: &RawDescriptor) -> Result<Option<Credentials>, ConfigError> {
    let password = raw.password.clone().filter(|p| !p.is_empty());
    match non_blank(raw.username.as_deref()) {
        Some(username) => Ok(Some(Credentials {
            username: username.to_owned(),
            password,
        })),
        None if password.is_some() => Err(invalid(
            "username",
            "password supplied without a username",
        )),
        None => Ok(None),
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidField {
        field,
        reason: reason.into(),
    }
}

/// Lookup against the users directory, the only globally unique store.
#[async_trait]
pub trait UsersDirectory: Send + Sync {
    /// `true` when `username` belongs to an account other than `tenant`.
    async fn claimed_by_other(
        &self,
        username: &str,
        tenant: Option<&TenantId>,
    ) -> Result<bool, DataError>;
}

/// Users directory stored on the managed cluster itself.
pub struct ClusterUsersDirectory<'a> {
    manager: &'a ConnectionManager,
    cluster_host: String,
}

impl<'a> ClusterUsersDirectory<'a> {
    #[must_use]
    pub fn new(manager: &'a ConnectionManager, cluster_host: impl Into<String>) -> Self {
        Self {
            manager,
            cluster_host: cluster_host.into(),
        }
    }
}

#[async_trait]
impl UsersDirectory for ClusterUsersDirectory<'_> {
    async fn claimed_by_other(
        &self,
        username: &str,
        tenant: Option<&TenantId>,
    ) -> Result<bool, DataError> {
        let cfg = &self.manager.config().document;
        let descriptor = DocumentDescriptor {
            deployment: Deployment::ManagedCloud {
                cluster_host: self.cluster_host.clone(),
            },
            database: cfg.directory_database.clone(),
            credentials: None,
            ssl: true,
            connection_limit: Some(1),
        };
        let session = self.manager.open_document(&descriptor).await?;
        let found = session
            .database()
            .collection::<Document>(&cfg.users_collection)
            .find_one(doc! { "username": username })
            .await;
        session.close().await;

        let found = found.map_err(|e| DataError::from_mongo(&e))?;
        Ok(match (found, tenant) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(user), Some(tenant)) => !account_matches(&user, tenant),
        })
    }
}

fn account_matches(user: &Document, tenant: &TenantId) -> bool {
    match user.get("_id") {
        Some(Bson::ObjectId(id)) => id.to_hex() == tenant.as_str(),
        Some(Bson::String(id)) => id == tenant.as_str(),
        _ => false,
    }
}

/// Setup-time admission on top of [`validate`].
pub struct Admission<'a> {
    cfg: &'a DocumentCfg,
    directory: &'a dyn UsersDirectory,
}

impl<'a> Admission<'a> {
    #[must_use]
    pub fn new(cfg: &'a DocumentCfg, directory: &'a dyn UsersDirectory) -> Self {
        Self { cfg, directory }
    }

    /// Relational and self-hosted document descriptors pass unchanged; the
    /// managed-cloud path needs cluster credentials and a free username.
    ///
    /// # Errors
    /// - `DataError::Connection` (`ServerMisconfigured`) when the server has
    ///   no cluster credentials configured
    /// - `ConfigError::UsernameTaken` when another account owns the username
    pub async fn admit(
        &self,
        descriptor: &ConnectionDescriptor,
        tenant: Option<&TenantId>,
    ) -> Result<(), DataError> {
        let ConnectionDescriptor::MongoDb(doc) = descriptor else {
            return Ok(());
        };
        if !doc.is_managed() {
            tracing::debug!(host = %doc.host(), "self-hosted document database, skipping live checks");
            return Ok(());
        }
        if self.cfg.cluster_credentials().is_none() {
            return Err(DataError::misconfigured(
                Engine::MongoDb,
                "managed cluster credentials are not configured on the server",
            ));
        }
        if let Some(credentials) = &doc.credentials
            && self
                .directory
                .claimed_by_other(&credentials.username, tenant)
                .await?
        {
            return Err(ConfigError::UsernameTaken(credentials.username.clone()).into());
        }
        Ok(())
    }
}
