use mongodb::error::{ErrorKind, WriteFailure};
use sea_orm::{ConnAcquireErr, DbErr, SqlErr};
use thiserror::Error;

use crate::descriptor::Engine;

/// Duplicate key server code reported by `MongoDB`.
pub(crate) const MONGO_DUPLICATE_KEY: i32 = 11000;

/// Descriptor rejected before any network use.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("unsupported database type '{0}'")]
    UnsupportedEngine(String),

    #[error("invalid value for '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("username '{0}' is already taken")]
    UsernameTaken(String),
}

/// Why a connection could not be established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFailure {
    /// Unreachable host, rejected credentials, TLS or DNS failure.
    Unavailable,
    /// The server itself lacks configuration it needs (e.g. managed cluster credentials).
    ServerMisconfigured,
}

/// Typed error for every operation of the data-access layer.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigError),

    #[error("connection failed ({engine}): {message}")]
    Connection {
        engine: Engine,
        kind: ConnectionFailure,
        message: String,
    },

    #[error("connection pool exhausted ({engine}): {message}")]
    ResourceExhausted { engine: Engine, message: String },

    #[error("isolation violation: {0}")]
    Isolation(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("duplicate key ({engine}): {message}")]
    Conflict { engine: Engine, message: String },

    #[error("{engine} statement failed: {message}")]
    Backend { engine: Engine, message: String },
}

impl DataError {
    pub(crate) fn unavailable(engine: Engine, message: impl Into<String>) -> Self {
        Self::Connection {
            engine,
            kind: ConnectionFailure::Unavailable,
            message: message.into(),
        }
    }

    pub(crate) fn misconfigured(engine: Engine, message: impl Into<String>) -> Self {
        Self::Connection {
            engine,
            kind: ConnectionFailure::ServerMisconfigured,
            message: message.into(),
        }
    }

    /// Engine the failure is attributed to, when one is known.
    #[must_use]
    pub fn engine(&self) -> Option<Engine> {
        match self {
            Self::Connection { engine, .. }
            | Self::ResourceExhausted { engine, .. }
            | Self::Conflict { engine, .. }
            | Self::Backend { engine, .. } => Some(*engine),
            Self::Configuration(_) | Self::Isolation(_) | Self::InvalidOperation(_) => None,
        }
    }

    /// Stable machine-readable code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "invalid_configuration",
            Self::Connection {
                kind: ConnectionFailure::ServerMisconfigured,
                ..
            } => "server_misconfigured",
            Self::Connection { .. } => "connection_failed",
            Self::ResourceExhausted { .. } => "resource_exhausted",
            Self::Isolation(_) => "isolation_violation",
            Self::InvalidOperation(_) => "invalid_operation",
            Self::Conflict { .. } => "duplicate_key",
            Self::Backend { .. } => "backend_error",
        }
    }

    /// Maps a sea-orm error raised while talking to an established pool.
    pub(crate) fn from_db(engine: Engine, err: DbErr) -> Self {
        if let Some(SqlErr::UniqueConstraintViolation(message)) = err.sql_err() {
            return Self::Conflict { engine, message };
        }
        match err {
            DbErr::ConnectionAcquire(ConnAcquireErr::Timeout) => Self::ResourceExhausted {
                engine,
                message: "timed out waiting for a free connection".to_owned(),
            },
            DbErr::ConnectionAcquire(e) => Self::unavailable(engine, e.to_string()),
            DbErr::Conn(e) => Self::unavailable(engine, e.to_string()),
            other => Self::Backend {
                engine,
                message: other.to_string(),
            },
        }
    }

    /// Maps a `MongoDB` driver error.
    pub(crate) fn from_mongo(err: &mongodb::error::Error) -> Self {
        let engine = Engine::MongoDb;
        if mongo_server_code(err) == Some(MONGO_DUPLICATE_KEY) {
            return Self::Conflict {
                engine,
                message: err.to_string(),
            };
        }
        match err.kind.as_ref() {
            ErrorKind::ServerSelection { .. }
            | ErrorKind::Authentication { .. }
            | ErrorKind::DnsResolve { .. }
            | ErrorKind::Io(_)
            | ErrorKind::ConnectionPoolCleared { .. } => Self::unavailable(engine, err.to_string()),
            _ => Self::Backend {
                engine,
                message: err.to_string(),
            },
        }
    }
}

/// Server error code carried by a `MongoDB` error, if any.
pub(crate) fn mongo_server_code(err: &mongodb::error::Error) -> Option<i32> {
    match err.kind.as_ref() {
        ErrorKind::Command(c) => Some(c.code),
        ErrorKind::Write(WriteFailure::WriteError(w)) => Some(w.code),
        ErrorKind::InsertMany(e) => e
            .write_errors
            .as_ref()
            .and_then(|errors| errors.first())
            .map(|w| w.code),
        _ => None,
    }
}
