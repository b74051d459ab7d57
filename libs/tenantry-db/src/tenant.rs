use std::fmt;

use serde::{Deserialize, Serialize};

use crate::DataError;

const MAX_TENANT_ID_LEN: usize = 128;

/// Opaque tenant identifier assigned at signup.
///
/// Restricted to `[A-Za-z0-9_.:@-]` so it can be compared against literals in
/// raw statements and used in names without escaping.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// # Errors
    /// Returns `DataError::Isolation` when the identifier is empty, too long,
    /// or contains characters outside the allowed set.
    pub fn new(value: impl Into<String>) -> Result<Self, DataError> {
        let value = value.into();
        if value.is_empty() {
            return Err(DataError::Isolation("tenant id is empty".to_owned()));
        }
        if value.len() > MAX_TENANT_ID_LEN {
            return Err(DataError::Isolation(format!(
                "tenant id exceeds {MAX_TENANT_ID_LEN} characters"
            )));
        }
        if let Some(c) = value
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '@' | '-')))
        {
            return Err(DataError::Isolation(format!(
                "tenant id contains unsupported character {c:?}"
            )));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantId {
    type Error = DataError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}
