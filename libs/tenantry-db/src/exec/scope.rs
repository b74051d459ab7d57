//! Tenant injection for structured operations.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::{Fields, SortKey, StructuredOp};
use crate::error::DataError;
use crate::schema::Schema;
use crate::tenant::TenantId;

#[allow(clippy::expect_used)] // good regex, it doesn't panic
static IDENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").expect("static regex should not panic")
});

/// Structured operation whose filters and documents are pinned to one tenant.
///
/// Only [`scope`] constructs it, so backends can take it as proof of scoping.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopedOp(StructuredOp);

impl ScopedOp {
    #[must_use]
    pub fn entity(&self) -> &str {
        self.0.entity()
    }

    #[must_use]
    pub fn op(&self) -> &StructuredOp {
        &self.0
    }
}

/// Returns `true` for names usable as entity and field identifiers.
#[must_use]
pub fn is_identifier(name: &str) -> bool {
    IDENT_RE.is_match(name)
}

/// Validates `op` and injects `tenant` into every filter and written document.
///
/// # Errors
/// - `DataError::Isolation` for global entities, a conflicting tenant value,
///   or an update that touches the tenant field
/// - `DataError::InvalidOperation` for bad identifiers, empty payloads or
///   non-scalar filter values
pub fn scope(op: StructuredOp, tenant: &TenantId, schema: &Schema) -> crate::Result<ScopedOp> {
    let field = schema.tenant_field();
    check_entity(op.entity(), schema)?;

    let scoped = match op {
        StructuredOp::Insert {
            entity,
            mut documents,
        } => {
            if documents.is_empty() {
                return Err(invalid("insert requires at least one document"));
            }
            for doc in &mut documents {
                check_keys(doc)?;
                pin(doc, field, tenant)?;
            }
            StructuredOp::Insert { entity, documents }
        }
        StructuredOp::Find {
            entity,
            filter,
            sort,
            limit,
            skip,
        } => {
            for SortKey { field: key, .. } in &sort {
                check_identifier(key)?;
            }
            StructuredOp::Find {
                entity,
                filter: scoped_filter(filter, field, tenant)?,
                sort,
                limit,
                skip,
            }
        }
        StructuredOp::Count { entity, filter } => StructuredOp::Count {
            entity,
            filter: scoped_filter(filter, field, tenant)?,
        },
        StructuredOp::Update {
            entity,
            filter,
            set,
        } => {
            if set.is_empty() {
                return Err(invalid("update requires a non-empty 'set'"));
            }
            check_keys(&set)?;
            if set.contains_key(field) {
                return Err(DataError::Isolation(format!(
                    "updates may not modify '{field}'"
                )));
            }
            StructuredOp::Update {
                entity,
                filter: scoped_filter(filter, field, tenant)?,
                set,
            }
        }
        StructuredOp::Delete { entity, filter } => StructuredOp::Delete {
            entity,
            filter: scoped_filter(filter, field, tenant)?,
        },
    };
    Ok(ScopedOp(scoped))
}

fn check_entity(entity: &str, schema: &Schema) -> crate::Result<()> {
    check_identifier(entity)?;
    if !schema.is_tenant_scoped(entity) {
        return Err(DataError::Isolation(format!(
            "'{entity}' is a global store and cannot be accessed per tenant"
        )));
    }
    Ok(())
}

fn scoped_filter(mut filter: Fields, field: &str, tenant: &TenantId) -> crate::Result<Fields> {
    check_keys(&filter)?;
    if let Some((key, _)) = filter
        .iter()
        .find(|(_, v)| matches!(v, Value::Object(_) | Value::Array(_)))
    {
        return Err(invalid(format!(
            "filter value for '{key}' must be a scalar or null"
        )));
    }
    pin(&mut filter, field, tenant)?;
    Ok(filter)
}

/// Sets the tenant field, rejecting a caller-supplied value for someone else.
fn pin(fields: &mut Fields, field: &str, tenant: &TenantId) -> crate::Result<()> {
    match fields.get(field) {
        None => {}
        Some(Value::String(v)) if v == tenant.as_str() => {}
        Some(other) => {
            return Err(DataError::Isolation(format!(
                "'{field}' value {other} does not match the requesting tenant"
            )));
        }
    }
    fields.insert(field.to_owned(), Value::String(tenant.as_str().to_owned()));
    Ok(())
}

fn check_keys(fields: &Fields) -> crate::Result<()> {
    fields.keys().try_for_each(|k| check_identifier(k))
}

fn check_identifier(name: &str) -> crate::Result<()> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(invalid(format!("'{name}' is not a valid identifier")))
    }
}

fn invalid(message: impl Into<String>) -> DataError {
    DataError::InvalidOperation(message.into())
}
