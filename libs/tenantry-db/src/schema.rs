//! Static declaration of entities and the indexes they must carry.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default tenant key. Every tenant-scoped row/document carries it.
pub const DEFAULT_TENANT_FIELD: &str = "userId";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyOrder {
    #[default]
    Asc,
    Desc,
}

impl KeyOrder {
    #[must_use]
    pub fn direction(self) -> i32 {
        match self {
            Self::Asc => 1,
            Self::Desc => -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexKey {
    pub field: String,
    pub order: KeyOrder,
}

impl IndexKey {
    #[must_use]
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: KeyOrder::Asc,
        }
    }

    #[must_use]
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: KeyOrder::Desc,
        }
    }
}

/// Declared index: name, ordered key spec, uniqueness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexDescriptor {
    pub name: String,
    pub keys: Vec<IndexKey>,
    pub unique: bool,
}

impl IndexDescriptor {
    /// Builds a descriptor named `{entity}_{field}_{dir}...`.
    #[must_use]
    pub fn new(entity: &str, keys: Vec<IndexKey>, unique: bool) -> Self {
        let mut name = entity.to_owned();
        for key in &keys {
            name.push('_');
            name.push_str(&key.field);
            name.push('_');
            name.push_str(&key.order.direction().to_string());
        }
        Self { name, keys, unique }
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|k| k.field.as_str())
    }

    #[must_use]
    pub fn leads_with(&self, field: &str) -> bool {
        self.keys.first().is_some_and(|k| k.field == field)
    }
}

impl fmt::Display for IndexDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, key) in self.keys.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}:{}", key.field, key.order.direction())?;
        }
        f.write_str(if self.unique { ") unique" } else { ")" })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDef {
    pub name: String,
    /// `false` only for global stores such as the users directory.
    pub tenant_scoped: bool,
    pub indexes: Vec<IndexDescriptor>,
}

/// Entities known to the layer, bound to one tenant key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    tenant_field: String,
    entities: Vec<EntityDef>,
}

impl Schema {
    #[must_use]
    pub fn new(tenant_field: impl Into<String>, entities: Vec<EntityDef>) -> Self {
        Self {
            tenant_field: tenant_field.into(),
            entities,
        }
    }

    /// Business entities with their tenant-leading unique constraints.
    #[must_use]
    pub fn standard(tenant_field: &str) -> Self {
        let scoped = |name: &str, indexes: Vec<(Vec<IndexKey>, bool)>| EntityDef {
            name: name.to_owned(),
            tenant_scoped: true,
            indexes: indexes
                .into_iter()
                .map(|(rest, unique)| {
                    let mut keys = vec![IndexKey::asc(tenant_field)];
                    keys.extend(rest);
                    IndexDescriptor::new(name, keys, unique)
                })
                .collect(),
        };

        let entities = vec![
            scoped("products", vec![(vec![IndexKey::asc("name")], true)]),
            scoped(
                "sales",
                vec![
                    (vec![IndexKey::asc("invoiceNumber")], true),
                    (vec![IndexKey::desc("createdAt")], false),
                ],
            ),
            scoped("settings", vec![(vec![IndexKey::asc("key")], true)]),
            scoped("customers", vec![(vec![IndexKey::asc("email")], true)]),
            scoped("suppliers", vec![(vec![IndexKey::asc("name")], true)]),
            scoped("categories", vec![(vec![IndexKey::asc("name")], true)]),
            EntityDef {
                name: "users".to_owned(),
                tenant_scoped: false,
                indexes: vec![IndexDescriptor::new(
                    "users",
                    vec![IndexKey::asc("email")],
                    true,
                )],
            },
        ];

        Self::new(tenant_field, entities)
    }

    #[must_use]
    pub fn tenant_field(&self) -> &str {
        &self.tenant_field
    }

    #[must_use]
    pub fn entities(&self) -> &[EntityDef] {
        &self.entities
    }

    #[must_use]
    pub fn entity(&self, name: &str) -> Option<&EntityDef> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// `true` unless the entity is declared as a global store.
    #[must_use]
    pub fn is_tenant_scoped(&self, name: &str) -> bool {
        self.entity(name).is_none_or(|e| e.tenant_scoped)
    }

    pub fn tenant_scoped_entities(&self) -> impl Iterator<Item = &EntityDef> {
        self.entities.iter().filter(|e| e.tenant_scoped)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn every_scoped_unique_index_leads_with_tenant_key() {
        let schema = Schema::standard(DEFAULT_TENANT_FIELD);
        for entity in schema.tenant_scoped_entities() {
            for index in entity.indexes.iter().filter(|i| i.unique) {
                assert!(index.leads_with("userId"), "{index} must lead with userId");
            }
        }
    }

    #[test]
    fn names_follow_field_direction_convention() {
        let schema = Schema::standard("userId");
        let products = schema.entity("products").unwrap();
        assert_eq!(products.indexes[0].name, "products_userId_1_name_1");
        let sales = schema.entity("sales").unwrap();
        assert_eq!(sales.indexes[1].name, "sales_userId_1_createdAt_-1");
        assert!(!sales.indexes[1].unique);
    }

    #[test]
    fn users_directory_is_global() {
        let schema = Schema::standard("userId");
        assert!(!schema.is_tenant_scoped("users"));
        assert!(schema.is_tenant_scoped("products"));
        assert!(schema.is_tenant_scoped("invoices_custom"));
    }
}
