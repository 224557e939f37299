//! External representation of an entity held by the target store.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::attributes::{Attribute, AttributeSource};
use crate::{AttributeValue, Variant};

/// Opaque identifier assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreId(String);

impl StoreId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A persisted store record addressed by variant and identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoreRef {
    pub variant: Variant,
    pub id: StoreId,
}

impl fmt::Display for StoreRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.variant.entity_set(), self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEntity {
    pub variant: Variant,
    pub id: Option<StoreId>,
    values: BTreeMap<Attribute, AttributeValue>,
}

impl StoreEntity {
    /// Unsaved stub of the given variant.
    pub fn new(variant: Variant) -> Self {
        Self {
            variant,
            id: None,
            values: BTreeMap::new(),
        }
    }

    pub fn with_id(variant: Variant, id: StoreId) -> Self {
        Self {
            id: Some(id),
            ..Self::new(variant)
        }
    }

    pub fn store_ref(&self) -> Option<StoreRef> {
        self.id.clone().map(|id| StoreRef {
            variant: self.variant,
            id,
        })
    }

    /// Set or clear an attribute. Attributes of another variant are ignored.
    pub fn set(&mut self, attribute: Attribute, value: Option<AttributeValue>) {
        if attribute.variant() != self.variant {
            return;
        }
        match value {
            Some(v) => {
                self.values.insert(attribute, v);
            }
            None => {
                self.values.remove(&attribute);
            }
        }
    }

    pub fn get(&self, attribute: Attribute) -> Option<&AttributeValue> {
        self.values.get(&attribute)
    }

    pub fn values(&self) -> impl Iterator<Item = (Attribute, &AttributeValue)> {
        self.values.iter().map(|(a, v)| (*a, v))
    }
}

impl AttributeSource for StoreEntity {
    fn variant(&self) -> Variant {
        self.variant
    }

    fn value(&self, attribute: Attribute) -> Option<AttributeValue> {
        self.values.get(&attribute).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreign_attributes_are_not_stored() {
        let mut entity = StoreEntity::new(Variant::Group);
        entity.set(Attribute::GroupId, Some(AttributeValue::text("G1")));
        entity.set(Attribute::LastName, Some(AttributeValue::text("nope")));
        assert_eq!(entity.values().count(), 1);
        entity.set(Attribute::GroupId, None);
        assert!(entity.get(Attribute::GroupId).is_none());
    }

    #[test]
    fn store_ref_requires_identifier() {
        assert!(StoreEntity::new(Variant::Facility).store_ref().is_none());
        let saved = StoreEntity::with_id(Variant::Facility, StoreId::new("f-1"));
        assert_eq!(saved.store_ref().unwrap().to_string(), "pd_facilities(f-1)");
    }
}
