//! Flattened view projection of a task

use crate::field::{Field, FieldMap, FieldValue};
use crate::id::EntityId;
use serde::{Deserialize, Serialize};

static NULL: FieldValue = FieldValue::Null;

/// The denormalized projection every view cache stores
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewEntity {
    /// Entity id (possibly a placeholder)
    pub id: EntityId,
    /// Primary and denormalized fields
    pub fields: FieldMap,
}

impl ViewEntity {
    /// Create an entity with no fields
    #[inline]
    #[must_use]
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            fields: FieldMap::new(),
        }
    }

    /// Builder-style field setter
    #[inline]
    #[must_use]
    pub fn with(mut self, field: Field, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(field, value.into());
        self
    }

    /// Field value, `Null` when absent
    #[inline]
    #[must_use]
    pub fn get(&self, field: Field) -> &FieldValue {
        self.fields.get(&field).unwrap_or(&NULL)
    }

    /// Set a single field
    #[inline]
    pub fn set(&mut self, field: Field, value: impl Into<FieldValue>) {
        self.fields.insert(field, value.into());
    }

    /// Shallow merge of `patch` onto this entity
    ///
    /// Returns true if any field changed.
    pub fn merge(&mut self, patch: &FieldMap) -> bool {
        let mut changed = false;
        for (field, value) in patch {
            if self.fields.get(field) != Some(value) {
                self.fields.insert(*field, value.clone());
                changed = true;
            }
        }
        changed
    }

    /// Rewrite every reference to `from` (own id included) into `to`
    pub fn replace_refs(&mut self, from: &EntityId, to: &EntityId) -> bool {
        let mut changed = false;
        if self.id == *from {
            self.id = *to;
            changed = true;
        }
        for value in self.fields.values_mut() {
            changed |= value.replace_ref(from, to);
        }
        changed
    }

    /// Whether any field references `id`
    #[must_use]
    pub fn references(&self, id: &EntityId) -> bool {
        self.fields.values().any(|v| v.as_ref_id().as_ref() == Some(id))
    }

    /// Current values of the given fields (`Null` for absent ones)
    #[must_use]
    pub fn project<'a>(&self, fields: impl IntoIterator<Item = &'a Field>) -> FieldMap {
        fields
            .into_iter()
            .map(|f| (*f, self.get(*f).clone()))
            .collect()
    }
}
