//! Mutation intents dispatched by the UI layer

use serde::{Deserialize, Serialize};
use taskview_entity::{EntityId, Field, FieldMap, FieldValue, ViewEntity};

/// What a mutation does to its entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    /// New entity under a placeholder id
    Create,
    /// Changed fields of an existing entity
    Update,
    /// New parent reference
    Reparent,
    /// Remove the entity
    Delete,
}

/// One user action against one entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationIntent {
    /// Target; a fresh placeholder for creates
    pub entity_id: EntityId,
    /// Kind
    pub kind: MutationKind,
    /// Only the fields this action changes
    pub changed: FieldMap,
    /// Optimistic entity to show instead of the one built from `changed`
    pub optimistic: Option<ViewEntity>,
}

impl MutationIntent {
    /// Create a task under a fresh placeholder id
    #[must_use]
    pub fn create(fields: FieldMap) -> Self {
        Self {
            entity_id: EntityId::temp(),
            kind: MutationKind::Create,
            changed: fields,
            optimistic: None,
        }
    }

    /// Update changed fields
    #[must_use]
    pub fn update(id: EntityId, changed: FieldMap) -> Self {
        Self {
            entity_id: id,
            kind: MutationKind::Update,
            changed,
            optimistic: None,
        }
    }

    /// Update one field
    #[must_use]
    pub fn set(id: EntityId, field: Field, value: impl Into<FieldValue>) -> Self {
        Self::update(id, FieldMap::from([(field, value.into())]))
    }

    /// Point the entity at a new parent, or detach it
    #[must_use]
    pub fn reparent(id: EntityId, parent: Option<EntityId>) -> Self {
        Self {
            entity_id: id,
            kind: MutationKind::Reparent,
            changed: FieldMap::from([(Field::ParentId, parent.into())]),
            optimistic: None,
        }
    }

    /// Delete the entity
    #[must_use]
    pub fn delete(id: EntityId) -> Self {
        Self {
            entity_id: id,
            kind: MutationKind::Delete,
            changed: FieldMap::new(),
            optimistic: None,
        }
    }

    /// Supply the optimistic entity directly
    #[must_use]
    pub fn with_optimistic(mut self, entity: ViewEntity) -> Self {
        self.optimistic = Some(entity);
        self
    }

    /// Placeholder ids referenced by changed field values
    #[must_use]
    pub fn temp_refs(&self) -> Vec<EntityId> {
        self.changed
            .values()
            .filter_map(FieldValue::as_ref_id)
            .filter(EntityId::is_temp)
            .collect()
    }

    /// Whether this intent needs `id` to exist on the backend first
    #[must_use]
    pub fn depends_on(&self, id: &EntityId) -> bool {
        (self.kind != MutationKind::Create && self.entity_id == *id) || self.temp_refs().contains(id)
    }
}
