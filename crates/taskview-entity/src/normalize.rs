//! Entity Normalizer
//!
//! Flattens a backend entity (primary fields plus embedded relations) into a
//! [`ViewEntity`]. Normalization is pure: the output depends only on the raw
//! shape, the previously cached entity and the relation directory.
//!
//! Denormalized join fields resolve in this order:
//! 1. the embedded relation, when it matches the relation id
//! 2. the previous entity's values, when it shadows the same relation id
//! 3. the relation directory
//! 4. `Null`

use crate::directory::RelationDirectory;
use crate::error::NormalizeError;
use crate::field::{Field, FieldMap, FieldValue};
use crate::id::{EntityId, UserId};
use crate::raw::RawEntity;
use crate::view_entity::ViewEntity;

/// Related entity kinds that feed denormalized fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Relation {
    Status,
    Assignee,
    Project,
}

impl Relation {
    const ALL: [Relation; 3] = [Relation::Status, Relation::Assignee, Relation::Project];

    fn id_field(self) -> Field {
        match self {
            Relation::Status => Field::StatusId,
            Relation::Assignee => Field::AssigneeId,
            Relation::Project => Field::ProjectId,
        }
    }

    /// Parse the relation id out of a field value
    fn key(self, value: &FieldValue) -> Result<Option<u64>, NormalizeError> {
        let expected = match self {
            Relation::Assignee => "user",
            Relation::Status | Relation::Project => "int",
        };
        match (self, value) {
            (_, FieldValue::Null) => Ok(None),
            (Relation::Assignee, FieldValue::User(UserId(id))) => Ok(Some(*id)),
            (Relation::Status | Relation::Project, FieldValue::Int(id)) if *id >= 0 => {
                Ok(Some(id.unsigned_abs()))
            }
            _ => Err(NormalizeError::InvalidFieldType {
                field: self.id_field(),
                expected,
                found: value.kind(),
            }),
        }
    }

    fn id_value(self, id: u64) -> FieldValue {
        match self {
            Relation::Assignee => FieldValue::User(UserId(id)),
            Relation::Status | Relation::Project => {
                FieldValue::Int(i64::try_from(id).unwrap_or(i64::MAX))
            }
        }
    }

    /// Id of the embedded relation, if projected
    fn embedded_id(self, raw: &RawEntity) -> Option<u64> {
        match self {
            Relation::Status => raw.status.as_ref().map(|s| s.id),
            Relation::Assignee => raw.assignee.as_ref().map(|u| u.id),
            Relation::Project => raw.project.as_ref().map(|p| p.id),
        }
    }

    /// Denormalized values from the embedded relation
    fn from_embedded(self, raw: &RawEntity, key: u64) -> Option<FieldMap> {
        match self {
            Relation::Status => raw.status.as_ref().filter(|s| s.id == key).map(|s| {
                FieldMap::from([
                    (Field::StatusName, FieldValue::text(&s.name)),
                    (Field::StatusColor, FieldValue::text(&s.color)),
                ])
            }),
            Relation::Assignee => raw.assignee.as_ref().filter(|u| u.id == key).map(|u| {
                FieldMap::from([(Field::AssigneeName, FieldValue::text(&u.display_name))])
            }),
            Relation::Project => raw.project.as_ref().filter(|p| p.id == key).map(|p| {
                FieldMap::from([
                    (Field::ProjectName, FieldValue::text(&p.name)),
                    (Field::ProjectColor, FieldValue::text(&p.color)),
                ])
            }),
        }
    }

    /// Denormalized values from the directory
    fn from_directory(self, directory: &RelationDirectory, key: u64) -> Option<FieldMap> {
        match self {
            Relation::Status => directory.status(key).map(|s| {
                FieldMap::from([
                    (Field::StatusName, FieldValue::text(&s.name)),
                    (Field::StatusColor, FieldValue::text(&s.color)),
                ])
            }),
            Relation::Assignee => directory.user(key).map(|u| {
                FieldMap::from([(Field::AssigneeName, FieldValue::text(&u.display_name))])
            }),
            Relation::Project => directory.project(key).map(|p| {
                FieldMap::from([
                    (Field::ProjectName, FieldValue::text(&p.name)),
                    (Field::ProjectColor, FieldValue::text(&p.color)),
                ])
            }),
        }
    }

    /// Previously known values, only when they shadow the same relation id
    fn from_previous(self, previous: &ViewEntity, value: &FieldValue) -> Option<FieldMap> {
        let id_field = self.id_field();
        if previous.get(id_field) != value {
            return None;
        }
        let dependents = id_field.dependents();
        if dependents.iter().all(|f| previous.get(*f).is_null()) {
            return None;
        }
        Some(previous.project(dependents))
    }

    fn nulls(self) -> FieldMap {
        self.id_field()
            .dependents()
            .iter()
            .map(|f| (*f, FieldValue::Null))
            .collect()
    }
}

/// Builds canonical view entities from backend shapes and optimistic edits
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    directory: RelationDirectory,
}

impl Normalizer {
    /// Create a normalizer over a relation directory
    #[inline]
    #[must_use]
    pub fn new(directory: RelationDirectory) -> Self {
        Self { directory }
    }

    /// Relation directory
    #[inline]
    #[must_use]
    pub fn directory(&self) -> &RelationDirectory {
        &self.directory
    }

    /// Mutable relation directory
    #[inline]
    pub fn directory_mut(&mut self) -> &mut RelationDirectory {
        &mut self.directory
    }

    /// Normalize a backend entity
    ///
    /// `previous` is the currently cached entity, if any. Primary fields the
    /// raw projection leaves out are carried over from it, and so are
    /// denormalized values whose relation id did not change.
    ///
    /// # Errors
    /// [`NormalizeError`] when the id or a required field is missing, or a
    /// relation field holds the wrong kind of value.
    pub fn normalize(
        &self,
        raw: &RawEntity,
        previous: Option<&ViewEntity>,
    ) -> Result<ViewEntity, NormalizeError> {
        let id = raw.id.ok_or(NormalizeError::MissingId)?;

        let mut fields = FieldMap::new();
        if let Some(prev) = previous {
            fields.extend(
                prev.fields
                    .iter()
                    .filter(|(f, _)| !f.is_denormalized())
                    .map(|(f, v)| (*f, v.clone())),
            );
        }
        fields.extend(
            raw.fields
                .iter()
                .filter(|(f, _)| !f.is_denormalized())
                .map(|(f, v)| (*f, v.clone())),
        );

        // Embedded relations imply the id when the projection omits it
        for relation in Relation::ALL {
            if !raw.fields.contains_key(&relation.id_field()) {
                if let Some(embedded) = relation.embedded_id(raw) {
                    fields.insert(relation.id_field(), relation.id_value(embedded));
                }
            }
        }

        self.assemble(EntityId::Real(id), fields, Some(raw), previous)
    }

    /// Build the optimistic entity for a create
    ///
    /// # Errors
    /// [`NormalizeError`] when a required field is missing or a relation
    /// field holds the wrong kind of value.
    pub fn build_optimistic(
        &self,
        id: EntityId,
        fields: &FieldMap,
    ) -> Result<ViewEntity, NormalizeError> {
        let primary = fields
            .iter()
            .filter(|(f, _)| !f.is_denormalized())
            .map(|(f, v)| (*f, v.clone()))
            .collect();
        self.assemble(id, primary, None, None)
    }

    /// Expand an update's changed fields with the denormalized fields they
    /// imply
    ///
    /// # Errors
    /// [`NormalizeError`] when the patch nulls a required field or a relation
    /// field holds the wrong kind of value.
    pub fn expand_patch(&self, changed: &FieldMap) -> Result<FieldMap, NormalizeError> {
        let mut patch: FieldMap = changed
            .iter()
            .filter(|(f, _)| !f.is_denormalized())
            .map(|(f, v)| (*f, v.clone()))
            .collect();

        for field in Field::REQUIRED {
            if patch.get(&field).is_some_and(FieldValue::is_null) {
                return Err(NormalizeError::MissingField(field));
            }
        }

        for relation in Relation::ALL {
            let Some(value) = patch.get(&relation.id_field()) else {
                continue;
            };
            let derived = match relation.key(value)? {
                Some(key) => relation
                    .from_directory(&self.directory, key)
                    .unwrap_or_else(|| relation.nulls()),
                None => relation.nulls(),
            };
            patch.extend(derived);
        }
        Ok(patch)
    }

    fn assemble(
        &self,
        id: EntityId,
        mut fields: FieldMap,
        raw: Option<&RawEntity>,
        previous: Option<&ViewEntity>,
    ) -> Result<ViewEntity, NormalizeError> {
        for field in Field::REQUIRED {
            if fields.get(&field).map_or(true, FieldValue::is_null) {
                return Err(NormalizeError::MissingField(field));
            }
        }

        let mut derived = FieldMap::new();
        for relation in Relation::ALL {
            let value = fields
                .get(&relation.id_field())
                .cloned()
                .unwrap_or(FieldValue::Null);
            let values = match relation.key(&value)? {
                None => relation.nulls(),
                Some(key) => raw
                    .and_then(|r| relation.from_embedded(r, key))
                    .or_else(|| previous.and_then(|p| relation.from_previous(p, &value)))
                    .or_else(|| relation.from_directory(&self.directory, key))
                    .unwrap_or_else(|| relation.nulls()),
            };
            derived.extend(values);
        }
        fields.extend(derived);

        Ok(ViewEntity { id, fields })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::{RawProject, RawStatus, RawUser};
    use pretty_assertions::assert_eq;

    fn status(id: u64, name: &str) -> RawStatus {
        RawStatus {
            id,
            name: name.to_string(),
            color: format!("#{id}{id}{id}"),
        }
    }

    fn raw_task(id: u64, title: &str) -> RawEntity {
        RawEntity::new(id, FieldMap::from([(Field::Title, FieldValue::text(title))]))
    }

    #[test]
    fn normalize_flattens_embedded_relations() {
        let normalizer = Normalizer::default();
        let raw = raw_task(42, "Ship it")
            .with_status(status(2, "Doing"))
            .with_assignee(RawUser {
                id: 7,
                display_name: "Sam".into(),
            })
            .with_project(RawProject {
                id: 1,
                name: "Core".into(),
                color: "red".into(),
            });

        let entity = normalizer.normalize(&raw, None).unwrap();

        assert_eq!(entity.id, EntityId::Real(42));
        assert_eq!(entity.get(Field::StatusId), &FieldValue::Int(2));
        assert_eq!(entity.get(Field::StatusName), &FieldValue::text("Doing"));
        assert_eq!(entity.get(Field::AssigneeId), &FieldValue::User(UserId(7)));
        assert_eq!(entity.get(Field::AssigneeName), &FieldValue::text("Sam"));
        assert_eq!(entity.get(Field::ProjectColor), &FieldValue::text("red"));
    }

    #[test]
    fn narrow_projection_keeps_previous_denormalized_values() {
        let normalizer = Normalizer::default();
        let rich = raw_task(42, "Ship it").with_status(status(2, "Doing"));
        let previous = normalizer.normalize(&rich, None).unwrap();

        // Update response without the embedded status
        let mut narrow = raw_task(42, "Ship it now");
        narrow.fields.insert(Field::StatusId, FieldValue::Int(2));
        let entity = normalizer.normalize(&narrow, Some(&previous)).unwrap();

        assert_eq!(entity.get(Field::Title), &FieldValue::text("Ship it now"));
        assert_eq!(entity.get(Field::StatusName), &FieldValue::text("Doing"));
    }

    #[test]
    fn changed_relation_does_not_reuse_stale_values() {
        let normalizer = Normalizer::default();
        let previous = normalizer
            .normalize(&raw_task(42, "t").with_status(status(2, "Doing")), None)
            .unwrap();

        let mut moved = raw_task(42, "t");
        moved.fields.insert(Field::StatusId, FieldValue::Int(3));
        let entity = normalizer.normalize(&moved, Some(&previous)).unwrap();

        assert!(entity.get(Field::StatusName).is_null());
    }

    #[test]
    fn directory_fills_unknown_relations() {
        let mut directory = RelationDirectory::new();
        directory.insert_status(status(3, "Done"));
        let normalizer = Normalizer::new(directory);

        let mut raw = raw_task(5, "t");
        raw.fields.insert(Field::StatusId, FieldValue::Int(3));
        let entity = normalizer.normalize(&raw, None).unwrap();
        assert_eq!(entity.get(Field::StatusName), &FieldValue::text("Done"));
    }

    #[test]
    fn missing_title_is_malformed() {
        let normalizer = Normalizer::default();
        let raw = RawEntity::new(1, FieldMap::new());
        assert_eq!(
            normalizer.normalize(&raw, None),
            Err(NormalizeError::MissingField(Field::Title))
        );
    }

    #[test]
    fn missing_id_is_malformed() {
        let normalizer = Normalizer::default();
        let mut raw = raw_task(1, "t");
        raw.id = None;
        assert_eq!(normalizer.normalize(&raw, None), Err(NormalizeError::MissingId));
    }

    #[test]
    fn wrong_relation_kind_is_malformed() {
        let normalizer = Normalizer::default();
        let mut raw = raw_task(1, "t");
        raw.fields.insert(Field::StatusId, FieldValue::text("doing"));
        assert!(matches!(
            normalizer.normalize(&raw, None),
            Err(NormalizeError::InvalidFieldType {
                field: Field::StatusId,
                ..
            })
        ));
    }

    #[test]
    fn normalization_is_deterministic() {
        let normalizer = Normalizer::default();
        let raw = raw_task(9, "same").with_status(status(1, "Todo"));
        let a = normalizer.normalize(&raw, None).unwrap();
        let b = normalizer.normalize(&raw, None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn denormalized_input_fields_are_ignored() {
        let normalizer = Normalizer::default();
        let mut raw = raw_task(9, "t");
        raw.fields.insert(Field::StatusName, FieldValue::text("bogus"));
        let entity = normalizer.normalize(&raw, None).unwrap();
        assert!(entity.get(Field::StatusName).is_null());
    }

    #[test]
    fn optimistic_create_uses_temp_id_and_directory() {
        let mut directory = RelationDirectory::new();
        directory.insert_user(RawUser {
            id: 4,
            display_name: "Kai".into(),
        });
        let normalizer = Normalizer::new(directory);

        let temp = EntityId::temp();
        let fields = FieldMap::from([
            (Field::Title, FieldValue::text("new")),
            (Field::AssigneeId, FieldValue::User(UserId(4))),
        ]);
        let entity = normalizer.build_optimistic(temp, &fields).unwrap();

        assert_eq!(entity.id, temp);
        assert_eq!(entity.get(Field::AssigneeName), &FieldValue::text("Kai"));
        assert!(entity.get(Field::StatusName).is_null());
    }

    #[test]
    fn expand_patch_derives_join_fields() {
        let mut directory = RelationDirectory::new();
        directory.insert_status(status(2, "Doing"));
        let normalizer = Normalizer::new(directory);

        let patch = normalizer
            .expand_patch(&FieldMap::from([(Field::StatusId, FieldValue::Int(2))]))
            .unwrap();
        assert_eq!(patch.get(&Field::StatusName), Some(&FieldValue::text("Doing")));
        assert!(patch.contains_key(&Field::StatusColor));
        assert!(!patch.contains_key(&Field::AssigneeName));
    }

    #[test]
    fn expand_patch_rejects_null_title() {
        let normalizer = Normalizer::default();
        let result = normalizer.expand_patch(&FieldMap::from([(Field::Title, FieldValue::Null)]));
        assert_eq!(result, Err(NormalizeError::MissingField(Field::Title)));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn narrow_projection_preserves_unchanged_relations(
                status_id in 1_u64..5,
                name in "[A-Za-z]{1,10}",
                title in "[a-z ]{1,12}",
                moved in any::<bool>(),
            ) {
                let normalizer = Normalizer::default();
                let previous = normalizer
                    .normalize(&raw_task(7, "before").with_status(status(status_id, &name)), None)
                    .unwrap();

                let next_status = if moved { status_id + 10 } else { status_id };
                let mut narrow = raw_task(7, &title);
                narrow.fields.insert(Field::StatusId, FieldValue::Int(i64::try_from(next_status).unwrap()));
                let entity = normalizer.normalize(&narrow, Some(&previous)).unwrap();

                prop_assert_eq!(entity.get(Field::Title), &FieldValue::text(title));
                if moved {
                    prop_assert!(entity.get(Field::StatusName).is_null());
                } else {
                    prop_assert_eq!(entity.get(Field::StatusName), &FieldValue::text(name));
                }
            }
        }
    }
}
