//! Task field model
//!
//! Fields split into two families:
//! - primary fields owned by the task itself
//! - denormalized join fields shadowing a related entity (status, assignee,
//!   project) so views render without a secondary fetch

use crate::id::{EntityId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Field map keyed by [`Field`]
pub type FieldMap = BTreeMap<Field, FieldValue>;

/// A named task field
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    /// Task title (required)
    Title,
    /// Free-form description
    Description,
    /// Status reference
    StatusId,
    /// Assigned user
    AssigneeId,
    /// Owning project
    ProjectId,
    /// Parent task reference
    ParentId,
    /// Priority rank
    Priority,
    /// Due date
    DueDate,
    /// Creation time
    CreatedAt,
    /// Last update time
    UpdatedAt,
    /// Manual ordering position
    Position,
    /// Status display name (denormalized)
    StatusName,
    /// Status color (denormalized)
    StatusColor,
    /// Assignee display name (denormalized)
    AssigneeName,
    /// Project display name (denormalized)
    ProjectName,
    /// Project color (denormalized)
    ProjectColor,
}

impl Field {
    /// Every known field
    pub const ALL: [Field; 16] = [
        Field::Title,
        Field::Description,
        Field::StatusId,
        Field::AssigneeId,
        Field::ProjectId,
        Field::ParentId,
        Field::Priority,
        Field::DueDate,
        Field::CreatedAt,
        Field::UpdatedAt,
        Field::Position,
        Field::StatusName,
        Field::StatusColor,
        Field::AssigneeName,
        Field::ProjectName,
        Field::ProjectColor,
    ];

    /// Fields a backend entity must carry
    pub const REQUIRED: [Field; 1] = [Field::Title];

    /// Whether the field shadows a related entity
    #[inline]
    #[must_use]
    pub fn is_denormalized(self) -> bool {
        self.source().is_some()
    }

    /// Relation id field a denormalized field is derived from
    #[must_use]
    pub fn source(self) -> Option<Field> {
        match self {
            Field::StatusName | Field::StatusColor => Some(Field::StatusId),
            Field::AssigneeName => Some(Field::AssigneeId),
            Field::ProjectName | Field::ProjectColor => Some(Field::ProjectId),
            _ => None,
        }
    }

    /// Denormalized fields derived from this relation id field
    #[must_use]
    pub fn dependents(self) -> &'static [Field] {
        match self {
            Field::StatusId => &[Field::StatusName, Field::StatusColor],
            Field::AssigneeId => &[Field::AssigneeName],
            Field::ProjectId => &[Field::ProjectName, Field::ProjectColor],
            _ => &[],
        }
    }

    /// Stable snake_case name
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Field::Title => "title",
            Field::Description => "description",
            Field::StatusId => "status_id",
            Field::AssigneeId => "assignee_id",
            Field::ProjectId => "project_id",
            Field::ParentId => "parent_id",
            Field::Priority => "priority",
            Field::DueDate => "due_date",
            Field::CreatedAt => "created_at",
            Field::UpdatedAt => "updated_at",
            Field::Position => "position",
            Field::StatusName => "status_name",
            Field::StatusColor => "status_color",
            Field::AssigneeName => "assignee_name",
            Field::ProjectName => "project_name",
            Field::ProjectColor => "project_color",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A field value
///
/// Ordering is total: values of different kinds order by kind first, so
/// sorting a mixed column is deterministic. `Null` sorts first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    /// Absent value
    Null,
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// Text
    Text(String),
    /// Timestamp
    Time(DateTime<Utc>),
    /// Reference to another entity
    Ref(EntityId),
    /// Reference to a user
    User(UserId),
}

impl FieldValue {
    /// Text value helper
    #[inline]
    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Whether the value is `Null`
    #[inline]
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Borrow as text
    #[inline]
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Entity reference, if any
    #[inline]
    #[must_use]
    pub fn as_ref_id(&self) -> Option<EntityId> {
        match self {
            Self::Ref(id) => Some(*id),
            _ => None,
        }
    }

    /// User reference, if any
    #[inline]
    #[must_use]
    pub fn as_user(&self) -> Option<UserId> {
        match self {
            Self::User(id) => Some(*id),
            _ => None,
        }
    }

    /// Timestamp, if any
    #[inline]
    #[must_use]
    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Time(t) => Some(*t),
            _ => None,
        }
    }

    /// Short kind name used in diagnostics
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Text(_) => "text",
            Self::Time(_) => "time",
            Self::Ref(_) => "ref",
            Self::User(_) => "user",
        }
    }

    /// Rewrite a reference from `from` to `to`
    ///
    /// Returns true if the value changed.
    pub fn replace_ref(&mut self, from: &EntityId, to: &EntityId) -> bool {
        match self {
            Self::Ref(id) if id == from => {
                *id = *to;
                true
            }
            _ => false,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Time(value)
    }
}

impl From<EntityId> for FieldValue {
    fn from(value: EntityId) -> Self {
        Self::Ref(value)
    }
}

impl From<UserId> for FieldValue {
    fn from(value: UserId) -> Self {
        Self::User(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}
