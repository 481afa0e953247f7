//! Backend entity shape
//!
//! Backend responses carry primary fields plus optionally embedded related
//! entities. Narrow projections (e.g. an update response) may leave any of
//! the relations out.

use crate::field::FieldMap;
use serde::{Deserialize, Serialize};

/// Embedded status relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawStatus {
    /// Status id
    pub id: u64,
    /// Display name
    pub name: String,
    /// Display color
    pub color: String,
}

/// Embedded user relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawUser {
    /// User id
    pub id: u64,
    /// Display name
    pub display_name: String,
}

/// Embedded project relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawProject {
    /// Project id
    pub id: u64,
    /// Display name
    pub name: String,
    /// Display color
    pub color: String,
}

/// Entity as returned by the backend (create response, fetch, realtime push)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEntity {
    /// Server id
    pub id: Option<u64>,
    /// Primary fields present in this projection
    #[serde(default)]
    pub fields: FieldMap,
    /// Embedded status, if projected
    #[serde(default)]
    pub status: Option<RawStatus>,
    /// Embedded assignee, if projected
    #[serde(default)]
    pub assignee: Option<RawUser>,
    /// Embedded project, if projected
    #[serde(default)]
    pub project: Option<RawProject>,
}

impl RawEntity {
    /// Raw entity with an id and fields, no relations
    #[inline]
    #[must_use]
    pub fn new(id: u64, fields: FieldMap) -> Self {
        Self {
            id: Some(id),
            fields,
            ..Self::default()
        }
    }

    /// Attach an embedded status
    #[inline]
    #[must_use]
    pub fn with_status(mut self, status: RawStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach an embedded assignee
    #[inline]
    #[must_use]
    pub fn with_assignee(mut self, assignee: RawUser) -> Self {
        self.assignee = Some(assignee);
        self
    }

    /// Attach an embedded project
    #[inline]
    #[must_use]
    pub fn with_project(mut self, project: RawProject) -> Self {
        self.project = Some(project);
        self
    }
}
