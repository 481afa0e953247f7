//! Known related entities
//!
//! Lets optimistic entities carry their denormalized join fields before the
//! backend echoes the embedded relations back.

use crate::raw::{RawEntity, RawProject, RawStatus, RawUser};
use std::collections::HashMap;

/// Lookup of statuses, users and projects by id
#[derive(Debug, Clone, Default)]
pub struct RelationDirectory {
    statuses: HashMap<u64, RawStatus>,
    users: HashMap<u64, RawUser>,
    projects: HashMap<u64, RawProject>,
}

impl RelationDirectory {
    /// Create an empty directory
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a status
    pub fn insert_status(&mut self, status: RawStatus) {
        self.statuses.insert(status.id, status);
    }

    /// Register a user
    pub fn insert_user(&mut self, user: RawUser) {
        self.users.insert(user.id, user);
    }

    /// Register a project
    pub fn insert_project(&mut self, project: RawProject) {
        self.projects.insert(project.id, project);
    }

    /// Learn every relation embedded in a backend entity
    pub fn observe(&mut self, raw: &RawEntity) {
        if let Some(status) = &raw.status {
            self.insert_status(status.clone());
        }
        if let Some(user) = &raw.assignee {
            self.insert_user(user.clone());
        }
        if let Some(project) = &raw.project {
            self.insert_project(project.clone());
        }
    }

    /// Status by id
    #[inline]
    #[must_use]
    pub fn status(&self, id: u64) -> Option<&RawStatus> {
        self.statuses.get(&id)
    }

    /// User by id
    #[inline]
    #[must_use]
    pub fn user(&self, id: u64) -> Option<&RawUser> {
        self.users.get(&id)
    }

    /// Project by id
    #[inline]
    #[must_use]
    pub fn project(&self, id: u64) -> Option<&RawProject> {
        self.projects.get(&id)
    }

    /// Total number of known relations
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.statuses.len() + self.users.len() + self.projects.len()
    }

    /// Whether nothing is known
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
