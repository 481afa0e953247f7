//! External collaborators
//!
//! The engine only needs a success or failure signal from each call.
//! Timeouts and retries belong to the implementations.

use crate::error::BackendError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskview_entity::{FieldMap, RawEntity, UserId};

/// Task persistence service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    /// Create a task; returns the stored shape with its server id
    async fn create(&self, fields: FieldMap) -> Result<RawEntity, BackendError>;

    /// Write changed fields; returns the stored shape
    async fn update(&self, id: u64, fields: FieldMap) -> Result<RawEntity, BackendError>;

    /// Delete a task
    async fn delete(&self, id: u64) -> Result<(), BackendError>;

    /// Fetch one task
    async fn fetch_by_id(&self, id: u64) -> Result<RawEntity, BackendError>;
}

/// A message as stored by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    /// Server id
    pub id: u64,
    /// Author
    pub author: UserId,
    /// Body text
    pub body: String,
    /// Server timestamp
    pub sent_at: DateTime<Utc>,
}

/// Comment thread service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ThreadBackend: Send + Sync {
    /// Create a thread, optionally linked to a task; returns its id
    async fn create_thread(&self, entity: Option<u64>) -> Result<u64, BackendError>;

    /// Add watchers in one call
    async fn add_watchers(&self, thread: u64, users: Vec<UserId>) -> Result<(), BackendError>;

    /// Remove one watcher
    async fn remove_watcher(&self, thread: u64, user: UserId) -> Result<(), BackendError>;

    /// Post a message
    async fn post_message(
        &self,
        thread: u64,
        author: UserId,
        body: String,
    ) -> Result<RawMessage, BackendError>;
}
