//! Error types for taskview core
//!
//! - Backend write and fetch failures
//! - Mutation failures surfaced to the UI layer
//! - Thread and participant failures
//! - Configuration loading

use crate::state_machine::{MutationId, MutationPhase};
use taskview_entity::{EntityId, NormalizeError, UserId};

/// Failure reported by a backend collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Backend refused the change
    #[error("rejected: {0}")]
    Rejected(String),

    /// Target does not exist on the backend
    #[error("not found: {0}")]
    NotFound(u64),

    /// Backend could not be reached or timed out
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    /// Whether retrying the same call may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Thread and participant failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ThreadError {
    /// Thread creation call failed; the session is back to no thread
    #[error("thread creation failed: {0}")]
    CreateFailed(BackendError),

    /// Thread exists but the batch watcher add failed
    #[error("adding watchers to thread {thread} failed: {source}")]
    WatchersFailed {
        /// Real thread id
        thread: u64,
        /// Backend failure
        source: BackendError,
    },

    /// Posting a message failed
    #[error("message failed: {0}")]
    MessageFailed(BackendError),

    /// Adding or removing one participant failed
    #[error("participant {user} change failed: {source}")]
    ParticipantFailed {
        /// Participant
        user: UserId,
        /// Backend failure
        source: BackendError,
    },

    /// The owning task has no server id yet, so the thread cannot link to it
    #[error("task {0} is not confirmed yet")]
    UnconfirmedEntity(EntityId),
}

/// Mutation failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MutationError {
    /// Input missing required fields; no cache was touched
    #[error(transparent)]
    MalformedEntity(#[from] NormalizeError),

    /// Backend rejected the change; optimistic state was rolled back
    #[error("write failed for {entity}: {source}")]
    WriteFailed {
        /// Target entity
        entity: EntityId,
        /// Backend failure
        source: BackendError,
    },

    /// A composite step failed after earlier steps committed
    #[error("composite `{plan}` failed at step `{failed_step}` ({} committed, {} skipped): {source}", .committed.len(), .skipped.len())]
    PartialCompositeFailure {
        /// Composite name
        plan: String,
        /// Step that failed
        failed_step: String,
        /// Steps that committed and stay visible
        committed: Vec<String>,
        /// Steps never issued
        skipped: Vec<String>,
        /// Failure of the failed step
        source: Box<MutationError>,
    },

    /// Real entity arrived for a placeholder nothing references any more
    #[error("reconciliation conflict: {temp} no longer cached, upserted {real}")]
    ReconciliationConflict {
        /// Placeholder id
        temp: EntityId,
        /// Server id
        real: EntityId,
    },

    /// Fetching an entity from the backend failed
    #[error("fetch failed for {entity}: {source}")]
    FetchFailed {
        /// Requested entity
        entity: EntityId,
        /// Backend failure
        source: BackendError,
    },

    /// Placeholder with no server id yet, or unknown to the engine
    #[error("unknown entity: {0}")]
    UnknownEntity(EntityId),

    /// Phase change outside the transition table
    #[error("mutation {mutation}: illegal transition {from:?} -> {to:?}")]
    IllegalTransition {
        /// Mutation
        mutation: MutationId,
        /// Current phase
        from: MutationPhase,
        /// Requested phase
        to: MutationPhase,
    },

    /// Thread subsystem failure
    #[error("thread error: {0}")]
    Thread(#[from] ThreadError),
}

impl MutationError {
    /// Whether the same intent may succeed if issued again
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::WriteFailed { source, .. } | Self::FetchFailed { source, .. } => {
                source.is_retryable()
            }
            Self::PartialCompositeFailure { source, .. } => source.is_retryable(),
            Self::Thread(
                ThreadError::CreateFailed(source)
                | ThreadError::MessageFailed(source)
                | ThreadError::WatchersFailed { source, .. }
                | ThreadError::ParticipantFailed { source, .. },
            ) => source.is_retryable(),
            _ => false,
        }
    }

    /// Whether some steps of a composite stay committed
    #[inline]
    #[must_use]
    pub fn is_partial(&self) -> bool {
        matches!(self, Self::PartialCompositeFailure { .. })
    }

    /// Write failure shorthand
    #[inline]
    pub fn write_failed(entity: EntityId, source: BackendError) -> Self {
        Self::WriteFailed { entity, source }
    }
}

/// Configuration loading failure
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Document is not valid TOML for the config shape
    #[error("invalid config document: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("invalid config value `{field}`: {reason}")]
    Invalid {
        /// Offending key
        field: &'static str,
        /// What is wrong
        reason: String,
    },
}
