//! Transient notifications for the UI layer

use crate::error::{MutationError, ThreadError};
use crate::state_machine::MutationId;
use taskview_entity::EntityId;

/// Something the user should be told about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationNotice {
    /// A write failed and the optimistic change was undone
    RolledBack {
        /// Mutation
        mutation: MutationId,
        /// Entity as issued
        entity: EntityId,
        /// Cause
        error: MutationError,
    },
    /// A composite stopped part way; committed steps stay visible
    PartialComposite {
        /// Composite name
        plan: String,
        /// [`MutationError::PartialCompositeFailure`]
        error: MutationError,
    },
    /// Thread creation, message or participant change failed
    Thread {
        /// Thread, if one exists
        thread: Option<EntityId>,
        /// Cause
        error: ThreadError,
    },
}

impl MutationNotice {
    /// Short text for a toast
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::RolledBack { entity, error, .. } => format!("change to {entity} was undone: {error}"),
            Self::PartialComposite { plan, error } => format!("{plan} only partly applied: {error}"),
            Self::Thread { error, .. } => format!("comment thread: {error}"),
        }
    }
}
