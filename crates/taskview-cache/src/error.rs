//! Error types for the cache layer

use crate::registry::ViewId;
use taskview_entity::Field;

/// Predicate evaluation failure for one cache instance
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PredicateError {
    /// Condition met a value of the wrong kind
    #[error("predicate on `{field}` expected {expected}, found {found}")]
    TypeMismatch {
        /// Field evaluated
        field: Field,
        /// Kind the condition needs
        expected: &'static str,
        /// Kind the entity holds
        found: &'static str,
    },
}

/// Cache registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// Handle refers to an instance that was unregistered
    #[error("view {0} is not registered")]
    UnknownView(ViewId),

    /// Page index beyond the next page to load
    #[error("page {page} out of range for view {view} ({loaded} loaded)")]
    PageOutOfRange {
        /// Instance
        view: ViewId,
        /// Requested page
        page: usize,
        /// Pages currently loaded in the group
        loaded: usize,
    },
}
