//! Mutation phases and the transition table
//!
//! `Idle -> OptimisticallyApplied -> Committed | RolledBack`

use crate::error::MutationError;
use crate::intent::MutationKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use taskview_entity::EntityId;
use ulid::Ulid;

/// Identifier of one issued mutation; sortable by issue time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MutationId(pub Ulid);

impl MutationId {
    /// Fresh id
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for MutationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mut-{}", self.0)
    }
}

/// Phase of one mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationPhase {
    /// Issued, nothing applied
    Idle,
    /// Visible in caches, write in flight
    OptimisticallyApplied,
    /// Confirmed by the backend
    Committed,
    /// Write failed, caches restored
    RolledBack,
}

impl MutationPhase {
    /// Whether no further transition is possible
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        allowed_transitions(self).is_empty()
    }
}

/// Phases reachable from `from`
#[must_use]
pub fn allowed_transitions(from: MutationPhase) -> &'static [MutationPhase] {
    use MutationPhase::*;
    match from {
        // Malformed input is rejected before the optimistic apply
        Idle => &[OptimisticallyApplied, RolledBack],
        OptimisticallyApplied => &[Committed, RolledBack],
        Committed | RolledBack => &[],
    }
}

/// Check a phase change for `mutation`
///
/// # Errors
/// [`MutationError::IllegalTransition`] when `to` is not reachable from `from`.
pub fn validate_transition(
    mutation: MutationId,
    from: MutationPhase,
    to: MutationPhase,
) -> Result<(), MutationError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(MutationError::IllegalTransition { mutation, from, to })
    }
}

/// Ledger entry of one mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
    /// Mutation
    pub id: MutationId,
    /// Target entity as issued
    pub entity: EntityId,
    /// Intent kind
    pub kind: MutationKind,
    /// Current phase
    pub phase: MutationPhase,
    /// Issue time
    pub issued_at: DateTime<Utc>,
    /// Server id when a placeholder was reconciled
    pub reconciled: Option<EntityId>,
    /// Failure or conflict noted along the way
    pub error: Option<MutationError>,
}

impl MutationRecord {
    /// Fresh record in `Idle`
    #[must_use]
    pub fn new(id: MutationId, entity: EntityId, kind: MutationKind) -> Self {
        Self {
            id,
            entity,
            kind,
            phase: MutationPhase::Idle,
            issued_at: Utc::now(),
            reconciled: None,
            error: None,
        }
    }

    /// Move to `to` if the table allows it
    ///
    /// # Errors
    /// [`MutationError::IllegalTransition`]
    pub fn advance(&mut self, to: MutationPhase) -> Result<(), MutationError> {
        validate_transition(self.id, self.phase, to)?;
        self.phase = to;
        Ok(())
    }
}
