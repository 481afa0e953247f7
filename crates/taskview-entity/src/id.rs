//! Entity identifiers
//!
//! An entity is identified either by a server-assigned id or by a
//! client-generated placeholder that only lives until reconciliation.
//! Consumers match on [`EntityId`] instead of sniffing string prefixes.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Client-only placeholder identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TempId(pub Uuid);

impl TempId {
    /// Generate a fresh placeholder
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic placeholder, used by fixtures and the simulator
    #[inline]
    #[must_use]
    pub fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }
}

impl Default for TempId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tmp-{}", self.0.simple())
    }
}

/// Identifier of an entity, thread or message
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityId {
    /// Server-assigned id
    Real(u64),
    /// Placeholder awaiting reconciliation
    Temp(TempId),
}

impl EntityId {
    /// Allocate a new placeholder id
    #[inline]
    #[must_use]
    pub fn temp() -> Self {
        Self::Temp(TempId::new())
    }

    /// Whether this id is still a placeholder
    #[inline]
    #[must_use]
    pub fn is_temp(&self) -> bool {
        matches!(self, Self::Temp(_))
    }

    /// Server id, if reconciled
    #[inline]
    #[must_use]
    pub fn real(&self) -> Option<u64> {
        match self {
            Self::Real(id) => Some(*id),
            Self::Temp(_) => None,
        }
    }

    /// Placeholder, if not yet reconciled
    #[inline]
    #[must_use]
    pub fn temp_id(&self) -> Option<TempId> {
        match self {
            Self::Temp(t) => Some(*t),
            Self::Real(_) => None,
        }
    }
}

impl From<u64> for EntityId {
    fn from(value: u64) -> Self {
        Self::Real(value)
    }
}

impl From<TempId> for EntityId {
    fn from(value: TempId) -> Self {
        Self::Temp(value)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Real(id) => write!(f, "{id}"),
            Self::Temp(t) => t.fmt(f),
        }
    }
}

/// User identifier (assignees, thread participants, message authors)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_and_real_are_distinct() {
        let temp = EntityId::temp();
        let real = EntityId::Real(42);

        assert!(temp.is_temp());
        assert!(!real.is_temp());
        assert_eq!(real.real(), Some(42));
        assert_eq!(temp.real(), None);
        assert!(temp.temp_id().is_some());
    }

    #[test]
    fn display_forms() {
        let temp = EntityId::Temp(TempId::from_u128(1));
        assert!(temp.to_string().starts_with("tmp-"));
        assert_eq!(EntityId::Real(7).to_string(), "7");
        assert_eq!(UserId(3).to_string(), "user:3");
    }

    #[test]
    fn fresh_temp_ids_differ() {
        assert_ne!(TempId::new(), TempId::new());
    }
}
