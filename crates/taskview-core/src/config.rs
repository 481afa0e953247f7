//! Engine configuration

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use taskview_cache::PatchPolicy;
use taskview_entity::Field;

/// Orchestrator, debouncer and thread settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Quiet period before a field edit is written, in milliseconds
    pub debounce_ms: u64,
    /// Buffered notices per subscriber before the oldest are dropped
    pub notice_capacity: usize,
    /// Field whose descending sort counts as "most recent first"
    pub recency_field: Field,
    /// Patch only the first loaded page of paginated views
    pub first_page_only: bool,
    /// Seed pending thread participants from the caller's default set
    pub seed_thread_participants: bool,
    /// Settled mutations kept in the ledger before the oldest are evicted
    pub ledger_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 300,
            notice_capacity: 64,
            recency_field: Field::CreatedAt,
            first_page_only: true,
            seed_thread_participants: true,
            ledger_capacity: 1024,
        }
    }
}

impl EngineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a TOML document; absent keys take defaults
    ///
    /// # Errors
    /// [`ConfigError::Parse`] for malformed documents and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_toml_str(document: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] naming the first bad key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.notice_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "notice_capacity",
                reason: "must be at least 1".into(),
            });
        }
        if self.ledger_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "ledger_capacity",
                reason: "must be at least 1".into(),
            });
        }
        if self.recency_field.is_denormalized() {
            return Err(ConfigError::Invalid {
                field: "recency_field",
                reason: format!("`{}` is a denormalized field", self.recency_field),
            });
        }
        Ok(())
    }

    /// With debounce window
    #[inline]
    #[must_use]
    pub fn with_debounce_ms(mut self, ms: u64) -> Self {
        self.debounce_ms = ms;
        self
    }

    /// With notice channel capacity
    #[inline]
    #[must_use]
    pub fn with_notice_capacity(mut self, capacity: usize) -> Self {
        self.notice_capacity = capacity;
        self
    }

    /// With recency field
    #[inline]
    #[must_use]
    pub fn with_recency_field(mut self, field: Field) -> Self {
        self.recency_field = field;
        self
    }

    /// With first-page-only patching on or off
    #[inline]
    #[must_use]
    pub fn with_first_page_only(mut self, enabled: bool) -> Self {
        self.first_page_only = enabled;
        self
    }

    /// With participant seeding on or off
    #[inline]
    #[must_use]
    pub fn with_seed_thread_participants(mut self, enabled: bool) -> Self {
        self.seed_thread_participants = enabled;
        self
    }

    /// With ledger capacity
    #[inline]
    #[must_use]
    pub fn with_ledger_capacity(mut self, capacity: usize) -> Self {
        self.ledger_capacity = capacity;
        self
    }

    /// Debounce window
    #[inline]
    #[must_use]
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Patching rules for the view registry
    #[inline]
    #[must_use]
    pub fn patch_policy(&self) -> PatchPolicy {
        PatchPolicy {
            recency_field: self.recency_field,
            first_page_only: self.first_page_only,
        }
    }
}
