//! Taskview Core - optimistic mutations over coherent view caches
//!
//! - Dispatches [`MutationIntent`]s through the optimistic-apply, write,
//!   commit-or-rollback lifecycle
//! - Runs multi-step composite mutations with partial-failure reporting
//! - Debounces per-field edits
//! - Bootstraps comment threads and their participants optimistically
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use taskview_core::prelude::*;
//!
//! # async fn example() -> Result<(), MutationError> {
//! let orchestrator = MutationOrchestrator::new(EngineConfig::new(), Arc::new(MemoryBackend::new()));
//! let list = orchestrator.register_view(ViewKey::new(
//!     ViewKind::List,
//!     Filter::all(),
//!     SortKey::desc(Field::CreatedAt),
//! ));
//!
//! let intent = MutationIntent::create(FieldMap::from([(Field::Title, "Write docs".into())]));
//! let outcome = orchestrator.mutate(intent).await?;
//!
//! println!("{} rows, committed: {}", list.current().len(), outcome.is_committed());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod backend;
pub mod composite;
pub mod config;
pub mod debounce;
pub mod error;
pub mod intent;
pub mod memory;
pub mod notice;
pub mod orchestrator;
pub mod simulator;
pub mod state_machine;
pub mod thread;

pub use backend::{Backend, RawMessage, ThreadBackend};
pub use composite::{CompositeOutcome, CompositePlan, CompositeStep};
pub use config::EngineConfig;
pub use debounce::FieldDebouncer;
pub use error::{BackendError, ConfigError, MutationError, ThreadError};
pub use intent::{MutationIntent, MutationKind};
pub use memory::{BackendOp, MemoryBackend, MemoryThread};
pub use notice::MutationNotice;
pub use orchestrator::{MutationOrchestrator, MutationOutcome, OrchestratorBuilder};
pub use state_machine::{
    allowed_transitions, validate_transition, MutationId, MutationPhase, MutationRecord,
};
pub use thread::{Message, ThreadSession, ThreadState, ThreadView};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with taskview
    pub use crate::{
        Backend, CompositeOutcome, CompositePlan, EngineConfig, FieldDebouncer, MemoryBackend,
        MutationError, MutationIntent, MutationNotice, MutationOrchestrator, MutationOutcome,
        ThreadSession,
    };
    pub use taskview_cache::{Condition, Filter, SortKey, ViewHandle, ViewKey, ViewKind};
    pub use taskview_entity::{EntityId, Field, FieldMap, FieldValue, RawEntity, ViewEntity};
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
