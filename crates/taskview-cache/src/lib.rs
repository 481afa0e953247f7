//! Taskview Cache - view caches, coherence broadcast and reconciliation
//!
//! - [`ViewKey`]: parameter tuple of one cache instance (filter, grouping, sort, page size)
//! - [`ViewRegistry`]: explicit registry with register/unregister lifecycle
//! - [`Broadcaster`]: applies one entity change to every live instance
//! - [`Reconciler`]: swaps temp ids for server ids atomically
//! - [`EntitySnapshot`]: pre-mutation state for rollback
//!
//! All cache mutation happens under the registry lock; subscribers are
//! notified through `tokio::sync::watch` only after a full pass completes.

#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod broadcast;
mod cache;
mod error;
mod index;
mod reconcile;
mod registry;
mod snapshot;
mod view;

pub use broadcast::{BroadcastReport, Broadcaster, CacheOp, Commit, SearchIndex};
pub use cache::{Change, Location, PatchPolicy, UpsertMode, ViewSnapshot};
pub use error::{CacheError, PredicateError};
pub use index::{RefIndex, SelectionState, ThreadLinks};
pub use reconcile::{ReconcileOutcome, Reconciler};
pub use registry::{ViewHandle, ViewId, ViewRegistry};
pub use snapshot::EntitySnapshot;
pub use view::{Condition, Filter, GroupKey, SortKey, SortOrder, ViewKey, ViewKind};
