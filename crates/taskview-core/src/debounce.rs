//! Per-field edit debouncing
//!
//! Edits to the same (entity, field) within the window coalesce into one
//! update carrying the last value. Edits to different fields of the same
//! entity are independent and may be in flight at the same time.

use crate::error::MutationError;
use crate::intent::MutationIntent;
use crate::orchestrator::{MutationOrchestrator, MutationOutcome};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskview_entity::{EntityId, Field, FieldMap, FieldValue};
use tokio::task::JoinHandle;
use tracing::trace;

#[derive(Debug)]
struct PendingEdit {
    value: FieldValue,
    generation: u64,
}

/// Coalesces rapid field edits into single writes
#[derive(Debug, Clone)]
pub struct FieldDebouncer {
    orchestrator: MutationOrchestrator,
    window: Duration,
    pending: Arc<Mutex<HashMap<(EntityId, Field), PendingEdit>>>,
    generation: Arc<AtomicU64>,
}

impl FieldDebouncer {
    /// Debouncer using the orchestrator's configured window
    #[must_use]
    pub fn new(orchestrator: MutationOrchestrator) -> Self {
        let window = orchestrator.config().debounce_window();
        Self {
            orchestrator,
            window,
            pending: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// With a different window
    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Quiet period
    #[inline]
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Edits waiting for their window to close
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Record an edit
    ///
    /// The returned task resolves to `None` when a later edit to the same
    /// field superseded this one, or a flush already issued it.
    pub fn edit(
        &self,
        id: EntityId,
        field: Field,
        value: impl Into<FieldValue>,
    ) -> JoinHandle<Option<Result<MutationOutcome, MutationError>>> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let key = (id, field);
        self.pending.lock().insert(
            key,
            PendingEdit {
                value: value.into(),
                generation,
            },
        );
        trace!(entity = %id, %field, generation, "edit debounced");

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.window).await;
            let value = {
                let mut pending = this.pending.lock();
                match pending.get(&key) {
                    Some(edit) if edit.generation == generation => {
                        pending.remove(&key).map(|edit| edit.value)
                    }
                    _ => None,
                }
            }?;
            Some(
                this.orchestrator
                    .mutate(MutationIntent::set(id, field, value))
                    .await,
            )
        })
    }

    /// Issue every pending edit now, one update per entity
    pub async fn flush(&self) -> Vec<Result<MutationOutcome, MutationError>> {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let mut by_entity: BTreeMap<EntityId, FieldMap> = BTreeMap::new();
        for ((id, field), edit) in drained {
            by_entity.entry(id).or_default().insert(field, edit.value);
        }

        join_all(
            by_entity
                .into_iter()
                .map(|(id, changed)| self.orchestrator.mutate(MutationIntent::update(id, changed))),
        )
        .await
    }
}
