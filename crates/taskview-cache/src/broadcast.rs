//! Cache coherence broadcaster
//!
//! Applies one entity change to every live cache instance under a single
//! registry lock, then publishes the instances that changed. Instances that
//! were never registered are skipped; they fetch fresh data when created.

use crate::cache::{Change, PatchPolicy, UpsertMode};
use crate::index::RefIndex;
use crate::registry::{RegistryState, ViewRegistry};
use std::fmt;
use std::sync::Arc;
use taskview_entity::{EntityId, FieldMap, ViewEntity};
use tracing::{debug, warn};

/// Full-text index kept eventually consistent with committed entities
///
/// Calls are fire-and-forget; implementations must not block.
pub trait SearchIndex: Send + Sync {
    /// Index or re-index an entity
    fn upsert(&self, entity: &ViewEntity);

    /// Drop an entity from the index
    fn remove(&self, id: &EntityId);
}

/// Change to broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOp {
    /// Newly created entity
    Create(ViewEntity),
    /// Shallow-merge upsert
    Upsert(ViewEntity),
    /// Changed fields only; skipped when no instance holds the entity
    Patch(EntityId, FieldMap),
    /// Remove everywhere
    Remove(EntityId),
}

impl CacheOp {
    /// Entity the op targets
    #[must_use]
    pub fn id(&self) -> EntityId {
        match self {
            CacheOp::Create(e) | CacheOp::Upsert(e) => e.id,
            CacheOp::Patch(id, _) | CacheOp::Remove(id) => *id,
        }
    }
}

/// Whether a change is a guess or confirmed by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    /// Optimistic apply
    Optimistic,
    /// Server-confirmed; also reaches the search index
    Authoritative,
}

/// Per-instance outcome counts of one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Instances the entity entered
    pub inserted: usize,
    /// Instances updated in place
    pub replaced: usize,
    /// Instances where the entity changed group or position
    pub moved: usize,
    /// Instances the entity left
    pub removed: usize,
    /// Instances holding it on a later page only
    pub stale: usize,
    /// Instances whose predicate failed to evaluate
    pub failed: usize,
    /// Instances left as they were
    pub unchanged: usize,
}

impl BroadcastReport {
    pub(crate) fn record(&mut self, change: Change) {
        match change {
            Change::Unchanged => self.unchanged += 1,
            Change::Inserted => self.inserted += 1,
            Change::Replaced => self.replaced += 1,
            Change::Moved => self.moved += 1,
            Change::Removed => self.removed += 1,
            Change::Stale => self.stale += 1,
        }
    }

    /// Instances whose contents changed
    #[must_use]
    pub fn changed(&self) -> usize {
        self.inserted + self.replaced + self.moved + self.removed
    }
}

/// Applies entity changes to every registered view
#[derive(Clone)]
pub struct Broadcaster {
    registry: ViewRegistry,
    search: Option<Arc<dyn SearchIndex>>,
}

impl fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcaster")
            .field("registry", &self.registry)
            .field("search", &self.search.is_some())
            .finish()
    }
}

impl Broadcaster {
    /// Broadcaster over `registry`
    #[must_use]
    pub fn new(registry: ViewRegistry) -> Self {
        Self {
            registry,
            search: None,
        }
    }

    /// Attach a search index updater
    #[must_use]
    pub fn with_search(mut self, search: Arc<dyn SearchIndex>) -> Self {
        self.search = Some(search);
        self
    }

    /// Registry this broadcaster patches
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &ViewRegistry {
        &self.registry
    }

    /// Apply `op` to every live instance and publish
    pub fn apply(&self, op: CacheOp, commit: Commit) -> BroadcastReport {
        let policy = self.registry.policy();
        let (report, committed) = {
            let mut state = self.registry.lock();
            let outcome = apply_locked(&mut state, &op, &policy);
            state.publish_all();
            outcome
        };

        debug!(
            entity = %op.id(),
            ?commit,
            changed = report.changed(),
            failed = report.failed,
            "broadcast applied"
        );

        if commit == Commit::Authoritative {
            match (&op, committed) {
                (CacheOp::Remove(id), _) => self.index_removal(id),
                (_, Some(entity)) => self.index(&entity),
                (_, None) => {}
            }
        }
        report
    }

    pub(crate) fn index(&self, entity: &ViewEntity) {
        if let Some(search) = &self.search {
            search.upsert(entity);
        }
    }

    pub(crate) fn index_removal(&self, id: &EntityId) {
        if let Some(search) = &self.search {
            search.remove(id);
        }
    }
}

/// Apply without publishing; returns the entity as now committed to caches
pub(crate) fn apply_locked(
    state: &mut RegistryState,
    op: &CacheOp,
    policy: &PatchPolicy,
) -> (BroadcastReport, Option<ViewEntity>) {
    let mut report = BroadcastReport::default();
    let id = op.id();

    // Patches need a full base for instances that do not hold the entity yet
    let resolved = match op {
        CacheOp::Create(e) | CacheOp::Upsert(e) => Some(e.clone()),
        CacheOp::Patch(id, fields) => {
            let base = state.instances.values().find_map(|cache| {
                cache.find(id).and_then(|loc| cache.get(&loc).cloned())
            });
            match base {
                Some(mut base) => {
                    base.merge(fields);
                    Some(base)
                }
                None => {
                    debug!(entity = %id, "patch skipped, entity not cached");
                    return (report, None);
                }
            }
        }
        CacheOp::Remove(id) => {
            let deselected = state.selection.remove_id(id);
            let unlinked = state.threads.remove_id(id);
            if deselected || unlinked {
                debug!(entity = %id, deselected, unlinked, "references dropped");
            }
            None
        }
    };

    for (view, cache) in state.instances.iter_mut() {
        let result = match (op, resolved.as_ref()) {
            (CacheOp::Remove(id), _) => Ok(cache.remove(id, policy)),
            (CacheOp::Create(e), _) => cache.upsert(e, UpsertMode::Created, policy),
            (CacheOp::Upsert(e), _) => cache.upsert(e, UpsertMode::Merge, policy),
            (CacheOp::Patch(id, fields), Some(full)) => {
                if cache.find(id).is_some() {
                    let partial = ViewEntity {
                        id: *id,
                        fields: fields.clone(),
                    };
                    cache.upsert(&partial, UpsertMode::Merge, policy)
                } else {
                    cache.upsert(full, UpsertMode::Merge, policy)
                }
            }
            (CacheOp::Patch(..), None) => Ok(Change::Unchanged),
        };

        match result {
            Ok(change) => {
                if change.is_mutation() {
                    debug!(view = %view, entity = %id, ?change, "cache patched");
                }
                report.record(change);
            }
            Err(error) => {
                warn!(view = %view, entity = %id, %error, "predicate failed, instance skipped");
                report.failed += 1;
            }
        }
    }

    let committed = match op {
        CacheOp::Remove(_) => None,
        _ => state
            .instances
            .values()
            .find_map(|cache| cache.find(&id).and_then(|loc| cache.get(&loc).cloned()))
            .or(resolved),
    };
    (report, committed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::{Condition, Filter, GroupKey, SortKey, SortOrder, ViewKey, ViewKind};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use taskview_entity::{Field, FieldValue};

    #[derive(Default)]
    struct RecordingIndex {
        upserts: Mutex<Vec<EntityId>>,
        removals: Mutex<Vec<EntityId>>,
    }

    impl SearchIndex for RecordingIndex {
        fn upsert(&self, entity: &ViewEntity) {
            self.upserts.lock().push(entity.id);
        }

        fn remove(&self, id: &EntityId) {
            self.removals.lock().push(*id);
        }
    }

    fn task(id: u64, title: &str) -> ViewEntity {
        ViewEntity::new(EntityId::Real(id)).with(Field::Title, title)
    }

    fn status_filter(status: i64) -> ViewKey {
        ViewKey::new(
            ViewKind::List,
            Filter::all().and(Condition::Eq(Field::StatusId, FieldValue::Int(status))),
            SortKey::asc(Field::Title),
        )
    }

    #[test]
    fn upsert_moves_between_filtered_views() {
        let registry = ViewRegistry::default();
        let open = registry.register(status_filter(1));
        let done = registry.register(status_filter(2));
        let broadcaster = Broadcaster::new(registry.clone());

        let report = broadcaster.apply(
            CacheOp::Upsert(task(1, "a").with(Field::StatusId, 1_i64)),
            Commit::Authoritative,
        );
        assert_eq!(report.inserted, 1);
        assert_eq!(open.current().len(), 1);
        assert!(done.current().is_empty());

        let report = broadcaster.apply(
            CacheOp::Patch(
                EntityId::Real(1),
                FieldMap::from([(Field::StatusId, FieldValue::Int(2))]),
            ),
            Commit::Optimistic,
        );
        assert_eq!((report.inserted, report.removed), (1, 1));
        assert!(open.current().is_empty());
        assert_eq!(done.current().ids(), vec![EntityId::Real(1)]);
        // The inserted copy carries the full entity, not just the patch
        assert_eq!(
            done.current().get(&EntityId::Real(1)).unwrap().get(Field::Title),
            &FieldValue::text("a")
        );
    }

    #[test]
    fn predicate_failure_is_isolated() {
        let registry = ViewRegistry::default();
        let broken = registry.register(ViewKey::new(
            ViewKind::Search,
            Filter::all().and(Condition::TextContains(Field::Priority, "1".into())),
            SortKey::asc(Field::Title),
        ));
        let healthy = registry.register(ViewKey::new(
            ViewKind::List,
            Filter::all(),
            SortKey::asc(Field::Title),
        ));

        let report = Broadcaster::new(registry.clone()).apply(
            CacheOp::Upsert(task(1, "a").with(Field::Priority, 1_i64)),
            Commit::Optimistic,
        );
        assert_eq!(report.failed, 1);
        assert_eq!(report.inserted, 1);
        assert!(broken.current().is_empty());
        assert_eq!(healthy.current().len(), 1);
    }

    #[test]
    fn only_registered_variants_are_patched() {
        let registry = ViewRegistry::default();
        let keys = ViewKey::variants(
            ViewKind::Board,
            &Filter::all(),
            &[Some(Field::StatusId), Some(Field::AssigneeId)],
            &[Field::CreatedAt, Field::Title],
            &[SortOrder::Asc, SortOrder::Desc],
        );
        let handles: Vec<_> = keys.iter().take(3).cloned().map(|k| registry.register(k)).collect();

        let report = Broadcaster::new(registry.clone())
            .apply(CacheOp::Create(task(1, "a")), Commit::Optimistic);
        assert_eq!(report.inserted, 3);
        for handle in &handles {
            assert_eq!(
                handle.current().group(&GroupKey::Value(FieldValue::Null)).map(|g| g.len()),
                Some(1)
            );
        }
    }

    #[test]
    fn patch_for_uncached_entity_is_skipped() {
        let registry = ViewRegistry::default();
        let handle = registry.register(status_filter(1));
        let report = Broadcaster::new(registry.clone()).apply(
            CacheOp::Patch(EntityId::Real(9), FieldMap::from([(Field::StatusId, FieldValue::Int(1))])),
            Commit::Optimistic,
        );
        assert_eq!(report, BroadcastReport::default());
        assert!(handle.current().is_empty());
    }

    #[test]
    fn search_index_sees_authoritative_commits_only() {
        let registry = ViewRegistry::default();
        let _handle = registry.register(status_filter(1));
        let index = Arc::new(RecordingIndex::default());
        let broadcaster = Broadcaster::new(registry).with_search(index.clone());

        broadcaster.apply(CacheOp::Upsert(task(1, "a")), Commit::Optimistic);
        broadcaster.apply(CacheOp::Upsert(task(2, "b")), Commit::Authoritative);
        broadcaster.apply(CacheOp::Remove(EntityId::Real(2)), Commit::Authoritative);

        assert_eq!(*index.upserts.lock(), vec![EntityId::Real(2)]);
        assert_eq!(*index.removals.lock(), vec![EntityId::Real(2)]);
    }

    #[test]
    fn applying_twice_is_idempotent() {
        let registry = ViewRegistry::default();
        let handle = registry.register(ViewKey::new(
            ViewKind::List,
            Filter::all(),
            SortKey::desc(Field::CreatedAt),
        ));
        let broadcaster = Broadcaster::new(registry.clone());
        let entity = task(1, "a").with(Field::Priority, 2_i64);

        broadcaster.apply(CacheOp::Upsert(entity.clone()), Commit::Authoritative);
        let once = registry.snapshot(handle.id()).unwrap();
        let report = broadcaster.apply(CacheOp::Upsert(entity), Commit::Authoritative);
        assert_eq!(report.changed(), 0);
        assert_eq!(registry.snapshot(handle.id()).unwrap(), once);
    }

    #[test]
    fn remove_drops_selection_and_thread_link() {
        let registry = ViewRegistry::default();
        let handle = registry.register(status_filter(1));
        let broadcaster = Broadcaster::new(registry.clone());
        broadcaster.apply(
            CacheOp::Upsert(task(1, "a").with(Field::StatusId, 1_i64)),
            Commit::Authoritative,
        );
        registry.select(EntityId::Real(1));
        registry.select(EntityId::Real(2));
        registry.focus(Some(EntityId::Real(1)));
        registry.link_thread(EntityId::Real(1), EntityId::Real(90));

        broadcaster.apply(CacheOp::Remove(EntityId::Real(1)), Commit::Optimistic);

        assert!(handle.current().is_empty());
        let selection = registry.selection();
        assert_eq!(selection.selected(), vec![EntityId::Real(2)]);
        assert_eq!(selection.focused(), None);
        assert_eq!(registry.thread_for(&EntityId::Real(1)), None);
    }
}
