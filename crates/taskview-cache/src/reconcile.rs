//! Temp-id reconciliation
//!
//! Swaps a placeholder id for the server-assigned one in every instance and
//! auxiliary index within one registry lock. Subscribers only ever see the
//! state before or after the swap, never both entries.

use crate::broadcast::{apply_locked, Broadcaster, CacheOp};
use crate::cache::PatchPolicy;
use crate::index::RefIndex;
use crate::registry::RegistryState;
use taskview_entity::{EntityId, ViewEntity};
use tracing::{debug, warn};

/// Result of one reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The placeholder was found and replaced
    Swapped {
        /// Instances that held the placeholder entry
        renamed: usize,
        /// Cached entities whose references were rewritten
        rewritten: usize,
    },
    /// Nothing referenced the placeholder any more; the real entity was
    /// upserted as a plain commit
    Orphaned,
}

/// Swaps temp ids for real ones
#[derive(Debug, Clone)]
pub struct Reconciler {
    broadcaster: Broadcaster,
}

impl Reconciler {
    /// Reconciler patching through `broadcaster`
    #[must_use]
    pub fn new(broadcaster: Broadcaster) -> Self {
        Self { broadcaster }
    }

    /// Replace `temp` with `real.id` everywhere, then upsert `real`
    pub fn reconcile(&self, temp: EntityId, real: ViewEntity) -> ReconcileOutcome {
        let registry = self.broadcaster.registry();
        let policy = registry.policy();
        let real_id = real.id;

        let (outcome, committed) = {
            let mut state = registry.lock();
            let outcome = swap_locked(&mut state, &temp, &real_id, &policy);
            let (report, committed) = apply_locked(&mut state, &CacheOp::Upsert(real), &policy);
            state.publish_all();
            debug!(%temp, real = %real_id, changed = report.changed(), "placeholder reconciled");
            (outcome, committed)
        };

        if outcome == ReconcileOutcome::Orphaned {
            warn!(%temp, real = %real_id, "reconciliation conflict, placeholder no longer cached");
        }
        if let Some(entity) = committed {
            self.broadcaster.index(&entity);
        }
        outcome
    }

    /// Replace references to `temp` without upserting an entity
    ///
    /// Used for ids that never live in a view cache themselves, such as
    /// comment threads.
    pub fn reconcile_id(&self, temp: EntityId, real: EntityId) -> ReconcileOutcome {
        let registry = self.broadcaster.registry();
        let policy = registry.policy();
        let mut state = registry.lock();
        let outcome = swap_locked(&mut state, &temp, &real, &policy);
        state.publish_all();
        debug!(%temp, %real, ?outcome, "reference reconciled");
        outcome
    }
}

fn swap_locked(
    state: &mut RegistryState,
    temp: &EntityId,
    real: &EntityId,
    policy: &PatchPolicy,
) -> ReconcileOutcome {
    let mut renamed = 0;
    let mut rewritten = 0;
    for cache in state.instances.values_mut() {
        if cache.rename(temp, real) {
            renamed += 1;
        }
        rewritten += cache.rewrite_refs(temp, real, policy);
    }
    let selected = state.selection.replace_id(temp, real);
    let linked = state.threads.replace_id(temp, real);

    if renamed == 0 && rewritten == 0 && !selected && !linked {
        ReconcileOutcome::Orphaned
    } else {
        ReconcileOutcome::Swapped { renamed, rewritten }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Commit;
    use crate::registry::ViewRegistry;
    use crate::view::{Filter, GroupKey, SortKey, ViewKey, ViewKind};
    use pretty_assertions::assert_eq;
    use taskview_entity::{Field, FieldValue};

    fn registry_with_views() -> (ViewRegistry, Vec<crate::registry::ViewHandle>) {
        let registry = ViewRegistry::default();
        let list = registry.register(ViewKey::new(
            ViewKind::List,
            Filter::all(),
            SortKey::desc(Field::CreatedAt),
        ));
        let board = registry.register(
            ViewKey::new(ViewKind::Board, Filter::all(), SortKey::asc(Field::Title))
                .grouped_by(Field::StatusId),
        );
        (registry, vec![list, board])
    }

    #[test]
    fn swap_keeps_single_row() {
        let (registry, handles) = registry_with_views();
        let broadcaster = Broadcaster::new(registry.clone());
        broadcaster.apply(
            CacheOp::Create(ViewEntity::new(EntityId::Real(7)).with(Field::Title, "old")),
            Commit::Authoritative,
        );

        let temp = EntityId::temp();
        broadcaster.apply(
            CacheOp::Create(ViewEntity::new(temp).with(Field::Title, "new")),
            Commit::Optimistic,
        );
        assert_eq!(handles[0].current().ids()[0], temp);

        let real = ViewEntity::new(EntityId::Real(42)).with(Field::Title, "new");
        let outcome = Reconciler::new(broadcaster).reconcile(temp, real);
        assert_eq!(outcome, ReconcileOutcome::Swapped { renamed: 2, rewritten: 0 });

        let list = handles[0].current();
        assert_eq!(list.ids(), vec![EntityId::Real(42), EntityId::Real(7)]);
        let board = handles[1].current();
        assert_eq!(
            board.group(&GroupKey::Value(FieldValue::Null)).map(|g| g.len()),
            Some(2)
        );
        assert!(!board.contains(&temp));
    }

    #[test]
    fn subscribers_never_see_both_ids() {
        let (registry, handles) = registry_with_views();
        let broadcaster = Broadcaster::new(registry.clone());
        let temp = EntityId::temp();
        broadcaster.apply(
            CacheOp::Create(ViewEntity::new(temp).with(Field::Title, "t")),
            Commit::Optimistic,
        );
        let mut receiver = handles[0].subscribe();
        receiver.mark_unchanged();

        Reconciler::new(broadcaster)
            .reconcile(temp, ViewEntity::new(EntityId::Real(1)).with(Field::Title, "t"));

        assert!(receiver.has_changed().unwrap());
        let seen = receiver.borrow_and_update().clone();
        assert!(seen.contains(&EntityId::Real(1)));
        assert!(!seen.contains(&temp));
        assert!(!receiver.has_changed().unwrap());
    }

    #[test]
    fn child_references_and_indices_follow() {
        let (registry, handles) = registry_with_views();
        let broadcaster = Broadcaster::new(registry.clone());
        let parent = EntityId::temp();
        let thread = EntityId::temp();
        broadcaster.apply(
            CacheOp::Create(ViewEntity::new(parent).with(Field::Title, "parent")),
            Commit::Optimistic,
        );
        broadcaster.apply(
            CacheOp::Upsert(
                ViewEntity::new(EntityId::Real(5))
                    .with(Field::Title, "child")
                    .with(Field::ParentId, parent),
            ),
            Commit::Optimistic,
        );
        registry.select(parent);
        registry.link_thread(parent, thread);

        let reconciler = Reconciler::new(broadcaster);
        let outcome = reconciler.reconcile(
            parent,
            ViewEntity::new(EntityId::Real(8)).with(Field::Title, "parent"),
        );
        assert_eq!(outcome, ReconcileOutcome::Swapped { renamed: 2, rewritten: 2 });

        let child = handles[0].current().get(&EntityId::Real(5)).cloned().unwrap();
        assert_eq!(child.get(Field::ParentId), &FieldValue::Ref(EntityId::Real(8)));
        assert_eq!(registry.selection().selected(), vec![EntityId::Real(8)]);
        assert_eq!(registry.thread_for(&EntityId::Real(8)), Some(thread));

        reconciler.reconcile_id(thread, EntityId::Real(300));
        assert_eq!(registry.thread_for(&EntityId::Real(8)), Some(EntityId::Real(300)));
    }

    #[test]
    fn missing_placeholder_is_orphaned_but_upserted() {
        let (registry, handles) = registry_with_views();
        let outcome = Reconciler::new(Broadcaster::new(registry)).reconcile(
            EntityId::temp(),
            ViewEntity::new(EntityId::Real(3)).with(Field::Title, "late"),
        );
        assert_eq!(outcome, ReconcileOutcome::Orphaned);
        assert_eq!(handles[0].current().ids(), vec![EntityId::Real(3)]);
    }
}
