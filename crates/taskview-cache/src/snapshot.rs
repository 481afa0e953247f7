//! Pre-mutation snapshots of one entity across all instances

use crate::cache::{Location, UpsertMode};
use crate::index::RefIndex;
use crate::registry::{RegistryState, ViewId, ViewRegistry};
use std::collections::HashMap;
use taskview_entity::{EntityId, Field, ViewEntity};
use tracing::{debug, warn};

/// Where an entity sat, and what it looked like, in every instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySnapshot {
    id: EntityId,
    entries: HashMap<ViewId, (Location, ViewEntity)>,
    prior: Option<ViewEntity>,
    selected_at: Option<usize>,
    focused: bool,
    thread: Option<EntityId>,
}

impl EntitySnapshot {
    /// Capture the current state of `id`
    #[must_use]
    pub fn capture(registry: &ViewRegistry, id: EntityId) -> Self {
        Self::capture_locked(&registry.lock(), id)
    }

    pub(crate) fn capture_locked(state: &RegistryState, id: EntityId) -> Self {
        let entries: HashMap<_, _> = state
            .instances
            .iter()
            .filter_map(|(view, cache)| {
                let loc = cache.find(&id)?;
                let entity = cache.get(&loc)?.clone();
                Some((*view, (loc, entity)))
            })
            .collect();
        let prior = entries.values().next().map(|(_, e)| e.clone());
        Self {
            id,
            entries,
            prior,
            selected_at: state.selection.position(&id),
            focused: state.selection.focused() == Some(id),
            thread: state.threads.thread_for(&id),
        }
    }

    /// Entity id
    #[inline]
    #[must_use]
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// A cached copy from before the mutation, if any instance held one
    #[inline]
    #[must_use]
    pub fn prior(&self) -> Option<&ViewEntity> {
        self.prior.as_ref()
    }

    /// Whether no instance held the entity
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Instances that held the entity
    #[must_use]
    pub fn views(&self) -> Vec<ViewId> {
        self.entries.keys().copied().collect()
    }

    /// Put the entity back as captured, then publish
    ///
    /// With `fields = None` every instance gets its captured copy back at the
    /// captured position. With `Some(fields)` only those fields revert, so
    /// concurrent edits to other fields survive; an instance whose result
    /// equals its captured copy still gets the captured position back.
    ///
    /// A full restore also brings back the selection, focus and thread link
    /// a removal dropped, and drops those of an entity the mutation created.
    ///
    /// Returns the number of instances touched.
    pub fn restore(&self, registry: &ViewRegistry, fields: Option<&[Field]>) -> usize {
        let policy = registry.policy();
        let mut state = registry.lock();
        let mut touched = 0;

        for (view, cache) in state.instances.iter_mut() {
            let saved = self.entries.get(view);
            let current = cache
                .find(&self.id)
                .and_then(|loc| cache.get(&loc).cloned());

            let Some(prior) = self.prior.as_ref() else {
                // Created by the mutation
                if current.is_some() {
                    cache.restore(&self.id, None);
                    touched += 1;
                }
                continue;
            };

            let target = match fields {
                None => saved.map(|(_, e)| e.clone()),
                Some(fields) => {
                    let mut base = current
                        .clone()
                        .or_else(|| saved.map(|(_, e)| e.clone()))
                        .unwrap_or_else(|| prior.clone());
                    base.merge(&prior.project(fields));
                    Some(base)
                }
            };

            match (target, saved) {
                (Some(target), Some(saved)) if target == saved.1 => {
                    if current.as_ref() != Some(&saved.1) || cache.find(&self.id) != Some(saved.0.clone()) {
                        cache.restore(&self.id, Some(saved));
                        touched += 1;
                    }
                }
                (Some(target), _) => match cache.upsert(&target, UpsertMode::Merge, &policy) {
                    Ok(change) if change.is_mutation() => touched += 1,
                    Ok(_) => {}
                    Err(error) => {
                        warn!(view = %view, entity = %self.id, %error, "restore skipped instance");
                    }
                },
                (None, _) => {
                    if current.is_some() {
                        cache.restore(&self.id, None);
                        touched += 1;
                    }
                }
            }
        }

        if fields.is_none() {
            self.restore_refs(&mut state);
        }
        let published = state.publish_all();
        debug!(entity = %self.id, touched, published, "snapshot restored");
        touched
    }

    fn restore_refs(&self, state: &mut RegistryState) {
        if self.prior.is_none() && self.id.is_temp() {
            state.selection.remove_id(&self.id);
            state.threads.remove_id(&self.id);
            return;
        }
        if let Some(index) = self.selected_at {
            state.selection.select_at(self.id, index);
        }
        if self.focused && state.selection.focused().is_none() {
            state.selection.focus(Some(self.id));
        }
        if let Some(thread) = self.thread {
            if state.threads.thread_for(&self.id).is_none() {
                state.threads.link(self.id, thread);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{Broadcaster, CacheOp, Commit};
    use crate::view::{Filter, SortKey, ViewKey, ViewKind};
    use taskview_entity::{FieldMap, FieldValue};

    fn task(id: u64, title: &str, priority: i64) -> ViewEntity {
        ViewEntity::new(EntityId::Real(id))
            .with(Field::Title, title)
            .with(Field::Priority, priority)
    }

    fn setup() -> (ViewRegistry, crate::registry::ViewHandle) {
        let registry = ViewRegistry::default();
        let handle = registry.register(ViewKey::new(
            ViewKind::List,
            Filter::all(),
            SortKey::asc(Field::Priority),
        ));
        registry
            .hydrate(&handle, vec![task(1, "a", 1), task(2, "b", 2), task(3, "c", 3)])
            .unwrap();
        (registry, handle)
    }

    #[test]
    fn exact_restore_after_reorder() {
        let (registry, handle) = setup();
        let before = registry.snapshot(handle.id()).unwrap();
        let snapshot = EntitySnapshot::capture(&registry, EntityId::Real(1));

        let broadcaster = Broadcaster::new(registry.clone());
        let patch = FieldMap::from([(Field::Priority, FieldValue::Int(10))]);
        broadcaster.apply(CacheOp::Patch(EntityId::Real(1), patch), Commit::Optimistic);
        assert_ne!(registry.snapshot(handle.id()).unwrap().groups, before.groups);

        snapshot.restore(&registry, None);
        assert_eq!(registry.snapshot(handle.id()).unwrap().groups, before.groups);
    }

    #[test]
    fn field_restore_keeps_other_edits() {
        let (registry, _handle) = setup();
        let snapshot = EntitySnapshot::capture(&registry, EntityId::Real(2));
        let broadcaster = Broadcaster::new(registry.clone());

        broadcaster.apply(
            CacheOp::Patch(EntityId::Real(2), FieldMap::from([(Field::Title, FieldValue::text("B"))])),
            Commit::Optimistic,
        );
        broadcaster.apply(
            CacheOp::Patch(EntityId::Real(2), FieldMap::from([(Field::Priority, FieldValue::Int(9))])),
            Commit::Optimistic,
        );

        snapshot.restore(&registry, Some(&[Field::Title]));
        let entity = registry.cached(&EntityId::Real(2)).unwrap();
        assert_eq!(entity.get(Field::Title), &FieldValue::text("b"));
        assert_eq!(entity.get(Field::Priority), &FieldValue::Int(9));
    }

    #[test]
    fn created_entity_is_removed() {
        let (registry, handle) = setup();
        let temp = EntityId::temp();
        let snapshot = EntitySnapshot::capture(&registry, temp);
        assert!(snapshot.is_empty());

        Broadcaster::new(registry.clone()).apply(
            CacheOp::Create(ViewEntity::new(temp).with(Field::Title, "t")),
            Commit::Optimistic,
        );
        assert_eq!(handle.current().len(), 4);

        assert_eq!(snapshot.restore(&registry, None), 1);
        assert_eq!(handle.current().len(), 3);
    }

    #[test]
    fn failed_removal_brings_back_selection_and_thread() {
        let (registry, handle) = setup();
        let before = registry.snapshot(handle.id()).unwrap();
        registry.select(EntityId::Real(3));
        registry.select(EntityId::Real(2));
        registry.focus(Some(EntityId::Real(2)));
        registry.link_thread(EntityId::Real(2), EntityId::Real(50));
        let snapshot = EntitySnapshot::capture(&registry, EntityId::Real(2));

        Broadcaster::new(registry.clone()).apply(CacheOp::Remove(EntityId::Real(2)), Commit::Optimistic);
        assert_eq!(registry.selection().selected(), vec![EntityId::Real(3)]);

        snapshot.restore(&registry, None);
        assert_eq!(registry.snapshot(handle.id()).unwrap().groups, before.groups);
        let selection = registry.selection();
        assert_eq!(selection.selected(), vec![EntityId::Real(3), EntityId::Real(2)]);
        assert_eq!(selection.focused(), Some(EntityId::Real(2)));
        assert_eq!(registry.thread_for(&EntityId::Real(2)), Some(EntityId::Real(50)));
    }

    #[test]
    fn rolled_back_create_leaves_no_references() {
        let (registry, _handle) = setup();
        let temp = EntityId::temp();
        let snapshot = EntitySnapshot::capture(&registry, temp);
        Broadcaster::new(registry.clone()).apply(
            CacheOp::Create(ViewEntity::new(temp).with(Field::Title, "t")),
            Commit::Optimistic,
        );
        registry.select(temp);
        registry.focus(Some(temp));
        registry.link_thread(temp, EntityId::temp());

        snapshot.restore(&registry, None);
        let selection = registry.selection();
        assert!(selection.selected().is_empty());
        assert_eq!(selection.focused(), None);
        assert_eq!(registry.thread_for(&temp), None);
    }
}
