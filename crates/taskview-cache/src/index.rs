//! Auxiliary indices that hold entity ids outside the view caches

use indexmap::IndexSet;
use std::collections::HashMap;
use taskview_entity::EntityId;

/// An index that must follow id swaps and removals
pub trait RefIndex {
    /// Replace every occurrence of `from` with `to`
    fn replace_id(&mut self, from: &EntityId, to: &EntityId) -> bool;

    /// Drop every occurrence of `id`
    fn remove_id(&mut self, id: &EntityId) -> bool;
}

/// Selected and focused entities
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionState {
    selected: IndexSet<EntityId>,
    focused: Option<EntityId>,
}

impl SelectionState {
    /// Add to the selection, keeping selection order
    pub fn select(&mut self, id: EntityId) -> bool {
        self.selected.insert(id)
    }

    /// Remove from the selection
    pub fn deselect(&mut self, id: &EntityId) -> bool {
        self.selected.shift_remove(id)
    }

    /// Focus one entity
    pub fn focus(&mut self, id: Option<EntityId>) {
        self.focused = id;
    }

    /// Focused entity
    #[must_use]
    pub fn focused(&self) -> Option<EntityId> {
        self.focused
    }

    /// Selected ids in selection order
    #[must_use]
    pub fn selected(&self) -> Vec<EntityId> {
        self.selected.iter().copied().collect()
    }

    /// Whether `id` is selected
    #[must_use]
    pub fn is_selected(&self, id: &EntityId) -> bool {
        self.selected.contains(id)
    }

    /// Selection order of `id`
    #[must_use]
    pub fn position(&self, id: &EntityId) -> Option<usize> {
        self.selected.get_index_of(id)
    }

    /// Select `id` at `index`, clamped to the selection length
    pub fn select_at(&mut self, id: EntityId, index: usize) -> bool {
        let (end, inserted) = self.selected.insert_full(id);
        if inserted {
            self.selected.move_index(end, index.min(end));
        }
        inserted
    }
}

impl RefIndex for SelectionState {
    fn replace_id(&mut self, from: &EntityId, to: &EntityId) -> bool {
        let mut changed = false;
        if let Some(index) = self.selected.get_index_of(from) {
            self.selected.shift_remove_index(index);
            if !self.selected.contains(to) {
                let (end, _) = self.selected.insert_full(*to);
                self.selected.move_index(end, index.min(end));
            }
            changed = true;
        }
        if self.focused == Some(*from) {
            self.focused = Some(*to);
            changed = true;
        }
        changed
    }

    fn remove_id(&mut self, id: &EntityId) -> bool {
        let mut changed = self.selected.shift_remove(id);
        if self.focused == Some(*id) {
            self.focused = None;
            changed = true;
        }
        changed
    }
}

/// 1:1 links between entities and their comment threads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadLinks {
    by_entity: HashMap<EntityId, EntityId>,
}

impl ThreadLinks {
    /// Link `thread` to `entity`, replacing any previous link
    pub fn link(&mut self, entity: EntityId, thread: EntityId) -> Option<EntityId> {
        self.by_entity.insert(entity, thread)
    }

    /// Remove the link for `entity`
    pub fn unlink(&mut self, entity: &EntityId) -> Option<EntityId> {
        self.by_entity.remove(entity)
    }

    /// Thread linked to `entity`
    #[must_use]
    pub fn thread_for(&self, entity: &EntityId) -> Option<EntityId> {
        self.by_entity.get(entity).copied()
    }

    /// Entity a thread belongs to
    #[must_use]
    pub fn entity_for(&self, thread: &EntityId) -> Option<EntityId> {
        self.by_entity
            .iter()
            .find(|(_, t)| *t == thread)
            .map(|(e, _)| *e)
    }

    /// Number of links
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_entity.len()
    }

    /// Whether there are no links
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_entity.is_empty()
    }
}

impl RefIndex for ThreadLinks {
    fn replace_id(&mut self, from: &EntityId, to: &EntityId) -> bool {
        let mut changed = false;
        if let Some(thread) = self.by_entity.remove(from) {
            self.by_entity.insert(*to, thread);
            changed = true;
        }
        for thread in self.by_entity.values_mut() {
            if thread == from {
                *thread = *to;
                changed = true;
            }
        }
        changed
    }

    fn remove_id(&mut self, id: &EntityId) -> bool {
        let before = self.by_entity.len();
        self.by_entity.retain(|entity, thread| entity != id && thread != id);
        before != self.by_entity.len()
    }
}
