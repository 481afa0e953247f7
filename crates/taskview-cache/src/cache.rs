//! A single view cache instance
//!
//! Entities are held per group, per loaded page. Pages are persistent
//! vectors so publishing a snapshot to subscribers is a cheap clone.
//!
//! Invariant: an entity id appears at most once across all groups and pages
//! of an instance.

use crate::error::{CacheError, PredicateError};
use crate::registry::ViewId;
use crate::view::{GroupKey, ViewKey};
use im::Vector;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use taskview_entity::{EntityId, Field, FieldValue, ViewEntity};
use tokio::sync::watch;

/// Position of an entity inside an instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location {
    /// Group
    pub group: GroupKey,
    /// Page within the group
    pub page: usize,
    /// Index within the page
    pub index: usize,
}

/// What a patch did to one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// Nothing to do
    Unchanged,
    /// Entity entered the instance
    Inserted,
    /// Entity replaced in place
    Replaced,
    /// Entity changed group or sort position
    Moved,
    /// Entity left the instance
    Removed,
    /// Entity sits on a later page, left for the next fetch
    Stale,
}

impl Change {
    /// Whether the instance contents changed
    #[inline]
    #[must_use]
    pub fn is_mutation(self) -> bool {
        !matches!(self, Change::Unchanged | Change::Stale)
    }
}

/// Whether an upsert comes from a fresh create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertMode {
    /// Newly created entity; recency-sorted views take it at the head
    Created,
    /// Shallow merge onto the cached copy
    Merge,
}

/// Patching rules shared by every instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchPolicy {
    /// Field that defines "most recent"
    pub recency_field: Field,
    /// Leave entities on later pages stale instead of patching them
    pub first_page_only: bool,
}

impl Default for PatchPolicy {
    fn default() -> Self {
        Self {
            recency_field: Field::CreatedAt,
            first_page_only: true,
        }
    }
}

/// Ordered contents of an instance as published to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewSnapshot {
    /// Instance
    pub view: ViewId,
    /// Monotonic publish counter
    pub version: u64,
    /// Groups in key order, pages concatenated
    pub groups: Vec<(GroupKey, Vector<ViewEntity>)>,
}

impl ViewSnapshot {
    /// Every entity, group by group
    pub fn entities(&self) -> impl Iterator<Item = &ViewEntity> {
        self.groups.iter().flat_map(|(_, entities)| entities.iter())
    }

    /// Ids in display order
    #[must_use]
    pub fn ids(&self) -> Vec<EntityId> {
        self.entities().map(|e| e.id).collect()
    }

    /// Number of entities
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.iter().map(|(_, e)| e.len()).sum()
    }

    /// Whether the view is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the view shows `id`
    #[must_use]
    pub fn contains(&self, id: &EntityId) -> bool {
        self.entities().any(|e| e.id == *id)
    }

    /// Entity by id
    #[must_use]
    pub fn get(&self, id: &EntityId) -> Option<&ViewEntity> {
        self.entities().find(|e| e.id == *id)
    }

    /// Entities of one group
    #[must_use]
    pub fn group(&self, key: &GroupKey) -> Option<&Vector<ViewEntity>> {
        self.groups.iter().find(|(k, _)| k == key).map(|(_, e)| e)
    }
}

#[derive(Debug, Clone, Default)]
struct Group {
    pages: Vec<Vector<ViewEntity>>,
}

impl Group {
    fn is_empty(&self) -> bool {
        self.pages.iter().all(Vector::is_empty)
    }
}

/// One live cache instance
#[derive(Debug)]
pub(crate) struct ViewCache {
    id: ViewId,
    key: ViewKey,
    groups: BTreeMap<GroupKey, Group>,
    pub(crate) subscribers: usize,
    version: u64,
    dirty: bool,
    publisher: watch::Sender<Arc<ViewSnapshot>>,
}

impl ViewCache {
    pub(crate) fn new(id: ViewId, key: ViewKey) -> Self {
        let empty = ViewSnapshot {
            view: id,
            version: 0,
            groups: Vec::new(),
        };
        let (publisher, _) = watch::channel(Arc::new(empty));
        Self {
            id,
            key,
            groups: BTreeMap::new(),
            subscribers: 0,
            version: 0,
            dirty: false,
            publisher,
        }
    }

    pub(crate) fn key(&self) -> &ViewKey {
        &self.key
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Arc<ViewSnapshot>> {
        self.publisher.subscribe()
    }

    pub(crate) fn find(&self, id: &EntityId) -> Option<Location> {
        for (group, entry) in &self.groups {
            for (page, entities) in entry.pages.iter().enumerate() {
                if let Some(index) = entities.iter().position(|e| e.id == *id) {
                    return Some(Location {
                        group: group.clone(),
                        page,
                        index,
                    });
                }
            }
        }
        None
    }

    pub(crate) fn get(&self, location: &Location) -> Option<&ViewEntity> {
        self.groups
            .get(&location.group)
            .and_then(|g| g.pages.get(location.page))
            .and_then(|p| p.get(location.index))
    }

    pub(crate) fn entities(&self) -> impl Iterator<Item = &ViewEntity> {
        self.groups
            .values()
            .flat_map(|g| g.pages.iter())
            .flat_map(Vector::iter)
    }

    /// Upsert with shallow merge onto the cached copy
    pub(crate) fn upsert(
        &mut self,
        entity: &ViewEntity,
        mode: UpsertMode,
        policy: &PatchPolicy,
    ) -> Result<Change, PredicateError> {
        let existing = self.find(&entity.id);
        let candidate = match existing.as_ref().and_then(|loc| self.get(loc)) {
            Some(current) => {
                let mut merged = current.clone();
                merged.merge(&entity.fields);
                merged
            }
            None => entity.clone(),
        };
        let matches = self.key.matches(&candidate)?;

        let change = match existing {
            None if !matches => Change::Unchanged,
            None => {
                let group = self.key.group_of(&candidate);
                self.insert_sorted(candidate, group, mode, policy);
                Change::Inserted
            }
            Some(loc) if loc.page > 0 && policy.first_page_only => Change::Stale,
            Some(loc) if !matches => {
                self.remove_at(&loc);
                Change::Removed
            }
            Some(loc) => self.replace(loc, candidate, policy),
        };

        if change.is_mutation() {
            self.dirty = true;
        }
        Ok(change)
    }

    fn replace(&mut self, loc: Location, candidate: ViewEntity, policy: &PatchPolicy) -> Change {
        if self.get(&loc) == Some(&candidate) {
            return Change::Unchanged;
        }
        let target = self.key.group_of(&candidate);
        if target != loc.group {
            self.remove_at(&loc);
            self.insert_sorted(candidate, target, UpsertMode::Merge, policy);
            return Change::Moved;
        }

        let sort = self.key.sort;
        let Some(page) = self
            .groups
            .get_mut(&loc.group)
            .and_then(|g| g.pages.get_mut(loc.page))
        else {
            return Change::Unchanged;
        };
        if let Some(slot) = page.get_mut(loc.index) {
            *slot = candidate.clone();
        }

        let before_ok = loc.index == 0
            || page
                .get(loc.index - 1)
                .map_or(true, |prev| sort.compare(prev, &candidate).is_le());
        let after_ok = page
            .get(loc.index + 1)
            .map_or(true, |next| sort.compare(&candidate, next).is_le());
        if before_ok && after_ok {
            return Change::Replaced;
        }

        page.remove(loc.index);
        self.insert_sorted(candidate, target, UpsertMode::Merge, policy);
        Change::Moved
    }

    /// Remove an entity
    pub(crate) fn remove(&mut self, id: &EntityId, policy: &PatchPolicy) -> Change {
        let change = match self.find(id) {
            None => Change::Unchanged,
            Some(loc) if loc.page > 0 && policy.first_page_only => Change::Stale,
            Some(loc) => {
                self.remove_at(&loc);
                Change::Removed
            }
        };
        if change.is_mutation() {
            self.dirty = true;
        }
        change
    }

    /// Swap an entity's id in place, keeping its position
    ///
    /// An entry already holding `to` is dropped first so the instance never
    /// shows both.
    pub(crate) fn rename(&mut self, from: &EntityId, to: &EntityId) -> bool {
        if self.find(from).is_none() {
            return false;
        }
        if let Some(existing) = self.find(to) {
            self.remove_at(&existing);
        }
        let Some(loc) = self.find(from) else {
            return false;
        };
        if let Some(page) = self
            .groups
            .get_mut(&loc.group)
            .and_then(|g| g.pages.get_mut(loc.page))
        {
            if let Some(entity) = page.get_mut(loc.index) {
                entity.id = *to;
                self.dirty = true;
                return true;
            }
        }
        false
    }

    /// Rewrite `Ref(from)` values, including group keys, into `Ref(to)`
    pub(crate) fn rewrite_refs(&mut self, from: &EntityId, to: &EntityId, policy: &PatchPolicy) -> usize {
        let mut rewritten = 0;
        for group in self.groups.values_mut() {
            for page in &mut group.pages {
                for entity in page.iter_mut() {
                    if entity.references(from) {
                        entity.replace_refs(from, to);
                        rewritten += 1;
                    }
                }
            }
        }

        let old_key = GroupKey::Value(FieldValue::Ref(*from));
        if let Some(group) = self.groups.remove(&old_key) {
            let new_key = GroupKey::Value(FieldValue::Ref(*to));
            if self.groups.contains_key(&new_key) {
                let moved: Vec<ViewEntity> = group.pages.into_iter().flatten().collect();
                for entity in moved {
                    self.insert_sorted(entity, new_key.clone(), UpsertMode::Merge, policy);
                }
            } else {
                self.groups.insert(new_key, group);
            }
        }

        if rewritten > 0 {
            self.dirty = true;
        }
        rewritten
    }

    /// Load a fetched page
    pub(crate) fn hydrate(
        &mut self,
        group: GroupKey,
        page: usize,
        entities: Vec<ViewEntity>,
    ) -> Result<(), CacheError> {
        let loaded = self.groups.get(&group).map_or(0, |g| g.pages.len());
        if page > loaded {
            return Err(CacheError::PageOutOfRange {
                view: self.id,
                page,
                loaded,
            });
        }

        // Later occurrences win; earlier copies elsewhere go
        let mut seen = HashSet::new();
        let mut fresh = Vector::new();
        for entity in entities.into_iter().rev() {
            if seen.insert(entity.id) {
                fresh.push_front(entity);
            }
        }
        for (key, entry) in &mut self.groups {
            for (index, entities) in entry.pages.iter_mut().enumerate() {
                if *key == group && index == page {
                    continue;
                }
                entities.retain(|e| !seen.contains(&e.id));
            }
        }

        let entry = self.groups.entry(group.clone()).or_default();
        if page == entry.pages.len() {
            entry.pages.push(fresh);
        } else {
            entry.pages[page] = fresh;
        }
        self.groups.retain(|_, g| !g.is_empty());
        self.dirty = true;
        Ok(())
    }

    /// Put an entity back exactly where a snapshot saw it
    pub(crate) fn restore(&mut self, id: &EntityId, saved: Option<&(Location, ViewEntity)>) {
        if let Some(loc) = self.find(id) {
            self.remove_at(&loc);
            self.dirty = true;
        }
        let Some((loc, entity)) = saved else {
            return;
        };
        let group = self.groups.entry(loc.group.clone()).or_default();
        while group.pages.len() <= loc.page {
            group.pages.push(Vector::new());
        }
        let page = &mut group.pages[loc.page];
        let index = loc.index.min(page.len());
        page.insert(index, entity.clone());
        self.dirty = true;
    }

    /// Send the current contents to subscribers if anything changed
    pub(crate) fn publish(&mut self) -> bool {
        if !self.dirty {
            return false;
        }
        self.version += 1;
        self.dirty = false;
        let snapshot = self.snapshot();
        self.publisher.send_replace(Arc::new(snapshot));
        true
    }

    pub(crate) fn snapshot(&self) -> ViewSnapshot {
        ViewSnapshot {
            view: self.id,
            version: self.version,
            groups: self
                .groups
                .iter()
                .map(|(key, group)| {
                    let mut all = Vector::new();
                    for page in &group.pages {
                        all.append(page.clone());
                    }
                    (key.clone(), all)
                })
                .collect(),
        }
    }

    fn remove_at(&mut self, loc: &Location) {
        if let Some(group) = self.groups.get_mut(&loc.group) {
            if let Some(page) = group.pages.get_mut(loc.page) {
                if loc.index < page.len() {
                    page.remove(loc.index);
                }
            }
            if group.is_empty() {
                self.groups.remove(&loc.group);
            }
        }
    }

    fn insert_sorted(
        &mut self,
        entity: ViewEntity,
        group: GroupKey,
        mode: UpsertMode,
        policy: &PatchPolicy,
    ) {
        let sort = self.key.sort;
        let head = mode == UpsertMode::Created && sort.is_recency(policy.recency_field);
        let entry = self.groups.entry(group).or_default();
        if entry.pages.is_empty() {
            entry.pages.push(Vector::new());
        }

        // First slot whose occupant sorts after the entity. Only page 0 is
        // searched when later pages are left stale.
        let searched = if policy.first_page_only { 1 } else { entry.pages.len() };
        let slot = if head {
            Some((0, 0))
        } else {
            entry.pages[..searched].iter().enumerate().find_map(|(page, entities)| {
                entities
                    .iter()
                    .position(|existing| sort.compare(&entity, existing).is_lt())
                    .map(|index| (page, index))
            })
        };
        let (page, index) = match slot {
            // Page boundaries stay put: a head-of-page slot belongs to the
            // tail of the page before it
            Some((page, 0)) if page > 0 && !head => (page - 1, entry.pages[page - 1].len()),
            Some(slot) => slot,
            None => {
                let last = searched - 1;
                (last, entry.pages[last].len())
            }
        };
        entry.pages[page].insert(index, entity);
    }
}
