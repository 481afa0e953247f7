//! Registry of live view cache instances
//!
//! Instances are created lazily on first registration and destroyed when the
//! last handle is unregistered. The registry is an explicit object shared by
//! reference; there is no process-wide store.

use crate::cache::{Location, PatchPolicy, ViewCache, ViewSnapshot};
use crate::error::CacheError;
use crate::index::{SelectionState, ThreadLinks};
use crate::view::{GroupKey, ViewKey};
use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use taskview_entity::{EntityId, ViewEntity};
use tokio::sync::watch;
use tracing::debug;

/// Identifier of one cache instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ViewId(pub u64);

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "view#{}", self.0)
    }
}

/// Subscription to one cache instance
///
/// Dropping a handle does not unregister it; pass it to
/// [`ViewRegistry::unregister`].
#[derive(Debug)]
pub struct ViewHandle {
    id: ViewId,
    key: ViewKey,
    receiver: watch::Receiver<Arc<ViewSnapshot>>,
}

impl ViewHandle {
    /// Instance id
    #[inline]
    #[must_use]
    pub fn id(&self) -> ViewId {
        self.id
    }

    /// Instance parameters
    #[inline]
    #[must_use]
    pub fn key(&self) -> &ViewKey {
        &self.key
    }

    /// Latest published contents
    #[must_use]
    pub fn current(&self) -> Arc<ViewSnapshot> {
        self.receiver.borrow().clone()
    }

    /// A fresh receiver for the stream of published contents
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<ViewSnapshot>> {
        self.receiver.clone()
    }

    /// Wait for the next publish; `None` once the instance is destroyed
    pub async fn changed(&mut self) -> Option<Arc<ViewSnapshot>> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }
}

#[derive(Debug, Default)]
pub(crate) struct RegistryState {
    pub(crate) instances: IndexMap<ViewId, ViewCache>,
    by_key: HashMap<ViewKey, ViewId>,
    pub(crate) selection: SelectionState,
    pub(crate) threads: ThreadLinks,
    next_id: u64,
}

impl RegistryState {
    /// Publish every instance changed since the last publish
    pub(crate) fn publish_all(&mut self) -> usize {
        self.instances
            .values_mut()
            .map(ViewCache::publish)
            .filter(|published| *published)
            .count()
    }
}

/// Explicit registry of live view caches
#[derive(Debug, Clone, Default)]
pub struct ViewRegistry {
    state: Arc<Mutex<RegistryState>>,
    policy: PatchPolicy,
}

impl ViewRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(policy: PatchPolicy) -> Self {
        Self {
            state: Arc::new(Mutex::new(RegistryState::default())),
            policy,
        }
    }

    /// Patching rules
    #[inline]
    #[must_use]
    pub fn policy(&self) -> PatchPolicy {
        self.policy
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock()
    }

    /// Subscribe to the instance for `key`, creating it if needed
    pub fn register(&self, key: ViewKey) -> ViewHandle {
        let mut state = self.lock();
        let id = match state.by_key.get(&key) {
            Some(id) => *id,
            None => {
                state.next_id += 1;
                let id = ViewId(state.next_id);
                state.by_key.insert(key.clone(), id);
                debug!(view = %id, kind = ?key.kind, "view instance created");
                id
            }
        };

        let cache = state
            .instances
            .entry(id)
            .or_insert_with(|| ViewCache::new(id, key.clone()));
        cache.subscribers += 1;
        let (receiver, subscribers) = (cache.subscribe(), cache.subscribers);
        debug!(view = %id, subscribers, "view registered");
        ViewHandle { id, key, receiver }
    }

    /// Drop a subscription; returns true if the instance was destroyed
    pub fn unregister(&self, handle: ViewHandle) -> bool {
        let mut state = self.lock();
        let Some(cache) = state.instances.get_mut(&handle.id) else {
            return false;
        };
        cache.subscribers = cache.subscribers.saturating_sub(1);
        if cache.subscribers > 0 {
            debug!(view = %handle.id, subscribers = cache.subscribers, "view unregistered");
            return false;
        }
        state.instances.shift_remove(&handle.id);
        state.by_key.remove(&handle.key);
        debug!(view = %handle.id, "view instance destroyed");
        true
    }

    /// Load the first page of every group from one fetch
    ///
    /// Groups the instance holds that are absent from the fetch are cleared.
    ///
    /// # Errors
    /// [`CacheError::UnknownView`] if the instance is gone.
    pub fn hydrate(&self, handle: &ViewHandle, entities: Vec<ViewEntity>) -> Result<(), CacheError> {
        let mut state = self.lock();
        let cache = state
            .instances
            .get_mut(&handle.id)
            .ok_or(CacheError::UnknownView(handle.id))?;

        let mut grouped: BTreeMap<GroupKey, Vec<ViewEntity>> = cache
            .snapshot()
            .groups
            .into_iter()
            .map(|(group, _)| (group, Vec::new()))
            .collect();
        for entity in entities {
            grouped
                .entry(cache.key().group_of(&entity))
                .or_default()
                .push(entity);
        }
        for (group, page) in grouped {
            cache.hydrate(group, 0, page)?;
        }
        cache.publish();
        Ok(())
    }

    /// Load one page of one group
    ///
    /// # Errors
    /// [`CacheError::UnknownView`] or [`CacheError::PageOutOfRange`].
    pub fn hydrate_page(
        &self,
        handle: &ViewHandle,
        group: GroupKey,
        page: usize,
        entities: Vec<ViewEntity>,
    ) -> Result<(), CacheError> {
        let mut state = self.lock();
        let cache = state
            .instances
            .get_mut(&handle.id)
            .ok_or(CacheError::UnknownView(handle.id))?;
        cache.hydrate(group, page, entities)?;
        cache.publish();
        Ok(())
    }

    /// Current contents of an instance, read under the lock
    ///
    /// # Errors
    /// [`CacheError::UnknownView`] if the instance is gone.
    pub fn snapshot(&self, view: ViewId) -> Result<ViewSnapshot, CacheError> {
        self.lock()
            .instances
            .get(&view)
            .map(ViewCache::snapshot)
            .ok_or(CacheError::UnknownView(view))
    }

    /// Contents of every instance, read under one lock
    #[must_use]
    pub fn snapshot_all(&self) -> Vec<ViewSnapshot> {
        self.lock().instances.values().map(ViewCache::snapshot).collect()
    }

    /// Parameters of an instance
    #[must_use]
    pub fn key_of(&self, view: ViewId) -> Option<ViewKey> {
        self.lock().instances.get(&view).map(|c| c.key().clone())
    }

    /// Where `id` sits in each instance holding it
    #[must_use]
    pub fn locate(&self, id: &EntityId) -> Vec<(ViewId, Location)> {
        self.lock()
            .instances
            .iter()
            .filter_map(|(view, cache)| cache.find(id).map(|loc| (*view, loc)))
            .collect()
    }

    /// First cached copy of an entity
    #[must_use]
    pub fn cached(&self, id: &EntityId) -> Option<ViewEntity> {
        let state = self.lock();
        state.instances.values().find_map(|cache| {
            cache
                .find(id)
                .and_then(|loc| cache.get(&loc).cloned())
        })
    }

    /// Ids of live instances
    #[must_use]
    pub fn views(&self) -> Vec<ViewId> {
        self.lock().instances.keys().copied().collect()
    }

    /// Instance registered for `key`
    #[must_use]
    pub fn find_view(&self, key: &ViewKey) -> Option<ViewId> {
        self.lock().by_key.get(key).copied()
    }

    /// Number of live instances
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().instances.len()
    }

    /// Whether no instance is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().instances.is_empty()
    }

    /// Add an entity to the selection
    pub fn select(&self, id: EntityId) -> bool {
        self.lock().selection.select(id)
    }

    /// Remove an entity from the selection
    pub fn deselect(&self, id: &EntityId) -> bool {
        self.lock().selection.deselect(id)
    }

    /// Focus an entity
    pub fn focus(&self, id: Option<EntityId>) {
        self.lock().selection.focus(id);
    }

    /// Current selection and focus
    #[must_use]
    pub fn selection(&self) -> SelectionState {
        self.lock().selection.clone()
    }

    /// Link a thread to an entity
    pub fn link_thread(&self, entity: EntityId, thread: EntityId) {
        self.lock().threads.link(entity, thread);
    }

    /// Drop the thread link of an entity
    pub fn unlink_thread(&self, entity: &EntityId) -> Option<EntityId> {
        self.lock().threads.unlink(entity)
    }

    /// Thread linked to an entity
    #[must_use]
    pub fn thread_for(&self, entity: &EntityId) -> Option<EntityId> {
        self.lock().threads.thread_for(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::{Filter, SortKey, ViewKind};
    use taskview_entity::Field;

    fn list() -> ViewKey {
        ViewKey::new(ViewKind::List, Filter::all(), SortKey::desc(Field::CreatedAt))
    }

    fn task(id: u64) -> ViewEntity {
        ViewEntity::new(EntityId::Real(id)).with(Field::Title, format!("task {id}"))
    }

    #[test]
    fn same_key_shares_one_instance() {
        let registry = ViewRegistry::default();
        let a = registry.register(list());
        let b = registry.register(list());
        assert_eq!(a.id(), b.id());
        assert_eq!(registry.len(), 1);

        assert!(!registry.unregister(a));
        assert_eq!(registry.len(), 1);
        assert!(registry.unregister(b));
        assert!(registry.is_empty());
        assert_eq!(registry.find_view(&list()), None);
    }

    #[test]
    fn hydrate_publishes_to_handle() {
        let registry = ViewRegistry::default();
        let handle = registry.register(list());
        registry.hydrate(&handle, vec![task(1), task(2)]).unwrap();

        let current = handle.current();
        assert_eq!(current.len(), 2);
        assert_eq!(registry.cached(&EntityId::Real(2)), Some(task(2)));
        assert_eq!(registry.locate(&EntityId::Real(1)).len(), 1);
    }

    #[test]
    fn hydrate_clears_groups_missing_from_fetch() {
        let registry = ViewRegistry::default();
        let key = ViewKey::new(ViewKind::Board, Filter::all(), SortKey::asc(Field::Title))
            .grouped_by(Field::StatusId);
        let handle = registry.register(key);
        registry
            .hydrate(&handle, vec![task(1).with(Field::StatusId, 1_i64), task(2)])
            .unwrap();
        assert_eq!(handle.current().groups.len(), 2);

        registry.hydrate(&handle, vec![task(2)]).unwrap();
        assert_eq!(handle.current().ids(), vec![EntityId::Real(2)]);
    }

    #[tokio::test]
    async fn changed_ends_when_instance_destroyed() {
        let registry = ViewRegistry::default();
        let mut watcher = registry.register(list());
        let other = registry.register(list());

        registry.hydrate(&other, vec![task(1)]).unwrap();
        let snapshot = watcher.changed().await.unwrap();
        assert_eq!(snapshot.len(), 1);

        let mut receiver = watcher.subscribe();
        registry.unregister(other);
        assert!(registry.unregister(watcher));
        assert!(receiver.changed().await.is_err());
    }

    #[test]
    fn snapshot_of_unknown_view_fails() {
        let registry = ViewRegistry::default();
        assert_eq!(
            registry.snapshot(ViewId(7)),
            Err(CacheError::UnknownView(ViewId(7)))
        );
    }
}
