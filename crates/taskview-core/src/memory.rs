//! In-memory backend with failure injection
//!
//! Used by the simulator and tests. Stores primary fields only, so every
//! response is a narrow projection that the normalizer has to complete.

use crate::backend::{Backend, RawMessage, ThreadBackend};
use crate::error::BackendError;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use taskview_entity::{EntityId, Field, FieldMap, FieldValue, RawEntity, UserId};
use tracing::trace;

/// Backend call kinds, for failure scripting and call counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    /// `create`
    Create,
    /// `update`
    Update,
    /// `delete`
    Delete,
    /// `fetch_by_id`
    Fetch,
    /// `create_thread`
    CreateThread,
    /// `add_watchers`
    AddWatchers,
    /// `remove_watcher`
    RemoveWatcher,
    /// `post_message`
    PostMessage,
}

/// Stored thread
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryThread {
    /// Linked task
    pub entity: Option<u64>,
    /// Watchers
    pub watchers: BTreeSet<UserId>,
    /// Messages in post order
    pub messages: Vec<RawMessage>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: u64,
    tasks: BTreeMap<u64, FieldMap>,
    threads: BTreeMap<u64, MemoryThread>,
    last_stamp: Option<DateTime<Utc>>,
}

impl MemoryState {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    // Strictly increasing so recency order is total
    fn stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last_stamp {
            Some(last) if now <= last => last + TimeDelta::microseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }
}

/// Backend holding everything in memory
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    scripted: Mutex<HashMap<BackendOp, usize>>,
    random: Mutex<Option<(StdRng, f64)>>,
    latency: Option<Duration>,
    calls: DashMap<BackendOp, usize>,
}

impl MemoryBackend {
    /// Empty backend that never fails
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail each write with probability `rate`, reproducibly
    #[must_use]
    pub fn with_failure_rate(self, seed: u64, rate: f64) -> Self {
        *self.random.lock() = Some((StdRng::seed_from_u64(seed), rate.clamp(0.0, 1.0)));
        self
    }

    /// Delay every call
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next `count` calls of `op`
    pub fn fail_next(&self, op: BackendOp, count: usize) {
        *self.scripted.lock().entry(op).or_default() += count;
    }

    /// Calls made so far, failed ones included
    #[must_use]
    pub fn calls(&self, op: BackendOp) -> usize {
        self.calls.get(&op).map_or(0, |c| *c)
    }

    /// Store a task directly, bypassing failure injection
    pub fn seed(&self, fields: FieldMap) -> RawEntity {
        let mut state = self.state.lock();
        let id = state.allocate();
        let stored = Self::stored(&mut state, FieldMap::new(), fields);
        state.tasks.insert(id, stored.clone());
        RawEntity::new(id, stored)
    }

    /// Stored task
    #[must_use]
    pub fn task(&self, id: u64) -> Option<RawEntity> {
        self.state
            .lock()
            .tasks
            .get(&id)
            .map(|fields| RawEntity::new(id, fields.clone()))
    }

    /// All stored tasks by id
    #[must_use]
    pub fn tasks(&self) -> Vec<RawEntity> {
        self.state
            .lock()
            .tasks
            .iter()
            .map(|(id, fields)| RawEntity::new(*id, fields.clone()))
            .collect()
    }

    /// Stored thread
    #[must_use]
    pub fn thread(&self, id: u64) -> Option<MemoryThread> {
        self.state.lock().threads.get(&id).cloned()
    }

    async fn enter(&self, op: BackendOp) -> Result<(), BackendError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        *self.calls.entry(op).or_default() += 1;

        {
            let mut scripted = self.scripted.lock();
            if let Some(remaining) = scripted.get_mut(&op) {
                if *remaining > 0 {
                    *remaining -= 1;
                    trace!(?op, "scripted failure");
                    return Err(BackendError::Unavailable(format!("scripted {op:?} failure")));
                }
            }
        }

        let reads = matches!(op, BackendOp::Fetch);
        if let Some((rng, rate)) = self.random.lock().as_mut() {
            if !reads && rng.random_bool(*rate) {
                trace!(?op, "random failure");
                return Err(BackendError::Unavailable(format!("random {op:?} failure")));
            }
        }
        Ok(())
    }

    fn stored(state: &mut MemoryState, base: FieldMap, changed: FieldMap) -> FieldMap {
        let mut fields = base;
        fields.extend(
            changed
                .into_iter()
                .filter(|(f, _)| !f.is_denormalized() && !matches!(f, Field::CreatedAt | Field::UpdatedAt)),
        );
        let now = state.stamp();
        fields.entry(Field::CreatedAt).or_insert(FieldValue::Time(now));
        fields.insert(Field::UpdatedAt, FieldValue::Time(now));
        fields
    }

    fn check_refs(fields: &FieldMap) -> Result<(), BackendError> {
        match fields
            .values()
            .filter_map(FieldValue::as_ref_id)
            .find(EntityId::is_temp)
        {
            Some(temp) => Err(BackendError::Rejected(format!("unresolved placeholder {temp}"))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn create(&self, fields: FieldMap) -> Result<RawEntity, BackendError> {
        self.enter(BackendOp::Create).await?;
        Self::check_refs(&fields)?;
        if fields.get(&Field::Title).map_or(true, FieldValue::is_null) {
            return Err(BackendError::Rejected("title is required".into()));
        }
        let mut state = self.state.lock();
        let id = state.allocate();
        let stored = Self::stored(&mut state, FieldMap::new(), fields);
        state.tasks.insert(id, stored.clone());
        Ok(RawEntity::new(id, stored))
    }

    async fn update(&self, id: u64, fields: FieldMap) -> Result<RawEntity, BackendError> {
        self.enter(BackendOp::Update).await?;
        Self::check_refs(&fields)?;
        if fields.get(&Field::Title).is_some_and(FieldValue::is_null) {
            return Err(BackendError::Rejected("title is required".into()));
        }
        let mut state = self.state.lock();
        let base = state.tasks.get(&id).cloned().ok_or(BackendError::NotFound(id))?;
        let stored = Self::stored(&mut state, base, fields);
        state.tasks.insert(id, stored.clone());
        Ok(RawEntity::new(id, stored))
    }

    async fn delete(&self, id: u64) -> Result<(), BackendError> {
        self.enter(BackendOp::Delete).await?;
        let mut state = self.state.lock();
        state.tasks.remove(&id).ok_or(BackendError::NotFound(id))?;
        state.threads.retain(|_, t| t.entity != Some(id));
        Ok(())
    }

    async fn fetch_by_id(&self, id: u64) -> Result<RawEntity, BackendError> {
        self.enter(BackendOp::Fetch).await?;
        self.task(id).ok_or(BackendError::NotFound(id))
    }
}

#[async_trait]
impl ThreadBackend for MemoryBackend {
    async fn create_thread(&self, entity: Option<u64>) -> Result<u64, BackendError> {
        self.enter(BackendOp::CreateThread).await?;
        let mut state = self.state.lock();
        if let Some(task) = entity {
            if !state.tasks.contains_key(&task) {
                return Err(BackendError::NotFound(task));
            }
        }
        let id = state.allocate();
        state.threads.insert(
            id,
            MemoryThread {
                entity,
                ..MemoryThread::default()
            },
        );
        Ok(id)
    }

    async fn add_watchers(&self, thread: u64, users: Vec<UserId>) -> Result<(), BackendError> {
        self.enter(BackendOp::AddWatchers).await?;
        let mut state = self.state.lock();
        let stored = state.threads.get_mut(&thread).ok_or(BackendError::NotFound(thread))?;
        stored.watchers.extend(users);
        Ok(())
    }

    async fn remove_watcher(&self, thread: u64, user: UserId) -> Result<(), BackendError> {
        self.enter(BackendOp::RemoveWatcher).await?;
        let mut state = self.state.lock();
        let stored = state.threads.get_mut(&thread).ok_or(BackendError::NotFound(thread))?;
        stored.watchers.remove(&user);
        Ok(())
    }

    async fn post_message(
        &self,
        thread: u64,
        author: UserId,
        body: String,
    ) -> Result<RawMessage, BackendError> {
        self.enter(BackendOp::PostMessage).await?;
        let mut state = self.state.lock();
        if !state.threads.contains_key(&thread) {
            return Err(BackendError::NotFound(thread));
        }
        let id = state.allocate();
        let message = RawMessage {
            id,
            author,
            body,
            sent_at: state.stamp(),
        };
        if let Some(stored) = state.threads.get_mut(&thread) {
            stored.messages.push(message.clone());
        }
        Ok(message)
    }
}
