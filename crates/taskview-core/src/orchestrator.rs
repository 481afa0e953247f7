//! Mutation orchestrator
//!
//! Every user action runs the same lifecycle:
//!
//! 1. Validate and build the optimistic change (malformed input stops here)
//! 2. Capture a snapshot of the entity and broadcast the optimistic change
//! 3. Write to the backend
//! 4. Commit the authoritative entity, or restore the snapshot
//!
//! Concurrent mutations against the same entity are tracked per field.
//! The most recently issued mutation owns a field until it settles; neither
//! a commit nor a rollback of an older mutation may overwrite it.
//!
//! Once a delete commits, its id is tombstoned: later commits, rollbacks and
//! ingests of that id leave the caches alone. Settled ledger records, and the
//! tombstones and placeholder resolutions they carry, are evicted oldest
//! first past the configured ledger capacity.

use crate::backend::Backend;
use crate::config::EngineConfig;
use crate::error::{BackendError, MutationError};
use crate::intent::{MutationIntent, MutationKind};
use crate::notice::MutationNotice;
use crate::state_machine::{MutationId, MutationPhase, MutationRecord};
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use taskview_cache::{
    Broadcaster, CacheOp, Commit, EntitySnapshot, ReconcileOutcome, Reconciler, SearchIndex,
    ViewHandle, ViewKey, ViewRegistry,
};
use taskview_entity::{
    EntityId, Field, FieldMap, FieldValue, NormalizeError, Normalizer, RawEntity,
    RelationDirectory, TempId, ViewEntity,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, trace, warn, Instrument};

/// Final state of one mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    /// Backend confirmed; the authoritative entity is in every matching view
    Committed(ViewEntity),
    /// Backend failed; optimistic state was undone
    RolledBack(MutationError),
}

impl MutationOutcome {
    /// Whether the mutation committed
    #[inline]
    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }

    /// Committed entity
    #[must_use]
    pub fn entity(&self) -> Option<&ViewEntity> {
        match self {
            Self::Committed(entity) => Some(entity),
            Self::RolledBack(_) => None,
        }
    }

    /// Rollback cause
    #[must_use]
    pub fn error(&self) -> Option<&MutationError> {
        match self {
            Self::Committed(_) => None,
            Self::RolledBack(error) => Some(error),
        }
    }

    /// Convert to a `Result`
    ///
    /// # Errors
    /// The rollback cause.
    pub fn into_result(self) -> Result<ViewEntity, MutationError> {
        match self {
            Self::Committed(entity) => Ok(entity),
            Self::RolledBack(error) => Err(error),
        }
    }
}

/// Validated mutation, ready to apply
#[derive(Debug, Clone)]
pub(crate) struct Prepared {
    pub(crate) mutation: MutationId,
    pub(crate) kind: MutationKind,
    /// Id the caches know the entity by
    pub(crate) entity: EntityId,
    pub(crate) op: CacheOp,
    /// Primary fields sent to the backend
    pub(crate) write: FieldMap,
    /// Fields this mutation claims while in flight
    pub(crate) owned: Vec<Field>,
}

/// Prepared mutation whose optimistic change is visible
#[derive(Debug)]
pub(crate) struct Applied {
    pub(crate) prepared: Prepared,
    pub(crate) snapshot: EntitySnapshot,
}

struct Inner {
    config: EngineConfig,
    registry: ViewRegistry,
    broadcaster: Broadcaster,
    reconciler: Reconciler,
    normalizer: RwLock<Normalizer>,
    backend: Arc<dyn Backend>,
    ledger: DashMap<MutationId, MutationRecord>,
    settled: Mutex<VecDeque<MutationId>>,
    active: DashMap<EntityId, Vec<(MutationId, MutationKind)>>,
    owners: DashMap<(EntityId, Field), MutationId>,
    resolved: DashMap<TempId, u64>,
    tombstones: DashSet<EntityId>,
    notices: broadcast::Sender<MutationNotice>,
}

/// Builder for [`MutationOrchestrator`]
pub struct OrchestratorBuilder {
    config: EngineConfig,
    backend: Arc<dyn Backend>,
    registry: Option<ViewRegistry>,
    search: Option<Arc<dyn SearchIndex>>,
    directory: RelationDirectory,
}

impl OrchestratorBuilder {
    /// Share an existing view registry
    #[must_use]
    pub fn with_registry(mut self, registry: ViewRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Keep a search index in step with committed changes
    #[must_use]
    pub fn with_search(mut self, search: Arc<dyn SearchIndex>) -> Self {
        self.search = Some(search);
        self
    }

    /// Start from a populated relation directory
    #[must_use]
    pub fn with_directory(mut self, directory: RelationDirectory) -> Self {
        self.directory = directory;
        self
    }

    /// Build the orchestrator
    #[must_use]
    pub fn build(self) -> MutationOrchestrator {
        let registry = self
            .registry
            .unwrap_or_else(|| ViewRegistry::new(self.config.patch_policy()));
        let mut broadcaster = Broadcaster::new(registry.clone());
        if let Some(search) = self.search {
            broadcaster = broadcaster.with_search(search);
        }
        let (notices, _) = broadcast::channel(self.config.notice_capacity.max(1));

        MutationOrchestrator {
            inner: Arc::new(Inner {
                reconciler: Reconciler::new(broadcaster.clone()),
                broadcaster,
                registry,
                normalizer: RwLock::new(Normalizer::new(self.directory)),
                backend: self.backend,
                config: self.config,
                ledger: DashMap::new(),
                settled: Mutex::new(VecDeque::new()),
                active: DashMap::new(),
                owners: DashMap::new(),
                resolved: DashMap::new(),
                tombstones: DashSet::new(),
                notices,
            }),
        }
    }
}

/// Runs mutations against the view caches and the backend
#[derive(Clone)]
pub struct MutationOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MutationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationOrchestrator")
            .field("views", &self.inner.registry.len())
            .field("mutations", &self.inner.ledger.len())
            .finish_non_exhaustive()
    }
}

impl MutationOrchestrator {
    /// Orchestrator with a fresh registry and empty directory
    #[must_use]
    pub fn new(config: EngineConfig, backend: Arc<dyn Backend>) -> Self {
        Self::builder(config, backend).build()
    }

    /// Start building an orchestrator
    #[must_use]
    pub fn builder(config: EngineConfig, backend: Arc<dyn Backend>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            backend,
            registry: None,
            search: None,
            directory: RelationDirectory::new(),
        }
    }

    /// Configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// View registry
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &ViewRegistry {
        &self.inner.registry
    }

    pub(crate) fn reconciler(&self) -> &Reconciler {
        &self.inner.reconciler
    }

    /// Mount a view
    #[inline]
    pub fn register_view(&self, key: ViewKey) -> ViewHandle {
        self.inner.registry.register(key)
    }

    /// Unmount a view
    #[inline]
    pub fn unregister_view(&self, handle: ViewHandle) -> bool {
        self.inner.registry.unregister(handle)
    }

    /// Receive rollback and failure notices
    #[must_use]
    pub fn subscribe_notices(&self) -> broadcast::Receiver<MutationNotice> {
        self.inner.notices.subscribe()
    }

    /// Edit the relation directory
    pub fn update_directory(&self, f: impl FnOnce(&mut RelationDirectory)) {
        f(self.inner.normalizer.write().directory_mut());
    }

    /// Server id a placeholder resolved to, or `id` itself
    ///
    /// Resolutions are forgotten once the create's record leaves the ledger.
    #[must_use]
    pub fn resolve(&self, id: EntityId) -> EntityId {
        match id {
            EntityId::Temp(temp) => self
                .inner
                .resolved
                .get(&temp)
                .map_or(id, |real| EntityId::Real(*real)),
            real @ EntityId::Real(_) => real,
        }
    }

    /// Ledger entry of one mutation
    #[must_use]
    pub fn record(&self, id: MutationId) -> Option<MutationRecord> {
        self.inner.ledger.get(&id).map(|r| r.clone())
    }

    /// Retained ledger entries in issue order
    #[must_use]
    pub fn records(&self) -> Vec<MutationRecord> {
        let mut records: Vec<_> = self.inner.ledger.iter().map(|r| r.clone()).collect();
        records.sort_by_key(|r| r.id);
        records
    }

    /// Mutations with a write in flight
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.active.iter().map(|entry| entry.len()).sum()
    }

    /// Whether a committed delete removed `id`
    #[must_use]
    pub fn is_deleted(&self, id: &EntityId) -> bool {
        self.inner.tombstones.contains(&self.resolve(*id))
    }

    /// Run one mutation to completion
    ///
    /// A backend failure is not an error here: it rolls the optimistic
    /// change back and yields [`MutationOutcome::RolledBack`].
    ///
    /// # Errors
    /// - [`MutationError::MalformedEntity`] when the intent cannot be
    ///   normalized; no cache is touched
    /// - [`MutationError::UnknownEntity`] when the intent targets or
    ///   references a placeholder whose create has not committed
    pub async fn mutate(&self, intent: MutationIntent) -> Result<MutationOutcome, MutationError> {
        let prepared = self.prepare(intent, false)?;
        let span = info_span!(
            "mutation",
            id = %prepared.mutation,
            entity = %prepared.entity,
            kind = ?prepared.kind,
        );
        async move {
            let applied = self.apply_optimistic(prepared)?;
            Ok(self.settle(applied).await)
        }
        .instrument(span)
        .await
    }

    /// Run a mutation on the runtime without waiting for it
    pub fn spawn(
        &self,
        intent: MutationIntent,
    ) -> JoinHandle<Result<MutationOutcome, MutationError>> {
        let this = self.clone();
        tokio::spawn(async move { this.mutate(intent).await })
    }

    /// Apply an entity that arrived from outside any mutation
    ///
    /// Fields owned by in-flight mutations keep their optimistic values.
    /// Entities with a delete in flight or committed are left out of the
    /// caches.
    ///
    /// # Errors
    /// [`MutationError::MalformedEntity`]
    pub fn ingest(&self, raw: &RawEntity) -> Result<ViewEntity, MutationError> {
        let id = EntityId::Real(raw.id.ok_or(NormalizeError::MissingId)?);
        let previous = self.inner.registry.cached(&id);
        let entity = self.normalize(raw, previous.as_ref())?;

        if self.pending_delete(&id) || self.inner.tombstones.contains(&id) {
            debug!(entity = %id, "ingest skipped, entity deleted");
            return Ok(entity);
        }

        let visible = self.without_foreign_fields(entity.clone(), None);
        let report = self
            .inner
            .broadcaster
            .apply(CacheOp::Upsert(visible), Commit::Authoritative);
        debug!(entity = %id, changed = report.changed(), "ingested");
        Ok(entity)
    }

    /// Apply a deletion that happened outside any mutation
    pub fn ingest_removal(&self, id: u64) -> usize {
        self.inner
            .broadcaster
            .apply(CacheOp::Remove(EntityId::Real(id)), Commit::Authoritative)
            .changed()
    }

    /// Fetch one entity from the backend and ingest it
    ///
    /// # Errors
    /// [`MutationError::FetchFailed`] or [`MutationError::MalformedEntity`].
    pub async fn fetch(&self, id: u64) -> Result<ViewEntity, MutationError> {
        let raw = self
            .inner
            .backend
            .fetch_by_id(id)
            .await
            .map_err(|source| MutationError::FetchFailed {
                entity: EntityId::Real(id),
                source,
            })?;
        self.ingest(&raw)
    }

    /// Validate an intent and build its cache op
    ///
    /// With `allow_pending`, placeholders that have not resolved yet are
    /// accepted; composites resolve them before each step is written.
    pub(crate) fn prepare(
        &self,
        mut intent: MutationIntent,
        allow_pending: bool,
    ) -> Result<Prepared, MutationError> {
        intent.entity_id = self.resolve(intent.entity_id);
        self.resolve_refs(&mut intent.changed);

        let mutation = MutationId::new();
        let mut record = MutationRecord::new(mutation, intent.entity_id, intent.kind);

        match self.build_op(&intent, allow_pending) {
            Ok((op, owned)) => {
                self.inner.ledger.insert(mutation, record);
                Ok(Prepared {
                    mutation,
                    kind: intent.kind,
                    entity: intent.entity_id,
                    op,
                    write: writable(&intent.changed),
                    owned,
                })
            }
            Err(error) => {
                record.advance(MutationPhase::RolledBack)?;
                record.error = Some(error.clone());
                self.inner.ledger.insert(mutation, record);
                self.retire(mutation);
                debug!(%mutation, %error, "intent rejected before apply");
                Err(error)
            }
        }
    }

    fn build_op(
        &self,
        intent: &MutationIntent,
        allow_pending: bool,
    ) -> Result<(CacheOp, Vec<Field>), MutationError> {
        let id = intent.entity_id;
        if intent.kind != MutationKind::Create && self.inner.tombstones.contains(&id) {
            return Err(MutationError::UnknownEntity(id));
        }
        if !allow_pending {
            if intent.kind != MutationKind::Create && id.is_temp() {
                return Err(MutationError::UnknownEntity(id));
            }
            if let Some(temp) = intent.temp_refs().first() {
                return Err(MutationError::UnknownEntity(*temp));
            }
        }

        let normalizer = self.inner.normalizer.read();
        match intent.kind {
            MutationKind::Create => {
                if !id.is_temp() {
                    return Err(MutationError::UnknownEntity(id));
                }
                let mut fields = intent.changed.clone();
                let now = FieldValue::Time(Utc::now());
                fields.entry(Field::CreatedAt).or_insert_with(|| now.clone());
                fields.entry(Field::UpdatedAt).or_insert(now);

                let built = normalizer.build_optimistic(id, &fields)?;
                let entity = match &intent.optimistic {
                    Some(supplied) => ViewEntity {
                        id,
                        fields: supplied.fields.clone(),
                    },
                    None => built,
                };
                Ok((CacheOp::Create(entity), Vec::new()))
            }
            MutationKind::Update | MutationKind::Reparent => {
                let patch = normalizer.expand_patch(&intent.changed)?;
                let owned = patch.keys().copied().collect();
                let op = match &intent.optimistic {
                    Some(supplied) => CacheOp::Upsert(ViewEntity {
                        id,
                        fields: supplied.fields.clone(),
                    }),
                    None => CacheOp::Patch(id, patch),
                };
                Ok((op, owned))
            }
            MutationKind::Delete => Ok((CacheOp::Remove(id), Vec::new())),
        }
    }

    /// Snapshot, claim fields and broadcast the optimistic change
    pub(crate) fn apply_optimistic(&self, prepared: Prepared) -> Result<Applied, MutationError> {
        self.advance(prepared.mutation, MutationPhase::OptimisticallyApplied)?;
        let snapshot = EntitySnapshot::capture(&self.inner.registry, prepared.entity);
        self.inner
            .active
            .entry(prepared.entity)
            .or_default()
            .push((prepared.mutation, prepared.kind));
        for field in &prepared.owned {
            self.inner
                .owners
                .insert((prepared.entity, *field), prepared.mutation);
        }
        let report = self
            .inner
            .broadcaster
            .apply(prepared.op.clone(), Commit::Optimistic);
        debug!(
            mutation = %prepared.mutation,
            changed = report.changed(),
            views = snapshot.views().len(),
            "optimistic change applied"
        );
        Ok(Applied { prepared, snapshot })
    }

    /// Write, then commit or roll back
    pub(crate) async fn settle(&self, applied: Applied) -> MutationOutcome {
        match self.finish(&applied).await {
            Ok(entity) => MutationOutcome::Committed(entity),
            Err(error) => self.rollback(&applied, error),
        }
    }

    /// Write and commit, leaving any rollback to the caller
    pub(crate) async fn finish(&self, applied: &Applied) -> Result<ViewEntity, MutationError> {
        let raw = self.write(&applied.prepared).await?;
        self.commit(applied, raw)
    }

    async fn write(&self, prepared: &Prepared) -> Result<Option<RawEntity>, MutationError> {
        let mut fields = prepared.write.clone();
        self.resolve_refs(&mut fields);
        if let Some(temp) = fields
            .values()
            .filter_map(FieldValue::as_ref_id)
            .find(EntityId::is_temp)
        {
            return Err(MutationError::UnknownEntity(temp));
        }

        let backend = &self.inner.backend;
        let result: Result<Option<RawEntity>, BackendError> = match prepared.kind {
            MutationKind::Create => backend.create(fields).await.map(Some),
            MutationKind::Update | MutationKind::Reparent => {
                let id = self.real_id(prepared.entity)?;
                backend.update(id, fields).await.map(Some)
            }
            MutationKind::Delete => {
                let id = self.real_id(prepared.entity)?;
                backend.delete(id).await.map(|()| None)
            }
        };
        result.map_err(|source| MutationError::write_failed(prepared.entity, source))
    }

    fn commit(&self, applied: &Applied, raw: Option<RawEntity>) -> Result<ViewEntity, MutationError> {
        let prepared = &applied.prepared;
        let entity = match (prepared.kind, raw) {
            (MutationKind::Delete, _) => {
                self.inner
                    .broadcaster
                    .apply(CacheOp::Remove(prepared.entity), Commit::Authoritative);
                let id = self.resolve(prepared.entity);
                self.inner.tombstones.insert(id);
                if id != prepared.entity {
                    if let Some(mut record) = self.inner.ledger.get_mut(&prepared.mutation) {
                        record.reconciled = Some(id);
                    }
                }
                applied
                    .snapshot
                    .prior()
                    .cloned()
                    .unwrap_or_else(|| ViewEntity::new(prepared.entity))
            }
            (MutationKind::Create, Some(raw)) => self.commit_create(prepared, &raw)?,
            (MutationKind::Update | MutationKind::Reparent, Some(raw)) => {
                let id = EntityId::Real(raw.id.ok_or(NormalizeError::MissingId)?);
                let previous = self.inner.registry.cached(&id);
                let entity = self.normalize(&raw, previous.as_ref())?;
                if self.inner.tombstones.contains(&id) {
                    debug!(entity = %id, "commit not cached, entity deleted");
                    entity
                } else {
                    let visible = self.without_foreign_fields(entity.clone(), Some(prepared.mutation));
                    self.inner
                        .broadcaster
                        .apply(CacheOp::Upsert(visible), Commit::Authoritative);
                    self.inner.registry.cached(&id).unwrap_or(entity)
                }
            }
            (_, None) => return Err(MutationError::UnknownEntity(prepared.entity)),
        };

        self.release(prepared);
        self.advance(prepared.mutation, MutationPhase::Committed)?;
        self.retire(prepared.mutation);
        info!(mutation = %prepared.mutation, entity = %entity.id, "mutation committed");
        Ok(entity)
    }

    fn commit_create(&self, prepared: &Prepared, raw: &RawEntity) -> Result<ViewEntity, MutationError> {
        let previous = self.inner.registry.cached(&prepared.entity);
        let entity = self.normalize(raw, previous.as_ref())?;
        if let (Some(temp), Some(real)) = (prepared.entity.temp_id(), entity.id.real()) {
            self.inner.resolved.insert(temp, real);
        }

        let outcome = self.inner.reconciler.reconcile(prepared.entity, entity.clone());
        if let Some(mut record) = self.inner.ledger.get_mut(&prepared.mutation) {
            record.reconciled = Some(entity.id);
            if outcome == ReconcileOutcome::Orphaned {
                record.error = Some(MutationError::ReconciliationConflict {
                    temp: prepared.entity,
                    real: entity.id,
                });
            }
        }
        Ok(self.inner.registry.cached(&entity.id).unwrap_or(entity))
    }

    /// Restore the snapshot without clobbering newer mutations
    pub(crate) fn rollback(&self, applied: &Applied, error: MutationError) -> MutationOutcome {
        let prepared = &applied.prepared;
        let restored = self.undo(applied, &error);
        warn!(
            mutation = %prepared.mutation,
            entity = %prepared.entity,
            restored,
            %error,
            "mutation rolled back"
        );
        self.notify(MutationNotice::RolledBack {
            mutation: prepared.mutation,
            entity: prepared.entity,
            error: error.clone(),
        });
        MutationOutcome::RolledBack(error)
    }

    /// Roll back without a notice; returns the instances restored
    pub(crate) fn undo(&self, applied: &Applied, error: &MutationError) -> usize {
        let prepared = &applied.prepared;
        let contested = self.contested(&prepared.entity, prepared.mutation);
        let deleted = self.inner.tombstones.contains(&self.resolve(prepared.entity));

        let restored = match prepared.kind {
            _ if deleted => {
                debug!(entity = %prepared.entity, "restore skipped, entity deleted");
                0
            }
            MutationKind::Update | MutationKind::Reparent if contested => {
                let still_owned: Vec<Field> = prepared
                    .owned
                    .iter()
                    .copied()
                    .filter(|field| {
                        self.inner
                            .owners
                            .get(&(prepared.entity, *field))
                            .is_some_and(|owner| *owner == prepared.mutation)
                    })
                    .collect();
                applied
                    .snapshot
                    .restore(&self.inner.registry, Some(&still_owned))
            }
            _ => applied.snapshot.restore(&self.inner.registry, None),
        };

        self.release(prepared);
        if let Some(mut record) = self.inner.ledger.get_mut(&prepared.mutation) {
            if let Err(illegal) = record.advance(MutationPhase::RolledBack) {
                warn!(%illegal, "rollback after settle");
            }
            record.error = Some(error.clone());
        }
        self.retire(prepared.mutation);
        restored
    }

    /// Mark prepared but never applied mutations as rolled back
    pub(crate) fn abandon(&self, prepared: &Prepared, error: &MutationError) {
        if let Some(mut record) = self.inner.ledger.get_mut(&prepared.mutation) {
            if record.advance(MutationPhase::RolledBack).is_ok() {
                record.error = Some(error.clone());
            }
        }
        self.retire(prepared.mutation);
    }

    /// Queue a settled record for eviction and evict past capacity
    fn retire(&self, mutation: MutationId) {
        let evicted: Vec<MutationId> = {
            let mut settled = self.inner.settled.lock();
            settled.push_back(mutation);
            let excess = settled.len().saturating_sub(self.inner.config.ledger_capacity);
            settled.drain(..excess).collect()
        };

        for old in evicted {
            let Some((_, record)) = self.inner.ledger.remove(&old) else {
                continue;
            };
            match (record.kind, record.entity) {
                (MutationKind::Create, EntityId::Temp(temp)) => {
                    self.inner.resolved.remove(&temp);
                }
                (MutationKind::Delete, entity) if record.phase == MutationPhase::Committed => {
                    self.inner.tombstones.remove(&record.reconciled.unwrap_or(entity));
                }
                _ => {}
            }
            trace!(mutation = %old, "ledger record evicted");
        }
    }

    pub(crate) fn notify(&self, notice: MutationNotice) {
        if self.inner.notices.send(notice).is_err() {
            debug!("no notice subscribers");
        }
    }

    pub(crate) fn advance(&self, mutation: MutationId, to: MutationPhase) -> Result<(), MutationError> {
        match self.inner.ledger.get_mut(&mutation) {
            Some(mut record) => record.advance(to),
            None => Err(MutationError::IllegalTransition {
                mutation,
                from: MutationPhase::Idle,
                to,
            }),
        }
    }

    fn normalize(&self, raw: &RawEntity, previous: Option<&ViewEntity>) -> Result<ViewEntity, MutationError> {
        let mut normalizer = self.inner.normalizer.write();
        normalizer.directory_mut().observe(raw);
        Ok(normalizer.normalize(raw, previous)?)
    }

    fn resolve_refs(&self, fields: &mut FieldMap) {
        for value in fields.values_mut() {
            if let FieldValue::Ref(id) = value {
                *id = self.resolve(*id);
            }
        }
    }

    fn real_id(&self, id: EntityId) -> Result<u64, MutationError> {
        self.resolve(id)
            .real()
            .ok_or(MutationError::UnknownEntity(id))
    }

    /// Drop fields owned by in-flight mutations other than `me`
    fn without_foreign_fields(&self, mut entity: ViewEntity, me: Option<MutationId>) -> ViewEntity {
        let id = entity.id;
        let foreign = |field: Field| {
            self.inner
                .owners
                .get(&(id, field))
                .is_some_and(|owner| Some(*owner) != me)
        };
        entity.fields.retain(|field, _| {
            !foreign(*field) && !field.source().is_some_and(|source| foreign(source))
        });
        entity
    }

    fn release(&self, prepared: &Prepared) {
        for field in &prepared.owned {
            self.inner
                .owners
                .remove_if(&(prepared.entity, *field), |_, owner| *owner == prepared.mutation);
        }
        if let Some(mut active) = self.inner.active.get_mut(&prepared.entity) {
            active.retain(|(mutation, _)| *mutation != prepared.mutation);
        }
        self.inner
            .active
            .remove_if(&prepared.entity, |_, active| active.is_empty());
    }

    /// Another mutation on `entity` is still in flight
    fn contested(&self, entity: &EntityId, me: MutationId) -> bool {
        self.inner
            .active
            .get(entity)
            .is_some_and(|active| active.iter().any(|(mutation, _)| *mutation != me))
    }

    fn pending_delete(&self, entity: &EntityId) -> bool {
        self.inner
            .active
            .get(entity)
            .is_some_and(|active| active.iter().any(|(_, kind)| *kind == MutationKind::Delete))
    }
}

/// Primary fields the backend stores; timestamps are server-owned
fn writable(changed: &FieldMap) -> FieldMap {
    changed
        .iter()
        .filter(|(field, _)| {
            !field.is_denormalized() && !matches!(field, Field::CreatedAt | Field::UpdatedAt)
        })
        .map(|(field, value)| (*field, value.clone()))
        .collect()
}
