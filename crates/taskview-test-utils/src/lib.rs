//! Testing utilities for the taskview workspace
//!
//! Shared fixtures: raw tasks, a populated relation directory, the common
//! view keys and an orchestrator over the in-memory backend.

#![allow(missing_docs)]

use std::sync::Arc;
use taskview_cache::{Condition, Filter, SortKey, ViewHandle, ViewKey, ViewKind};
use taskview_core::{EngineConfig, MemoryBackend, MutationOrchestrator};
use taskview_entity::{EntityId, Field, FieldMap, FieldValue, RawEntity, RawStatus, ViewEntity};

pub use taskview_core::simulator::{sample_directory, sample_views};

pub fn fields(title: &str) -> FieldMap {
    FieldMap::from([(Field::Title, FieldValue::text(title))])
}

pub fn raw_task(id: u64, title: &str) -> RawEntity {
    RawEntity::new(id, fields(title))
}

pub fn raw_task_with(id: u64, title: &str, extra: &[(Field, FieldValue)]) -> RawEntity {
    let mut fields = fields(title);
    fields.extend(extra.iter().cloned());
    RawEntity::new(id, fields)
}

pub fn raw_task_with_status(id: u64, title: &str, status: u64) -> RawEntity {
    let status_id = i64::try_from(status).unwrap();
    raw_task_with(id, title, &[(Field::StatusId, FieldValue::Int(status_id))]).with_status(
        RawStatus {
            id: status,
            name: format!("status {status}"),
            color: "gray".into(),
        },
    )
}

pub fn view_task(id: u64, title: &str) -> ViewEntity {
    ViewEntity::new(EntityId::Real(id)).with(Field::Title, title)
}

/// Every task, newest first
pub fn recency_list() -> ViewKey {
    ViewKey::new(ViewKind::List, Filter::all(), SortKey::desc(Field::CreatedAt))
}

/// Kanban board with one column per status, `Null` being "no status"
pub fn status_board() -> ViewKey {
    ViewKey::new(ViewKind::Board, Filter::all(), SortKey::asc(Field::Priority))
        .grouped_by(Field::StatusId)
}

pub fn project_list(project: i64) -> ViewKey {
    ViewKey::new(
        ViewKind::List,
        Filter::all().and(Condition::Eq(Field::ProjectId, FieldValue::Int(project))),
        SortKey::asc(Field::Title),
    )
}

pub fn search(query: &str) -> ViewKey {
    ViewKey::new(
        ViewKind::Search,
        Filter::all().and(Condition::Search(query.into())),
        SortKey::desc(Field::UpdatedAt),
    )
}

pub struct Fixture {
    pub backend: Arc<MemoryBackend>,
    pub orchestrator: MutationOrchestrator,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_backend(MemoryBackend::new())
    }

    pub fn with_backend(backend: MemoryBackend) -> Self {
        Self::with_config(backend, EngineConfig::default())
    }

    pub fn with_config(backend: MemoryBackend, config: EngineConfig) -> Self {
        let backend = Arc::new(backend);
        let orchestrator = MutationOrchestrator::builder(config, backend.clone())
            .with_directory(sample_directory())
            .build();
        Self {
            backend,
            orchestrator,
        }
    }

    pub fn view(&self, key: ViewKey) -> ViewHandle {
        self.orchestrator.register_view(key)
    }

    /// Store a task in the backend and ingest it
    pub fn seed(&self, fields: FieldMap) -> EntityId {
        let raw = self.backend.seed(fields);
        self.orchestrator.ingest(&raw).unwrap().id
    }

    pub fn ids(&self, handle: &ViewHandle) -> Vec<EntityId> {
        handle.current().ids()
    }

    pub fn cached(&self, id: EntityId) -> ViewEntity {
        self.orchestrator.registry().cached(&id).unwrap()
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}
