//! Seeded coherence simulator
//!
//! Drives random intents against the in-memory backend and, after every
//! step, checks the view caches against the backend:
//! - each entity appears at most once per view
//! - each cached entity matches its view's predicate and sits in its group
//! - no placeholder id survives a settled step
//! - each view holds exactly the backend rows its predicate selects, with
//!   the backend's field values

use crate::composite::CompositeOutcome;
use crate::config::EngineConfig;
use crate::error::MutationError;
use crate::intent::MutationIntent;
use crate::memory::MemoryBackend;
use crate::orchestrator::{MutationOrchestrator, MutationOutcome};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeSet, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use taskview_cache::{Condition, Filter, SortKey, ViewHandle, ViewKey, ViewKind};
use taskview_entity::{
    EntityId, Field, FieldMap, FieldValue, Normalizer, RawProject, RawStatus, RawUser,
    RelationDirectory, UserId, ViewEntity,
};
use tracing::{debug, info};

/// Simulator configuration
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Operations to run
    pub ops: u64,
    /// Probability that a backend write fails
    pub failure_rate: f64,
    /// Tasks stored before the first operation
    pub initial_tasks: usize,
    /// Stop at the first violation
    pub stop_on_violation: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            ops: 500,
            failure_rate: 0.1,
            initial_tasks: 8,
            stop_on_violation: true,
        }
    }
}

/// One simulated user action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedOperation {
    /// Create a task
    Create,
    /// Change one field
    Update,
    /// Two field edits on one task at once
    ConcurrentUpdate,
    /// Move a task under another, or detach it
    Reparent,
    /// Delete a task
    Delete,
    /// Promote a task into a parent and child
    Promote,
    /// Another client created a task
    RemoteCreate,
    /// Refresh one task from the backend
    Refresh,
}

impl SimulatedOperation {
    const ALL: [SimulatedOperation; 8] = [
        Self::Create,
        Self::Update,
        Self::ConcurrentUpdate,
        Self::Reparent,
        Self::Delete,
        Self::Promote,
        Self::RemoteCreate,
        Self::Refresh,
    ];
}

/// A broken coherence rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// Same entity twice in one view
    Duplicate {
        /// Step
        step: u64,
        /// View key kind
        view: ViewKind,
        /// Entity
        entity: EntityId,
    },
    /// Cached entity fails the view predicate or sits in the wrong group
    Misplaced {
        /// Step
        step: u64,
        /// View key kind
        view: ViewKind,
        /// Entity
        entity: EntityId,
    },
    /// Placeholder id or reference left after settling
    Placeholder {
        /// Step
        step: u64,
        /// Entity holding it
        entity: EntityId,
    },
    /// View contents differ from the backend
    Diverged {
        /// Step
        step: u64,
        /// View key kind
        view: ViewKind,
        /// Backend rows the view is missing
        missing: Vec<EntityId>,
        /// Cached entities the backend does not select
        extra: Vec<EntityId>,
    },
    /// Cached field value differs from the backend
    StaleField {
        /// Step
        step: u64,
        /// Entity
        entity: EntityId,
        /// Field
        field: Field,
    },
    /// A mutation never settled
    Unsettled {
        /// Step
        step: u64,
        /// Mutations still in flight
        count: usize,
    },
    /// Engine returned an error no random intent should cause
    UnexpectedError {
        /// Step
        step: u64,
        /// Operation
        operation: SimulatedOperation,
        /// Error text
        error: String,
    },
}

/// Statistics for one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatorStats {
    /// Operations run
    pub operations: u64,
    /// Mutations committed
    pub committed: u64,
    /// Mutations rolled back
    pub rolled_back: u64,
    /// Composites that committed only partly
    pub partial_composites: u64,
    /// Remote changes ingested
    pub ingested: u64,
}

/// Final report
#[derive(Debug, Clone)]
pub struct SimulatorReport {
    /// Configuration used
    pub config: SimulatorConfig,
    /// Counters
    pub stats: SimulatorStats,
    /// Violations found
    pub violations: Vec<Violation>,
}

impl SimulatorReport {
    /// No violations
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Human-readable report
    #[must_use]
    pub fn generate_text(&self) -> String {
        let mut report = String::new();
        let _ = writeln!(report, "=== taskview simulator report ===\n");
        let _ = writeln!(report, "Seed: {}", self.config.seed);
        let _ = writeln!(report, "Failure rate: {}", self.config.failure_rate);
        let _ = writeln!(report, "Operations: {}", self.stats.operations);
        let _ = writeln!(report, "Committed: {}", self.stats.committed);
        let _ = writeln!(report, "Rolled back: {}", self.stats.rolled_back);
        let _ = writeln!(report, "Partial composites: {}", self.stats.partial_composites);
        let _ = writeln!(report, "Ingested: {}", self.stats.ingested);
        let _ = writeln!(report, "Violations: {}", self.violations.len());

        if !self.violations.is_empty() {
            let _ = writeln!(report, "\n=== Violations ===");
            for (i, v) in self.violations.iter().enumerate() {
                let _ = writeln!(report, "{}. {v:?}", i + 1);
            }
        }

        let _ = writeln!(
            report,
            "\n=== Result: {} ===",
            if self.passed() { "PASS" } else { "FAIL" }
        );
        report
    }
}

/// Relations every simulated task draws from
#[must_use]
pub fn sample_directory() -> RelationDirectory {
    let mut directory = RelationDirectory::new();
    for (id, name, color) in [(1, "Todo", "gray"), (2, "Doing", "blue"), (3, "Done", "green")] {
        directory.insert_status(RawStatus {
            id,
            name: name.into(),
            color: color.into(),
        });
    }
    for (id, name) in [(1, "Ada"), (2, "Grace"), (3, "Linus")] {
        directory.insert_user(RawUser {
            id,
            display_name: name.into(),
        });
    }
    for (id, name, color) in [(1, "Platform", "red"), (2, "Website", "teal")] {
        directory.insert_project(RawProject {
            id,
            name: name.into(),
            color: color.into(),
        });
    }
    directory
}

/// Views the simulator keeps mounted
#[must_use]
pub fn sample_views() -> Vec<ViewKey> {
    vec![
        ViewKey::new(ViewKind::List, Filter::all(), SortKey::desc(Field::CreatedAt)),
        ViewKey::new(ViewKind::Board, Filter::all(), SortKey::asc(Field::Priority))
            .grouped_by(Field::StatusId),
        ViewKey::new(
            ViewKind::List,
            Filter::all().and(Condition::Eq(Field::ProjectId, FieldValue::Int(1))),
            SortKey::asc(Field::Title),
        ),
        ViewKey::new(
            ViewKind::Calendar,
            Filter::all().and(Condition::In(
                Field::Priority,
                vec![FieldValue::Int(2), FieldValue::Int(3)],
            )),
            SortKey::asc(Field::CreatedAt),
        ),
        ViewKey::new(
            ViewKind::Board,
            Filter::all().and(Condition::IsNull(Field::ParentId)),
            SortKey::desc(Field::UpdatedAt),
        )
        .grouped_by(Field::AssigneeId),
    ]
}

struct Harness {
    rng: StdRng,
    backend: Arc<MemoryBackend>,
    orchestrator: MutationOrchestrator,
    checker: Normalizer,
    views: Vec<ViewHandle>,
    stats: SimulatorStats,
}

/// Run the simulator
pub async fn run_simulator(config: SimulatorConfig) -> SimulatorReport {
    let backend = Arc::new(
        MemoryBackend::new().with_failure_rate(config.seed.wrapping_add(1), config.failure_rate),
    );
    let orchestrator = MutationOrchestrator::builder(EngineConfig::default(), backend.clone())
        .with_directory(sample_directory())
        .build();
    let mut harness = Harness {
        rng: StdRng::seed_from_u64(config.seed),
        views: sample_views()
            .into_iter()
            .map(|key| orchestrator.register_view(key))
            .collect(),
        checker: Normalizer::new(sample_directory()),
        backend,
        orchestrator,
        stats: SimulatorStats::default(),
    };
    harness.seed(config.initial_tasks);

    let mut violations = Vec::new();
    for step in 0..config.ops {
        let operation = *SimulatedOperation::ALL
            .choose(&mut harness.rng)
            .unwrap_or(&SimulatedOperation::Create);
        debug!(step, ?operation, "simulated operation");

        if let Err(error) = harness.execute(operation).await {
            violations.push(Violation::UnexpectedError {
                step,
                operation,
                error: error.to_string(),
            });
        }
        harness.stats.operations += 1;
        violations.extend(harness.check(step));

        if config.stop_on_violation && !violations.is_empty() {
            break;
        }
    }

    info!(
        operations = harness.stats.operations,
        violations = violations.len(),
        "simulation finished"
    );
    SimulatorReport {
        config,
        stats: harness.stats,
        violations,
    }
}

impl Harness {
    fn seed(&mut self, count: usize) {
        for _ in 0..count {
            let fields = self.random_fields();
            let raw = self.backend.seed(fields);
            if self.orchestrator.ingest(&raw).is_ok() {
                self.stats.ingested += 1;
            }
        }
    }

    fn random_fields(&mut self) -> FieldMap {
        let n: u32 = self.rng.random_range(0..10_000);
        let mut fields = FieldMap::from([
            (Field::Title, FieldValue::text(format!("task {n}"))),
            (Field::Priority, FieldValue::Int(self.rng.random_range(0..4))),
        ]);
        fields.insert(Field::StatusId, self.random_status());
        fields.insert(Field::ProjectId, FieldValue::Int(self.rng.random_range(1..=2)));
        if self.rng.random_bool(0.5) {
            fields.insert(
                Field::AssigneeId,
                FieldValue::User(UserId(self.rng.random_range(1..=3))),
            );
        }
        fields
    }

    fn random_status(&mut self) -> FieldValue {
        if self.rng.random_bool(0.2) {
            FieldValue::Null
        } else {
            FieldValue::Int(self.rng.random_range(1..=3))
        }
    }

    fn random_task(&mut self) -> Option<EntityId> {
        let ids: Vec<u64> = self.backend.tasks().iter().filter_map(|t| t.id).collect();
        ids.choose(&mut self.rng).map(|id| EntityId::Real(*id))
    }

    fn tally(&mut self, outcome: &MutationOutcome) {
        match outcome {
            MutationOutcome::Committed(_) => self.stats.committed += 1,
            MutationOutcome::RolledBack(_) => self.stats.rolled_back += 1,
        }
    }

    async fn execute(&mut self, operation: SimulatedOperation) -> Result<(), MutationError> {
        match operation {
            SimulatedOperation::Create => {
                let fields = self.random_fields();
                let outcome = self.orchestrator.mutate(MutationIntent::create(fields)).await?;
                self.tally(&outcome);
            }
            SimulatedOperation::Update => {
                let Some(id) = self.random_task() else {
                    return Ok(());
                };
                let intent = match self.rng.random_range(0..3) {
                    0 => MutationIntent::set(id, Field::StatusId, self.random_status()),
                    1 => MutationIntent::set(id, Field::Priority, self.rng.random_range(0..4_i64)),
                    _ => MutationIntent::set(
                        id,
                        Field::AssigneeId,
                        FieldValue::User(UserId(self.rng.random_range(1..=3))),
                    ),
                };
                let outcome = self.orchestrator.mutate(intent).await?;
                self.tally(&outcome);
            }
            SimulatedOperation::ConcurrentUpdate => {
                let Some(id) = self.random_task() else {
                    return Ok(());
                };
                let status = MutationIntent::set(id, Field::StatusId, self.random_status());
                let priority =
                    MutationIntent::set(id, Field::Priority, self.rng.random_range(0..4_i64));
                let (a, b) = futures::join!(
                    self.orchestrator.mutate(status),
                    self.orchestrator.mutate(priority)
                );
                self.tally(&a?);
                self.tally(&b?);
            }
            SimulatedOperation::Reparent => {
                let Some(id) = self.random_task() else {
                    return Ok(());
                };
                let parent = if self.rng.random_bool(0.3) {
                    None
                } else {
                    self.random_task().filter(|p| *p != id)
                };
                let outcome = self
                    .orchestrator
                    .mutate(MutationIntent::reparent(id, parent))
                    .await?;
                self.tally(&outcome);
            }
            SimulatedOperation::Delete => {
                let Some(id) = self.random_task() else {
                    return Ok(());
                };
                let outcome = self.orchestrator.mutate(MutationIntent::delete(id)).await?;
                self.tally(&outcome);
            }
            SimulatedOperation::Promote => {
                let Some(id) = self.random_task() else {
                    return Ok(());
                };
                let n: u32 = self.rng.random_range(0..10_000);
                match self.orchestrator.promote_task(id, format!("child {n}")).await? {
                    CompositeOutcome::Committed(steps) => {
                        self.stats.committed += steps.len() as u64;
                    }
                    CompositeOutcome::Failed(error) if error.is_partial() => {
                        self.stats.partial_composites += 1;
                    }
                    CompositeOutcome::Failed(_) => self.stats.rolled_back += 1,
                }
            }
            SimulatedOperation::RemoteCreate => {
                let fields = self.random_fields();
                let raw = self.backend.seed(fields);
                self.orchestrator.ingest(&raw)?;
                self.stats.ingested += 1;
            }
            SimulatedOperation::Refresh => {
                let Some(id) = self.random_task().and_then(|id| id.real()) else {
                    return Ok(());
                };
                self.orchestrator.fetch(id).await?;
                self.stats.ingested += 1;
            }
        }
        Ok(())
    }

    fn check(&self, step: u64) -> Vec<Violation> {
        let mut violations = Vec::new();

        let in_flight = self.orchestrator.in_flight();
        if in_flight > 0 {
            violations.push(Violation::Unsettled {
                step,
                count: in_flight,
            });
        }

        let expected: Vec<ViewEntity> = self
            .backend
            .tasks()
            .iter()
            .filter_map(|raw| self.checker.normalize(raw, None).ok())
            .collect();

        for handle in &self.views {
            let key = handle.key();
            let snapshot = handle.current();
            let mut seen = HashSet::new();

            for (group, entities) in &snapshot.groups {
                for entity in entities {
                    if !seen.insert(entity.id) {
                        violations.push(Violation::Duplicate {
                            step,
                            view: key.kind,
                            entity: entity.id,
                        });
                    }
                    if !key.matches(entity).unwrap_or(false) || key.group_of(entity) != *group {
                        violations.push(Violation::Misplaced {
                            step,
                            view: key.kind,
                            entity: entity.id,
                        });
                    }
                    let placeholder = entity.id.is_temp()
                        || entity
                            .fields
                            .values()
                            .filter_map(FieldValue::as_ref_id)
                            .any(|r| r.is_temp());
                    if placeholder {
                        violations.push(Violation::Placeholder {
                            step,
                            entity: entity.id,
                        });
                    }
                }
            }

            let wanted: BTreeSet<EntityId> = expected
                .iter()
                .filter(|e| key.matches(e).unwrap_or(false))
                .map(|e| e.id)
                .collect();
            let cached: BTreeSet<EntityId> = seen.into_iter().collect();
            if wanted != cached {
                violations.push(Violation::Diverged {
                    step,
                    view: key.kind,
                    missing: wanted.difference(&cached).copied().collect(),
                    extra: cached.difference(&wanted).copied().collect(),
                });
            }
        }

        for entity in &expected {
            let Some(cached) = self.orchestrator.registry().cached(&entity.id) else {
                continue;
            };
            if let Some((field, _)) = entity
                .fields
                .iter()
                .find(|(field, value)| cached.get(**field) != *value)
            {
                violations.push(Violation::StaleField {
                    step,
                    entity: entity.id,
                    field: *field,
                });
            }
        }

        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reliable_backend_stays_coherent() {
        let report = run_simulator(SimulatorConfig {
            seed: 7,
            ops: 150,
            failure_rate: 0.0,
            ..SimulatorConfig::default()
        })
        .await;
        assert!(report.passed(), "{}", report.generate_text());
        assert_eq!(report.stats.rolled_back, 0);
    }

    #[tokio::test]
    async fn failing_backend_stays_coherent() {
        let report = run_simulator(SimulatorConfig {
            seed: 11,
            ops: 300,
            failure_rate: 0.3,
            ..SimulatorConfig::default()
        })
        .await;
        assert!(report.passed(), "{}", report.generate_text());
        assert!(report.stats.rolled_back > 0);
    }

    #[test]
    fn report_names_result() {
        let report = SimulatorReport {
            config: SimulatorConfig::default(),
            stats: SimulatorStats::default(),
            violations: vec![Violation::Unsettled { step: 3, count: 1 }],
        };
        let text = report.generate_text();
        assert!(text.contains("Result: FAIL"));
        assert!(text.contains("Unsettled"));
    }
}
