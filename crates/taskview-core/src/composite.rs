//! Composite mutations
//!
//! A composite is one user action that needs several backend writes.
//! Every step is applied optimistically up front. Writes then run in
//! waves: steps in a wave are independent and run concurrently, and a
//! step waits for the wave that creates any placeholder it references.
//!
//! When a step fails, steps that already committed stay. The failed step
//! and every step not yet written are rolled back.

use crate::error::MutationError;
use crate::intent::{MutationIntent, MutationKind};
use crate::notice::MutationNotice;
use crate::orchestrator::{Applied, MutationOrchestrator, Prepared};
use futures::future::join_all;
use taskview_entity::{EntityId, Field, FieldMap, FieldValue, ViewEntity};
use tracing::{debug, info, info_span, warn, Instrument};

/// One write of a composite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeStep {
    /// Name reported on failure
    pub name: String,
    /// Intent
    pub intent: MutationIntent,
}

/// Ordered steps of one user action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositePlan {
    /// Action name
    pub name: String,
    /// Steps in issue order
    pub steps: Vec<CompositeStep>,
}

impl CompositePlan {
    /// Empty plan
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step
    #[must_use]
    pub fn step(mut self, name: impl Into<String>, intent: MutationIntent) -> Self {
        self.steps.push(CompositeStep {
            name: name.into(),
            intent,
        });
        self
    }

    /// Promote `original` into a new parent with a new sibling child
    ///
    /// Steps: `create-parent`, then `reparent-original` and `create-child`
    /// together once the parent has a server id.
    #[must_use]
    pub fn promote_task(original: &ViewEntity, child_title: impl Into<String>) -> Self {
        let mut parent_fields = FieldMap::new();
        for field in [Field::Title, Field::StatusId, Field::ProjectId, Field::AssigneeId] {
            let value = original.get(field);
            if !value.is_null() {
                parent_fields.insert(field, value.clone());
            }
        }
        let create_parent = MutationIntent::create(parent_fields);
        let parent = create_parent.entity_id;

        let mut child_fields = FieldMap::from([
            (Field::Title, FieldValue::text(child_title)),
            (Field::ParentId, FieldValue::Ref(parent)),
        ]);
        for field in [Field::StatusId, Field::ProjectId] {
            let value = original.get(field);
            if !value.is_null() {
                child_fields.insert(field, value.clone());
            }
        }

        Self::new("promote-task")
            .step("create-parent", create_parent)
            .step("reparent-original", MutationIntent::reparent(original.id, Some(parent)))
            .step("create-child", MutationIntent::create(child_fields))
    }

    /// Steps grouped into waves that can run concurrently
    ///
    /// A step joins the wave after the latest earlier step it depends on:
    /// one that creates a placeholder it references, or one that targets
    /// the same entity.
    #[must_use]
    pub fn waves(&self) -> Vec<Vec<usize>> {
        let mut level = vec![0_usize; self.steps.len()];
        for (i, step) in self.steps.iter().enumerate() {
            for (j, earlier) in self.steps[..i].iter().enumerate() {
                let creates_dependency = earlier.intent.kind == MutationKind::Create
                    && step.intent.depends_on(&earlier.intent.entity_id);
                if creates_dependency || earlier.intent.entity_id == step.intent.entity_id {
                    level[i] = level[i].max(level[j] + 1);
                }
            }
        }

        let depth = level.iter().max().map_or(0, |max| max + 1);
        let mut waves = vec![Vec::new(); depth];
        for (i, l) in level.into_iter().enumerate() {
            waves[l].push(i);
        }
        waves
    }
}

/// Final state of a composite
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompositeOutcome {
    /// Every step committed; committed entities by step name
    Committed(Vec<(String, ViewEntity)>),
    /// A step failed
    ///
    /// [`MutationError::PartialCompositeFailure`] when earlier steps stay
    /// committed, otherwise the failed step's own error.
    Failed(MutationError),
}

impl CompositeOutcome {
    /// Whether every step committed
    #[inline]
    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }

    /// Committed entity of a named step
    #[must_use]
    pub fn entity(&self, step: &str) -> Option<&ViewEntity> {
        match self {
            Self::Committed(steps) => steps.iter().find(|(name, _)| name == step).map(|(_, e)| e),
            Self::Failed(_) => None,
        }
    }
}

impl MutationOrchestrator {
    /// Run a composite plan
    ///
    /// # Errors
    /// [`MutationError::MalformedEntity`] when any step is malformed; no
    /// step is applied in that case.
    pub async fn run_composite(&self, plan: CompositePlan) -> Result<CompositeOutcome, MutationError> {
        let span = info_span!("composite", plan = %plan.name, steps = plan.steps.len());
        self.run_plan(plan).instrument(span).await
    }

    /// Promote a cached task into a parent and child
    ///
    /// # Errors
    /// [`MutationError::UnknownEntity`] when the task is not cached, or any
    /// error of [`MutationOrchestrator::run_composite`].
    pub async fn promote_task(
        &self,
        id: EntityId,
        child_title: impl Into<String>,
    ) -> Result<CompositeOutcome, MutationError> {
        let id = self.resolve(id);
        let original = self
            .registry()
            .cached(&id)
            .ok_or(MutationError::UnknownEntity(id))?;
        self.run_composite(CompositePlan::promote_task(&original, child_title))
            .await
    }

    async fn run_plan(&self, plan: CompositePlan) -> Result<CompositeOutcome, MutationError> {
        let waves = plan.waves();

        let mut prepared = Vec::with_capacity(plan.steps.len());
        for step in &plan.steps {
            match self.prepare(step.intent.clone(), true) {
                Ok(p) => prepared.push(p),
                Err(error) => {
                    for p in &prepared {
                        self.abandon(p, &error);
                    }
                    return Err(error);
                }
            }
        }

        let mut pending: Vec<Option<Applied>> = self.apply_all(prepared)?.into_iter().map(Some).collect();

        let mut committed: Vec<(String, ViewEntity)> = Vec::new();
        let mut own_errors: Vec<Option<MutationError>> = vec![None; pending.len()];
        let mut failure: Option<(usize, MutationError)> = None;

        for (n, wave) in waves.iter().enumerate() {
            let batch: Vec<(usize, Applied)> = wave
                .iter()
                .filter_map(|&i| pending[i].take().map(|a| (i, a)))
                .collect();
            debug!(wave = n, steps = batch.len(), "composite wave");

            let results = join_all(batch.into_iter().map(|(i, applied)| async move {
                let result = self.finish(&applied).await;
                (i, applied, result)
            }))
            .await;

            for (i, applied, result) in results {
                match result {
                    Ok(entity) => committed.push((plan.steps[i].name.clone(), entity)),
                    Err(error) => {
                        if failure.as_ref().map_or(true, |(f, _)| i < *f) {
                            failure = Some((i, error.clone()));
                        }
                        own_errors[i] = Some(error);
                        pending[i] = Some(applied);
                    }
                }
            }
            if failure.is_some() {
                break;
            }
        }

        let Some((failed, error)) = failure else {
            info!(plan = %plan.name, "composite committed");
            return Ok(CompositeOutcome::Committed(committed));
        };

        // Undo in reverse apply order so each snapshot sees the state it captured
        let mut skipped = Vec::new();
        for i in (0..pending.len()).rev() {
            let Some(applied) = pending[i].take() else {
                continue;
            };
            match own_errors[i].take() {
                Some(own) => {
                    self.rollback(&applied, own);
                }
                None => {
                    self.undo(&applied, &error);
                    skipped.push(plan.steps[i].name.clone());
                }
            }
        }
        skipped.reverse();
        self.rewrite_resolved(&plan);

        if committed.is_empty() {
            warn!(plan = %plan.name, step = %plan.steps[failed].name, "composite rolled back");
            return Ok(CompositeOutcome::Failed(error));
        }

        committed.sort_by_key(|(name, _)| plan.steps.iter().position(|s| &s.name == name));
        let partial = MutationError::PartialCompositeFailure {
            plan: plan.name.clone(),
            failed_step: plan.steps[failed].name.clone(),
            committed: committed.into_iter().map(|(name, _)| name).collect(),
            skipped,
            source: Box::new(error),
        };
        warn!(plan = %plan.name, error = %partial, "composite partially applied");
        self.notify(MutationNotice::PartialComposite {
            plan: plan.name,
            error: partial.clone(),
        });
        Ok(CompositeOutcome::Failed(partial))
    }

    /// Apply every step optimistically, or none of them
    pub(crate) fn apply_all(&self, prepared: Vec<Prepared>) -> Result<Vec<Applied>, MutationError> {
        let mut applied: Vec<Applied> = Vec::with_capacity(prepared.len());
        let mut steps = prepared.into_iter();
        while let Some(step) = steps.next() {
            let mutation = step.mutation;
            match self.apply_optimistic(step) {
                Ok(a) => applied.push(a),
                Err(error) => {
                    warn!(%mutation, %error, "composite apply failed, unwinding");
                    for a in applied.iter().rev() {
                        self.undo(a, &error);
                    }
                    for rest in steps.by_ref() {
                        self.abandon(&rest, &error);
                    }
                    return Err(error);
                }
            }
        }
        Ok(applied)
    }

    /// Rewrite placeholder references restored by rollbacks
    fn rewrite_resolved(&self, plan: &CompositePlan) {
        for step in &plan.steps {
            let temp = step.intent.entity_id;
            if step.intent.kind != MutationKind::Create || !temp.is_temp() {
                continue;
            }
            let real = self.resolve(temp);
            if real != temp {
                self.reconciler().reconcile_id(temp, real);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::config::EngineConfig;
    use crate::state_machine::MutationPhase;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use taskview_cache::{Filter, SortKey, ViewKey, ViewKind};
    use taskview_entity::RawEntity;

    fn original() -> ViewEntity {
        ViewEntity::new(EntityId::Real(7))
            .with(Field::Title, "Ship release")
            .with(Field::StatusId, 2_i64)
    }

    #[test]
    fn promote_plan_has_three_steps_in_two_waves() {
        let plan = CompositePlan::promote_task(&original(), "Ship release, part 2");
        let names: Vec<_> = plan.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["create-parent", "reparent-original", "create-child"]);
        assert_eq!(plan.waves(), vec![vec![0], vec![1, 2]]);

        let parent = plan.steps[0].intent.entity_id;
        assert_eq!(
            plan.steps[2].intent.changed.get(&Field::ParentId),
            Some(&FieldValue::Ref(parent))
        );
        assert_eq!(
            plan.steps[0].intent.changed.get(&Field::Title),
            Some(&FieldValue::text("Ship release"))
        );
    }

    #[test]
    fn independent_steps_share_a_wave() {
        let plan = CompositePlan::new("bulk")
            .step("a", MutationIntent::set(EntityId::Real(1), Field::Priority, 1_i64))
            .step("b", MutationIntent::set(EntityId::Real(2), Field::Priority, 1_i64));
        assert_eq!(plan.waves(), vec![vec![0, 1]]);
    }

    #[test]
    fn same_target_runs_in_issue_order() {
        let plan = CompositePlan::new("twice")
            .step("a", MutationIntent::set(EntityId::Real(1), Field::Priority, 1_i64))
            .step("b", MutationIntent::set(EntityId::Real(1), Field::Priority, 2_i64));
        assert_eq!(plan.waves(), vec![vec![0], vec![1]]);
    }

    #[test]
    fn empty_plan_has_no_waves() {
        assert!(CompositePlan::new("noop").waves().is_empty());
    }

    #[test]
    fn failed_apply_unwinds_earlier_steps() {
        let orch = MutationOrchestrator::new(EngineConfig::default(), Arc::new(MockBackend::new()));
        let handle = orch.register_view(ViewKey::new(
            ViewKind::List,
            Filter::all(),
            SortKey::asc(Field::Priority),
        ));
        for (id, priority) in [(1, 1_i64), (2, 2), (3, 3)] {
            let fields = FieldMap::from([
                (Field::Title, FieldValue::text(format!("task {id}"))),
                (Field::Priority, FieldValue::Int(priority)),
            ]);
            orch.ingest(&RawEntity::new(id, fields)).unwrap();
        }
        let before = handle.current().groups.clone();

        let prepared: Vec<_> = [(1, 9_i64), (2, 8), (3, 7)]
            .into_iter()
            .map(|(id, priority)| {
                orch.prepare(MutationIntent::set(EntityId::Real(id), Field::Priority, priority), true)
                    .unwrap()
            })
            .collect();
        let stale = MutationError::UnknownEntity(EntityId::Real(3));
        orch.abandon(&prepared[2], &stale);
        let ids: Vec<_> = prepared.iter().map(|p| p.mutation).collect();

        let err = orch.apply_all(prepared).unwrap_err();

        assert!(matches!(err, MutationError::IllegalTransition { .. }));
        assert_eq!(handle.current().groups, before);
        assert_eq!(orch.in_flight(), 0);
        for id in &ids[..2] {
            assert_eq!(orch.record(*id).unwrap().phase, MutationPhase::RolledBack);
        }
    }
}
