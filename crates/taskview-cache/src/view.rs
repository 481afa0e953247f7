//! View parameters and filter predicates
//!
//! A [`ViewKey`] is the full parameter tuple of one cache instance: view
//! kind, filter, grouping dimension, sort key and page size. Two
//! subscriptions with equal keys share one instance.

use crate::error::PredicateError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use taskview_entity::{Field, FieldValue, ViewEntity};

/// UI surface a cache backs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViewKind {
    /// Flat task list
    List,
    /// Kanban board
    Board,
    /// Calendar
    Calendar,
    /// Full-text search results
    Search,
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortOrder {
    /// Ascending
    Asc,
    /// Descending
    Desc,
}

/// Sort field and direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKey {
    /// Field to sort by
    pub field: Field,
    /// Direction
    pub order: SortOrder,
}

impl SortKey {
    /// Ascending sort on `field`
    #[inline]
    #[must_use]
    pub fn asc(field: Field) -> Self {
        Self {
            field,
            order: SortOrder::Asc,
        }
    }

    /// Descending sort on `field`
    #[inline]
    #[must_use]
    pub fn desc(field: Field) -> Self {
        Self {
            field,
            order: SortOrder::Desc,
        }
    }

    /// Whether this is a "most recent first" ordering on `recency_field`
    #[inline]
    #[must_use]
    pub fn is_recency(&self, recency_field: Field) -> bool {
        self.field == recency_field && self.order == SortOrder::Desc
    }

    /// Total order between two entities; ties break on id
    #[must_use]
    pub fn compare(&self, a: &ViewEntity, b: &ViewEntity) -> Ordering {
        let ord = a
            .get(self.field)
            .cmp(b.get(self.field))
            .then_with(|| a.id.cmp(&b.id));
        match self.order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    }
}

/// A single filter condition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Condition {
    /// Field equals value
    Eq(Field, FieldValue),
    /// Field differs from value
    NotEq(Field, FieldValue),
    /// Field is null
    IsNull(Field),
    /// Field is one of the values
    In(Field, Vec<FieldValue>),
    /// Text field contains the needle, case-insensitive
    TextContains(Field, String),
    /// Inclusive range; entity value must be of the bounds' kind
    Between(Field, FieldValue, FieldValue),
    /// Every whitespace-separated term appears in title or description
    Search(String),
    /// At least one nested condition holds
    Any(Vec<Condition>),
}

impl Condition {
    /// Evaluate against an entity
    ///
    /// # Errors
    /// [`PredicateError::TypeMismatch`] when a text or range condition meets
    /// a value of the wrong kind.
    pub fn matches(&self, entity: &ViewEntity) -> Result<bool, PredicateError> {
        match self {
            Condition::Eq(field, value) => Ok(entity.get(*field) == value),
            Condition::NotEq(field, value) => Ok(entity.get(*field) != value),
            Condition::IsNull(field) => Ok(entity.get(*field).is_null()),
            Condition::In(field, values) => Ok(values.contains(entity.get(*field))),
            Condition::TextContains(field, needle) => {
                Ok(text_of(entity, *field)?.is_some_and(|t| contains_ci(t, needle)))
            }
            Condition::Between(field, low, high) => {
                let value = entity.get(*field);
                if value.is_null() {
                    return Ok(false);
                }
                if value.kind() != low.kind() {
                    return Err(PredicateError::TypeMismatch {
                        field: *field,
                        expected: low.kind(),
                        found: value.kind(),
                    });
                }
                Ok(value >= low && value <= high)
            }
            Condition::Search(query) => {
                let title = text_of(entity, Field::Title)?.unwrap_or_default();
                let description = text_of(entity, Field::Description)?.unwrap_or_default();
                Ok(query
                    .split_whitespace()
                    .all(|term| contains_ci(title, term) || contains_ci(description, term)))
            }
            Condition::Any(conditions) => {
                for condition in conditions {
                    if condition.matches(entity)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

fn text_of(entity: &ViewEntity, field: Field) -> Result<Option<&str>, PredicateError> {
    match entity.get(field) {
        FieldValue::Null => Ok(None),
        FieldValue::Text(text) => Ok(Some(text)),
        other => Err(PredicateError::TypeMismatch {
            field,
            expected: "text",
            found: other.kind(),
        }),
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Conjunction of conditions; empty matches everything
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter {
    /// Conditions, all of which must hold
    pub conditions: Vec<Condition>,
}

impl Filter {
    /// Filter matching every entity
    #[inline]
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Add a condition
    #[inline]
    #[must_use]
    pub fn and(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Evaluate every condition
    ///
    /// # Errors
    /// The first [`PredicateError`] raised by a condition.
    pub fn matches(&self, entity: &ViewEntity) -> Result<bool, PredicateError> {
        for condition in &self.conditions {
            if !condition.matches(entity)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Group an entity falls into within an instance
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GroupKey {
    /// Ungrouped view
    All,
    /// Value of the grouping field (`Null` is the "none" column)
    Value(FieldValue),
}

/// Full parameter tuple of a cache instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewKey {
    /// Surface kind
    pub kind: ViewKind,
    /// Membership predicate
    pub filter: Filter,
    /// Grouping dimension
    pub group_by: Option<Field>,
    /// Sort key
    pub sort: SortKey,
    /// Page size used when the view was fetched
    pub page_size: usize,
}

impl ViewKey {
    /// Ungrouped view
    #[must_use]
    pub fn new(kind: ViewKind, filter: Filter, sort: SortKey) -> Self {
        Self {
            kind,
            filter,
            group_by: None,
            sort,
            page_size: 50,
        }
    }

    /// Group by a field
    #[inline]
    #[must_use]
    pub fn grouped_by(mut self, field: Field) -> Self {
        self.group_by = Some(field);
        self
    }

    /// Set the page size
    #[inline]
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Group an entity belongs to
    #[must_use]
    pub fn group_of(&self, entity: &ViewEntity) -> GroupKey {
        match self.group_by {
            Some(field) => GroupKey::Value(entity.get(field).clone()),
            None => GroupKey::All,
        }
    }

    /// Membership predicate
    ///
    /// # Errors
    /// [`PredicateError`] from the filter.
    #[inline]
    pub fn matches(&self, entity: &ViewEntity) -> Result<bool, PredicateError> {
        self.filter.matches(entity)
    }

    /// Cartesian product of grouping × sort field × sort order
    #[must_use]
    pub fn variants(
        kind: ViewKind,
        filter: &Filter,
        groupings: &[Option<Field>],
        sort_fields: &[Field],
        orders: &[SortOrder],
    ) -> Vec<ViewKey> {
        let mut keys = Vec::with_capacity(groupings.len() * sort_fields.len() * orders.len());
        for group_by in groupings {
            for field in sort_fields {
                for order in orders {
                    keys.push(ViewKey {
                        kind,
                        filter: filter.clone(),
                        group_by: *group_by,
                        sort: SortKey {
                            field: *field,
                            order: *order,
                        },
                        page_size: 50,
                    });
                }
            }
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskview_entity::EntityId;

    fn task(id: u64, title: &str) -> ViewEntity {
        ViewEntity::new(EntityId::Real(id)).with(Field::Title, title)
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(Filter::all().matches(&task(1, "x")).unwrap());
    }

    #[test]
    fn eq_and_is_null() {
        let entity = task(1, "x").with(Field::StatusId, 2_i64);
        let filter = Filter::all()
            .and(Condition::Eq(Field::StatusId, FieldValue::Int(2)))
            .and(Condition::IsNull(Field::AssigneeId));
        assert!(filter.matches(&entity).unwrap());

        let filter = Filter::all().and(Condition::IsNull(Field::StatusId));
        assert!(!filter.matches(&entity).unwrap());
    }

    #[test]
    fn search_terms_are_case_insensitive() {
        let entity = task(1, "Fix Login bug").with(Field::Description, "crash on submit");
        assert!(Condition::Search("login CRASH".into()).matches(&entity).unwrap());
        assert!(!Condition::Search("logout".into()).matches(&entity).unwrap());
    }

    #[test]
    fn text_condition_on_non_text_is_an_error() {
        let entity = task(1, "x").with(Field::Priority, 3_i64);
        let result = Condition::TextContains(Field::Priority, "3".into()).matches(&entity);
        assert!(matches!(result, Err(PredicateError::TypeMismatch { .. })));
    }

    #[test]
    fn between_is_inclusive_and_typed() {
        let entity = task(1, "x").with(Field::Priority, 5_i64);
        let cond = Condition::Between(Field::Priority, FieldValue::Int(1), FieldValue::Int(5));
        assert!(cond.matches(&entity).unwrap());

        let no_due = task(2, "y");
        let cond = Condition::Between(Field::DueDate, FieldValue::Int(0), FieldValue::Int(1));
        assert!(!cond.matches(&no_due).unwrap());

        let bad = task(3, "z").with(Field::DueDate, "tomorrow");
        assert!(cond.matches(&bad).is_err());
    }

    #[test]
    fn any_short_circuits() {
        let entity = task(1, "x").with(Field::StatusId, 1_i64);
        let cond = Condition::Any(vec![
            Condition::Eq(Field::StatusId, FieldValue::Int(1)),
            Condition::TextContains(Field::Priority, "never evaluated".into()),
        ]);
        assert!(cond.matches(&entity.with(Field::Priority, 1_i64)).unwrap());
    }

    #[test]
    fn sort_desc_reverses_and_breaks_ties_on_id() {
        let sort = SortKey::desc(Field::Priority);
        let a = task(1, "a").with(Field::Priority, 1_i64);
        let b = task(2, "b").with(Field::Priority, 2_i64);
        assert_eq!(sort.compare(&b, &a), Ordering::Less);

        let c = task(3, "c").with(Field::Priority, 2_i64);
        assert_ne!(sort.compare(&b, &c), Ordering::Equal);
    }

    #[test]
    fn group_of_uses_grouping_field() {
        let key = ViewKey::new(ViewKind::Board, Filter::all(), SortKey::asc(Field::Position))
            .grouped_by(Field::StatusId);
        assert_eq!(key.group_of(&task(1, "x")), GroupKey::Value(FieldValue::Null));

        let flat = ViewKey::new(ViewKind::List, Filter::all(), SortKey::asc(Field::Position));
        assert_eq!(flat.group_of(&task(1, "x")), GroupKey::All);
    }

    #[test]
    fn variants_cover_the_product() {
        let keys = ViewKey::variants(
            ViewKind::Board,
            &Filter::all(),
            &[Some(Field::StatusId), Some(Field::AssigneeId)],
            &[Field::CreatedAt, Field::DueDate],
            &[SortOrder::Asc, SortOrder::Desc],
        );
        assert_eq!(keys.len(), 8);
        let unique: std::collections::HashSet<_> = keys.iter().collect();
        assert_eq!(unique.len(), 8);
    }
}
