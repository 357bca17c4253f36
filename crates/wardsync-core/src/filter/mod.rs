//! Patient filters.
//!
//! `SelectionFilter`s turn a user constraint into a parameterised SQL
//! selection for routed queries. `Matcher`s test already-loaded items and
//! back the `FilteredCursor`.

mod matchers;

pub use matchers::{IdMatcher, Matcher, NameMatcher, PatientSearchMatcher};

use crate::location::LocationTree;
use crate::store::contracts::patients;
use crate::store::Query;

/// A SQL selection parameterised by a constraint string.
pub trait SelectionFilter: Send + Sync {
    fn selection(&self) -> String;

    fn selection_args(&self, constraint: &str) -> Vec<String>;

    /// Query restricted by this filter.
    fn to_query(&self, constraint: &str) -> Query {
        let selection = self.selection();
        if selection.is_empty() {
            Query::new()
        } else {
            Query::new().filter(&selection, self.selection_args(constraint))
        }
    }
}

/// Matches every row.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllFilter;

impl SelectionFilter for AllFilter {
    fn selection(&self) -> String {
        String::new()
    }

    fn selection_args(&self, _constraint: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Exact match on the patient uuid given as constraint.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidFilter;

impl SelectionFilter for UuidFilter {
    fn selection(&self) -> String {
        format!("{} = ?", patients::UUID)
    }

    fn selection_args(&self, constraint: &str) -> Vec<String> {
        vec![constraint.to_string()]
    }
}

/// Exact match on the human-readable patient id.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdFilter;

impl SelectionFilter for IdFilter {
    fn selection(&self) -> String {
        format!("{} = ?", patients::ID)
    }

    fn selection_args(&self, constraint: &str) -> Vec<String> {
        vec![constraint.to_string()]
    }
}

/// Substring match on either name.
#[derive(Debug, Clone, Copy, Default)]
pub struct NameFilter;

impl SelectionFilter for NameFilter {
    fn selection(&self) -> String {
        format!(
            "{} LIKE ? OR {} LIKE ?",
            patients::GIVEN_NAME,
            patients::FAMILY_NAME
        )
    }

    fn selection_args(&self, constraint: &str) -> Vec<String> {
        let pattern = format!("%{}%", constraint);
        vec![pattern.clone(), pattern]
    }
}

/// Patients assigned to any of a fixed set of locations.
///
/// The constraint is ignored.
#[derive(Debug, Clone, Default)]
pub struct LocationUuidFilter {
    location_uuids: Vec<String>,
}

impl LocationUuidFilter {
    pub fn new(location_uuids: Vec<String>) -> Self {
        Self { location_uuids }
    }

    /// `root` and every location below it.
    pub fn subtree(tree: &LocationTree, root: &str) -> Self {
        let mut uuids = Vec::new();
        if tree.get(root).is_some() {
            uuids.push(root.to_string());
            uuids.extend(tree.descendants(root).map(|node| node.uuid().to_string()));
        }
        Self::new(uuids)
    }
}

impl SelectionFilter for LocationUuidFilter {
    fn selection(&self) -> String {
        if self.location_uuids.is_empty() {
            return "0 = 1".to_string();
        }
        let placeholders = vec!["?"; self.location_uuids.len()].join(", ");
        format!("{} IN ({})", patients::LOCATION_UUID, placeholders)
    }

    fn selection_args(&self, _constraint: &str) -> Vec<String> {
        self.location_uuids.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOperator {
    And,
    Or,
}

/// Several filters combined with AND or OR, all given the same constraint.
pub struct FilterGroup {
    operator: GroupOperator,
    filters: Vec<Box<dyn SelectionFilter>>,
}

impl FilterGroup {
    pub fn all_of(filters: Vec<Box<dyn SelectionFilter>>) -> Self {
        Self {
            operator: GroupOperator::And,
            filters,
        }
    }

    pub fn any_of(filters: Vec<Box<dyn SelectionFilter>>) -> Self {
        Self {
            operator: GroupOperator::Or,
            filters,
        }
    }
}

impl SelectionFilter for FilterGroup {
    fn selection(&self) -> String {
        let joiner = match self.operator {
            GroupOperator::And => " AND ",
            GroupOperator::Or => " OR ",
        };
        self.filters
            .iter()
            .map(|f| f.selection())
            .filter(|s| !s.is_empty())
            .map(|s| format!("({})", s))
            .collect::<Vec<_>>()
            .join(joiner)
    }

    fn selection_args(&self, constraint: &str) -> Vec<String> {
        self.filters
            .iter()
            .filter(|f| !f.selection().is_empty())
            .flat_map(|f| f.selection_args(constraint))
            .collect()
    }
}
