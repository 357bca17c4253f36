use crate::models::Patient;

/// In-memory predicate over `(item, constraint)`.
pub trait Matcher<T>: Send + Sync {
    fn matches(&self, item: &T, constraint: &str) -> bool;
}

impl<T, F> Matcher<T> for F
where
    F: Fn(&T, &str) -> bool + Send + Sync,
{
    fn matches(&self, item: &T, constraint: &str) -> bool {
        self(item, constraint)
    }
}

fn contains_ignore_case(haystack: Option<&str>, needle: &str) -> bool {
    haystack
        .map(|h| h.to_lowercase().contains(&needle.to_lowercase()))
        .unwrap_or(false)
}

/// Patient id starts with the constraint, ignoring case.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdMatcher;

impl Matcher<Patient> for IdMatcher {
    fn matches(&self, patient: &Patient, constraint: &str) -> bool {
        patient
            .id
            .as_deref()
            .map(|id| id.to_lowercase().starts_with(&constraint.to_lowercase()))
            .unwrap_or(false)
    }
}

/// Either name contains the constraint, ignoring case.
#[derive(Debug, Clone, Copy, Default)]
pub struct NameMatcher;

impl Matcher<Patient> for NameMatcher {
    fn matches(&self, patient: &Patient, constraint: &str) -> bool {
        contains_ignore_case(patient.given_name.as_deref(), constraint)
            || contains_ignore_case(patient.family_name.as_deref(), constraint)
    }
}

/// Search box matcher: every whitespace-separated term must match the id
/// or a name. A blank constraint matches everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatientSearchMatcher;

impl Matcher<Patient> for PatientSearchMatcher {
    fn matches(&self, patient: &Patient, constraint: &str) -> bool {
        constraint.split_whitespace().all(|term| {
            IdMatcher.matches(patient, term) || NameMatcher.matches(patient, term)
        })
    }
}
