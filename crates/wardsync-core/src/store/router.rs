//! Resource-path routing onto table operations.
//!
//! Every read and write of the local store goes through `ContentRouter`.
//! A `ResourcePath` resolves to exactly one `Capability`; operations a path
//! does not support fail fast with `DataError::UnsupportedOperation`.
//! Mutations notify observers of the exact path written, after the write has
//! committed and the connection lock has been released.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use rusqlite::params_from_iter;
use tracing::{debug, warn};

use super::contracts::{patient_counts, patients, Table, ROW_ID};
use super::selection::{checked_identifier, SelectionBuilder};
use super::{ContentValues, ResultSet, Row, Store};
use crate::error::{DataError, Result};

// ============================================================================
// Resource Paths
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourcePath {
    Patients,
    /// A single patient by row id.
    Patient(String),
    /// Number of patients per location, derived from the patients table.
    PatientCounts,
    Locations,
    Location(String),
    LocationNames,
    Observations,
    Observation(String),
    Orders,
    Order(String),
    Users,
    Misc,
}

/// What a resolved resource path allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub table: Table,
    pub single_row: bool,
    pub insert: bool,
    pub update: bool,
    pub delete: bool,
}

impl Capability {
    const fn collection(table: Table) -> Self {
        Self {
            table,
            single_row: false,
            insert: true,
            update: true,
            delete: true,
        }
    }

    const fn item(table: Table) -> Self {
        Self {
            table,
            single_row: true,
            insert: false,
            update: true,
            delete: true,
        }
    }

    const fn read_only(table: Table) -> Self {
        Self {
            table,
            single_row: false,
            insert: false,
            update: false,
            delete: false,
        }
    }

    fn allows(&self, op: Operation) -> bool {
        match op {
            Operation::Query => true,
            Operation::Insert | Operation::BulkInsert => self.insert,
            Operation::Update => self.update,
            Operation::Delete => self.delete,
        }
    }
}

impl ResourcePath {
    pub fn capability(&self) -> Capability {
        match self {
            ResourcePath::Patients => Capability::collection(Table::Patients),
            ResourcePath::Patient(_) => Capability::item(Table::Patients),
            ResourcePath::PatientCounts => Capability::read_only(Table::Patients),
            ResourcePath::Locations => Capability::collection(Table::Locations),
            ResourcePath::Location(_) => Capability::item(Table::Locations),
            ResourcePath::LocationNames => Capability::collection(Table::LocationNames),
            ResourcePath::Observations => Capability::collection(Table::Observations),
            ResourcePath::Observation(_) => Capability::item(Table::Observations),
            ResourcePath::Orders => Capability::collection(Table::Orders),
            ResourcePath::Order(_) => Capability::item(Table::Orders),
            ResourcePath::Users => Capability::collection(Table::Users),
            ResourcePath::Misc => Capability {
                update: true,
                ..Capability::read_only(Table::Misc)
            },
        }
    }

    /// Key of a single-row path.
    fn item_key(&self) -> Option<&str> {
        match self {
            ResourcePath::Patient(k)
            | ResourcePath::Location(k)
            | ResourcePath::Observation(k)
            | ResourcePath::Order(k) => Some(k),
            _ => None,
        }
    }

    /// Path of a single row of `table`, if that table has item paths.
    fn for_item(table: Table, key: String) -> Option<Self> {
        match table {
            Table::Patients => Some(ResourcePath::Patient(key)),
            Table::Locations => Some(ResourcePath::Location(key)),
            Table::Observations => Some(ResourcePath::Observation(key)),
            Table::Orders => Some(ResourcePath::Order(key)),
            _ => None,
        }
    }
}

impl FromStr for ResourcePath {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim_matches('/');
        let mut segments = trimmed.split('/');
        let head = segments.next().unwrap_or("");
        let tail = segments.next();
        if segments.next().is_some() {
            return Err(DataError::Routing(s.to_string()));
        }
        let item = |make: fn(String) -> ResourcePath| match tail {
            Some(key) if !key.is_empty() => Ok(make(key.to_string())),
            _ => Err(DataError::Routing(s.to_string())),
        };
        match (head, tail) {
            ("patients", None) => Ok(ResourcePath::Patients),
            ("patients", Some(_)) => item(ResourcePath::Patient),
            ("patient-counts", None) | ("location-counts", None) => Ok(ResourcePath::PatientCounts),
            ("locations", None) => Ok(ResourcePath::Locations),
            ("locations", Some(_)) => item(ResourcePath::Location),
            ("location-names", None) => Ok(ResourcePath::LocationNames),
            ("observations", None) => Ok(ResourcePath::Observations),
            ("observations", Some(_)) => item(ResourcePath::Observation),
            ("orders", None) => Ok(ResourcePath::Orders),
            ("orders", Some(_)) => item(ResourcePath::Order),
            ("users", None) => Ok(ResourcePath::Users),
            ("misc", None) => Ok(ResourcePath::Misc),
            _ => Err(DataError::Routing(s.to_string())),
        }
    }
}

impl std::fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourcePath::Patients => write!(f, "patients"),
            ResourcePath::Patient(id) => write!(f, "patients/{}", id),
            ResourcePath::PatientCounts => write!(f, "patient-counts"),
            ResourcePath::Locations => write!(f, "locations"),
            ResourcePath::Location(uuid) => write!(f, "locations/{}", uuid),
            ResourcePath::LocationNames => write!(f, "location-names"),
            ResourcePath::Observations => write!(f, "observations"),
            ResourcePath::Observation(uuid) => write!(f, "observations/{}", uuid),
            ResourcePath::Orders => write!(f, "orders"),
            ResourcePath::Order(uuid) => write!(f, "orders/{}", uuid),
            ResourcePath::Users => write!(f, "users"),
            ResourcePath::Misc => write!(f, "misc"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Query,
    Insert,
    BulkInsert,
    Update,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Operation::Query => "query",
            Operation::Insert => "insert",
            Operation::BulkInsert => "bulk insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Query Descriptor
// ============================================================================

/// Projection, predicate and sort order of a routed read.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub projection: Option<Vec<String>>,
    pub selection: Option<String>,
    pub args: Vec<String>,
    pub sort_order: Option<String>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn project(mut self, columns: &[&str]) -> Self {
        self.projection = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn filter<I, S>(mut self, selection: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selection = Some(selection.to_string());
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn order_by(mut self, sort_order: &str) -> Self {
        self.sort_order = Some(sort_order.to_string());
        self
    }
}

// ============================================================================
// Observers
// ============================================================================

/// Receives a notification after a write to the path it registered for.
pub trait ContentObserver: Send + Sync {
    fn on_change(&self, path: &ResourcePath);
}

impl<F> ContentObserver for F
where
    F: Fn(&ResourcePath) + Send + Sync,
{
    fn on_change(&self, path: &ResourcePath) {
        self(path)
    }
}

// ============================================================================
// Router
// ============================================================================

pub struct ContentRouter {
    store: Store,
    observers: RwLock<Vec<(ResourcePath, Arc<dyn ContentObserver>)>>,
}

impl ContentRouter {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Run blocking store work on the blocking pool.
    pub async fn run<T, F>(self: &Arc<Self>, f: F) -> Result<T>
    where
        F: FnOnce(&ContentRouter) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let router = self.clone();
        tokio::task::spawn_blocking(move || f(&router)).await?
    }

    /// Resolve `path` for `op`, failing if the path does not support it.
    pub fn resolve(&self, path: &ResourcePath, op: Operation) -> Result<Capability> {
        let capability = path.capability();
        if capability.allows(op) {
            Ok(capability)
        } else {
            Err(DataError::UnsupportedOperation {
                op,
                path: path.to_string(),
            })
        }
    }

    /// Parse and resolve a textual resource path.
    pub fn resolve_str(&self, path: &str, op: Operation) -> Result<(ResourcePath, Capability)> {
        let path: ResourcePath = path.parse()?;
        let capability = self.resolve(&path, op)?;
        Ok((path, capability))
    }

    fn base_builder(path: &ResourcePath, capability: &Capability) -> SelectionBuilder {
        let builder = SelectionBuilder::new().table(capability.table.name());
        match path.item_key() {
            Some(key) => builder.and_where(
                &format!("{} = ?", capability.table.key_column()),
                [key.to_string()],
            ),
            None => builder,
        }
    }

    pub fn query(&self, path: &ResourcePath, query: &Query) -> Result<ResultSet> {
        let capability = self.resolve(path, Operation::Query)?;
        if *path == ResourcePath::PatientCounts {
            return self.query_patient_counts(query);
        }
        let builder = Self::base_builder(path, &capability)
            .and_where_opt(query.selection.as_deref(), &query.args);
        let projection: Option<Vec<&str>> = query
            .projection
            .as_ref()
            .map(|cols| cols.iter().map(String::as_str).collect());
        self.store.with_conn(|conn| {
            builder.query(conn, projection.as_deref(), query.sort_order.as_deref())
        })
    }

    /// Patient counts per location.
    ///
    /// Equivalent to `SELECT location_uuid, COUNT(*) FROM patients WHERE
    /// location_uuid IS NOT NULL GROUP BY location_uuid`, computed as an
    /// explicit aggregation pass and ordered by location uuid.
    fn query_patient_counts(&self, query: &Query) -> Result<ResultSet> {
        let builder = SelectionBuilder::new()
            .table(Table::Patients.name())
            .and_where_opt(query.selection.as_deref(), &query.args)
            .and_where(
                &format!("{} IS NOT NULL", patients::LOCATION_UUID),
                Vec::<String>::new(),
            );
        let located = self
            .store
            .with_conn(|conn| builder.query(conn, Some(&[patients::LOCATION_UUID]), None))?;

        let mut counts: BTreeMap<String, i64> = BTreeMap::new();
        for row in located.iter() {
            if let Some(location) = row.get_string(patients::LOCATION_UUID) {
                *counts.entry(location).or_insert(0) += 1;
            }
        }

        let columns: Arc<[String]> = vec![
            patient_counts::LOCATION_UUID.to_string(),
            patient_counts::TENT_PATIENT_COUNT.to_string(),
        ]
        .into();
        let rows = counts
            .into_iter()
            .map(|(location, count)| {
                Row::new(
                    columns.clone(),
                    vec![location.into(), count.into()],
                )
            })
            .collect();
        Ok(ResultSet::new(rows))
    }

    /// Insert one row, returning the path of the new row.
    pub fn insert(&self, path: &ResourcePath, values: &ContentValues) -> Result<ResourcePath> {
        let capability = self.resolve(path, Operation::Insert)?;
        let inserted = self.insert_row(&capability, values)?;
        self.notify_change(path);
        Ok(inserted.unwrap_or_else(|| path.clone()))
    }

    /// Insert rows one at a time, each committed on its own.
    ///
    /// A failure stops the remaining inserts; rows already inserted stay.
    pub fn bulk_insert(&self, path: &ResourcePath, rows: &[ContentValues]) -> Result<usize> {
        let capability = self.resolve(path, Operation::BulkInsert)?;
        let mut inserted = 0;
        let mut failure = None;
        for values in rows {
            match self.insert_row(&capability, values) {
                Ok(_) => inserted += 1,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if inserted > 0 {
            self.notify_change(path);
        }
        match failure {
            None => {
                debug!(path = %path, inserted, "Bulk insert complete");
                Ok(inserted)
            }
            Some(e) => {
                warn!(path = %path, inserted, error = %e, "Bulk insert aborted");
                Err(DataError::BulkInsertAborted {
                    path: path.to_string(),
                    inserted,
                    source: Box::new(e),
                })
            }
        }
    }

    fn insert_row(
        &self,
        capability: &Capability,
        values: &ContentValues,
    ) -> Result<Option<ResourcePath>> {
        if values.is_empty() {
            return Err(DataError::Validation("insert without values".to_string()));
        }
        let table = capability.table;
        let mut columns = Vec::with_capacity(values.len());
        for (column, _) in values.iter() {
            columns.push(checked_identifier(column)?);
        }
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table.name(),
            columns.join(", "),
            placeholders
        );
        let row_id = self.store.with_conn(|conn| {
            conn.execute(&sql, params_from_iter(values.iter().map(|(_, v)| v)))?;
            Ok(conn.last_insert_rowid())
        })?;

        let key = if table.key_column() == ROW_ID {
            Some(row_id.to_string())
        } else {
            values.get_str(table.key_column()).map(str::to_string)
        };
        Ok(key.and_then(|k| ResourcePath::for_item(table, k)))
    }

    pub fn update(
        &self,
        path: &ResourcePath,
        values: &ContentValues,
        selection: Option<&str>,
        args: &[String],
    ) -> Result<usize> {
        let capability = self.resolve(path, Operation::Update)?;
        let builder = Self::base_builder(path, &capability).and_where_opt(selection, args);
        let count = self.store.with_conn(|conn| builder.update(conn, values))?;
        self.notify_change(path);
        Ok(count)
    }

    pub fn delete(&self, path: &ResourcePath, selection: Option<&str>, args: &[String]) -> Result<usize> {
        let capability = self.resolve(path, Operation::Delete)?;
        let builder = Self::base_builder(path, &capability).and_where_opt(selection, args);
        let count = self.store.with_conn(|conn| builder.delete(conn))?;
        self.notify_change(path);
        Ok(count)
    }

    pub fn register_observer(&self, path: ResourcePath, observer: Arc<dyn ContentObserver>) {
        let mut observers = self.observers.write();
        if !observers
            .iter()
            .any(|(p, o)| *p == path && same_observer(o, &observer))
        {
            observers.push((path, observer));
        }
    }

    pub fn unregister_observer(&self, observer: &Arc<dyn ContentObserver>) {
        self.observers
            .write()
            .retain(|(_, o)| !same_observer(o, observer));
    }

    fn notify_change(&self, path: &ResourcePath) {
        let matching: Vec<Arc<dyn ContentObserver>> = self
            .observers
            .read()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, o)| o.clone())
            .collect();
        debug!(path = %path, observers = matching.len(), "Content changed");
        for observer in matching {
            observer.on_change(path);
        }
    }
}

fn same_observer(a: &Arc<dyn ContentObserver>, b: &Arc<dyn ContentObserver>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contracts::{locations, misc, observations};
    use parking_lot::Mutex;

    fn router() -> ContentRouter {
        ContentRouter::new(Store::in_memory().unwrap())
    }

    fn patient(id: &str, location: Option<&str>) -> ContentValues {
        let mut values = ContentValues::new();
        values
            .put_str(patients::ID, id)
            .put_str(patients::UUID, &format!("uuid-{}", id))
            .put_opt_str(patients::LOCATION_UUID, location);
        values
    }

    #[test]
    fn test_parse_paths() {
        assert_eq!("patients".parse::<ResourcePath>().unwrap(), ResourcePath::Patients);
        assert_eq!(
            "/patients/12".parse::<ResourcePath>().unwrap(),
            ResourcePath::Patient("12".into())
        );
        assert_eq!(
            "location-counts".parse::<ResourcePath>().unwrap(),
            ResourcePath::PatientCounts
        );
        assert!(matches!(
            "charts".parse::<ResourcePath>(),
            Err(DataError::Routing(_))
        ));
        assert!(matches!(
            "patients/1/2".parse::<ResourcePath>(),
            Err(DataError::Routing(_))
        ));
        assert!(matches!(
            "patient-counts/x".parse::<ResourcePath>(),
            Err(DataError::Routing(_))
        ));
    }

    #[test]
    fn test_path_display_round_trips() {
        for path in [
            ResourcePath::Patient("7".into()),
            ResourcePath::PatientCounts,
            ResourcePath::Order("o-1".into()),
            ResourcePath::Misc,
        ] {
            assert_eq!(path.to_string().parse::<ResourcePath>().unwrap(), path);
        }
    }

    #[test]
    fn test_unsupported_operations() {
        let router = router();
        let err = router
            .insert(&ResourcePath::PatientCounts, &patient("1", None))
            .unwrap_err();
        assert!(
            matches!(err, DataError::UnsupportedOperation { ref path, .. } if path == "patient-counts")
        );
        assert!(router
            .insert(&ResourcePath::Patient("1".into()), &patient("1", None))
            .is_err());
        assert!(router.delete(&ResourcePath::Misc, None, &[]).is_err());
        assert!(router.resolve_str("misc", Operation::Update).is_ok());
    }

    #[test]
    fn test_insert_returns_item_path_and_query_by_id() {
        let router = router();
        let path = router
            .insert(&ResourcePath::Patients, &patient("KH.1", Some("tent-a")))
            .unwrap();
        let ResourcePath::Patient(row_id) = &path else {
            panic!("expected item path, got {}", path);
        };
        let rows = router.query(&path, &Query::new()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.first().unwrap().get_string(ROW_ID).as_deref(), Some(row_id.as_str()));
        assert_eq!(rows.first().unwrap().get_str(patients::ID), Some("KH.1"));
    }

    #[test]
    fn test_patient_counts_match_group_by() {
        let router = router();
        let rows = [
            patient("1", Some("b")),
            patient("2", Some("a")),
            patient("3", Some("b")),
            patient("4", None),
            patient("5", Some("c")),
        ];
        assert_eq!(router.bulk_insert(&ResourcePath::Patients, &rows).unwrap(), 5);

        let manual: Vec<(String, i64)> = router
            .query(&ResourcePath::PatientCounts, &Query::new())
            .unwrap()
            .iter()
            .map(|r| {
                (
                    r.get_string(patient_counts::LOCATION_UUID).unwrap(),
                    r.get_i64(patient_counts::TENT_PATIENT_COUNT).unwrap(),
                )
            })
            .collect();

        let grouped: Vec<(String, i64)> = router
            .store
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT location_uuid, COUNT(*) FROM patients \
                     WHERE location_uuid IS NOT NULL GROUP BY location_uuid ORDER BY location_uuid",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .unwrap();

        assert_eq!(manual, grouped);
        assert_eq!(manual, vec![("a".into(), 1), ("b".into(), 2), ("c".into(), 1)]);
    }

    #[test]
    fn test_patient_counts_respect_selection() {
        let router = router();
        router
            .bulk_insert(
                &ResourcePath::Patients,
                &[patient("1", Some("a")), patient("2", Some("a")), patient("3", Some("b"))],
            )
            .unwrap();
        let rows = router
            .query(
                &ResourcePath::PatientCounts,
                &Query::new().filter("id != ?", ["1"]),
            )
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.first().unwrap().get_i64(patient_counts::TENT_PATIENT_COUNT), Some(1));
    }

    #[test]
    fn test_bulk_insert_aborts_without_rollback() {
        let router = router();
        let rows = [patient("1", None), patient("1", None), patient("2", None)];
        let err = router.bulk_insert(&ResourcePath::Patients, &rows).unwrap_err();
        assert!(matches!(err, DataError::BulkInsertAborted { inserted: 1, .. }));

        let remaining = router.query(&ResourcePath::Patients, &Query::new()).unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[test]
    fn test_observers_see_committed_data_for_exact_path() {
        let router = Arc::new(router());
        let seen: Arc<Mutex<Vec<(String, usize)>>> = Arc::new(Mutex::new(Vec::new()));

        let observer: Arc<dyn ContentObserver> = {
            let router = Arc::downgrade(&router);
            let seen = seen.clone();
            Arc::new(move |path: &ResourcePath| {
                let router = router.upgrade().unwrap();
                let count = router.query(&ResourcePath::Patients, &Query::new()).unwrap().len();
                seen.lock().push((path.to_string(), count));
            })
        };
        router.register_observer(ResourcePath::Patients, observer.clone());
        router.register_observer(ResourcePath::Patients, observer.clone());

        let item = router
            .insert(&ResourcePath::Patients, &patient("1", None))
            .unwrap();
        let mut values = ContentValues::new();
        values.put_str(patients::GIVEN_NAME, "Ada");
        router.update(&item, &values, None, &[]).unwrap();

        // Only the collection path was observed, once per write.
        assert_eq!(*seen.lock(), vec![("patients".to_string(), 1)]);

        router.unregister_observer(&observer);
        router.insert(&ResourcePath::Patients, &patient("2", None)).unwrap();
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_update_and_delete_item_paths() {
        let router = router();
        let mut values = ContentValues::new();
        values
            .put_str(locations::LOCATION_UUID, "loc-1")
            .put_null(locations::PARENT_UUID);
        let path = router.insert(&ResourcePath::Locations, &values).unwrap();
        assert_eq!(path, ResourcePath::Location("loc-1".into()));

        let mut parent = ContentValues::new();
        parent.put_str(locations::PARENT_UUID, "root");
        assert_eq!(router.update(&path, &parent, None, &[]).unwrap(), 1);
        assert_eq!(router.delete(&path, None, &[]).unwrap(), 1);
        assert!(router.query(&ResourcePath::Locations, &Query::new()).unwrap().is_empty());
    }

    #[test]
    fn test_misc_row_is_updatable() {
        let router = router();
        let mut values = ContentValues::new();
        values.put(misc::FULL_SYNC_START_MILLIS, 10i64);
        assert_eq!(router.update(&ResourcePath::Misc, &values, None, &[]).unwrap(), 1);
        let rows = router.query(&ResourcePath::Misc, &Query::new()).unwrap();
        assert_eq!(rows.first().unwrap().get_i64(misc::FULL_SYNC_START_MILLIS), Some(10));
    }

    #[test]
    fn test_uuid_keyed_insert_without_key_returns_collection_path() {
        let router = router();
        let mut values = ContentValues::new();
        values
            .put_str(observations::PATIENT_UUID, "p")
            .put(observations::ENCOUNTER_TIME, 1i64)
            .put_str(observations::CONCEPT_UUID, "c");
        assert_eq!(
            router.insert(&ResourcePath::Observations, &values).unwrap(),
            ResourcePath::Observations
        );
    }
}
