//! Local persistent store.
//!
//! The SQLite database is only ever reached through the `ContentRouter`,
//! which resolves resource paths such as `patients/12` to table operations
//! built with the `SelectionBuilder`. Query results are materialized into
//! `ResultSet`s so no statement outlives the connection lock.

pub mod contracts;
pub mod router;
pub mod schema;
pub mod selection;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::debug;

use crate::error::Result;

pub use contracts::Table;
pub use router::{Capability, ContentObserver, ContentRouter, Operation, Query, ResourcePath};
pub use rusqlite::types::Value as SqlValue;
pub use selection::SelectionBuilder;

/// SQLite connection guarded for single-writer access.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                debug!(error = %e, "Could not create database directory");
            }
        }
        let conn = Connection::open(path)?;
        debug!(?path, "Opened local store");
        Self::with_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        schema::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` with exclusive access to the connection.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }
}

/// Column values for an insert or update, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentValues(BTreeMap<String, SqlValue>);

impl ContentValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, column: &str, value: impl Into<SqlValue>) -> &mut Self {
        self.0.insert(column.to_string(), value.into());
        self
    }

    pub fn put_str(&mut self, column: &str, value: &str) -> &mut Self {
        self.put(column, value.to_string())
    }

    /// Put `value`, or NULL when absent.
    pub fn put_opt_str(&mut self, column: &str, value: Option<&str>) -> &mut Self {
        match value {
            Some(v) => self.put_str(column, v),
            None => self.put_null(column),
        }
    }

    pub fn put_opt_i64(&mut self, column: &str, value: Option<i64>) -> &mut Self {
        match value {
            Some(v) => self.put(column, v),
            None => self.put_null(column),
        }
    }

    pub fn put_null(&mut self, column: &str) -> &mut Self {
        self.0.insert(column.to_string(), SqlValue::Null);
        self
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.0.get(column)
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        match self.0.get(column) {
            Some(SqlValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.contains_key(column)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// One materialized row of a query result.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    fn index_of(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.index_of(column).and_then(|i| self.values.get(i))
    }

    /// Text value of `column`, `None` for NULL or a missing column.
    pub fn get_str(&self, column: &str) -> Option<&str> {
        match self.get(column) {
            Some(SqlValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Text value of `column`, rendering integers as text.
    pub fn get_string(&self, column: &str) -> Option<String> {
        match self.get(column) {
            Some(SqlValue::Text(s)) => Some(s.clone()),
            Some(SqlValue::Integer(i)) => Some(i.to_string()),
            _ => None,
        }
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        match self.get(column) {
            Some(SqlValue::Integer(i)) => Some(*i),
            Some(SqlValue::Text(s)) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn get_bool(&self, column: &str) -> bool {
        self.get_i64(column).map(|v| v != 0).unwrap_or(false)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

/// Materialized rows returned by a routed query.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    rows: Vec<Row>,
}

impl ResultSet {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }
}

impl IntoIterator for ResultSet {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_accessors() {
        let columns: Arc<[String]> = vec!["uuid".to_string(), "n".to_string(), "v".to_string()].into();
        let row = Row::new(
            columns,
            vec![
                SqlValue::Text("abc".into()),
                SqlValue::Integer(3),
                SqlValue::Null,
            ],
        );
        assert_eq!(row.get_str("uuid"), Some("abc"));
        assert_eq!(row.get_i64("n"), Some(3));
        assert_eq!(row.get_string("n").as_deref(), Some("3"));
        assert_eq!(row.get_str("v"), None);
        assert!(row.get("missing").is_none());
        assert!(row.get_bool("n"));
    }

    #[test]
    fn test_content_values_put() {
        let mut values = ContentValues::new();
        values.put_str("a", "x").put("b", 2i64).put_null("c");
        assert_eq!(values.len(), 3);
        assert_eq!(values.get_str("a"), Some("x"));
        assert_eq!(values.get("c"), Some(&SqlValue::Null));
    }
}
