//! Composition of parameterised WHERE clauses.
//!
//! Every fragment is kept as `(text, args)` so the final statement is always
//! bound with positional parameters, never interpolated.

use std::collections::HashMap;

use rusqlite::{params_from_iter, Connection};
use tracing::debug;

use super::{ContentValues, ResultSet, Row, SqlValue};
use crate::error::{DataError, Result};

/// Builder for a single-table SELECT, UPDATE or DELETE.
#[derive(Debug, Clone, Default)]
pub struct SelectionBuilder {
    table: Option<String>,
    selection: Vec<String>,
    args: Vec<String>,
    projection_map: HashMap<String, String>,
    invalid: Option<String>,
}

impl SelectionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(mut self, table: &str) -> Self {
        self.table = Some(table.to_string());
        self
    }

    /// Append a WHERE fragment, conjoined with any previous ones.
    ///
    /// An empty fragment is ignored unless it carries arguments, which is
    /// reported as a validation error when the statement runs.
    pub fn and_where<I, S>(mut self, selection: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        if selection.trim().is_empty() {
            if !args.is_empty() && self.invalid.is_none() {
                self.invalid = Some(format!(
                    "{} selection args given for an empty selection",
                    args.len()
                ));
            }
            return self;
        }
        self.selection.push(selection.trim().to_string());
        self.args.extend(args);
        self
    }

    /// Append an optional fragment, as passed through from a routed call.
    pub fn and_where_opt(self, selection: Option<&str>, args: &[String]) -> Self {
        self.and_where(selection.unwrap_or(""), args.iter().cloned())
    }

    /// Project `column` as `expression AS column` in queries.
    pub fn map(mut self, column: &str, expression: &str) -> Self {
        self.projection_map
            .insert(column.to_string(), format!("{} AS {}", expression, column));
        self
    }

    /// The composed WHERE text, without the keyword.
    pub fn selection(&self) -> String {
        self.selection
            .iter()
            .map(|fragment| {
                if has_or_keyword(fragment) {
                    format!("({})", fragment)
                } else {
                    fragment.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn require_table(&self) -> Result<&str> {
        self.table
            .as_deref()
            .ok_or_else(|| DataError::IllegalState("Table not specified".to_string()))
    }

    /// Compose and validate the WHERE clause.
    fn compose(&self) -> Result<(String, Vec<SqlValue>)> {
        if let Some(reason) = &self.invalid {
            return Err(DataError::Validation(reason.clone()));
        }
        let selection = self.selection();
        let placeholders = count_placeholders(&selection);
        if placeholders != self.args.len() {
            return Err(DataError::Validation(format!(
                "selection has {} placeholders but {} args: {}",
                placeholders,
                self.args.len(),
                selection
            )));
        }
        let clause = if selection.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", selection)
        };
        let args = self.args.iter().cloned().map(SqlValue::Text).collect();
        Ok((clause, args))
    }

    fn projection(&self, columns: Option<&[&str]>) -> Result<String> {
        match columns {
            None => Ok("*".to_string()),
            Some([]) => Ok("*".to_string()),
            Some(columns) => columns
                .iter()
                .map(|c| match self.projection_map.get(*c) {
                    Some(mapped) => Ok(mapped.clone()),
                    None => checked_identifier(c).map(str::to_string),
                })
                .collect::<Result<Vec<_>>>()
                .map(|cols| cols.join(", ")),
        }
    }

    /// Run a SELECT with the accumulated selection.
    pub fn query(
        &self,
        conn: &Connection,
        columns: Option<&[&str]>,
        sort_order: Option<&str>,
    ) -> Result<ResultSet> {
        let table = self.require_table()?;
        let (clause, args) = self.compose()?;
        let mut sql = format!("SELECT {} FROM {}{}", self.projection(columns)?, table, clause);
        if let Some(order) = sort_order.filter(|o| !o.trim().is_empty()) {
            sql.push_str(" ORDER BY ");
            sql.push_str(checked_sort_order(order)?);
        }
        debug!(sql = %sql, args = args.len(), "query");

        let mut stmt = conn.prepare(&sql)?;
        let names: std::sync::Arc<[String]> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>()
            .into();
        let width = names.len();
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                let mut values = Vec::with_capacity(width);
                for i in 0..width {
                    values.push(row.get::<_, SqlValue>(i)?);
                }
                Ok(Row::new(names.clone(), values))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ResultSet::new(rows))
    }

    /// Run an UPDATE with the accumulated selection, returning affected rows.
    pub fn update(&self, conn: &Connection, values: &ContentValues) -> Result<usize> {
        let table = self.require_table()?;
        if values.is_empty() {
            return Err(DataError::Validation("update without values".to_string()));
        }
        let (clause, args) = self.compose()?;
        let mut assignments = Vec::with_capacity(values.len());
        let mut params: Vec<SqlValue> = Vec::with_capacity(values.len() + args.len());
        for (column, value) in values.iter() {
            assignments.push(format!("{} = ?", checked_identifier(column)?));
            params.push(value.clone());
        }
        params.extend(args);
        let sql = format!("UPDATE {} SET {}{}", table, assignments.join(", "), clause);
        debug!(sql = %sql, "update");
        Ok(conn.execute(&sql, params_from_iter(params.iter()))?)
    }

    /// Run a DELETE with the accumulated selection, returning affected rows.
    pub fn delete(&self, conn: &Connection) -> Result<usize> {
        let table = self.require_table()?;
        let (clause, args) = self.compose()?;
        let sql = format!("DELETE FROM {}{}", table, clause);
        debug!(sql = %sql, "delete");
        Ok(conn.execute(&sql, params_from_iter(args.iter()))?)
    }
}

/// Count `?` placeholders outside quoted literals.
fn count_placeholders(sql: &str) -> usize {
    let mut count = 0;
    let mut quote: Option<char> = None;
    for c in sql.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'') | (None, '"') => quote = Some(c),
            (None, '?') => count += 1,
            _ => {}
        }
    }
    count
}

fn has_or_keyword(fragment: &str) -> bool {
    fragment
        .split_whitespace()
        .any(|word| word.eq_ignore_ascii_case("or"))
}

pub(super) fn checked_identifier(name: &str) -> Result<&str> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '*');
    if valid {
        Ok(name)
    } else {
        Err(DataError::Validation(format!("invalid column name: {}", name)))
    }
}

fn checked_sort_order(order: &str) -> Result<&str> {
    let valid = order
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ',' | ' '));
    if valid {
        Ok(order)
    } else {
        Err(DataError::Validation(format!("invalid sort order: {}", order)))
    }
}
