//! Typed cursors over materialized query results.
//!
//! A `TypedCursor` is a cheap handle: clones share both the rows and the
//! close state, so closing any handle closes all of them. The rows are freed
//! when the last handle drops, closed or not.

mod filtered;

pub use filtered::FilteredCursor;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{DataError, Result};
use crate::store::{ResultSet, Row};

/// Conversion from one materialized row.
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> Result<Self>;
}

pub struct TypedCursor<T> {
    rows: Arc<[T]>,
    closed: Arc<AtomicBool>,
}

impl<T> Clone for TypedCursor<T> {
    fn clone(&self) -> Self {
        Self {
            rows: self.rows.clone(),
            closed: self.closed.clone(),
        }
    }
}

impl<T> std::fmt::Debug for TypedCursor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedCursor")
            .field("rows", &self.rows.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> TypedCursor<T> {
    pub fn new(rows: Vec<T>) -> Self {
        Self {
            rows: rows.into(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(DataError::CursorClosed)
        } else {
            Ok(())
        }
    }

    pub fn count(&self) -> Result<usize> {
        self.check_open()?;
        Ok(self.rows.len())
    }

    pub fn get(&self, index: usize) -> Result<&T> {
        self.check_open()?;
        self.rows.get(index).ok_or(DataError::IndexOutOfRange {
            index,
            count: self.rows.len(),
        })
    }

    pub fn iter(&self) -> Result<std::slice::Iter<'_, T>> {
        self.check_open()?;
        Ok(self.rows.iter())
    }

    /// Close every handle of this cursor. Closing twice is a no-op.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<T: FromRow> TypedCursor<T> {
    /// Convert every row of `rows`, failing on the first row that does not convert.
    pub fn load(rows: ResultSet) -> Result<Self> {
        let items = rows
            .iter()
            .map(T::from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(items))
    }
}
