use super::TypedCursor;
use crate::error::{DataError, Result};
use crate::filter::Matcher;

/// A fixed subset of a backing cursor.
///
/// The matcher runs once per backing row at construction; afterwards only
/// the matching indices are kept, so no row is copied.
#[derive(Debug)]
pub struct FilteredCursor<T> {
    backing: TypedCursor<T>,
    indices: Vec<usize>,
}

impl<T> FilteredCursor<T> {
    pub fn new<M>(backing: TypedCursor<T>, matcher: &M, constraint: &str) -> Result<Self>
    where
        M: Matcher<T> + ?Sized,
    {
        let indices = backing
            .iter()?
            .enumerate()
            .filter(|(_, item)| matcher.matches(item, constraint))
            .map(|(i, _)| i)
            .collect();
        Ok(Self { backing, indices })
    }

    pub fn count(&self) -> usize {
        self.indices.len()
    }

    pub fn get(&self, index: usize) -> Result<&T> {
        let backing_index = *self.indices.get(index).ok_or(DataError::IndexOutOfRange {
            index,
            count: self.indices.len(),
        })?;
        self.backing.get(backing_index)
    }

    /// Matching items in backing order. Each call starts a fresh pass.
    pub fn iter(&self) -> Result<impl Iterator<Item = &T> + '_> {
        let rows = self.backing.iter()?.as_slice();
        Ok(self.indices.iter().filter_map(move |&i| rows.get(i)))
    }

    /// Close the backing cursor.
    pub fn close(&self) {
        self.backing.close();
    }

    pub fn is_closed(&self) -> bool {
        self.backing.is_closed()
    }
}
