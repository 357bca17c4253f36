use serde::{Deserialize, Serialize};

use crate::cursor::FromRow;
use crate::error::{DataError, Result};
use crate::store::contracts::users;
use crate::store::{ContentValues, Row};

/// A provider who can record encounters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub uuid: String,
    pub full_name: String,
}

impl User {
    pub fn to_content_values(&self) -> ContentValues {
        let mut values = ContentValues::new();
        values
            .put_str(users::UUID, &self.uuid)
            .put_str(users::FULL_NAME, &self.full_name);
        values
    }
}

impl FromRow for User {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            uuid: row
                .get_string(users::UUID)
                .ok_or_else(|| DataError::Validation("user row without uuid".to_string()))?,
            full_name: row.get_string(users::FULL_NAME).unwrap_or_default(),
        })
    }
}
