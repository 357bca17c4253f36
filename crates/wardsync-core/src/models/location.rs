use serde::{Deserialize, Serialize};

use super::LocalizedString;
use crate::store::contracts::{location_names, locations};
use crate::store::ContentValues;

/// One location row with its names in every known locale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub uuid: String,
    /// `None` for a root location.
    pub parent_uuid: Option<String>,
    #[serde(default)]
    pub names: LocalizedString,
}

impl Location {
    pub fn new(uuid: &str, parent_uuid: Option<&str>) -> Self {
        Self {
            uuid: uuid.to_string(),
            parent_uuid: parent_uuid.map(str::to_string),
            names: LocalizedString::new(),
        }
    }

    pub fn named(mut self, locale: &str, name: &str) -> Self {
        self.names.add_translation(locale, name);
        self
    }

    pub fn to_content_values(&self) -> ContentValues {
        let mut values = ContentValues::new();
        values
            .put_str(locations::LOCATION_UUID, &self.uuid)
            .put_opt_str(locations::PARENT_UUID, self.parent_uuid.as_deref());
        values
    }

    /// One `location_names` row per locale.
    pub fn name_rows(&self) -> Vec<ContentValues> {
        self.names
            .locales()
            .filter_map(|locale| {
                let name = self.names.translation_for(locale)?;
                let mut values = ContentValues::new();
                values
                    .put_str(location_names::LOCATION_UUID, &self.uuid)
                    .put_str(location_names::LOCALE, locale)
                    .put_str(location_names::NAME, name);
                Some(values)
            })
            .collect()
    }
}
