//! Location hierarchy: the immutable tree, its disk snapshot and the cache
//! that keeps one resident tree current.

mod cache;
mod snapshot;
mod tree;

pub use cache::LocationTreeCache;
pub use snapshot::{CachedData, SnapshotStore, TreeSnapshot};
pub use tree::{Ancestors, Descendants, LocationNode, LocationTree};

use std::collections::HashMap;

use crate::error::Result;
use crate::models::{LocalizedString, Location};
use crate::store::contracts::{location_names, locations, patient_counts, ROW_ID};
use crate::store::{ContentRouter, Query, ResourcePath};

/// Build a tree from the locations, names and patient counts in the store.
pub fn load_tree_from_store(router: &ContentRouter, locale: &str) -> Result<LocationTree> {
    let mut names: HashMap<String, LocalizedString> = HashMap::new();
    for row in router.query(&ResourcePath::LocationNames, &Query::new())?.iter() {
        let (Some(uuid), Some(name_locale), Some(name)) = (
            row.get_str(location_names::LOCATION_UUID),
            row.get_str(location_names::LOCALE),
            row.get_str(location_names::NAME),
        ) else {
            continue;
        };
        names
            .entry(uuid.to_string())
            .or_default()
            .add_translation(name_locale, name);
    }

    let rows = router.query(
        &ResourcePath::Locations,
        &Query::new().order_by(ROW_ID),
    )?;
    let mut flat = Vec::with_capacity(rows.len());
    for row in rows.iter() {
        let Some(uuid) = row.get_str(locations::LOCATION_UUID) else {
            continue;
        };
        let mut location = Location::new(uuid, row.get_str(locations::PARENT_UUID));
        if let Some(localized) = names.remove(uuid) {
            location.names = localized;
        }
        flat.push(location);
    }

    let counts: HashMap<String, u64> = router
        .query(&ResourcePath::PatientCounts, &Query::new())?
        .iter()
        .filter_map(|row| {
            let uuid = row.get_string(patient_counts::LOCATION_UUID)?;
            let count = row.get_i64(patient_counts::TENT_PATIENT_COUNT)?;
            Some((uuid, u64::try_from(count).unwrap_or(0)))
        })
        .collect();

    Ok(LocationTree::build(flat, &counts)?.with_locale(locale))
}
