use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::LocationTree;
use crate::error::{DataError, Result};
use crate::models::Location;

const SNAPSHOT_NAME: &str = "location_tree";

/// A payload with the time it was written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedData<T> {
    pub data: T,
    pub cached_at: DateTime<Utc>,
}

impl<T> CachedData<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            cached_at: Utc::now(),
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.cached_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        let minutes = self.age_minutes();
        if minutes < 1 {
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            format!("{}h ago", minutes / 60)
        } else {
            format!("{}d ago", minutes / 1440)
        }
    }
}

/// Serialized form of a location tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub locale: String,
    pub locations: Vec<Location>,
    #[serde(default)]
    pub counts: HashMap<String, u64>,
}

impl TreeSnapshot {
    pub fn of(tree: &LocationTree) -> Self {
        let (locations, counts) = tree.to_parts();
        Self {
            locale: tree.locale().to_string(),
            locations,
            counts,
        }
    }

    pub fn into_tree(self) -> Result<LocationTree> {
        Ok(LocationTree::build(self.locations, &self.counts)?.with_locale(&self.locale))
    }
}

/// Location tree snapshot stored as JSON in the cache directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    cache_dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    fn path(&self) -> PathBuf {
        self.cache_dir.join(format!("{}.json", SNAPSHOT_NAME))
    }

    /// Load the snapshot. A missing, unreadable or corrupt file is reported
    /// as no snapshot.
    pub fn load(&self) -> Option<CachedData<TreeSnapshot>> {
        let path = self.path();
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) => {
                debug!(?path, error = %e, "No location snapshot");
                return None;
            }
        };
        match serde_json::from_str(&contents) {
            Ok(cached) => Some(cached),
            Err(e) => {
                debug!(?path, error = %e, "Ignoring corrupt location snapshot");
                None
            }
        }
    }

    pub fn save(&self, tree: &LocationTree) -> Result<()> {
        std::fs::create_dir_all(&self.cache_dir)
            .map_err(|e| DataError::Snapshot(format!("create {}: {}", self.cache_dir.display(), e)))?;
        let cached = CachedData::new(TreeSnapshot::of(tree));
        let contents =
            serde_json::to_string_pretty(&cached).map_err(|e| DataError::Snapshot(e.to_string()))?;
        std::fs::write(self.path(), contents)
            .map_err(|e| DataError::Snapshot(format!("write snapshot: {}", e)))?;
        debug!(locations = tree.len(), "Saved location snapshot");
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(self.path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DataError::Snapshot(format!("remove snapshot: {}", e))),
        }
    }
}
