//! Wardsync core - data access and synchronization for a clinical records client.
//!
//! This crate contains everything between the local SQLite store, the remote
//! records server and the screens that display patients:
//!
//! - `store`: selection builder, schema and the `ContentRouter`
//! - `cursor`: typed and filtered cursors over materialized query results
//! - `filter`: reusable SQL selection filters and in-memory matchers
//! - `location`: the location tree, its disk snapshot and the tree cache
//! - `sync`: at-most-one-flight full synchronization
//! - `remote`: the remote source seam and its HTTP implementation
//! - `events`: the event bus and the delivery queue
//! - `model`: `AppModel`, the asynchronous task dispatcher
//! - `app`: wiring of all of the above into one `App`

pub mod app;
pub mod config;
pub mod cursor;
pub mod error;
pub mod events;
pub mod filter;
pub mod location;
pub mod model;
pub mod models;
pub mod remote;
pub mod store;
pub mod sync;

pub use app::App;
pub use config::Config;
pub use error::{DataError, FailureReason, Result};
