//! The remote records server.
//!
//! Everything the data layer needs from the server goes through the
//! `RemoteSource` trait. `HttpRemote` speaks JSON over HTTP; `MockRemote`
//! keeps everything in memory for tests and demos.

mod client;
mod error;
mod mock;

pub use client::HttpRemote;
pub use error::RemoteError;
pub use mock::{MockFailure, MockRemote};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Encounter, Location, Observation, Order, Patient, PatientDelta, User, VoidObs};

/// Items changed since a sync token, with the server time to resume from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch<T> {
    pub items: Vec<T>,
    pub server_time: DateTime<Utc>,
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn list_locations(&self) -> RemoteResult<Vec<Location>>;

    async fn list_patients(&self) -> RemoteResult<Vec<Patient>>;

    async fn list_users(&self) -> RemoteResult<Vec<User>>;

    async fn list_orders(&self) -> RemoteResult<Vec<Order>>;

    /// Observations created or changed after `since`, all of them when `None`.
    async fn list_observations_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> RemoteResult<Batch<Observation>>;

    /// Look up a patient by human-readable id.
    async fn get_patient(&self, id: &str) -> RemoteResult<Patient>;

    async fn add_patient(&self, delta: &PatientDelta) -> RemoteResult<Patient>;

    async fn update_patient(&self, uuid: &str, delta: &PatientDelta) -> RemoteResult<Patient>;

    async fn delete_patient(&self, uuid: &str) -> RemoteResult<()>;

    /// Store an encounter, returning it with its server uuid.
    async fn add_encounter(&self, encounter: &Encounter) -> RemoteResult<Encounter>;

    /// Create the order when it has no uuid, replace it otherwise.
    async fn save_order(&self, order: &Order) -> RemoteResult<Order>;

    async fn delete_order(&self, uuid: &str) -> RemoteResult<()>;

    async fn void_observation(&self, obs: &VoidObs) -> RemoteResult<()>;
}
