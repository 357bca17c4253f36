use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use uuid::Uuid;

use super::{Batch, RemoteError, RemoteResult, RemoteSource};
use crate::models::{Encounter, Location, Observation, Order, Patient, PatientDelta, User, VoidObs};

/// How every call of a failing `MockRemote` fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    Offline,
    ServerError,
}

impl MockFailure {
    fn error(self) -> RemoteError {
        match self {
            MockFailure::Offline => RemoteError::Connectivity("server unreachable".to_string()),
            MockFailure::ServerError => RemoteError::ServerError("internal error".to_string()),
        }
    }
}

#[derive(Default)]
struct Records {
    locations: Vec<Location>,
    patients: Vec<Patient>,
    users: Vec<User>,
    orders: Vec<Order>,
    observations: Vec<Observation>,
}

/// In-memory records server.
///
/// Counts calls per operation, can be switched to fail every call, and can
/// hold `list_locations` (the first call of a full sync) until released.
pub struct MockRemote {
    records: Mutex<Records>,
    calls: Mutex<HashMap<&'static str, usize>>,
    failure: Mutex<Option<MockFailure>>,
    gate: watch::Sender<bool>,
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRemote {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            records: Mutex::new(Records::default()),
            calls: Mutex::new(HashMap::new()),
            failure: Mutex::new(None),
            gate,
        }
    }

    pub fn with_location(self, location: Location) -> Self {
        self.records.lock().locations.push(location);
        self
    }

    pub fn with_patient(self, patient: Patient) -> Self {
        self.records.lock().patients.push(patient);
        self
    }

    pub fn with_user(self, user: User) -> Self {
        self.records.lock().users.push(user);
        self
    }

    pub fn with_order(self, order: Order) -> Self {
        self.records.lock().orders.push(order);
        self
    }

    pub fn with_observation(self, observation: Observation) -> Self {
        self.records.lock().observations.push(observation);
        self
    }

    pub fn patients(&self) -> Vec<Patient> {
        self.records.lock().patients.clone()
    }

    pub fn orders(&self) -> Vec<Order> {
        self.records.lock().orders.clone()
    }

    pub fn observations(&self) -> Vec<Observation> {
        self.records.lock().observations.clone()
    }

    /// Number of calls made to `operation`, e.g. `"list_locations"`.
    pub fn calls(&self, operation: &str) -> usize {
        self.calls.lock().get(operation).copied().unwrap_or(0)
    }

    pub fn set_failure(&self, failure: Option<MockFailure>) {
        *self.failure.lock() = failure;
    }

    /// Make `list_locations` wait until `release` is called.
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    fn enter(&self, operation: &'static str) -> RemoteResult<()> {
        *self.calls.lock().entry(operation).or_insert(0) += 1;
        match *self.failure.lock() {
            Some(failure) => Err(failure.error()),
            None => Ok(()),
        }
    }

    async fn wait_for_gate(&self) {
        let mut open = self.gate.subscribe();
        // The sender lives in self, so the channel cannot close while waiting.
        let _ = open.wait_for(|open| *open).await;
    }
}

#[async_trait]
impl RemoteSource for MockRemote {
    async fn list_locations(&self) -> RemoteResult<Vec<Location>> {
        self.wait_for_gate().await;
        self.enter("list_locations")?;
        Ok(self.records.lock().locations.clone())
    }

    async fn list_patients(&self) -> RemoteResult<Vec<Patient>> {
        self.enter("list_patients")?;
        Ok(self.records.lock().patients.clone())
    }

    async fn list_users(&self) -> RemoteResult<Vec<User>> {
        self.enter("list_users")?;
        Ok(self.records.lock().users.clone())
    }

    async fn list_orders(&self) -> RemoteResult<Vec<Order>> {
        self.enter("list_orders")?;
        Ok(self.records.lock().orders.clone())
    }

    async fn list_observations_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> RemoteResult<Batch<Observation>> {
        self.enter("list_observations_since")?;
        let items = self
            .records
            .lock()
            .observations
            .iter()
            .filter(|o| since.map_or(true, |since| o.encounter_time > since))
            .cloned()
            .collect();
        Ok(Batch {
            items,
            server_time: Utc::now(),
        })
    }

    async fn get_patient(&self, id: &str) -> RemoteResult<Patient> {
        self.enter("get_patient")?;
        self.records
            .lock()
            .patients
            .iter()
            .find(|p| p.id.as_deref() == Some(id))
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("patient {}", id)))
    }

    async fn add_patient(&self, delta: &PatientDelta) -> RemoteResult<Patient> {
        self.enter("add_patient")?;
        let mut patient = Patient::new(&Uuid::new_v4().to_string());
        delta.apply(&mut patient);
        self.records.lock().patients.push(patient.clone());
        Ok(patient)
    }

    async fn update_patient(&self, uuid: &str, delta: &PatientDelta) -> RemoteResult<Patient> {
        self.enter("update_patient")?;
        let mut records = self.records.lock();
        let patient = records
            .patients
            .iter_mut()
            .find(|p| p.uuid == uuid)
            .ok_or_else(|| RemoteError::NotFound(format!("patient {}", uuid)))?;
        delta.apply(patient);
        Ok(patient.clone())
    }

    async fn delete_patient(&self, uuid: &str) -> RemoteResult<()> {
        self.enter("delete_patient")?;
        self.records.lock().patients.retain(|p| p.uuid != uuid);
        Ok(())
    }

    async fn add_encounter(&self, encounter: &Encounter) -> RemoteResult<Encounter> {
        self.enter("add_encounter")?;
        let mut stored = encounter.clone();
        stored.uuid = Some(Uuid::new_v4().to_string());
        let mut records = self.records.lock();
        for mut obs in stored.observation_rows() {
            obs.uuid = Some(Uuid::new_v4().to_string());
            records.observations.push(obs);
        }
        Ok(stored)
    }

    async fn save_order(&self, order: &Order) -> RemoteResult<Order> {
        self.enter("save_order")?;
        let mut records = self.records.lock();
        let mut saved = order.clone();
        match saved.uuid {
            Some(ref uuid) => {
                let existing = records
                    .orders
                    .iter_mut()
                    .find(|o| o.uuid.as_deref() == Some(uuid.as_str()))
                    .ok_or_else(|| RemoteError::NotFound(format!("order {}", uuid)))?;
                *existing = saved.clone();
            }
            None => {
                saved.uuid = Some(Uuid::new_v4().to_string());
                records.orders.push(saved.clone());
            }
        }
        Ok(saved)
    }

    async fn delete_order(&self, uuid: &str) -> RemoteResult<()> {
        self.enter("delete_order")?;
        self.records
            .lock()
            .orders
            .retain(|o| o.uuid.as_deref() != Some(uuid));
        Ok(())
    }

    async fn void_observation(&self, obs: &VoidObs) -> RemoteResult<()> {
        self.enter("void_observation")?;
        let mut records = self.records.lock();
        let observation = records
            .observations
            .iter_mut()
            .find(|o| o.uuid.as_deref() == Some(obs.uuid.as_str()))
            .ok_or_else(|| RemoteError::NotFound(format!("observation {}", obs.uuid)))?;
        observation.voided = true;
        Ok(())
    }
}
