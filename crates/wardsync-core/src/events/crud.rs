//! Results of `AppModel` operations, posted on a consumer-scoped bus.

use std::sync::Arc;

use tracing::debug;

use super::bus::{BusEvent, CleanupSubscriber, EventBus};
use crate::cursor::TypedCursor;
use crate::error::{DataError, FailureReason};
use crate::location::LocationTree;
use crate::models::{Encounter, Observation, Order, Patient, User};

/// A cursor returned by a fetch.
#[derive(Debug, Clone)]
pub enum FetchedCursor {
    Patients(TypedCursor<Patient>),
    Users(TypedCursor<User>),
    Observations(TypedCursor<Observation>),
}

impl FetchedCursor {
    pub fn close(&self) {
        match self {
            FetchedCursor::Patients(c) => c.close(),
            FetchedCursor::Users(c) => c.close(),
            FetchedCursor::Observations(c) => c.close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            FetchedCursor::Patients(c) => c.is_closed(),
            FetchedCursor::Users(c) => c.is_closed(),
            FetchedCursor::Observations(c) => c.is_closed(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Patient(Patient),
    Encounter(Encounter),
    Order(Order),
    Observation(Observation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Patient,
    Encounter,
    Order,
    Observation,
}

/// The operation a failure event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    FetchPatients,
    FetchPatient,
    DownloadPatient,
    FetchUsers,
    FetchObservations,
    FetchLocationTree,
    AddPatient,
    UpdatePatient,
    DeletePatient,
    AddEncounter,
    SaveOrder,
    DeleteOrder,
    VoidObservation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub task: TaskKind,
    pub reason: FailureReason,
    pub message: String,
}

impl TaskFailure {
    pub fn new(task: TaskKind, error: &DataError) -> Self {
        Self {
            task,
            reason: error.reason(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum CrudEvent {
    CursorFetched(FetchedCursor),
    ItemFetched(Item),
    ItemCreated(Item),
    ItemUpdated(Item),
    ItemDeleted { kind: ItemKind, uuid: String },
    LocationTreeFetched(Arc<LocationTree>),
    TaskFailed(TaskFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrudEventKind {
    CursorFetched,
    ItemFetched,
    ItemCreated,
    ItemUpdated,
    ItemDeleted,
    LocationTreeFetched,
    TaskFailed,
}

impl BusEvent for CrudEvent {
    type Kind = CrudEventKind;

    fn kind(&self) -> CrudEventKind {
        match self {
            CrudEvent::CursorFetched(_) => CrudEventKind::CursorFetched,
            CrudEvent::ItemFetched(_) => CrudEventKind::ItemFetched,
            CrudEvent::ItemCreated(_) => CrudEventKind::ItemCreated,
            CrudEvent::ItemUpdated(_) => CrudEventKind::ItemUpdated,
            CrudEvent::ItemDeleted { .. } => CrudEventKind::ItemDeleted,
            CrudEvent::LocationTreeFetched(_) => CrudEventKind::LocationTreeFetched,
            CrudEvent::TaskFailed(_) => CrudEventKind::TaskFailed,
        }
    }
}

/// Closes cursors nobody received and leaves the bus once its last
/// subscriber is gone.
#[derive(Debug, Default)]
pub struct CrudCleanupSubscriber;

impl CleanupSubscriber<CrudEvent> for CrudCleanupSubscriber {
    fn on_no_subscriber(self: Arc<Self>, bus: &EventBus<CrudEvent>, event: &CrudEvent) {
        match event {
            CrudEvent::CursorFetched(cursor) => {
                debug!(bus = bus.name(), "Closing unclaimed cursor");
                cursor.close();
            }
            CrudEvent::LocationTreeFetched(_) => {
                debug!(bus = bus.name(), "Releasing unclaimed location tree");
            }
            _ => {}
        }
    }

    fn on_all_unregistered(self: Arc<Self>, bus: &EventBus<CrudEvent>) {
        let me: Arc<dyn CleanupSubscriber<CrudEvent>> = self;
        bus.unregister_cleanup_subscriber(&me);
    }
}
