use std::sync::Arc;

use super::bus::BusEvent;
use crate::error::FailureReason;
use crate::location::LocationTree;
use crate::models::Patient;

/// Application-wide lifecycle signals.
#[derive(Debug, Clone)]
pub enum GlobalEvent {
    SyncStarted,
    SyncSucceeded,
    SyncFailed { reason: FailureReason },
    LocationsLoaded(Arc<LocationTree>),
    LocationsLoadFailed { reason: FailureReason },
    PatientCreated(Patient),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GlobalEventKind {
    SyncStarted,
    SyncSucceeded,
    SyncFailed,
    LocationsLoaded,
    LocationsLoadFailed,
    PatientCreated,
}

impl BusEvent for GlobalEvent {
    type Kind = GlobalEventKind;

    fn kind(&self) -> GlobalEventKind {
        match self {
            GlobalEvent::SyncStarted => GlobalEventKind::SyncStarted,
            GlobalEvent::SyncSucceeded => GlobalEventKind::SyncSucceeded,
            GlobalEvent::SyncFailed { .. } => GlobalEventKind::SyncFailed,
            GlobalEvent::LocationsLoaded(_) => GlobalEventKind::LocationsLoaded,
            GlobalEvent::LocationsLoadFailed { .. } => GlobalEventKind::LocationsLoadFailed,
            GlobalEvent::PatientCreated(_) => GlobalEventKind::PatientCreated,
        }
    }
}
