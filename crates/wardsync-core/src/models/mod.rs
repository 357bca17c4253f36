//! Domain models for clinical records.
//!
//! - `Patient`, `PatientDelta`, `Gender`
//! - `Location` with its `LocalizedString` names
//! - `Encounter`, `Order`, `Observation`, `VoidObs`
//! - `User`

pub mod clinical;
pub mod localized;
pub mod location;
pub mod patient;
pub mod user;

pub use clinical::{
    Encounter, EncounterObservation, Observation, Order, VoidObs, ORDER_EXECUTED_CONCEPT_UUID,
};
pub use localized::LocalizedString;
pub use location::Location;
pub use patient::{Gender, Patient, PatientDelta};
pub use user::User;
