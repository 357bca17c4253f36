//! Encounters, orders and observations.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::cursor::FromRow;
use crate::error::{DataError, Result};
use crate::store::contracts::{observations, orders};
use crate::store::{ContentValues, Row};

/// Concept recorded when an order is marked as executed.
pub const ORDER_EXECUTED_CONCEPT_UUID: &str = "buendia-concept-order_executed";

fn millis_to_time(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// One coded value recorded in an encounter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncounterObservation {
    pub concept_uuid: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Encounter {
    /// Assigned by the server.
    pub uuid: Option<String>,
    pub patient_uuid: String,
    pub encounter_time: DateTime<Utc>,
    #[serde(default)]
    pub observations: Vec<EncounterObservation>,
    /// Orders this encounter records as executed.
    #[serde(default)]
    pub order_uuids: Vec<String>,
}

impl Encounter {
    pub fn new(patient_uuid: &str, encounter_time: DateTime<Utc>) -> Self {
        Self {
            uuid: None,
            patient_uuid: patient_uuid.to_string(),
            encounter_time,
            observations: Vec::new(),
            order_uuids: Vec::new(),
        }
    }

    pub fn observe(mut self, concept_uuid: &str, value: &str) -> Self {
        self.observations.push(EncounterObservation {
            concept_uuid: concept_uuid.to_string(),
            value: value.to_string(),
        });
        self
    }

    /// Observation rows for this encounter, once it has a uuid.
    pub fn observation_rows(&self) -> Vec<Observation> {
        let mut rows: Vec<Observation> = self
            .observations
            .iter()
            .map(|o| Observation {
                uuid: None,
                patient_uuid: self.patient_uuid.clone(),
                encounter_uuid: self.uuid.clone(),
                encounter_time: self.encounter_time,
                concept_uuid: o.concept_uuid.clone(),
                value: Some(o.value.clone()),
                voided: false,
            })
            .collect();
        rows.extend(self.order_uuids.iter().map(|order| Observation {
            uuid: None,
            patient_uuid: self.patient_uuid.clone(),
            encounter_uuid: self.uuid.clone(),
            encounter_time: self.encounter_time,
            concept_uuid: ORDER_EXECUTED_CONCEPT_UUID.to_string(),
            value: Some(order.clone()),
            voided: false,
        }));
        rows
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// `None` for an order that has not been saved yet.
    pub uuid: Option<String>,
    pub patient_uuid: String,
    pub instructions: String,
    pub start: Option<DateTime<Utc>>,
    pub stop: Option<DateTime<Utc>>,
}

impl Order {
    pub fn to_content_values(&self) -> ContentValues {
        let mut values = ContentValues::new();
        values
            .put_opt_str(orders::UUID, self.uuid.as_deref())
            .put_str(orders::PATIENT_UUID, &self.patient_uuid)
            .put_str(orders::INSTRUCTIONS, &self.instructions)
            .put_opt_i64(orders::START_MILLIS, self.start.map(|t| t.timestamp_millis()))
            .put_opt_i64(orders::STOP_MILLIS, self.stop.map(|t| t.timestamp_millis()));
        values
    }
}

impl FromRow for Order {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            uuid: row.get_string(orders::UUID),
            patient_uuid: row
                .get_string(orders::PATIENT_UUID)
                .ok_or_else(|| DataError::Validation("order row without patient".to_string()))?,
            instructions: row.get_string(orders::INSTRUCTIONS).unwrap_or_default(),
            start: row.get_i64(orders::START_MILLIS).and_then(millis_to_time),
            stop: row.get_i64(orders::STOP_MILLIS).and_then(millis_to_time),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub uuid: Option<String>,
    pub patient_uuid: String,
    pub encounter_uuid: Option<String>,
    pub encounter_time: DateTime<Utc>,
    pub concept_uuid: String,
    pub value: Option<String>,
    #[serde(default)]
    pub voided: bool,
}

impl Observation {
    pub fn to_content_values(&self) -> ContentValues {
        let mut values = ContentValues::new();
        values
            .put_opt_str(observations::UUID, self.uuid.as_deref())
            .put_str(observations::PATIENT_UUID, &self.patient_uuid)
            .put_opt_str(observations::ENCOUNTER_UUID, self.encounter_uuid.as_deref())
            .put(observations::ENCOUNTER_TIME, self.encounter_time.timestamp_millis())
            .put_str(observations::CONCEPT_UUID, &self.concept_uuid)
            .put_opt_str(observations::VALUE, self.value.as_deref())
            .put(observations::VOIDED, i64::from(self.voided));
        values
    }
}

impl FromRow for Observation {
    fn from_row(row: &Row) -> Result<Self> {
        let invalid = |what: &str| DataError::Validation(format!("observation row without {}", what));
        Ok(Self {
            uuid: row.get_string(observations::UUID),
            patient_uuid: row
                .get_string(observations::PATIENT_UUID)
                .ok_or_else(|| invalid("patient"))?,
            encounter_uuid: row.get_string(observations::ENCOUNTER_UUID),
            encounter_time: row
                .get_i64(observations::ENCOUNTER_TIME)
                .and_then(millis_to_time)
                .ok_or_else(|| invalid("encounter time"))?,
            concept_uuid: row
                .get_string(observations::CONCEPT_UUID)
                .ok_or_else(|| invalid("concept"))?,
            value: row.get_string(observations::VALUE),
            voided: row.get_bool(observations::VOIDED),
        })
    }
}

/// Request to void one observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoidObs {
    pub uuid: String,
}

impl VoidObs {
    pub fn new(uuid: &str) -> Self {
        Self {
            uuid: uuid.to_string(),
        }
    }
}
