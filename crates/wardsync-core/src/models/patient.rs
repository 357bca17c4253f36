//! Patient record and the partial update applied to it.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::cursor::FromRow;
use crate::error::{DataError, Result};
use crate::store::contracts::{patients, ROW_ID};
use crate::store::{ContentValues, Row};

const BIRTHDATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Gender {
    #[default]
    Unknown,
    Male,
    Female,
}

impl Gender {
    /// Stored and wire code, `M` or `F`.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Gender::Male => Some("M"),
            Gender::Female => Some("F"),
            Gender::Unknown => None,
        }
    }

    pub fn from_code(code: &str) -> Self {
        match code {
            "M" | "m" => Gender::Male,
            "F" | "f" => Gender::Female,
            _ => Gender::Unknown,
        }
    }
}

impl std::fmt::Display for Gender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Gender::Male => write!(f, "M"),
            Gender::Female => write!(f, "F"),
            Gender::Unknown => write!(f, "?"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    /// Local row id; `None` until stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_id: Option<i64>,
    /// Human-readable patient id, e.g. `KH.31`.
    pub id: Option<String>,
    pub uuid: String,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    #[serde(default)]
    pub gender: Gender,
    pub birthdate: Option<NaiveDate>,
    pub admission_time: Option<DateTime<Utc>>,
    pub location_uuid: Option<String>,
}

impl Patient {
    pub fn new(uuid: &str) -> Self {
        Self {
            row_id: None,
            id: None,
            uuid: uuid.to_string(),
            given_name: None,
            family_name: None,
            gender: Gender::Unknown,
            birthdate: None,
            admission_time: None,
            location_uuid: None,
        }
    }

    pub fn full_name(&self) -> String {
        format!(
            "{} {}",
            self.given_name.as_deref().unwrap_or(""),
            self.family_name.as_deref().unwrap_or("")
        )
        .trim()
        .to_string()
    }

    /// Column values for a full insert or replacement of this patient.
    pub fn to_content_values(&self) -> ContentValues {
        let mut values = ContentValues::new();
        values
            .put_opt_str(patients::ID, self.id.as_deref())
            .put_str(patients::UUID, &self.uuid)
            .put_opt_str(patients::GIVEN_NAME, self.given_name.as_deref())
            .put_opt_str(patients::FAMILY_NAME, self.family_name.as_deref())
            .put_opt_str(patients::GENDER, self.gender.code())
            .put_opt_str(
                patients::BIRTHDATE,
                self.birthdate
                    .map(|d| d.format(BIRTHDATE_FORMAT).to_string())
                    .as_deref(),
            )
            .put_opt_i64(
                patients::ADMISSION_TIMESTAMP,
                self.admission_time.map(|t| t.timestamp()),
            )
            .put_opt_str(patients::LOCATION_UUID, self.location_uuid.as_deref());
        values
    }
}

impl FromRow for Patient {
    fn from_row(row: &Row) -> Result<Self> {
        let uuid = row
            .get_string(patients::UUID)
            .ok_or_else(|| DataError::Validation("patient row without uuid".to_string()))?;
        Ok(Self {
            row_id: row.get_i64(ROW_ID),
            id: row.get_string(patients::ID),
            uuid,
            given_name: row.get_string(patients::GIVEN_NAME),
            family_name: row.get_string(patients::FAMILY_NAME),
            gender: row
                .get_str(patients::GENDER)
                .map(Gender::from_code)
                .unwrap_or_default(),
            birthdate: row
                .get_str(patients::BIRTHDATE)
                .and_then(|s| NaiveDate::parse_from_str(s, BIRTHDATE_FORMAT).ok()),
            admission_time: row
                .get_i64(patients::ADMISSION_TIMESTAMP)
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
            location_uuid: row.get_string(patients::LOCATION_UUID),
        })
    }
}

/// Partial patient update; only present fields are written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientDelta {
    pub id: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub gender: Option<Gender>,
    pub birthdate: Option<NaiveDate>,
    pub admission_time: Option<DateTime<Utc>>,
    pub location_uuid: Option<String>,
}

impl PatientDelta {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Overwrite the fields of `patient` that are present in this delta.
    pub fn apply(&self, patient: &mut Patient) {
        if let Some(ref id) = self.id {
            patient.id = Some(id.clone());
        }
        if let Some(ref given) = self.given_name {
            patient.given_name = Some(given.clone());
        }
        if let Some(ref family) = self.family_name {
            patient.family_name = Some(family.clone());
        }
        if let Some(gender) = self.gender {
            patient.gender = gender;
        }
        if let Some(birthdate) = self.birthdate {
            patient.birthdate = Some(birthdate);
        }
        if let Some(admission) = self.admission_time {
            patient.admission_time = Some(admission);
        }
        if let Some(ref location) = self.location_uuid {
            patient.location_uuid = Some(location.clone());
        }
    }

    /// Column values for the fields present in this delta.
    pub fn to_content_values(&self) -> ContentValues {
        let mut values = ContentValues::new();
        if let Some(ref id) = self.id {
            values.put_str(patients::ID, id);
        }
        if let Some(ref given) = self.given_name {
            values.put_str(patients::GIVEN_NAME, given);
        }
        if let Some(ref family) = self.family_name {
            values.put_str(patients::FAMILY_NAME, family);
        }
        if let Some(gender) = self.gender {
            values.put_opt_str(patients::GENDER, gender.code());
        }
        if let Some(birthdate) = self.birthdate {
            values.put_str(
                patients::BIRTHDATE,
                &birthdate.format(BIRTHDATE_FORMAT).to_string(),
            );
        }
        if let Some(admission) = self.admission_time {
            values.put(patients::ADMISSION_TIMESTAMP, admission.timestamp());
        }
        if let Some(ref location) = self.location_uuid {
            values.put_str(patients::LOCATION_UUID, location);
        }
        values
    }

    /// A new patient needs an id and both names.
    pub fn validate_for_create(&self) -> Result<()> {
        let missing: Vec<&str> = [
            ("id", &self.id),
            ("given name", &self.given_name),
            ("family name", &self.family_name),
        ]
        .into_iter()
        .filter(|(_, v)| v.as_deref().map(str::trim).unwrap_or("").is_empty())
        .map(|(name, _)| name)
        .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(DataError::Validation(format!(
                "missing patient fields: {}",
                missing.join(", ")
            )))
        }
    }
}
