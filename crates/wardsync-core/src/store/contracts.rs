//! Table and column names of the local store.

/// Row id column present on every table.
pub const ROW_ID: &str = "_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Patients,
    Locations,
    LocationNames,
    Observations,
    Orders,
    Users,
    Misc,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::Patients => "patients",
            Table::Locations => "locations",
            Table::LocationNames => "location_names",
            Table::Observations => "observations",
            Table::Orders => "orders",
            Table::Users => "users",
            Table::Misc => "misc",
        }
    }

    /// Column identifying a single row in resource paths such as `orders/{uuid}`.
    pub fn key_column(&self) -> &'static str {
        match self {
            Table::Patients | Table::Misc | Table::LocationNames => ROW_ID,
            Table::Locations => locations::LOCATION_UUID,
            Table::Observations => observations::UUID,
            Table::Orders => orders::UUID,
            Table::Users => users::UUID,
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub mod patients {
    pub const ID: &str = "id";
    pub const UUID: &str = "uuid";
    pub const GIVEN_NAME: &str = "given_name";
    pub const FAMILY_NAME: &str = "family_name";
    pub const GENDER: &str = "gender";
    pub const BIRTHDATE: &str = "birthdate";
    pub const ADMISSION_TIMESTAMP: &str = "admission_timestamp";
    pub const LOCATION_UUID: &str = "location_uuid";
}

pub mod patient_counts {
    pub const LOCATION_UUID: &str = "location_uuid";
    pub const TENT_PATIENT_COUNT: &str = "tent_patient_count";
}

pub mod locations {
    pub const LOCATION_UUID: &str = "location_uuid";
    pub const PARENT_UUID: &str = "parent_uuid";
}

pub mod location_names {
    pub const LOCATION_UUID: &str = "location_uuid";
    pub const LOCALE: &str = "locale";
    pub const NAME: &str = "name";
}

pub mod observations {
    pub const UUID: &str = "uuid";
    pub const PATIENT_UUID: &str = "patient_uuid";
    pub const ENCOUNTER_UUID: &str = "encounter_uuid";
    pub const ENCOUNTER_TIME: &str = "encounter_time";
    pub const CONCEPT_UUID: &str = "concept_uuid";
    pub const VALUE: &str = "value";
    pub const VOIDED: &str = "voided";
}

pub mod orders {
    pub const UUID: &str = "uuid";
    pub const PATIENT_UUID: &str = "patient_uuid";
    pub const INSTRUCTIONS: &str = "instructions";
    pub const START_MILLIS: &str = "start_millis";
    pub const STOP_MILLIS: &str = "stop_millis";
}

pub mod users {
    pub const UUID: &str = "uuid";
    pub const FULL_NAME: &str = "full_name";
}

pub mod misc {
    /// Written as the first operation of a full sync.
    pub const FULL_SYNC_START_MILLIS: &str = "full_sync_start_millis";
    /// Written as the last operation of a full sync.
    pub const FULL_SYNC_END_MILLIS: &str = "full_sync_end_millis";
    /// Server time of the last observation batch, used for incremental fetches.
    pub const OBS_SYNC_MILLIS: &str = "obs_sync_millis";
}
