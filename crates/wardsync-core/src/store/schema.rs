//! SQLite schema definitions.

use rusqlite::Connection;
use tracing::debug;

use crate::error::Result;

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema if it does not exist yet.
pub fn initialize_schema(conn: &Connection) -> Result<()> {
    let current: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current >= SCHEMA_VERSION {
        debug!(version = current, "Schema up to date");
        return Ok(());
    }

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS patients (
            _id INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT,
            uuid TEXT UNIQUE,
            given_name TEXT,
            family_name TEXT,
            gender TEXT,
            birthdate TEXT,
            admission_timestamp INTEGER,
            location_uuid TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_patients_location ON patients(location_uuid);

        CREATE TABLE IF NOT EXISTS locations (
            _id INTEGER PRIMARY KEY AUTOINCREMENT,
            location_uuid TEXT NOT NULL UNIQUE,
            parent_uuid TEXT
        );

        CREATE TABLE IF NOT EXISTS location_names (
            _id INTEGER PRIMARY KEY AUTOINCREMENT,
            location_uuid TEXT NOT NULL,
            locale TEXT NOT NULL,
            name TEXT NOT NULL,
            UNIQUE (location_uuid, locale)
        );

        CREATE TABLE IF NOT EXISTS observations (
            _id INTEGER PRIMARY KEY AUTOINCREMENT,
            uuid TEXT UNIQUE,
            patient_uuid TEXT NOT NULL,
            encounter_uuid TEXT,
            encounter_time INTEGER NOT NULL,
            concept_uuid TEXT NOT NULL,
            value TEXT,
            voided INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_observations_patient ON observations(patient_uuid);

        CREATE TABLE IF NOT EXISTS orders (
            _id INTEGER PRIMARY KEY AUTOINCREMENT,
            uuid TEXT UNIQUE,
            patient_uuid TEXT NOT NULL,
            instructions TEXT,
            start_millis INTEGER,
            stop_millis INTEGER
        );

        CREATE TABLE IF NOT EXISTS users (
            _id INTEGER PRIMARY KEY AUTOINCREMENT,
            uuid TEXT NOT NULL UNIQUE,
            full_name TEXT
        );

        CREATE TABLE IF NOT EXISTS misc (
            _id INTEGER PRIMARY KEY,
            full_sync_start_millis INTEGER,
            full_sync_end_millis INTEGER,
            obs_sync_millis INTEGER
        );
        INSERT OR IGNORE INTO misc (_id) VALUES (1);",
    )?;

    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    debug!(version = SCHEMA_VERSION, "Schema created");
    Ok(())
}
