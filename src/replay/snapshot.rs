//! Read access to a BroodMinder app SQLite export.

use crate::reading::Reading;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, Row, params};
use std::path::Path;
use thiserror::Error;
use tracing::warn;

const DEVICE_ID_INDEX: usize = 0;
const SAMPLE_INDEX: usize = 1;
const TIMESTAMP_INDEX: usize = 2;
const TEMPERATURE_INDEX: usize = 3;
const HUMIDITY_INDEX: usize = 4;
const BATTERY_INDEX: usize = 5;

// DeviceId may be stored as text or integer depending on the app version,
// and Timestamp as INTEGER or REAL. Both are normalised in SQL.
const DEVICE_IDS_QUERY: &str = "SELECT DISTINCT CAST(DeviceId AS TEXT)
    FROM StoredSensorReading
    WHERE DeviceId IS NOT NULL
    ORDER BY 1";

const ROWS_AFTER_QUERY: &str = "SELECT
        CAST(DeviceId AS TEXT),
        Sample,
        CAST(Timestamp AS INTEGER) AS ts,
        Temperature,
        Humidity,
        Battery
    FROM StoredSensorReading
    WHERE CAST(DeviceId AS TEXT) = ?1
        AND Timestamp IS NOT NULL
        AND (?2 IS NULL OR CAST(Timestamp AS INTEGER) > ?2)
    ORDER BY ts ASC, Sample ASC";

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid {column} value {value} for device {device_id}")]
    InvalidValue {
        column: &'static str,
        device_id: String,
        value: String,
    },
}

/// Rows of one device read from a snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceRows {
    /// Complete rows, oldest first
    pub readings: Vec<Reading>,
    /// Rows left out because a measured value was NULL
    pub skipped: usize,
}

/// An opened snapshot database.
pub struct Snapshot {
    conn: Connection,
}

impl Snapshot {
    /// Open a snapshot file read-only.
    pub fn open(path: &Path) -> Result<Self, SnapshotError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    /// Distinct device ids present in the snapshot, sorted.
    pub fn device_ids(&self) -> Result<Vec<String>, SnapshotError> {
        let mut stmt = self.conn.prepare(DEVICE_IDS_QUERY)?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Rows of one device stored strictly after `after` (Unix seconds),
    /// oldest first. `None` returns every row.
    ///
    /// Rows with a NULL sample, temperature, humidity or battery are counted
    /// in [`DeviceRows::skipped`] instead of failing the device.
    pub fn rows_after(
        &self,
        device_id: &str,
        after: Option<i64>,
    ) -> Result<DeviceRows, SnapshotError> {
        let mut stmt = self.conn.prepare(ROWS_AFTER_QUERY)?;
        let mut rows = stmt.query(params![device_id, after])?;

        let mut device_rows = DeviceRows::default();
        while let Some(row) = rows.next()? {
            if let Some(column) = missing_column(row)? {
                let timestamp: i64 = row.get(TIMESTAMP_INDEX)?;
                warn!(device_id, timestamp, column, "Skipping snapshot row without a value");
                device_rows.skipped += 1;
                continue;
            }
            device_rows.readings.push(reading_from_row(row)?);
        }
        Ok(device_rows)
    }
}

/// First measured column that is NULL in `row`, if any.
fn missing_column(row: &Row<'_>) -> Result<Option<&'static str>, SnapshotError> {
    const MEASURED: [(usize, &str); 4] = [
        (SAMPLE_INDEX, "Sample"),
        (TEMPERATURE_INDEX, "Temperature"),
        (HUMIDITY_INDEX, "Humidity"),
        (BATTERY_INDEX, "Battery"),
    ];
    for (index, column) in MEASURED {
        if matches!(row.get_ref(index)?, ValueRef::Null) {
            return Ok(Some(column));
        }
    }
    Ok(None)
}

fn reading_from_row(row: &Row<'_>) -> Result<Reading, SnapshotError> {
    let device_id: String = row.get(DEVICE_ID_INDEX)?;
    let sample: i64 = row.get(SAMPLE_INDEX)?;
    let timestamp: i64 = row.get(TIMESTAMP_INDEX)?;
    let temperature: f64 = row.get(TEMPERATURE_INDEX)?;
    let humidity: f64 = row.get(HUMIDITY_INDEX)?;
    let battery: f64 = row.get(BATTERY_INDEX)?;

    let sample = u32::try_from(sample).map_err(|_| SnapshotError::InvalidValue {
        column: "Sample",
        device_id: device_id.clone(),
        value: sample.to_string(),
    })?;
    let humidity = percent("Humidity", &device_id, humidity)?;
    let battery = percent("Battery", &device_id, battery)?;

    Ok(Reading::from_fahrenheit(
        device_id,
        sample,
        timestamp,
        temperature,
        humidity,
        battery,
    ))
}

fn percent(column: &'static str, device_id: &str, value: f64) -> Result<u8, SnapshotError> {
    let rounded = value.round();
    if !(0.0..=f64::from(u8::MAX)).contains(&rounded) {
        return Err(SnapshotError::InvalidValue {
            column,
            device_id: device_id.to_string(),
            value: value.to_string(),
        });
    }
    Ok(rounded as u8)
}
