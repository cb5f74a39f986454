use crate::decoder::{
    BATTERY, FieldSpec, HUMIDITY, MIN_PAYLOAD_LEN, SAMPLE, TEMPERATURE, VENDOR_SIGNATURE,
    WEIGHT_LEFT, WEIGHT_RIGHT, Width,
};
use crate::mac_address::MacAddress;
use crate::reading::Reading;
use crate::replay::Watermarks;
use crate::replay::snapshot::Snapshot;
use crate::scanner::{Beacon, BeaconSource, ScanError};
use crate::sink::{BoxFuture, DeliveryError, Sink};
use rusqlite::{Connection, params};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

/// A stable MAC address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// Raw on-air values, before bias and scaling.
#[derive(Debug, Clone, Copy)]
pub struct RawFields {
    pub sample: u8,
    pub battery: u8,
    pub temperature: u16,
    pub weight_left: u16,
    pub weight_right: u16,
    pub humidity: u8,
}

impl Default for RawFields {
    /// 0 C, zero weight, 50 % humidity, full battery.
    fn default() -> Self {
        Self {
            sample: 1,
            battery: 100,
            temperature: 5000,
            weight_left: 32767,
            weight_right: 32767,
            humidity: 50,
        }
    }
}

fn put(data: &mut [u8], field: &FieldSpec, value: u16) {
    match field.width {
        Width::Byte => data[field.offset] = value as u8,
        Width::Word => {
            data[field.offset..field.offset + 2].copy_from_slice(&value.to_le_bytes());
        }
    }
}

/// Build a minimal BroodMinder manufacturer field carrying `fields`.
pub fn encode_payload(fields: &RawFields) -> Vec<u8> {
    let mut data = vec![0u8; MIN_PAYLOAD_LEN];
    data[..2].copy_from_slice(&VENDOR_SIGNATURE);
    put(&mut data, &BATTERY, fields.battery.into());
    put(&mut data, &SAMPLE, fields.sample.into());
    put(&mut data, &TEMPERATURE, fields.temperature);
    put(&mut data, &WEIGHT_LEFT, fields.weight_left);
    put(&mut data, &WEIGHT_RIGHT, fields.weight_right);
    put(&mut data, &HUMIDITY, fields.humidity.into());
    data
}

/// A live reading with plausible values and no timestamp or weight.
pub fn live_reading(device_id: &str, sample_number: u32) -> Reading {
    Reading {
        device_id: device_id.to_string(),
        sample_number,
        timestamp_seconds: None,
        temperature_celsius: 20.0,
        humidity_percent: 50,
        battery_percent: 100,
        weight_kilograms: None,
    }
}

/// A beacon as a BroodMinder device would advertise it.
pub fn broodminder_beacon(local_name: Option<&str>, fields: &RawFields) -> Beacon {
    Beacon {
        address: TEST_MAC,
        rssi: Some(-60),
        local_name: local_name.map(str::to_string),
        manufacturer_data: Some(encode_payload(fields)),
    }
}

/// In-memory remote store acting as both sink and watermark source.
///
/// The watermark of a device is the newest stored timestamp, or the seeded
/// value when that is newer.
#[derive(Debug, Default)]
pub struct MemoryStore {
    readings: Mutex<Vec<Reading>>,
    seeded: BTreeMap<String, i64>,
    watermark_queries: AtomicUsize,
}

impl MemoryStore {
    pub fn with_watermark(mut self, device_id: &str, timestamp: i64) -> Self {
        self.seeded.insert(device_id.to_string(), timestamp);
        self
    }

    pub fn readings(&self) -> Vec<Reading> {
        self.readings.lock().unwrap().clone()
    }

    pub fn watermark_queries(&self) -> usize {
        self.watermark_queries.load(Ordering::SeqCst)
    }

    fn push(&self, reading: &Reading) {
        self.readings.lock().unwrap().push(reading.clone());
    }

    fn newest(&self, device_id: &str) -> Option<i64> {
        let stored = self
            .readings
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.device_id == device_id)
            .filter_map(|r| r.timestamp_seconds)
            .max();
        stored.max(self.seeded.get(device_id).copied())
    }
}

impl Sink for MemoryStore {
    fn deliver<'a>(&'a self, reading: &'a Reading) -> BoxFuture<'a, Result<(), DeliveryError>> {
        self.push(reading);
        Box::pin(async { Ok(()) })
    }
}

impl Watermarks for MemoryStore {
    fn latest_timestamp<'a>(
        &'a self,
        device_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<i64>, DeliveryError>> {
        self.watermark_queries.fetch_add(1, Ordering::SeqCst);
        let newest = self.newest(device_id);
        Box::pin(async move { Ok(newest) })
    }
}

/// Sink that rejects the first `failures` attempts with HTTP 503.
#[derive(Debug, Default)]
pub struct FlakySink {
    remaining_failures: AtomicU32,
    attempts: AtomicU32,
    pub store: MemoryStore,
}

impl FlakySink {
    pub fn new(failures: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(failures),
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Sink for FlakySink {
    fn deliver<'a>(&'a self, reading: &'a Reading) -> BoxFuture<'a, Result<(), DeliveryError>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Box::pin(async {
                Err(DeliveryError::Rejected {
                    status: 503,
                    body: "unavailable".to_string(),
                })
            });
        }
        self.store.deliver(reading)
    }
}

impl Watermarks for FlakySink {
    fn latest_timestamp<'a>(
        &'a self,
        device_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<i64>, DeliveryError>> {
        self.store.latest_timestamp(device_id)
    }
}

/// Beacon source replaying scripted bursts; once exhausted every burst is empty.
#[derive(Debug, Default)]
pub struct FakeSource {
    bursts: Mutex<VecDeque<Result<Vec<Beacon>, ScanError>>>,
    scans: AtomicUsize,
}

impl FakeSource {
    pub fn new(bursts: Vec<Result<Vec<Beacon>, ScanError>>) -> Self {
        Self {
            bursts: Mutex::new(bursts.into()),
            scans: AtomicUsize::new(0),
        }
    }

    pub fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }
}

impl BeaconSource for FakeSource {
    fn scan(
        &self,
        _duration: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Beacon>, ScanError>> + Send + '_>> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        let burst = self.bursts.lock().unwrap().pop_front().unwrap_or(Ok(Vec::new()));
        Box::pin(async move { burst })
    }
}

/// One `StoredSensorReading` row.
#[derive(Debug, Clone)]
pub struct SnapshotRow {
    pub device_id: String,
    pub sample: u32,
    pub timestamp: i64,
    pub temperature_f: f64,
    pub humidity: f64,
    pub battery: f64,
}

impl SnapshotRow {
    pub fn new(device_id: &str, sample: u32, timestamp: i64) -> Self {
        Self {
            device_id: device_id.to_string(),
            sample,
            timestamp,
            temperature_f: 68.0,
            humidity: 50.0,
            battery: 90.0,
        }
    }
}

fn fill_snapshot(conn: &Connection, rows: &[SnapshotRow]) {
    conn.execute_batch(
        "CREATE TABLE StoredSensorReading (
            Id INTEGER PRIMARY KEY,
            DeviceId TEXT,
            Sample INTEGER,
            Timestamp INTEGER,
            Temperature REAL,
            Humidity INTEGER,
            Battery INTEGER
        );",
    )
    .unwrap();
    for row in rows {
        conn.execute(
            "INSERT INTO StoredSensorReading
                (DeviceId, Sample, Timestamp, Temperature, Humidity, Battery)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.device_id,
                row.sample,
                row.timestamp,
                row.temperature_f,
                row.humidity,
                row.battery
            ],
        )
        .unwrap();
    }
}

/// An in-memory snapshot holding `rows`.
pub fn memory_snapshot(rows: &[SnapshotRow]) -> Snapshot {
    let conn = Connection::open_in_memory().unwrap();
    fill_snapshot(&conn, rows);
    Snapshot::from_connection(conn)
}

/// An in-memory snapshot holding `rows`, then modified by `sql`.
pub fn memory_snapshot_with(rows: &[SnapshotRow], sql: &str) -> Snapshot {
    let conn = Connection::open_in_memory().unwrap();
    fill_snapshot(&conn, rows);
    conn.execute_batch(sql).unwrap();
    Snapshot::from_connection(conn)
}

/// Write a snapshot database holding `rows` to `path`.
pub fn write_snapshot(path: &Path, rows: &[SnapshotRow]) {
    let conn = Connection::open(path).unwrap();
    fill_snapshot(&conn, rows);
}
