//! Benchmark for the scan burst and replay pipelines.
//!
//! A fake beacon source and an in-memory sink stand in for Bluetooth and the
//! network, so only decoding, filtering and bookkeeping are measured.

use broodminder_bridge::app::{RunMode, ScanOptions, run_burst};
use broodminder_bridge::replay::snapshot::Snapshot;
use broodminder_bridge::replay::{Watermarks, replay};
use broodminder_bridge::sink::{BoxFuture, DeliveryError, RetryPolicy, Sink};
use broodminder_bridge::{Beacon, BeaconSource, MacAddress, Reading, ScanError};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rusqlite::{Connection, params};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};

fn payload(sample: u8) -> Vec<u8> {
    vec![
        0x8d, 0x02, 0x00, 0x00, 0x00, 0x00, 0x57, sample, 0x00, 0xEC, 0x13, 0x00, 0xE7, 0x83,
        0xE9, 0x80, 0x37,
    ]
}

struct FakeSource {
    beacons: Vec<Beacon>,
}

impl FakeSource {
    /// `size` beacons, every fourth one from another vendor.
    fn new(size: usize) -> Self {
        let beacons = (0..size)
            .map(|i| {
                let broodminder = i % 4 != 3;
                Beacon {
                    address: MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, i as u8]),
                    rssi: Some(-70),
                    local_name: Some(format!("4300{i:04}")),
                    manufacturer_data: Some(if broodminder {
                        payload(i as u8)
                    } else {
                        vec![0x4c, 0x00, 0x02, 0x15]
                    }),
                }
            })
            .collect();
        Self { beacons }
    }
}

impl BeaconSource for FakeSource {
    fn scan(
        &self,
        _duration: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Beacon>, ScanError>> + Send + '_>> {
        let beacons = self.beacons.clone();
        Box::pin(async move { Ok(beacons) })
    }
}

/// Sink that only counts, with no stored points for watermarks.
#[derive(Default)]
struct CountingSink {
    delivered: AtomicUsize,
}

impl Sink for CountingSink {
    fn deliver<'a>(&'a self, _reading: &'a Reading) -> BoxFuture<'a, Result<(), DeliveryError>> {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Box::pin(async { Ok(()) })
    }
}

impl Watermarks for CountingSink {
    fn latest_timestamp<'a>(
        &'a self,
        _device_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<i64>, DeliveryError>> {
        Box::pin(async { Ok(None) })
    }
}

fn runtime() -> Runtime {
    Builder::new_current_thread().enable_time().build().unwrap()
}

fn options() -> ScanOptions {
    ScanOptions {
        mode: RunMode::OneShot,
        scan_duration: Duration::ZERO,
        interval: Duration::ZERO,
        retry: RetryPolicy::once(),
    }
}

fn bench_scan_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan_burst");
    let rt = runtime();

    for size in [1, 10, 100] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let source = FakeSource::new(size);
            let options = options();
            b.iter(|| {
                let sink = CountingSink::default();
                let report = rt.block_on(run_burst(&source, &sink, &options)).unwrap();
                black_box(report)
            })
        });
    }

    group.finish();
}

fn snapshot(devices: usize, rows_per_device: usize) -> Snapshot {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(
        "CREATE TABLE StoredSensorReading (
            DeviceId TEXT, Sample INTEGER, Timestamp INTEGER,
            Temperature REAL, Humidity INTEGER, Battery INTEGER
        );",
    )
    .unwrap();
    for device in 0..devices {
        for row in 0..rows_per_device {
            conn.execute(
                "INSERT INTO StoredSensorReading VALUES (?1, ?2, ?3, 68.0, 50, 90)",
                params![
                    format!("4300{device:04}"),
                    row as i64,
                    1_700_000_000 + (row as i64) * 300
                ],
            )
            .unwrap();
        }
    }
    Snapshot::from_connection(conn)
}

fn bench_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay");
    let rt = runtime();

    for (devices, rows) in [(1, 1000), (10, 100)] {
        group.throughput(Throughput::Elements((devices * rows) as u64));
        group.bench_function(format!("{devices}x{rows}"), |b| {
            b.iter_batched(
                || snapshot(devices, rows),
                |snapshot| {
                    let sink = CountingSink::default();
                    rt.block_on(replay(snapshot, &sink, &sink, &RetryPolicy::once()))
                        .unwrap()
                },
                criterion::BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_scan_burst, bench_replay);
criterion_main!(benches);
