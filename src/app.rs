//! Live scan loop for `broodminder-bridge`.
//!
//! This module is decoupled from CLI parsing, Bluetooth and HTTP so it can be
//! tested deterministically with an injected beacon source and sink.

use crate::decoder::{decode, is_broodminder};
use crate::reading::is_valid_device_id;
use crate::scanner::{BeaconSource, ScanError};
use crate::sink::{RetryPolicy, Sink, deliver_with_retry};
use clap::ValueEnum;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Whether the loop scans once or forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum RunMode {
    /// Scan a single burst, deliver what was heard, exit
    #[default]
    OneShot,
    /// Scan, deliver, sleep for the interval, repeat until killed
    Daemon,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::OneShot => write!(f, "one-shot"),
            RunMode::Daemon => write!(f, "daemon"),
        }
    }
}

/// Configuration for the scan loop.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub mode: RunMode,
    pub scan_duration: Duration,
    /// Sleep between bursts in daemon mode
    pub interval: Duration,
    pub retry: RetryPolicy,
}

/// What happened to the beacons of one burst.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BurstReport {
    pub seen: usize,
    /// Not BroodMinder beacons
    pub ignored: usize,
    /// BroodMinder beacons without a usable local name
    pub unnamed: usize,
    pub malformed: usize,
    pub delivered: usize,
    /// Readings dropped after every delivery attempt failed
    pub failed: usize,
}

/// Errors returned by the scan loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error("{0} reading(s) could not be delivered")]
    Undelivered(usize),
}

/// Scan one burst and deliver every BroodMinder reading in it.
///
/// Beacons that are not BroodMinder, have no usable name or cannot be decoded are
/// counted and skipped. A reading that still fails after retries is logged
/// and counted as failed; it does not stop the burst.
pub async fn run_burst<B, S>(
    source: &B,
    sink: &S,
    options: &ScanOptions,
) -> Result<BurstReport, ScanError>
where
    B: BeaconSource + ?Sized,
    S: Sink + ?Sized,
{
    let beacons = source.scan(options.scan_duration).await?;
    let mut report = BurstReport {
        seen: beacons.len(),
        ..BurstReport::default()
    };

    for beacon in beacons {
        let data = beacon.manufacturer_data.as_deref();
        if !is_broodminder(data) {
            debug!(address = %beacon.address, "Ignoring non-BroodMinder beacon");
            report.ignored += 1;
            continue;
        }

        let name = beacon.local_name.as_deref();
        let Some(device_id) = name.filter(|name| is_valid_device_id(name)) else {
            warn!(
                address = %beacon.address,
                name = ?name,
                "BroodMinder beacon without a usable name, skipping"
            );
            report.unnamed += 1;
            continue;
        };

        let reading = match decode(device_id, data) {
            Ok(reading) => reading,
            Err(err) => {
                debug!(address = %beacon.address, device_id, "{err}");
                report.malformed += 1;
                continue;
            }
        };

        info!(rssi = ?beacon.rssi, "{reading}");

        match deliver_with_retry(sink, &reading, &options.retry).await {
            Ok(()) => report.delivered += 1,
            Err(err) => {
                error!(
                    device_id,
                    sample = reading.sample_number,
                    "Dropping reading after {} attempt(s): {err}",
                    options.retry.max_attempts
                );
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

/// Run the scan loop.
///
/// In one-shot mode this returns after a single burst, failing with
/// [`RunError::Undelivered`] if any reading was dropped. In daemon mode it
/// only returns on a fatal scan error.
pub async fn run<B, S>(source: &B, sink: &S, options: &ScanOptions) -> Result<(), RunError>
where
    B: BeaconSource + ?Sized,
    S: Sink + ?Sized,
{
    info!(
        mode = %options.mode,
        scan_duration = ?options.scan_duration,
        "Starting scan loop"
    );

    loop {
        let failed = match run_burst(source, sink, options).await {
            Ok(report) => {
                info!(
                    seen = report.seen,
                    ignored = report.ignored,
                    unnamed = report.unnamed,
                    malformed = report.malformed,
                    delivered = report.delivered,
                    failed = report.failed,
                    "Scan burst finished"
                );
                report.failed
            }
            Err(err) if err.is_recoverable() => {
                warn!("Scan burst discarded: {err}");
                0
            }
            Err(err) => return Err(err.into()),
        };

        match options.mode {
            RunMode::OneShot if failed > 0 => return Err(RunError::Undelivered(failed)),
            RunMode::OneShot => return Ok(()),
            RunMode::Daemon => {
                debug!(interval = ?options.interval, "Sleeping until next burst");
                tokio::time::sleep(options.interval).await;
            }
        }
    }
}
