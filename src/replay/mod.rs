//! Replay of stored readings from a snapshot into a sink.
//!
//! For each device in the snapshot, the newest timestamp already present in
//! the remote store (its watermark) is looked up once, and only newer rows are
//! delivered, oldest first. Running the same snapshot twice therefore
//! delivers nothing the second time.

pub mod snapshot;

use crate::reading::is_valid_device_id;
use crate::sink::{BoxFuture, DeliveryError, RetryPolicy, Sink, deliver_with_retry};
use serde::Serialize;
use snapshot::{Snapshot, SnapshotError};
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Remote lookup of the newest stored timestamp per device.
pub trait Watermarks: Send + Sync {
    /// Unix seconds of the latest stored point, or `None` if the device has none.
    fn latest_timestamp<'a>(
        &'a self,
        device_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<i64>, DeliveryError>>;
}

/// Outcome of replaying one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceReplay {
    /// Watermark the rows were filtered against
    pub watermark: Option<i64>,
    /// Rows delivered in this run
    pub delivered: usize,
    /// Rows left out because a measured value was missing
    pub skipped: usize,
    /// Newest timestamp now known to be stored remotely
    pub last_timestamp: Option<i64>,
}

/// Per-device outcome of a replay run, keyed by device id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ReplaySummary {
    pub devices: BTreeMap<String, DeviceReplay>,
}

impl ReplaySummary {
    /// Total rows delivered across all devices.
    pub fn delivered(&self) -> usize {
        self.devices.values().map(|d| d.delivered).sum()
    }
}

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("Watermark lookup for device {device_id} failed: {source}")]
    Watermark {
        device_id: String,
        #[source]
        source: DeliveryError,
    },
    #[error("Delivery of device {device_id} sample {sample} failed: {source}")]
    Delivery {
        device_id: String,
        sample: u32,
        #[source]
        source: DeliveryError,
    },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Watermarks for one run, fetched on first use.
struct WatermarkCache<'w, W: ?Sized> {
    source: &'w W,
    known: BTreeMap<String, Option<i64>>,
}

impl<'w, W: Watermarks + ?Sized> WatermarkCache<'w, W> {
    fn new(source: &'w W) -> Self {
        Self {
            source,
            known: BTreeMap::new(),
        }
    }

    async fn get(&mut self, device_id: &str) -> Result<Option<i64>, ReplayError> {
        if let Some(watermark) = self.known.get(device_id) {
            return Ok(*watermark);
        }
        let watermark = self
            .source
            .latest_timestamp(device_id)
            .await
            .map_err(|source| ReplayError::Watermark {
                device_id: device_id.to_string(),
                source,
            })?;
        self.known.insert(device_id.to_string(), watermark);
        Ok(watermark)
    }
}

/// Deliver every row of `snapshot` newer than its device's watermark.
///
/// Stops at the first row that cannot be delivered after retries; rows
/// delivered before that stay delivered, and the next run resumes from the
/// new watermark.
pub async fn replay<W, S>(
    snapshot: Snapshot,
    watermarks: &W,
    sink: &S,
    retry: &RetryPolicy,
) -> Result<ReplaySummary, ReplayError>
where
    W: Watermarks + ?Sized,
    S: Sink + ?Sized,
{
    let mut cache = WatermarkCache::new(watermarks);
    let mut summary = ReplaySummary::default();

    let device_ids = snapshot.device_ids()?;
    debug!(devices = device_ids.len(), "Replaying snapshot");

    for device_id in device_ids {
        if !is_valid_device_id(&device_id) {
            warn!(device_id = ?device_id, "Skipping snapshot device with an unusable id");
            continue;
        }

        let watermark = cache.get(&device_id).await?;
        let rows = snapshot.rows_after(&device_id, watermark)?;

        let mut outcome = DeviceReplay {
            watermark,
            delivered: 0,
            skipped: rows.skipped,
            last_timestamp: watermark,
        };

        for reading in &rows.readings {
            deliver_with_retry(sink, reading, retry)
                .await
                .map_err(|source| ReplayError::Delivery {
                    device_id: device_id.clone(),
                    sample: reading.sample_number,
                    source,
                })?;
            outcome.delivered += 1;
            outcome.last_timestamp = reading.timestamp_seconds;
        }

        info!(
            device_id = %device_id,
            watermark = ?watermark,
            delivered = outcome.delivered,
            skipped = outcome.skipped,
            "Device replayed"
        );
        summary.devices.insert(device_id, outcome);
    }

    Ok(summary)
}

/// Replay the snapshot file at `path`, then delete it whatever the outcome.
pub async fn replay_file<W, S>(
    path: &Path,
    watermarks: &W,
    sink: &S,
    retry: &RetryPolicy,
) -> Result<ReplaySummary, ReplayError>
where
    W: Watermarks + ?Sized,
    S: Sink + ?Sized,
{
    tokio::fs::metadata(path).await?;

    let result = match Snapshot::open(path) {
        Ok(snapshot) => replay(snapshot, watermarks, sink, retry).await,
        Err(err) => Err(err.into()),
    };

    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), "Could not remove snapshot: {err}"),
    }

    result
}
