//! Delivery sinks for BroodMinder readings.
//!
//! A sink takes one [`Reading`] and stores it somewhere remote. The concrete
//! destination is picked once at startup as an [`Output`]; the scan loop and
//! the replay pipeline only see the [`Sink`] trait.

pub mod cloud;
pub mod influxdb;

use crate::reading::Reading;
use cloud::CloudUploader;
use influxdb::InfluxDbClient;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Boxed future returned by sink and store operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors talking to a remote destination.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Request could not be sent or the response could not be read
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// Remote answered with a non-success status
    #[error("Rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    /// Remote answered successfully but the body made no sense
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Destination for decoded readings.
pub trait Sink: Send + Sync {
    /// Deliver a single reading. No retry happens at this level.
    fn deliver<'a>(&'a self, reading: &'a Reading) -> BoxFuture<'a, Result<(), DeliveryError>>;
}

/// Output selected from configuration.
pub enum Output {
    Cloud(CloudUploader),
    InfluxDb(InfluxDbClient),
}

impl Sink for Output {
    fn deliver<'a>(&'a self, reading: &'a Reading) -> BoxFuture<'a, Result<(), DeliveryError>> {
        match self {
            Output::Cloud(cloud) => cloud.deliver(reading),
            Output::InfluxDb(influxdb) => influxdb.deliver(reading),
        }
    }
}

/// Bounded retry for deliveries.
///
/// Delivery is at-least-once: if a request reached the remote but its
/// response got lost, the retry stores the reading a second time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (at least 1)
    pub max_attempts: u32,
    /// Pause before the second attempt; grows linearly afterwards
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Deliver once, without retrying.
    pub const fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    /// Pause after failed attempt number `attempt` (1-based).
    pub fn pause_after(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}

/// Deliver `reading`, retrying failures according to `policy`.
///
/// Returns the error of the last attempt when every attempt fails.
pub async fn deliver_with_retry<S: Sink + ?Sized>(
    sink: &S,
    reading: &Reading,
    policy: &RetryPolicy,
) -> Result<(), DeliveryError> {
    let mut attempt = 1;
    loop {
        match sink.deliver(reading).await {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= policy.max_attempts => return Err(err),
            Err(err) => {
                warn!(
                    device_id = %reading.device_id,
                    sample = reading.sample_number,
                    attempt,
                    max_attempts = policy.max_attempts,
                    "Delivery failed, retrying: {err}"
                );
                tokio::time::sleep(policy.pause_after(attempt)).await;
                attempt += 1;
            }
        }
    }
}
