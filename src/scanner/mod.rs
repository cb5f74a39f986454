//! Beacon source abstraction.
//!
//! The live scan loop only needs "give me what you heard during the last N
//! seconds". Backends implement [`BeaconSource`]; tests use an in-memory fake.

#[cfg(feature = "bluer")]
pub mod bluer;

use crate::decoder::BROODMINDER_COMPANY_ID;
use crate::mac_address::MacAddress;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Default length of one scan burst.
pub const DEFAULT_SCAN_DURATION: Duration = Duration::from_secs(15);

/// One advertisement heard during a scan burst.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    pub address: MacAddress,
    /// Received signal strength in dBm
    pub rssi: Option<i16>,
    /// Advertised local name; BroodMinder uses it as the device id
    pub local_name: Option<String>,
    /// Manufacturer-specific field, company id first
    pub manufacturer_data: Option<Vec<u8>>,
}

/// Error type for scanner operations.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    /// The adapter went away mid-burst; the next burst may succeed
    #[error("Bluetooth adapter disconnected: {0}")]
    Disconnected(String),
    /// Backend not available (not compiled in)
    #[error("Backend '{0}' not available (not compiled in)")]
    BackendNotAvailable(String),
}

impl ScanError {
    /// Whether the scan loop should skip the burst instead of stopping.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ScanError::Disconnected(_))
    }
}

/// Source of beacons, scanned in fixed-length bursts.
pub trait BeaconSource: Send + Sync {
    /// Listen for `duration` and return every beacon heard.
    fn scan(
        &self,
        duration: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Beacon>, ScanError>> + Send + '_>>;
}

/// Rebuild the raw manufacturer field from a per-company map.
///
/// Backends such as BlueZ split the company id off the payload. The decoder
/// expects the field as it appears on air, so the id is put back in front
/// (little-endian). When a device advertises several companies the
/// BroodMinder entry wins, otherwise the lowest company id is used.
pub fn manufacturer_field(data: &HashMap<u16, Vec<u8>>) -> Option<Vec<u8>> {
    let (company_id, payload) = data
        .get_key_value(&BROODMINDER_COMPANY_ID)
        .or_else(|| data.iter().min_by_key(|(id, _)| **id))?;

    let mut field = Vec::with_capacity(payload.len() + 2);
    field.extend_from_slice(&company_id.to_le_bytes());
    field.extend_from_slice(payload);
    Some(field)
}
