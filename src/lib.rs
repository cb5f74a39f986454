//! `broodminder-bridge` library.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing, logging setup
//! and process exit codes. The scan loop lives in [`crate::app`] and the
//! snapshot replay in [`crate::replay`], both testable without Bluetooth or a
//! network through the [`BeaconSource`], [`Sink`] and [`Watermarks`] traits.

pub mod app;
pub mod config;
pub mod decoder;
pub mod mac_address;
pub mod reading;
pub mod replay;
pub mod scanner;
pub mod server;
pub mod sink;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-export commonly used types at the crate root
pub use app::{BurstReport, RunError, RunMode, ScanOptions};
pub use config::{ConfigError, InfluxDbConfig, parse_duration};
pub use decoder::{DecodeError, decode, is_broodminder, parse_hex};
pub use mac_address::MacAddress;
pub use reading::Reading;
pub use replay::{ReplayError, ReplaySummary, Watermarks};
pub use scanner::{Beacon, BeaconSource, ScanError};
pub use sink::{DeliveryError, Output, RetryPolicy, Sink};
