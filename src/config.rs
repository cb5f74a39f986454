//! Command-line and environment configuration.
//!
//! Every option can also be set through an environment variable so the
//! bridge runs unchanged in a container. Validation happens here, before any
//! Bluetooth adapter or socket is touched.

use crate::app::{RunMode, ScanOptions};
use crate::scanner::DEFAULT_SCAN_DURATION;
use crate::sink::cloud::{CloudUploader, DEFAULT_UPLOAD_URL};
use crate::sink::influxdb::InfluxDbClient;
use crate::sink::{Output, RetryPolicy};
use clap::{Args, Parser, Subcommand, ValueEnum};
use reqwest::Url;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default request body limit for snapshot uploads.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Startup configuration errors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("--influxdb-{0} must be set when InfluxDB is used")]
    MissingInfluxDb(&'static str),
    #[error("invalid {name} URL '{value}': {reason}")]
    InvalidUrl {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Parser, Debug)]
#[command(author, about, version)]
pub struct Cli {
    /// Verbose output, log every beacon and request
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Scan for BroodMinder beacons and forward their readings
    Scan(ScanArgs),
    /// Accept snapshot uploads over HTTP and replay them into InfluxDB
    Serve(ServeArgs),
    /// Decode a single manufacturer payload given as hex
    Decode(DecodeArgs),
}

/// Where live readings are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputKind {
    /// MyBroodMinder cloud upload API
    #[default]
    Cloud,
    /// InfluxDB v2
    Influxdb,
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputKind::Cloud => write!(f, "cloud"),
            OutputKind::Influxdb => write!(f, "influxdb"),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ScanArgs {
    /// Scan once and exit, or keep scanning
    #[arg(long, env = "RUN_MODE", value_enum, default_value_t)]
    pub mode: RunMode,

    /// Where to send the discovered data
    #[arg(long, env = "OUTPUT_MODE", value_enum, default_value_t)]
    pub output: OutputKind,

    /// Length of one scan burst (e.g. 15s, 1m)
    #[arg(long, env = "SCAN_DURATION", default_value = "15s", value_parser = parse_duration)]
    pub scan_duration: Duration,

    /// Pause between bursts in daemon mode
    #[arg(long, env = "SCAN_INTERVAL", default_value = "5m", value_parser = parse_duration)]
    pub interval: Duration,

    /// MyBroodMinder upload endpoint
    #[arg(long, env = "CLOUD_UPLOAD_URL", default_value = DEFAULT_UPLOAD_URL)]
    pub cloud_url: String,

    #[command(flatten)]
    pub influxdb: InfluxDbArgs,

    #[command(flatten)]
    pub delivery: DeliveryArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:5000")]
    pub listen: SocketAddr,

    /// Directory for uploaded snapshots while they are replayed
    #[arg(long, env = "UPLOAD_DIR", default_value_os_t = std::env::temp_dir())]
    pub upload_dir: PathBuf,

    /// Largest accepted upload in bytes
    #[arg(long, env = "MAX_UPLOAD_BYTES", default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    pub max_upload_bytes: usize,

    #[command(flatten)]
    pub influxdb: InfluxDbArgs,

    #[command(flatten)]
    pub delivery: DeliveryArgs,
}

#[derive(Args, Debug, Clone)]
pub struct DecodeArgs {
    /// Manufacturer data as hex, company id first (e.g. 8d02...)
    pub payload: String,

    /// Device id to attribute the reading to
    #[arg(long, default_value = "unknown")]
    pub device_id: String,
}

/// InfluxDB connection options; all four are required together.
#[derive(Args, Debug, Clone, Default)]
pub struct InfluxDbArgs {
    /// InfluxDB server URL
    #[arg(long = "influxdb-url", env = "INFLUXDB_URL")]
    pub url: Option<String>,

    /// InfluxDB organisation
    #[arg(long = "influxdb-org", env = "INFLUXDB_ORG")]
    pub org: Option<String>,

    /// InfluxDB bucket
    #[arg(long = "influxdb-bucket", env = "INFLUXDB_BUCKET")]
    pub bucket: Option<String>,

    /// InfluxDB auth token
    #[arg(long = "influxdb-token", env = "INFLUXDB_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct DeliveryArgs {
    /// Attempts per reading before giving up
    #[arg(long, env = "DELIVERY_ATTEMPTS", default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..))]
    pub delivery_attempts: u32,

    /// Pause before the first retry; later retries wait longer
    #[arg(long, env = "DELIVERY_BACKOFF", default_value = "2s", value_parser = parse_duration)]
    pub delivery_backoff: Duration,

    /// Timeout for each HTTP request
    #[arg(long, env = "HTTP_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub http_timeout: Duration,
}

impl Default for DeliveryArgs {
    fn default() -> Self {
        Self {
            delivery_attempts: 3,
            delivery_backoff: Duration::from_secs(2),
            http_timeout: Duration::from_secs(10),
        }
    }
}

impl DeliveryArgs {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.delivery_attempts,
            backoff: self.delivery_backoff,
        }
    }
}

/// Validated InfluxDB connection settings.
#[derive(Clone, PartialEq, Eq)]
pub struct InfluxDbConfig {
    pub url: Url,
    pub org: String,
    pub bucket: String,
    pub token: String,
}

impl fmt::Debug for InfluxDbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfluxDbConfig")
            .field("url", &self.url.as_str())
            .field("org", &self.org)
            .field("bucket", &self.bucket)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl InfluxDbArgs {
    /// Require every connection option, reporting the first one missing.
    pub fn require(&self) -> Result<InfluxDbConfig, ConfigError> {
        fn present<'a>(
            value: &'a Option<String>,
            name: &'static str,
        ) -> Result<&'a str, ConfigError> {
            value
                .as_deref()
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::MissingInfluxDb(name))
        }

        let url = present(&self.url, "url")?;
        let org = present(&self.org, "org")?;
        let bucket = present(&self.bucket, "bucket")?;
        let token = present(&self.token, "token")?;

        Ok(InfluxDbConfig {
            url: parse_url("InfluxDB", url)?,
            org: org.to_string(),
            bucket: bucket.to_string(),
            token: token.to_string(),
        })
    }
}

fn parse_url(name: &'static str, value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::InvalidUrl {
        name,
        value: value.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidUrl {
            name,
            value: value.to_string(),
            reason: "scheme must be http or https".to_string(),
        });
    }
    Ok(url)
}

impl ScanArgs {
    /// Build the configured output, failing when its settings are incomplete.
    pub fn output(&self) -> Result<Output, ConfigError> {
        let timeout = self.delivery.http_timeout;
        match self.output {
            OutputKind::Cloud => Ok(Output::Cloud(CloudUploader::new(
                parse_url("cloud upload", &self.cloud_url)?,
                timeout,
            ))),
            OutputKind::Influxdb => Ok(Output::InfluxDb(InfluxDbClient::new(
                self.influxdb.require()?,
                timeout,
            ))),
        }
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            mode: self.mode,
            scan_duration: self.scan_duration,
            interval: self.interval,
            retry: self.delivery.retry_policy(),
        }
    }
}

impl Default for ScanArgs {
    fn default() -> Self {
        Self {
            mode: RunMode::default(),
            output: OutputKind::default(),
            scan_duration: DEFAULT_SCAN_DURATION,
            interval: Duration::from_secs(300),
            cloud_url: DEFAULT_UPLOAD_URL.to_string(),
            influxdb: InfluxDbArgs::default(),
            delivery: DeliveryArgs::default(),
        }
    }
}

impl ServeArgs {
    /// Replay always writes to InfluxDB, so its settings are mandatory here.
    pub fn store(&self) -> Result<InfluxDbClient, ConfigError> {
        Ok(InfluxDbClient::new(
            self.influxdb.require()?,
            self.delivery.http_timeout,
        ))
    }
}

/// Parse a duration from a human-readable string.
///
/// Supports the following suffixes:
/// - `ms`: milliseconds
/// - `s` or no suffix: seconds
/// - `m`: minutes
/// - `h`: hours
///
/// # Examples
/// ```
/// use broodminder_bridge::config::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("15s").unwrap(), Duration::from_secs(15));
/// assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();
    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (number, unit_secs, unit_name) = if let Some(n) = src.strip_suffix("ms") {
        (n, None, "milliseconds")
    } else if let Some(n) = src.strip_suffix('h') {
        (n, Some(3600), "hours")
    } else if let Some(n) = src.strip_suffix('m') {
        (n, Some(60), "minutes")
    } else if let Some(n) = src.strip_suffix('s') {
        (n, Some(1), "seconds")
    } else {
        (src, Some(1), "seconds")
    };

    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid {unit_name}: {number}"))?;

    match unit_secs {
        None => Ok(Duration::from_millis(value)),
        Some(unit) => value
            .checked_mul(unit)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration too large: {src}")),
    }
}
