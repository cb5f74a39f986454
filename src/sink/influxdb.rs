//! InfluxDB v2 output: line protocol, writes and watermark queries.

use super::{BoxFuture, DeliveryError, Sink};
use crate::config::InfluxDbConfig;
use crate::reading::Reading;
use crate::replay::Watermarks;
use chrono::DateTime;
use reqwest::Url;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Measurement every BroodMinder point is written to.
pub const MEASUREMENT: &str = "broodminder";

/// Tag carrying the device id.
pub const DEVICE_TAG: &str = "deviceId";

/// Field values for InfluxDB line protocol
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldValue::Float(num) => write!(f, "{num}"),
            FieldValue::Integer(num) => write!(f, "{num}i"),
        }
    }
}

/// Data point in InfluxDB line protocol
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub measurement: String,
    pub tag_set: BTreeMap<String, String>,
    pub field_set: BTreeMap<String, FieldValue>,
    /// Unix timestamp in seconds; `None` lets the server use ingestion time
    pub timestamp: Option<i64>,
}

impl DataPoint {
    /// Point for a reading: temperature in Celsius, weight only when known.
    pub fn from_reading(reading: &Reading) -> Self {
        let tag_set = BTreeMap::from([(DEVICE_TAG.to_string(), reading.device_id.clone())]);

        let mut field_set = BTreeMap::from([
            (
                "temperature".to_string(),
                FieldValue::Float(reading.temperature_celsius),
            ),
            (
                "humidity".to_string(),
                FieldValue::Integer(i64::from(reading.humidity_percent)),
            ),
            (
                "battery".to_string(),
                FieldValue::Integer(i64::from(reading.battery_percent)),
            ),
            (
                "sampleNumber".to_string(),
                FieldValue::Integer(i64::from(reading.sample_number)),
            ),
        ]);
        if let Some(weight) = reading.weight_kilograms {
            field_set.insert("weight".to_string(), FieldValue::Float(weight));
        }

        Self {
            measurement: MEASUREMENT.to_string(),
            tag_set,
            field_set,
            timestamp: reading.timestamp_seconds,
        }
    }
}

/// Escape commas, spaces and (for keys and tag values) equals signs.
///
/// A trailing backslash is doubled so it cannot escape the separator that
/// follows. Control characters have no escape; device ids carrying them are
/// refused before they become readings.
fn escape(value: &str, escape_equals: bool) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if c == ',' || c == ' ' || (escape_equals && c == '=') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    if escaped.ends_with('\\') {
        escaped.push('\\');
    }
    escaped
}

fn fmt_tags(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    for (key, value) in data_point.tag_set.iter() {
        write!(fmt, ",{}={}", escape(key, true), escape(value, true))?;
    }
    Ok(())
}

fn fmt_fields(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    let mut first = true;
    for (key, value) in data_point.field_set.iter() {
        if first {
            first = false;
        } else {
            write!(fmt, ",")?;
        }
        write!(fmt, "{}={}", escape(key, true), value)?;
    }
    Ok(())
}

impl fmt::Display for DataPoint {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", escape(&self.measurement, false))?;
        fmt_tags(self, fmt)?;
        write!(fmt, " ")?;
        fmt_fields(self, fmt)?;
        if let Some(seconds) = self.timestamp {
            write!(fmt, " {seconds}")?;
        }
        Ok(())
    }
}

/// Flux query for the newest temperature point of a device.
pub fn watermark_query(bucket: &str, device_id: &str) -> String {
    format!(
        r#"from(bucket: "{bucket}")
  |> range(start: 0)
  |> filter(fn: (r) => r["_measurement"] == "{MEASUREMENT}")
  |> filter(fn: (r) => r["_field"] == "temperature")
  |> filter(fn: (r) => r["{DEVICE_TAG}"] == "{device}")
  |> last()"#,
        bucket = flux_string(bucket),
        device = flux_string(device_id),
    )
}

fn flux_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Extract the newest `_time` from a Flux CSV response.
///
/// Returns `None` when the response holds no rows, i.e. the device has never
/// been written.
pub fn parse_latest_time(body: &str) -> Result<Option<i64>, DeliveryError> {
    let mut reader = csv::ReaderBuilder::new()
        .comment(Some(b'#'))
        .flexible(true)
        .from_reader(body.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| DeliveryError::InvalidResponse(e.to_string()))?
        .clone();
    let Some(time_index) = headers.iter().position(|h| h == "_time") else {
        return Ok(None);
    };

    let mut latest = None;
    for record in reader.records() {
        let record = record.map_err(|e| DeliveryError::InvalidResponse(e.to_string()))?;
        // Each result table repeats the header row
        let Some(raw) = record.get(time_index).filter(|v| !v.is_empty() && *v != "_time") else {
            continue;
        };
        let seconds = DateTime::parse_from_rfc3339(raw)
            .map_err(|e| DeliveryError::InvalidResponse(format!("bad _time '{raw}': {e}")))?
            .timestamp();
        latest = latest.max(Some(seconds));
    }

    Ok(latest)
}

/// Client for the InfluxDB v2 HTTP API.
#[derive(Debug, Clone)]
pub struct InfluxDbClient {
    config: InfluxDbConfig,
    client: reqwest::Client,
    timeout: Duration,
}

impl InfluxDbClient {
    pub fn new(config: InfluxDbConfig, timeout: Duration) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            timeout,
        }
    }

    fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> Result<Url, DeliveryError> {
        let base = self.config.url.as_str().trim_end_matches('/');
        Url::parse_with_params(&format!("{base}/{path}"), params)
            .map_err(|e| DeliveryError::InvalidResponse(format!("bad InfluxDB URL: {e}")))
    }

    pub fn write_url(&self) -> Result<Url, DeliveryError> {
        self.endpoint(
            "api/v2/write",
            &[
                ("org", &self.config.org),
                ("bucket", &self.config.bucket),
                ("precision", "s"),
            ],
        )
    }

    pub fn query_url(&self) -> Result<Url, DeliveryError> {
        self.endpoint("api/v2/query", &[("org", &self.config.org)])
    }

    fn token(&self) -> String {
        format!("Token {}", self.config.token)
    }

    /// Write a single point.
    pub async fn write(&self, point: &DataPoint) -> Result<(), DeliveryError> {
        let line = point.to_string();
        debug!(%line, "Writing to InfluxDB");

        let response = self
            .client
            .post(self.write_url()?)
            .timeout(self.timeout)
            .header(AUTHORIZATION, self.token())
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(line)
            .send()
            .await?;

        check_status(response).await.map(drop)
    }

    /// Timestamp (Unix seconds) of the newest stored point for a device.
    pub async fn latest_timestamp(&self, device_id: &str) -> Result<Option<i64>, DeliveryError> {
        let response = self
            .client
            .post(self.query_url()?)
            .timeout(self.timeout)
            .header(AUTHORIZATION, self.token())
            .header(CONTENT_TYPE, "application/vnd.flux")
            .header(ACCEPT, "application/csv")
            .body(watermark_query(&self.config.bucket, device_id))
            .send()
            .await?;

        let body = check_status(response).await?.text().await?;
        parse_latest_time(&body)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, DeliveryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(DeliveryError::Rejected {
        status: status.as_u16(),
        body,
    })
}

impl Sink for InfluxDbClient {
    fn deliver<'a>(&'a self, reading: &'a Reading) -> BoxFuture<'a, Result<(), DeliveryError>> {
        Box::pin(async move { self.write(&DataPoint::from_reading(reading)).await })
    }
}

impl Watermarks for InfluxDbClient {
    fn latest_timestamp<'a>(
        &'a self,
        device_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<i64>, DeliveryError>> {
        Box::pin(InfluxDbClient::latest_timestamp(self, device_id))
    }
}
