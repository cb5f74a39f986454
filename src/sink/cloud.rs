//! MyBroodMinder cloud upload.

use super::{BoxFuture, DeliveryError, Sink};
use crate::reading::{Reading, round_tenths};
use reqwest::Url;
use std::time::Duration;
use tracing::debug;

/// Public upload endpoint of the MyBroodMinder cloud.
pub const DEFAULT_UPLOAD_URL: &str = "https://mybroodminder.com/api_public/devices/upload";

/// Uploads readings with one GET request each.
///
/// The API takes everything as query parameters and expects Fahrenheit.
#[derive(Debug, Clone)]
pub struct CloudUploader {
    endpoint: Url,
    client: reqwest::Client,
    timeout: Duration,
}

impl CloudUploader {
    pub fn new(endpoint: Url, timeout: Duration) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
            timeout,
        }
    }

    /// Build the upload URL for a reading.
    ///
    /// `weight` is only present when the reading has one.
    pub fn upload_url(&self, reading: &Reading) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("device_id", &reading.device_id)
                .append_pair("sample", &reading.sample_number.to_string())
                .append_pair(
                    "temperature",
                    &round_tenths(reading.temperature_fahrenheit()).to_string(),
                )
                .append_pair("humidity", &reading.humidity_percent.to_string())
                .append_pair("battery_charge", &reading.battery_percent.to_string());
            if let Some(weight) = reading.weight_kilograms {
                query.append_pair("weight", &weight.to_string());
            }
        }
        url
    }

    async fn upload(&self, reading: &Reading) -> Result<(), DeliveryError> {
        let url = self.upload_url(reading);
        debug!(%url, "Uploading to MyBroodMinder");

        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

impl Sink for CloudUploader {
    fn deliver<'a>(&'a self, reading: &'a Reading) -> BoxFuture<'a, Result<(), DeliveryError>> {
        Box::pin(self.upload(reading))
    }
}
