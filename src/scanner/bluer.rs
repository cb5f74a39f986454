//! BlueZ D-Bus backend for beacon scanning.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.

use super::{Beacon, BeaconSource, ScanError, manufacturer_field};
use bluer::{Adapter, AdapterEvent, Address, ErrorKind, Session};
use futures::{StreamExt, pin_mut};
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        match err.kind {
            ErrorKind::NotReady | ErrorKind::NotAvailable => {
                ScanError::Disconnected(err.to_string())
            }
            _ => ScanError::Bluetooth(err.to_string()),
        }
    }
}

/// Beacon source backed by the default BlueZ adapter.
pub struct BluerSource {
    // Keeps the D-Bus connection alive for the adapter
    _session: Session,
    adapter: Adapter,
}

impl BluerSource {
    /// Connect to BlueZ and power on the default adapter.
    pub async fn new() -> Result<Self, ScanError> {
        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        debug!(adapter = adapter.name(), "Using Bluetooth adapter");

        Ok(Self {
            _session: session,
            adapter,
        })
    }

    /// Run discovery for `duration` and collect the addresses that showed up.
    async fn discover(&self, duration: Duration) -> Result<BTreeSet<Address>, ScanError> {
        let mut addresses = BTreeSet::new();

        // Discovery stops when the event stream is dropped
        let events = self.adapter.discover_devices().await?;
        pin_mut!(events);
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.next() => match event {
                    Some(AdapterEvent::DeviceAdded(address)) => {
                        addresses.insert(address);
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }

        Ok(addresses)
    }

    async fn beacon(&self, address: Address) -> Result<Beacon, ScanError> {
        let device = self.adapter.device(address)?;
        let manufacturer_data = device.manufacturer_data().await?;

        Ok(Beacon {
            address: address.into(),
            rssi: device.rssi().await?,
            local_name: device.name().await?,
            manufacturer_data: manufacturer_data.as_ref().and_then(manufacturer_field),
        })
    }
}

impl BeaconSource for BluerSource {
    fn scan(
        &self,
        duration: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Beacon>, ScanError>> + Send + '_>> {
        Box::pin(async move {
            let addresses = self.discover(duration).await?;
            let mut beacons = Vec::with_capacity(addresses.len());

            for address in addresses {
                match self.beacon(address).await {
                    Ok(beacon) => beacons.push(beacon),
                    Err(err) if err.is_recoverable() => return Err(err),
                    // Devices can vanish between discovery and the property reads
                    Err(err) => debug!(%address, "Skipping device: {err}"),
                }
            }

            Ok(beacons)
        })
    }
}
