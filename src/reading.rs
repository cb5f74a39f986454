//! BroodMinder reading data structure.

use std::fmt;

/// A single measurement from a BroodMinder device.
///
/// Live readings come from a decoded advertisement and carry no wall-clock
/// time; replayed readings come from a snapshot row and carry the time the
/// phone app stored them.
///
/// Temperature is kept in Celsius only. Fahrenheit is always derived through
/// [`Reading::temperature_fahrenheit`].
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Device identifier from the advertised local name
    pub device_id: String,
    /// Firmware sample counter (one byte on air, so it wraps at 255)
    pub sample_number: u32,
    /// Unix timestamp in seconds, for replayed rows only
    pub timestamp_seconds: Option<i64>,
    /// Temperature in Celsius
    pub temperature_celsius: f64,
    /// Relative humidity in percent (0-100)
    pub humidity_percent: u8,
    /// Battery charge in percent (0-100)
    pub battery_percent: u8,
    /// Total weight of both load cells, when the device reports a plausible one
    pub weight_kilograms: Option<f64>,
}

impl Reading {
    /// Build a reading from a snapshot row, which stores temperature in Fahrenheit.
    pub fn from_fahrenheit(
        device_id: String,
        sample_number: u32,
        timestamp_seconds: i64,
        temperature_fahrenheit: f64,
        humidity_percent: u8,
        battery_percent: u8,
    ) -> Self {
        Self {
            device_id,
            sample_number,
            timestamp_seconds: Some(timestamp_seconds),
            temperature_celsius: fahrenheit_to_celsius(temperature_fahrenheit),
            humidity_percent,
            battery_percent,
            weight_kilograms: None,
        }
    }

    /// Temperature in Fahrenheit.
    pub fn temperature_fahrenheit(&self) -> f64 {
        celsius_to_fahrenheit(self.temperature_celsius)
    }
}

pub fn celsius_to_fahrenheit(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

pub fn fahrenheit_to_celsius(fahrenheit: f64) -> f64 {
    (fahrenheit - 32.0) * 5.0 / 9.0
}

/// Can `id` be used as a device id?
///
/// Blank ids and ids containing control characters are refused; the id ends
/// up as an InfluxDB tag value and a query parameter.
pub fn is_valid_device_id(id: &str) -> bool {
    !id.trim().is_empty() && !id.chars().any(char::is_control)
}

/// Round to one decimal place, the resolution the cloud API expects.
pub fn round_tenths(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "device={} sample={} temperature_c={:.2} temperature_f={} humidity={} battery={}",
            self.device_id,
            self.sample_number,
            self.temperature_celsius,
            round_tenths(self.temperature_fahrenheit()),
            self.humidity_percent,
            self.battery_percent,
        )?;
        if let Some(weight) = self.weight_kilograms {
            write!(f, " weight={weight}")?;
        }
        if let Some(timestamp) = self.timestamp_seconds {
            write!(f, " timestamp={timestamp}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fahrenheit_is_derived_from_celsius() {
        let reading = Reading {
            device_id: "43001234".to_string(),
            sample_number: 1,
            timestamp_seconds: None,
            temperature_celsius: 1.0,
            humidity_percent: 50,
            battery_percent: 90,
            weight_kilograms: None,
        };
        assert!((reading.temperature_fahrenheit() - 33.8).abs() < 1e-9);
        assert_eq!(round_tenths(reading.temperature_fahrenheit()), 33.8);
    }

    #[test]
    fn test_from_fahrenheit_converts_to_celsius() {
        let reading = Reading::from_fahrenheit("43001234".to_string(), 7, 100, 212.0, 40, 80);
        assert!((reading.temperature_celsius - 100.0).abs() < 1e-9);
        assert_eq!(reading.timestamp_seconds, Some(100));
        assert_eq!(reading.weight_kilograms, None);
    }

    #[test]
    fn test_device_id_validation() {
        assert!(is_valid_device_id("43001234"));
        assert!(is_valid_device_id("hive 1,a=b"));
        assert!(!is_valid_device_id(""));
        assert!(!is_valid_device_id("   "));
        assert!(!is_valid_device_id("43001234\nhijack,deviceId=x temperature=999"));
        assert!(!is_valid_device_id("4300\t1234"));
        assert!(!is_valid_device_id("4300\u{7f}"));
    }

    #[test]
    fn test_round_tenths() {
        assert_eq!(round_tenths(95.44), 95.4);
        assert_eq!(round_tenths(95.46), 95.5);
        assert_eq!(round_tenths(-0.04), -0.0);
    }

    #[test]
    fn test_display_includes_optional_fields_only_when_present() {
        let mut reading = Reading::from_fahrenheit("43001234".to_string(), 3, 300, 50.0, 61, 77);
        let line = reading.to_string();
        assert!(line.starts_with("device=43001234 sample=3 temperature_c=10.00 temperature_f=50"));
        assert!(line.ends_with("timestamp=300"));
        assert!(!line.contains("weight="));

        reading.timestamp_seconds = None;
        reading.weight_kilograms = Some(12.34);
        let line = reading.to_string();
        assert!(line.ends_with("weight=12.34"));
        assert!(!line.contains("timestamp="));
    }
}
