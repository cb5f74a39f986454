//! Decoder for BroodMinder advertising payloads.
//!
//! BroodMinder devices broadcast their latest sample in the manufacturer-specific
//! field of every advertisement. The field starts with the two-byte company
//! identifier, followed by fixed-position values. The vendor documents byte
//! positions relative to the whole advertising packet; the manufacturer field
//! starts 8 bytes later, so every documented position is shifted by
//! [`HEADER_ADJUSTMENT`].
//!
//! The layout lives in a single table ([`LAYOUT`]) so that positions, widths and
//! transforms can be checked in one place.

use crate::reading::Reading;
use thiserror::Error;

/// Company identifier of IF, LLC (BroodMinder).
pub const BROODMINDER_COMPANY_ID: u16 = 0x028D;

/// First two bytes of every BroodMinder manufacturer field (company id, little-endian).
pub const VENDOR_SIGNATURE: [u8; 2] = BROODMINDER_COMPANY_ID.to_le_bytes();

/// Bytes present in the vendor's documented packet but absent from the manufacturer field.
pub const HEADER_ADJUSTMENT: usize = 8;

/// Totals at or below this are what weight-less (temperature/humidity only)
/// devices report, so they are treated as "no weight".
pub const MIN_VALID_WEIGHT_KG: f64 = -1.0;

/// Width of a field in the manufacturer data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    /// Single unsigned byte
    Byte,
    /// Unsigned 16-bit value, low byte first
    Word,
}

impl Width {
    pub const fn size(self) -> usize {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
        }
    }
}

/// Position and transform of one value in the manufacturer data.
///
/// The physical value is `(raw - bias) / divisor`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub offset: usize,
    pub width: Width,
    pub bias: i32,
    pub divisor: f64,
}

impl FieldSpec {
    const fn documented(
        name: &'static str,
        position: usize,
        width: Width,
        bias: i32,
        divisor: f64,
    ) -> Self {
        Self {
            name,
            offset: position - HEADER_ADJUSTMENT,
            width,
            bias,
            divisor,
        }
    }

    /// One past the last byte this field reads.
    pub const fn end(&self) -> usize {
        self.offset + self.width.size()
    }

    /// Raw unsigned value as stored on air.
    pub fn raw(&self, data: &[u8]) -> Result<u16, DecodeError> {
        let bytes = data
            .get(self.offset..self.end())
            .ok_or(DecodeError::MalformedPayload {
                expected: self.end(),
                actual: data.len(),
            })?;

        Ok(match self.width {
            Width::Byte => u16::from(bytes[0]),
            Width::Word => u16::from_le_bytes([bytes[0], bytes[1]]),
        })
    }

    /// Raw value with the bias removed, still in the field's integer units.
    pub fn unbiased(&self, data: &[u8]) -> Result<i32, DecodeError> {
        Ok(i32::from(self.raw(data)?) - self.bias)
    }

    /// Physical value after bias and divisor.
    pub fn physical(&self, data: &[u8]) -> Result<f64, DecodeError> {
        Ok(self.scale(self.unbiased(data)?))
    }

    /// Convert an unbiased value (or a sum of them) to physical units.
    pub fn scale(&self, unbiased: i32) -> f64 {
        f64::from(unbiased) / self.divisor
    }
}

pub const BATTERY: FieldSpec = FieldSpec::documented("battery_percent", 14, Width::Byte, 0, 1.0);
pub const SAMPLE: FieldSpec = FieldSpec::documented("sample_number", 15, Width::Byte, 0, 1.0);
pub const TEMPERATURE: FieldSpec =
    FieldSpec::documented("temperature_celsius", 17, Width::Word, 5000, 100.0);
pub const WEIGHT_LEFT: FieldSpec =
    FieldSpec::documented("weight_left_kilograms", 20, Width::Word, 32767, 100.0);
pub const WEIGHT_RIGHT: FieldSpec =
    FieldSpec::documented("weight_right_kilograms", 22, Width::Word, 32767, 100.0);
pub const HUMIDITY: FieldSpec = FieldSpec::documented("humidity_percent", 24, Width::Byte, 0, 1.0);

/// Every field read from the manufacturer data, in on-air order.
pub const LAYOUT: [FieldSpec; 6] = [BATTERY, SAMPLE, TEMPERATURE, WEIGHT_LEFT, WEIGHT_RIGHT, HUMIDITY];

/// Shortest manufacturer field that covers every entry of [`LAYOUT`].
pub const MIN_PAYLOAD_LEN: usize = layout_end(&LAYOUT);

const fn layout_end(layout: &[FieldSpec]) -> usize {
    let mut end = 0;
    let mut i = 0;
    while i < layout.len() {
        if layout[i].end() > end {
            end = layout[i].end();
        }
        i += 1;
    }
    end
}

/// Reasons a manufacturer field does not yield a reading.
///
/// Both are routine while scanning: most advertisements nearby belong to
/// other vendors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Data is absent or does not start with the BroodMinder company id
    #[error("Not a BroodMinder payload")]
    NotRecognizedVendor,
    /// Data is too short for the fields it must contain
    #[error("Malformed payload: expected at least {expected} bytes, got {actual}")]
    MalformedPayload { expected: usize, actual: usize },
}

/// Does this manufacturer field belong to a BroodMinder device?
pub fn is_broodminder(data: Option<&[u8]>) -> bool {
    data.is_some_and(|data| data.starts_with(&VENDOR_SIGNATURE))
}

/// Decode a BroodMinder manufacturer field into a [`Reading`].
///
/// # Arguments
/// * `device_id` - Identifier taken from the advertised local name
/// * `data` - The manufacturer-specific field, company id included
///
/// # Weight
/// The two load cells are summed in hundredths of a kilogram. The total is
/// kept only when it is above [`MIN_VALID_WEIGHT_KG`]; devices without a scale
/// report large negative totals and get no weight at all.
pub fn decode(device_id: &str, data: Option<&[u8]>) -> Result<Reading, DecodeError> {
    let data = data.ok_or(DecodeError::NotRecognizedVendor)?;

    if data.len() < VENDOR_SIGNATURE.len() {
        return Err(DecodeError::MalformedPayload {
            expected: MIN_PAYLOAD_LEN,
            actual: data.len(),
        });
    }
    if !is_broodminder(Some(data)) {
        return Err(DecodeError::NotRecognizedVendor);
    }
    if data.len() < MIN_PAYLOAD_LEN {
        return Err(DecodeError::MalformedPayload {
            expected: MIN_PAYLOAD_LEN,
            actual: data.len(),
        });
    }

    let weight_hundredths = WEIGHT_LEFT.unbiased(data)? + WEIGHT_RIGHT.unbiased(data)?;
    let weight = WEIGHT_LEFT.scale(weight_hundredths);

    Ok(Reading {
        device_id: device_id.to_string(),
        sample_number: u32::from(SAMPLE.raw(data)?),
        timestamp_seconds: None,
        temperature_celsius: TEMPERATURE.physical(data)?,
        humidity_percent: low_byte(HUMIDITY.raw(data)?),
        battery_percent: low_byte(BATTERY.raw(data)?),
        weight_kilograms: (weight > MIN_VALID_WEIGHT_KG).then_some(weight),
    })
}

fn low_byte(value: u16) -> u8 {
    value.to_le_bytes()[0]
}

/// Errors returned when parsing hex text into bytes.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseHexError {
    #[error("invalid hex: odd number of digits ({0})")]
    OddLength(usize),
    #[error("invalid hex: '{0}' is not a hex byte")]
    InvalidDigit(String),
}

/// Parse the hex text form of a manufacturer field, e.g. `8d02...`.
///
/// Spaces, colons and dashes between bytes are ignored.
pub fn parse_hex(text: &str) -> Result<Vec<u8>, ParseHexError> {
    let digits: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != '-')
        .collect();
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(&digits);

    if !digits.is_ascii() {
        return Err(ParseHexError::InvalidDigit(digits.to_string()));
    }

    hex::decode(digits).map_err(|err| match err {
        hex::FromHexError::InvalidHexCharacter { index, .. } => {
            let start = index - index % 2;
            let pair = digits.get(start..start + 2).unwrap_or(&digits[start..]);
            ParseHexError::InvalidDigit(pair.to_string())
        }
        hex::FromHexError::OddLength | hex::FromHexError::InvalidStringLength => {
            ParseHexError::OddLength(digits.len())
        }
    })
}
