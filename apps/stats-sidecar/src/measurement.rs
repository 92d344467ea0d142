use anyhow::{bail, Result};
use chrono::DateTime;
use serde::Deserialize;
use simd_json::OwnedValue;

/// One power reading as consumed from the input stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMeasurement {
    pub sensor_id: String,
    pub timestamp_ms: i64,
    pub value_watts: f64,
}

impl RawMeasurement {
    pub fn new(sensor_id: impl Into<String>, timestamp_ms: i64, value_watts: f64) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            timestamp_ms,
            value_watts,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireMeasurement {
    identifier: String,
    timestamp: WireTimestamp,
    #[serde(alias = "valueInWatts", alias = "value_in_watts", alias = "value")]
    #[serde(rename = "valueInW")]
    value_in_w: f64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Int(i64),
    Float(f64),
    Str(String),
}

impl WireTimestamp {
    fn to_millis(&self) -> Result<i64> {
        match self {
            WireTimestamp::Int(ms) => Ok(*ms),
            WireTimestamp::Float(ms) if ms.is_finite() => Ok(ms.trunc() as i64),
            WireTimestamp::Float(ms) => bail!("non-finite timestamp {ms}"),
            WireTimestamp::Str(raw) => {
                let trimmed = raw.trim();
                if let Ok(ms) = trimmed.parse::<i64>() {
                    return Ok(ms);
                }
                Ok(DateTime::parse_from_rfc3339(trimmed)?.timestamp_millis())
            }
        }
    }
}

impl TryFrom<WireMeasurement> for RawMeasurement {
    type Error = anyhow::Error;

    fn try_from(wire: WireMeasurement) -> Result<Self> {
        let sensor_id = wire.identifier.trim();
        if sensor_id.is_empty() {
            bail!("measurement without identifier");
        }
        Ok(RawMeasurement {
            sensor_id: sensor_id.to_string(),
            timestamp_ms: wire.timestamp.to_millis()?,
            value_watts: wire.value_in_w,
        })
    }
}

/// Outcome of decoding one payload. Elements that fail to decode are kept apart with
/// their error so the rest of a batch still goes through.
#[derive(Debug, Default)]
pub struct DecodedPayload {
    pub measurements: Vec<RawMeasurement>,
    pub rejected: Vec<anyhow::Error>,
}

fn decode_element(element: OwnedValue) -> Result<RawMeasurement> {
    let wire: WireMeasurement = simd_json::serde::from_owned_value(element)?;
    RawMeasurement::try_from(wire)
}

/// Decodes a single measurement object or an array of them. Only a payload that is not
/// JSON in either shape is an error; bad elements end up in `rejected`.
pub fn parse_payload(payload: &mut [u8]) -> Result<DecodedPayload> {
    let first = payload
        .iter()
        .copied()
        .find(|byte| !byte.is_ascii_whitespace());
    let elements: Vec<OwnedValue> = match first {
        None => return Ok(DecodedPayload::default()),
        Some(b'[') => simd_json::serde::from_slice(payload)?,
        Some(_) => vec![simd_json::serde::from_slice(payload)?],
    };

    let mut decoded = DecodedPayload::default();
    for element in elements {
        match decode_element(element) {
            Ok(measurement) => decoded.measurements.push(measurement),
            Err(err) => decoded.rejected.push(err),
        }
    }
    Ok(decoded)
}
