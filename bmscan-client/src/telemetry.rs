//! Decoding raw object bytes into unit-scaled battery metrics
//!
//! All functions here are pure: they take a catalog entry and raw bytes and produce a typed
//! value, with no bus access or state.
use std::time::SystemTime;

use bmscan_common::dictionary::{DictEntry, WireType};
use snafu::Snafu;

/// Errors produced when decoding or encoding a catalog entry
#[derive(Debug, Clone, Copy, PartialEq, Snafu)]
pub enum DecodeError {
    /// The payload is shorter than the entry's wire width
    #[snafu(display("Payload for {name} too short: got {got} bytes, need {need}"))]
    PayloadTooShort {
        /// The catalog entry name
        name: &'static str,
        /// Bytes available
        got: usize,
        /// Bytes required by the wire type
        need: usize,
    },
    /// The value cannot be represented in the entry's wire type
    #[snafu(display("Value out of range for {name}"))]
    ValueOutOfRange {
        /// The catalog entry name
        name: &'static str,
    },
    /// The entry's wire type cannot appear in this context (e.g. a string in a PDO)
    #[snafu(display("Wire type of {name} not usable here"))]
    UnsupportedType {
        /// The catalog entry name
        name: &'static str,
    },
}

/// A decoded value
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    /// A scaled fixed-point value (divisor != 1)
    Float(f64),
    /// An unscaled integer value
    Integer(i64),
    /// A string value
    Text(String),
}

/// A single decoded, unit-scaled reading from one node
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    /// The node the value was read from
    pub node_id: u8,
    /// The catalog entry name, e.g. "voltage"
    pub name: &'static str,
    /// The converted value
    pub value: MetricValue,
    /// Physical unit of the value
    pub unit: &'static str,
    /// When the value was decoded
    pub timestamp: SystemTime,
}

/// Build a [Metric] for a decoded value
pub fn metric(node_id: u8, entry: &DictEntry, value: MetricValue) -> Metric {
    Metric {
        node_id,
        name: entry.name,
        value,
        unit: entry.unit,
        timestamp: SystemTime::now(),
    }
}

/// Decode raw little-endian bytes per the catalog entry's wire type and scaling
///
/// Payloads longer than the wire width are allowed (expedited responses always carry a 4-byte
/// field); the excess is ignored. Shorter payloads are rejected.
pub fn decode(entry: &DictEntry, raw: &[u8]) -> Result<MetricValue, DecodeError> {
    let need = entry.wire_type.byte_width();
    if raw.len() < need {
        return PayloadTooShortSnafu {
            name: entry.name,
            got: raw.len(),
            need,
        }
        .fail();
    }

    let raw_value: i64 = match entry.wire_type {
        WireType::U8 => raw[0] as i64,
        WireType::U16 => u16::from_le_bytes(raw[0..2].try_into().unwrap()) as i64,
        WireType::U32 => u32::from_le_bytes(raw[0..4].try_into().unwrap()) as i64,
        WireType::I16 => i16::from_le_bytes(raw[0..2].try_into().unwrap()) as i64,
        WireType::I32 => i32::from_le_bytes(raw[0..4].try_into().unwrap()) as i64,
        WireType::VisibleString => {
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            return Ok(MetricValue::Text(
                String::from_utf8_lossy(&raw[..end]).into_owned(),
            ));
        }
    };

    if entry.divisor == 1.0 {
        Ok(MetricValue::Integer(raw_value))
    } else {
        Ok(MetricValue::Float(raw_value as f64 / entry.divisor))
    }
}

/// Encode a value to the wire representation of the catalog entry
///
/// The inverse of [decode]: scaled values are multiplied by the divisor and rounded to the
/// nearest raw integer, then range-checked against the wire type.
pub fn encode(entry: &DictEntry, value: &MetricValue) -> Result<Vec<u8>, DecodeError> {
    let raw_value: i64 = match value {
        MetricValue::Integer(v) => *v,
        MetricValue::Float(v) => {
            let scaled = v * entry.divisor;
            if !scaled.is_finite() {
                return ValueOutOfRangeSnafu { name: entry.name }.fail();
            }
            scaled.round() as i64
        }
        MetricValue::Text(s) => return Ok(s.as_bytes().to_vec()),
    };

    let out = match entry.wire_type {
        WireType::U8 => {
            let v: u8 = raw_value
                .try_into()
                .map_err(|_| ValueOutOfRangeSnafu { name: entry.name }.build())?;
            vec![v]
        }
        WireType::U16 => {
            let v: u16 = raw_value
                .try_into()
                .map_err(|_| ValueOutOfRangeSnafu { name: entry.name }.build())?;
            v.to_le_bytes().to_vec()
        }
        WireType::U32 => {
            let v: u32 = raw_value
                .try_into()
                .map_err(|_| ValueOutOfRangeSnafu { name: entry.name }.build())?;
            v.to_le_bytes().to_vec()
        }
        WireType::I16 => {
            let v: i16 = raw_value
                .try_into()
                .map_err(|_| ValueOutOfRangeSnafu { name: entry.name }.build())?;
            v.to_le_bytes().to_vec()
        }
        WireType::I32 => {
            let v: i32 = raw_value
                .try_into()
                .map_err(|_| ValueOutOfRangeSnafu { name: entry.name }.build())?;
            v.to_le_bytes().to_vec()
        }
        WireType::VisibleString => return UnsupportedTypeSnafu { name: entry.name }.fail(),
    };
    Ok(out)
}

/// Decode a PDO payload using a list of mapped catalog entries
///
/// Each entry consumes its wire width from the payload in order. Strings cannot be PDO-mapped.
pub fn decode_pdo(
    node_id: u8,
    entries: &[&'static DictEntry],
    payload: &[u8],
) -> Result<Vec<Metric>, DecodeError> {
    let mut metrics = Vec::with_capacity(entries.len());
    let mut offset = 0;
    for entry in entries {
        let width = entry.wire_type.byte_width();
        if width == 0 {
            return UnsupportedTypeSnafu { name: entry.name }.fail();
        }
        let slice = payload
            .get(offset..offset + width)
            .ok_or_else(|| {
                PayloadTooShortSnafu {
                    name: entry.name,
                    got: payload.len().saturating_sub(offset),
                    need: width,
                }
                .build()
            })?;
        let value = decode(entry, slice)?;
        metrics.push(metric(node_id, entry, value));
        offset += width;
    }
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bmscan_common::dictionary::find_entry;

    #[test]
    fn test_voltage_decode() {
        // Raw 55296 / 1024 = 54.0 V, as returned in an expedited response data field
        let entry = find_entry(0x6060, 0).unwrap();
        let value = decode(entry, &[0x00, 0xD8, 0x00, 0x00]).unwrap();
        assert_eq!(MetricValue::Float(54.0), value);
    }

    #[test]
    fn test_signed_current_decode() {
        // -2500 mA -> -2.5 A
        let entry = find_entry(0x2010, 0).unwrap();
        let raw = (-2500i32).to_le_bytes();
        assert_eq!(MetricValue::Float(-2.5), decode(entry, &raw).unwrap());
    }

    #[test]
    fn test_temperature_decode() {
        let entry = find_entry(0x6010, 0).unwrap();
        // 201 / 8 = 25.125 degC
        let raw = 201i16.to_le_bytes();
        assert_eq!(MetricValue::Float(25.125), decode(entry, &raw).unwrap());
        // Negative temperature
        let raw = (-60i16).to_le_bytes();
        assert_eq!(MetricValue::Float(-7.5), decode(entry, &raw).unwrap());
    }

    #[test]
    fn test_unscaled_integer_decode() {
        let entry = find_entry(0x6050, 0).unwrap();
        let raw = 321u16.to_le_bytes();
        assert_eq!(MetricValue::Integer(321), decode(entry, &raw).unwrap());
    }

    #[test]
    fn test_short_payload_rejected() {
        let entry = find_entry(0x6060, 0).unwrap();
        assert_eq!(
            Err(DecodeError::PayloadTooShort {
                name: "voltage",
                got: 2,
                need: 4
            }),
            decode(entry, &[0x00, 0xD8])
        );
    }

    #[test]
    fn test_string_decode_trims_nul() {
        let entry = find_entry(0x1008, 0).unwrap();
        let value = decode(entry, b"Epsilon V2\0\0").unwrap();
        assert_eq!(MetricValue::Text("Epsilon V2".to_string()), value);
    }

    #[test]
    fn test_roundtrip_scaled() {
        // decode(encode(v)) == v within 1e-9 relative to the divisor
        let entry = find_entry(0x6010, 0).unwrap();
        for v in [-40.0, -0.125, 0.0, 25.125, 99.875] {
            let raw = encode(entry, &MetricValue::Float(v)).unwrap();
            match decode(entry, &raw).unwrap() {
                MetricValue::Float(back) => {
                    assert!((back - v).abs() < 1e-9 / entry.divisor, "{v} != {back}")
                }
                other => panic!("Unexpected value {other:?}"),
            }
        }
    }

    #[test]
    fn test_roundtrip_integer() {
        let entry = find_entry(0x1017, 0).unwrap();
        for v in [0i64, 1, 1000, 65535] {
            let raw = encode(entry, &MetricValue::Integer(v)).unwrap();
            assert_eq!(MetricValue::Integer(v), decode(entry, &raw).unwrap());
        }
    }

    #[test]
    fn test_encode_range_check() {
        let entry = find_entry(0x1017, 0).unwrap();
        assert_eq!(
            Err(DecodeError::ValueOutOfRange {
                name: "heartbeat_time"
            }),
            encode(entry, &MetricValue::Integer(65536))
        );
        assert_eq!(
            Err(DecodeError::ValueOutOfRange {
                name: "heartbeat_time"
            }),
            encode(entry, &MetricValue::Integer(-1))
        );
    }

    #[test]
    fn test_decode_pdo() {
        // TPDO carrying voltage (4 bytes) + soc (1 byte)
        let entries = [find_entry(0x6060, 0).unwrap(), find_entry(0x6081, 0).unwrap()];
        let mut payload = Vec::new();
        payload.extend_from_slice(&55296i32.to_le_bytes());
        payload.push(87);
        let metrics = decode_pdo(5, &entries, &payload).unwrap();
        assert_eq!(2, metrics.len());
        assert_eq!("voltage", metrics[0].name);
        assert_eq!(MetricValue::Float(54.0), metrics[0].value);
        assert_eq!("soc", metrics[1].name);
        assert_eq!(MetricValue::Integer(87), metrics[1].value);
        assert_eq!(5, metrics[1].node_id);

        // Truncated payload fails
        assert!(decode_pdo(5, &entries, &payload[..4]).is_err());
    }
}
