//! Uplink payload encoding.
//!
//! Two formats: `Plain`, a packed big-endian layout small enough for a
//! long-range radio frame, and `Json`, newline-delimited JSON for serial
//! and BLE consumers. Everything is built in fixed-size buffers.
use heapless::Vec;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::dedup::Counts;
use crate::error::EncodeError;

/// Firmware version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Size of one send queue element
pub const PAYLOAD_BUFFER_SIZE: usize = 256;

/// Serialized payload as stored in a send queue
pub type Payload = Vec<u8, PAYLOAD_BUFFER_SIZE>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    Plain,
    Json,
}

impl PayloadFormat {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "plain" => Some(PayloadFormat::Plain),
            "json" => Some(PayloadFormat::Json),
            _ => None,
        }
    }

    fn code(self) -> u8 {
        match self {
            PayloadFormat::Plain => 1,
            PayloadFormat::Json => 2,
        }
    }
}

/// Context attached to a counter report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    /// Report sequence number, wraps
    pub seq: u16,
    pub uptime_s: u32,
    /// Last battery sample, if the board has a probe
    pub battery_mv: Option<u16>,
    pub format: PayloadFormat,
}

/// Device health snapshot, sent on request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub uptime_s: u32,
    pub battery_mv: Option<u16>,
    pub heap_free: u32,
    /// Payloads dropped on full send queues, all transports
    pub dropped: u32,
}

/// Turns one window's counts into a payload.
///
/// Must not block. A failure makes the dispatcher skip this cycle.
pub trait PayloadEncoder {
    fn encode(&mut self, counts: &Counts, meta: &Metadata) -> Result<Payload, EncodeError>;
}

/// Default encoder, format chosen per call from [`Metadata::format`].
#[derive(Debug, Default, Clone, Copy)]
pub struct Encoder;

impl PayloadEncoder for Encoder {
    fn encode(&mut self, counts: &Counts, meta: &Metadata) -> Result<Payload, EncodeError> {
        match meta.format {
            PayloadFormat::Plain => {
                let mut out = Payload::new();
                put(&mut out, &saturate(counts.wifi).to_be_bytes())?;
                put(&mut out, &saturate(counts.ble).to_be_bytes())?;
                Ok(out)
            }
            PayloadFormat::Json => to_ndjson(&DeviceMessage::Counts {
                wifi: counts.wifi,
                ble: counts.ble,
                seq: meta.seq,
                uptime: meta.uptime_s,
                batt: meta.battery_mv,
            }),
        }
    }
}

/// Encode a status response.
pub fn encode_status(status: &Status, format: PayloadFormat) -> Result<Payload, EncodeError> {
    match format {
        PayloadFormat::Plain => {
            let mut out = Payload::new();
            put(&mut out, &status.battery_mv.unwrap_or(0).to_be_bytes())?;
            put(&mut out, &status.uptime_s.to_be_bytes())?;
            put(&mut out, &status.heap_free.to_be_bytes())?;
            put(&mut out, &status.dropped.to_be_bytes())?;
            Ok(out)
        }
        PayloadFormat::Json => to_ndjson(&DeviceMessage::Status {
            uptime: status.uptime_s,
            heap_free: status.heap_free,
            batt: status.battery_mv,
            dropped: status.dropped,
            board: crate::board::BOARD_NAME,
            version: VERSION,
        }),
    }
}

/// Encode the running configuration.
pub fn encode_config(config: &Config, format: PayloadFormat) -> Result<Payload, EncodeError> {
    match format {
        PayloadFormat::Plain => {
            let flags = (config.wifi_scan as u8)
                | ((config.ble_scan as u8) << 1)
                | ((config.screen_on as u8) << 2);
            let mut out = Payload::new();
            put(&mut out, &config.report_interval_s.to_be_bytes())?;
            put(&mut out, &config.housekeeping_interval_s.to_be_bytes())?;
            put(&mut out, &config.channel_dwell_ms.to_be_bytes())?;
            put(&mut out, &config.display_refresh_ms.to_be_bytes())?;
            put(&mut out, &config.min_rssi.to_be_bytes())?;
            put(&mut out, &[flags, config.payload_format.code()])?;
            Ok(out)
        }
        PayloadFormat::Json => to_ndjson(&DeviceMessage::Config { config }),
    }
}

// ── JSON messages ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum DeviceMessage<'a> {
    #[serde(rename = "counts")]
    Counts {
        wifi: u32,
        ble: u32,
        seq: u16,
        /// Uptime in seconds
        uptime: u32,
        /// Battery voltage in mV
        #[serde(skip_serializing_if = "Option::is_none")]
        batt: Option<u16>,
    },
    #[serde(rename = "status")]
    Status {
        uptime: u32,
        heap_free: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        batt: Option<u16>,
        dropped: u32,
        board: &'static str,
        version: &'static str,
    },
    #[serde(rename = "config")]
    Config { config: &'a Config },
}

/// Serialize to JSON and terminate with a newline (NDJSON).
fn to_ndjson(msg: &DeviceMessage) -> Result<Payload, EncodeError> {
    let mut buf = [0u8; PAYLOAD_BUFFER_SIZE];
    let len = serde_json_core::to_slice(msg, &mut buf).map_err(|e| match e {
        serde_json_core::ser::Error::BufferFull => EncodeError::Overflow(PAYLOAD_BUFFER_SIZE),
        _ => EncodeError::Serialize,
    })?;
    if len >= buf.len() {
        return Err(EncodeError::Overflow(PAYLOAD_BUFFER_SIZE));
    }
    buf[len] = b'\n';
    Payload::from_slice(&buf[..len + 1]).map_err(|_| EncodeError::Overflow(PAYLOAD_BUFFER_SIZE))
}

fn put(out: &mut Payload, bytes: &[u8]) -> Result<(), EncodeError> {
    out.extend_from_slice(bytes)
        .map_err(|_| EncodeError::Overflow(PAYLOAD_BUFFER_SIZE))
}

fn saturate(count: u32) -> u16 {
    count.min(u16::MAX as u32) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(format: PayloadFormat) -> Metadata {
        Metadata {
            seq: 7,
            uptime_s: 3600,
            battery_mv: None,
            format,
        }
    }

    fn as_str(p: &Payload) -> &str {
        core::str::from_utf8(p).unwrap()
    }

    #[test]
    fn plain_counts_are_two_big_endian_words() {
        let counts = Counts { wifi: 0x0102, ble: 3 };
        let p = Encoder.encode(&counts, &meta(PayloadFormat::Plain)).unwrap();
        assert_eq!(p.as_slice(), &[0x01, 0x02, 0x00, 0x03]);
    }

    #[test]
    fn plain_counts_saturate() {
        let counts = Counts { wifi: 70_000, ble: 0 };
        let p = Encoder.encode(&counts, &meta(PayloadFormat::Plain)).unwrap();
        assert_eq!(&p[..2], &[0xFF, 0xFF]);
    }

    #[test]
    fn json_counts_message() {
        let counts = Counts { wifi: 12, ble: 5 };
        let mut m = meta(PayloadFormat::Json);
        let p = Encoder.encode(&counts, &m).unwrap();
        let json = as_str(&p);
        assert!(json.starts_with(r#"{"type":"counts""#));
        assert!(json.contains(r#""wifi":12"#));
        assert!(json.contains(r#""ble":5"#));
        assert!(json.contains(r#""seq":7"#));
        assert!(json.ends_with('\n'));
        // batt omitted when unknown
        assert!(!json.contains("batt"));

        m.battery_mv = Some(3950);
        let p = Encoder.encode(&counts, &m).unwrap();
        assert!(as_str(&p).contains(r#""batt":3950"#));
    }

    #[test]
    fn plain_status_layout() {
        let status = Status {
            uptime_s: 1,
            battery_mv: Some(0x0E10),
            heap_free: 2,
            dropped: 3,
        };
        let p = encode_status(&status, PayloadFormat::Plain).unwrap();
        assert_eq!(
            p.as_slice(),
            &[0x0E, 0x10, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3]
        );
    }

    #[test]
    fn json_status_names_board_and_version() {
        let status = Status {
            uptime_s: 120,
            battery_mv: None,
            heap_free: 48_000,
            dropped: 2,
        };
        let p = encode_status(&status, PayloadFormat::Json).unwrap();
        let json = as_str(&p);
        assert!(json.contains(r#""type":"status""#));
        assert!(json.contains(r#""dropped":2"#));
        assert!(json.contains(VERSION));
        assert!(json.contains(crate::board::BOARD_NAME));
    }

    #[test]
    fn plain_config_layout() {
        let mut cfg = Config::DEFAULT;
        cfg.ble_scan = false;
        cfg.min_rssi = -1;
        let p = encode_config(&cfg, PayloadFormat::Plain).unwrap();
        assert_eq!(p.len(), 11);
        assert_eq!(&p[..2], &120u16.to_be_bytes());
        assert_eq!(p[8], 0xFF);
        assert_eq!(p[9], 0b101);
        assert_eq!(p[10], 1);
    }

    #[test]
    fn json_config_fits_one_element() {
        let cfg = Config {
            report_interval_s: 510,
            housekeeping_interval_s: 3600,
            channel_dwell_ms: 2550,
            display_refresh_ms: 5000,
            min_rssi: -128,
            wifi_scan: false,
            ble_scan: false,
            screen_on: false,
            payload_format: PayloadFormat::Plain,
        };
        let p = encode_config(&cfg, PayloadFormat::Json).unwrap();
        let json = as_str(&p);
        assert!(json.contains(r#""type":"config""#));
        assert!(json.contains(r#""min_rssi":-128"#));
    }

    #[test]
    fn format_names_parse() {
        assert_eq!(PayloadFormat::parse("plain"), Some(PayloadFormat::Plain));
        assert_eq!(PayloadFormat::parse("json"), Some(PayloadFormat::Json));
        assert_eq!(PayloadFormat::parse("cayenne"), None);
    }

    #[test]
    fn version_is_semver() {
        let parts: heapless::Vec<&str, 4> = VERSION.split('.').collect();
        assert_eq!(parts.len(), 3, "VERSION should be semver (major.minor.patch)");
        for part in &parts {
            assert!(part.parse::<u32>().is_ok(), "'{part}' is not a number");
        }
    }
}
