//! Runtime configuration.
//!
//! One [`Config`] value is the source of truth for every cycle period and
//! feature toggle. It lives in a [`ConfigCell`] and is always copied whole,
//! so a reader on any task or core sees either the old or the new value.
//! Timers read their period when they rearm, which is what makes a
//! changed period take effect on the next cycle rather than mid-cycle.

use core::cell::Cell;

use critical_section::Mutex;
use embassy_time::Duration;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::flags::TimerSource;
use crate::payload::PayloadFormat;

pub const REPORT_INTERVAL_S: (u16, u16) = (2, 510);
pub const HOUSEKEEPING_INTERVAL_S: (u16, u16) = (1, 3600);
pub const CHANNEL_DWELL_MS: (u16, u16) = (10, 2550);
pub const DISPLAY_REFRESH_MS: (u16, u16) = (40, 5000);

/// Persisted format version. Bump when `Config` changes shape.
pub const CONFIG_VERSION: u8 = 1;

/// Upper bound of an encoded configuration.
pub const MAX_CONFIG_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Counting window and uplink period (seconds)
    pub report_interval_s: u16,
    /// Maintenance cycle period (seconds)
    pub housekeeping_interval_s: u16,
    /// Time spent on each Wi-Fi channel (milliseconds)
    pub channel_dwell_ms: u16,
    /// Display refresh period (milliseconds)
    pub display_refresh_ms: u16,
    /// Devices weaker than this (dBm) are not counted
    pub min_rssi: i8,
    pub wifi_scan: bool,
    pub ble_scan: bool,
    pub screen_on: bool,
    pub payload_format: PayloadFormat,
}

impl Config {
    pub const DEFAULT: Config = Config {
        report_interval_s: 120,
        housekeeping_interval_s: 30,
        channel_dwell_ms: 500,
        display_refresh_ms: 40,
        min_rssi: -100,
        wifi_scan: true,
        ble_scan: true,
        screen_on: true,
        payload_format: PayloadFormat::Plain,
    };

    pub fn validate(&self) -> Result<(), ConfigError> {
        check("report_interval_s", self.report_interval_s, REPORT_INTERVAL_S)?;
        check(
            "housekeeping_interval_s",
            self.housekeeping_interval_s,
            HOUSEKEEPING_INTERVAL_S,
        )?;
        check("channel_dwell_ms", self.channel_dwell_ms, CHANNEL_DWELL_MS)?;
        check("display_refresh_ms", self.display_refresh_ms, DISPLAY_REFRESH_MS)?;
        if self.min_rssi > 0 {
            return Err(ConfigError::OutOfRange { field: "min_rssi" });
        }
        Ok(())
    }

    /// Period of a hardware timer under this configuration.
    pub fn period(&self, source: TimerSource) -> Duration {
        match source {
            TimerSource::ChannelRotation => Duration::from_millis(self.channel_dwell_ms as u64),
            TimerSource::ReportCycle => Duration::from_secs(self.report_interval_s as u64),
            TimerSource::Housekeeping => Duration::from_secs(self.housekeeping_interval_s as u64),
            TimerSource::DisplayRefresh => Duration::from_millis(self.display_refresh_ms as u64),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::DEFAULT
    }
}

fn check(field: &'static str, value: u16, (min, max): (u16, u16)) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange { field })
    }
}

/// Process-wide configuration shared across tasks and interrupt context.
pub struct ConfigCell {
    inner: Mutex<Cell<Config>>,
}

impl ConfigCell {
    pub const fn new(config: Config) -> Self {
        Self {
            inner: Mutex::new(Cell::new(config)),
        }
    }

    pub fn get(&self) -> Config {
        critical_section::with(|cs| self.inner.borrow(cs).get())
    }

    pub fn set(&self, config: Config) {
        critical_section::with(|cs| self.inner.borrow(cs).set(config));
    }

    /// Current period for `source`; read by a timer each time it rearms.
    pub fn period(&self, source: TimerSource) -> Duration {
        self.get().period(source)
    }
}

// ── Persistence ────────────────────────────────────────────────────────

/// Non-volatile storage backing the configuration.
pub trait ConfigStore {
    fn load(&mut self) -> Result<Config, ConfigError>;
    fn save(&mut self, config: &Config) -> Result<(), ConfigError>;
}

impl<T: ConfigStore + ?Sized> ConfigStore for &mut T {
    fn load(&mut self) -> Result<Config, ConfigError> {
        (**self).load()
    }

    fn save(&mut self, config: &Config) -> Result<(), ConfigError> {
        (**self).save(config)
    }
}

#[derive(Serialize, Deserialize)]
struct Stored {
    v: u8,
    cfg: Config,
}

/// Serialize a configuration into `buf`. Returns the encoded length.
pub fn encode(config: &Config, buf: &mut [u8]) -> Result<usize, ConfigError> {
    let stored = Stored {
        v: CONFIG_VERSION,
        cfg: *config,
    };
    serde_json_core::to_slice(&stored, buf).map_err(|_| ConfigError::BufferTooSmall)
}

/// Decode and validate a stored configuration.
pub fn decode(bytes: &[u8]) -> Result<Config, ConfigError> {
    let (stored, _) =
        serde_json_core::from_slice::<Stored>(bytes).map_err(|_| ConfigError::Corrupt)?;
    if stored.v != CONFIG_VERSION {
        return Err(ConfigError::Version(stored.v));
    }
    stored.cfg.validate()?;
    Ok(stored.cfg)
}

/// RAM-backed store. Holds the encoded bytes the same way a flash
/// partition would, but forgets them on reset.
pub struct MemoryStore {
    bytes: heapless::Vec<u8, MAX_CONFIG_LEN>,
}

impl MemoryStore {
    pub const fn new() -> Self {
        Self {
            bytes: heapless::Vec::new(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore for MemoryStore {
    fn load(&mut self) -> Result<Config, ConfigError> {
        if self.bytes.is_empty() {
            return Err(ConfigError::Storage);
        }
        decode(&self.bytes)
    }

    fn save(&mut self, config: &Config) -> Result<(), ConfigError> {
        let mut buf = [0u8; MAX_CONFIG_LEN];
        let len = encode(config, &mut buf)?;
        self.bytes.clear();
        self.bytes
            .extend_from_slice(&buf[..len])
            .map_err(|_| ConfigError::BufferTooSmall)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(Config::default().validate(), Ok(()));
    }

    #[test]
    fn validate_rejects_out_of_range_periods() {
        let mut cfg = Config::DEFAULT;
        cfg.report_interval_s = 1;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::OutOfRange { field: "report_interval_s" })
        );

        let mut cfg = Config::DEFAULT;
        cfg.channel_dwell_ms = 5000;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::OutOfRange { field: "channel_dwell_ms" })
        );

        let mut cfg = Config::DEFAULT;
        cfg.display_refresh_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::DEFAULT;
        cfg.min_rssi = 3;
        assert_eq!(cfg.validate(), Err(ConfigError::OutOfRange { field: "min_rssi" }));
    }

    #[test]
    fn validate_accepts_bounds_inclusive() {
        let mut cfg = Config::DEFAULT;
        cfg.report_interval_s = REPORT_INTERVAL_S.0;
        cfg.housekeeping_interval_s = HOUSEKEEPING_INTERVAL_S.1;
        cfg.channel_dwell_ms = CHANNEL_DWELL_MS.0;
        cfg.display_refresh_ms = DISPLAY_REFRESH_MS.1;
        cfg.min_rssi = i8::MIN;
        assert_eq!(cfg.validate(), Ok(()));
    }

    #[test]
    fn periods_follow_config() {
        let cfg = Config::DEFAULT;
        assert_eq!(cfg.period(TimerSource::ReportCycle), Duration::from_secs(120));
        assert_eq!(cfg.period(TimerSource::Housekeeping), Duration::from_secs(30));
        assert_eq!(cfg.period(TimerSource::ChannelRotation), Duration::from_millis(500));
        assert_eq!(cfg.period(TimerSource::DisplayRefresh), Duration::from_millis(40));
    }

    #[test]
    fn cell_publishes_whole_values() {
        let cell = ConfigCell::new(Config::DEFAULT);
        let mut next = Config::DEFAULT;
        next.report_interval_s = 60;
        next.ble_scan = false;
        cell.set(next);
        assert_eq!(cell.get(), next);
        assert_eq!(cell.period(TimerSource::ReportCycle), Duration::from_secs(60));
    }

    #[test]
    fn stored_config_survives_save_and_load() {
        let mut store = MemoryStore::new();
        let mut cfg = Config::DEFAULT;
        cfg.min_rssi = -80;
        cfg.payload_format = PayloadFormat::Json;
        store.save(&cfg).unwrap();
        assert_eq!(store.load(), Ok(cfg));

        let text = core::str::from_utf8(store.as_bytes()).unwrap();
        assert!(text.starts_with(r#"{"v":1,"#));
        assert!(text.contains(r#""payload_format":"json""#));
    }

    #[test]
    fn empty_store_reports_storage_error() {
        let mut store = MemoryStore::new();
        assert_eq!(store.load(), Err(ConfigError::Storage));
    }

    #[test]
    fn decode_rejects_garbage_and_other_versions() {
        assert_eq!(decode(b"\xff\x00garbage"), Err(ConfigError::Corrupt));

        let mut buf = [0u8; MAX_CONFIG_LEN];
        let len = encode(&Config::DEFAULT, &mut buf).unwrap();
        let text = core::str::from_utf8(&buf[..len]).unwrap();
        let bumped = text.replacen(r#""v":1"#, r#""v":9"#, 1);
        assert_eq!(decode(bumped.as_bytes()), Err(ConfigError::Version(9)));
    }

    #[test]
    fn decode_rejects_invalid_values() {
        let mut cfg = Config::DEFAULT;
        cfg.report_interval_s = 0;
        let mut buf = [0u8; MAX_CONFIG_LEN];
        let len = encode(&cfg, &mut buf).unwrap();
        assert_eq!(
            decode(&buf[..len]),
            Err(ConfigError::OutOfRange { field: "report_interval_s" })
        );
    }
}
