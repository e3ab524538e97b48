/// Host command layer: NDJSON commands written by a companion over BLE.
///
/// Commands only ever produce a new [`Config`] candidate; it is validated
/// as a whole before being committed, so a rejected command leaves the
/// running configuration untouched.
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use serde::Deserialize;

use crate::config::Config;
use crate::error::ConfigError;
use crate::payload::{PayloadFormat, PAYLOAD_BUFFER_SIZE};
use crate::queue::Message;

/// BLE GATT service UUIDs.
///
/// These duplicate the string literals in the `#[gatt_service]` and
/// `#[characteristic]` attributes in the firmware binary. Proc macros
/// require string literals, so these are the reference copy.
#[allow(dead_code)]
pub mod ble_uuids {
    pub const SERVICE: &str = "7c0e0001-5b2d-4f0a-9c61-3a8d2e94b1f0";
    /// TX characteristic, payloads, notify
    pub const TX_CHAR: &str = "7c0e0002-5b2d-4f0a-9c61-3a8d2e94b1f0";
    /// RX characteristic, commands, write
    pub const RX_CHAR: &str = "7c0e0003-5b2d-4f0a-9c61-3a8d2e94b1f0";
}

/// BLE advertising name
pub const BLE_ADV_NAME: &str = "Paxcount";

/// Maximum BLE notification payload (MTU-3)
pub const BLE_MAX_NOTIFY: usize = 20;

/// Notifications needed for the largest payload
pub const MAX_NOTIFY_FRAMES: usize = PAYLOAD_BUFFER_SIZE.div_ceil(BLE_MAX_NOTIFY - 2);

/// Longest command line accepted
pub const MAX_LINE_LEN: usize = 128;

pub const COMMAND_QUEUE_SIZE: usize = 4;

/// Commands from the BLE RX characteristic to the dispatcher.
pub type CommandChannel = Channel<CriticalSectionRawMutex, HostCommand, COMMAND_QUEUE_SIZE>;

/// Commands sent from a companion to the device.
///
/// Deserialized via [`RawCommand`] because `serde_json_core` does not
/// support internally tagged enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCommand {
    SetReportInterval { seconds: u16 },
    SetHousekeepingInterval { seconds: u16 },
    SetChannelDwell { ms: u16 },
    SetDisplayRefresh { ms: u16 },
    SetRssi { min_rssi: i8 },
    SetWifiScan { enabled: bool },
    SetBleScan { enabled: bool },
    SetScreen { enabled: bool },
    SetPayloadFormat { format: PayloadFormat },
    /// Close the current counting window without reporting it
    ResetCounters,
    GetStatus,
    GetConfig,
    /// Restore and persist the default configuration
    FactoryReset,
}

/// Wire format for host commands. Flat so that `serde_json_core` can
/// deserialize it without `deserialize_any`.
#[derive(Deserialize)]
struct RawCommand {
    cmd: heapless::String<24>,
    #[serde(default)]
    value: Option<i32>,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    format: Option<heapless::String<8>>,
}

impl RawCommand {
    fn into_command(self) -> Option<HostCommand> {
        let cmd = match self.cmd.as_str() {
            "set_report_interval" => HostCommand::SetReportInterval {
                seconds: u16::try_from(self.value?).ok()?,
            },
            "set_housekeeping_interval" => HostCommand::SetHousekeepingInterval {
                seconds: u16::try_from(self.value?).ok()?,
            },
            "set_channel_dwell" => HostCommand::SetChannelDwell {
                ms: u16::try_from(self.value?).ok()?,
            },
            "set_display_refresh" => HostCommand::SetDisplayRefresh {
                ms: u16::try_from(self.value?).ok()?,
            },
            "set_rssi" => HostCommand::SetRssi {
                min_rssi: i8::try_from(self.value?).ok()?,
            },
            "set_wifi_scan" => HostCommand::SetWifiScan {
                enabled: self.enabled?,
            },
            "set_ble_scan" => HostCommand::SetBleScan {
                enabled: self.enabled?,
            },
            "set_screen" => HostCommand::SetScreen {
                enabled: self.enabled?,
            },
            "set_payload_format" => HostCommand::SetPayloadFormat {
                format: PayloadFormat::parse(self.format?.as_str())?,
            },
            "reset_counters" => HostCommand::ResetCounters,
            "get_status" => HostCommand::GetStatus,
            "get_config" => HostCommand::GetConfig,
            "factory_reset" => HostCommand::FactoryReset,
            _ => return None,
        };
        Some(cmd)
    }
}

/// Deserialize a HostCommand from one NDJSON line.
pub fn parse_command(data: &[u8]) -> Option<HostCommand> {
    let trimmed = data.trim_ascii_end();
    if trimmed.is_empty() {
        return None;
    }
    serde_json_core::from_slice::<RawCommand>(trimmed)
        .ok()
        .and_then(|(raw, _)| raw.into_command())
}

/// What the dispatcher has to do after a command was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandEffect {
    /// Configuration changed: persist and publish it
    ConfigChanged,
    ResetCounters,
    SendStatus,
    SendConfig,
}

/// Apply `cmd` to `config`. On error `config` is left unchanged.
pub fn apply_command(cmd: HostCommand, config: &mut Config) -> Result<CommandEffect, ConfigError> {
    let mut next = *config;
    match cmd {
        HostCommand::SetReportInterval { seconds } => next.report_interval_s = seconds,
        HostCommand::SetHousekeepingInterval { seconds } => next.housekeeping_interval_s = seconds,
        HostCommand::SetChannelDwell { ms } => next.channel_dwell_ms = ms,
        HostCommand::SetDisplayRefresh { ms } => next.display_refresh_ms = ms,
        HostCommand::SetRssi { min_rssi } => next.min_rssi = min_rssi,
        HostCommand::SetWifiScan { enabled } => next.wifi_scan = enabled,
        HostCommand::SetBleScan { enabled } => next.ble_scan = enabled,
        HostCommand::SetScreen { enabled } => next.screen_on = enabled,
        HostCommand::SetPayloadFormat { format } => next.payload_format = format,
        HostCommand::FactoryReset => next = Config::DEFAULT,
        HostCommand::ResetCounters => return Ok(CommandEffect::ResetCounters),
        HostCommand::GetStatus => return Ok(CommandEffect::SendStatus),
        HostCommand::GetConfig => return Ok(CommandEffect::SendConfig),
    }
    next.validate()?;
    *config = next;
    log::info!("Config updated by host command: {:?}", cmd);
    Ok(CommandEffect::ConfigChanged)
}

// ── BLE notification framing ──────────────────────────────────────────

/// One notification frame on the TX characteristic.
pub type NotifyFrame = [u8; BLE_MAX_NOTIFY];

/// Split a payload into TX notifications.
///
/// NDJSON payloads are chunked and padded with newlines so the companion
/// NDJSON parser sees harmless empty lines instead of null bytes. Plain
/// payloads carry a `[port, len]` header in every frame.
pub fn notify_frames(msg: &Message) -> heapless::Vec<NotifyFrame, MAX_NOTIFY_FRAMES> {
    let mut frames = heapless::Vec::new();
    if msg.format == PayloadFormat::Json {
        for chunk in msg.payload.chunks(BLE_MAX_NOTIFY) {
            let mut padded = [b'\n'; BLE_MAX_NOTIFY];
            padded[..chunk.len()].copy_from_slice(chunk);
            let _ = frames.push(padded);
        }
    } else {
        for chunk in msg.payload.chunks(BLE_MAX_NOTIFY - 2) {
            let mut frame = [0u8; BLE_MAX_NOTIFY];
            frame[0] = msg.port.number();
            frame[1] = chunk.len() as u8;
            frame[2..2 + chunk.len()].copy_from_slice(chunk);
            let _ = frames.push(frame);
        }
    }
    frames
}

// ── NDJSON line reader ────────────────────────────────────────────────

/// Accumulates bytes until a newline is found, then yields the line.
pub struct LineReader {
    buf: [u8; MAX_LINE_LEN],
    pos: usize,
    overflowed: bool,
}

impl LineReader {
    pub const fn new() -> Self {
        Self {
            buf: [0; MAX_LINE_LEN],
            pos: 0,
            overflowed: false,
        }
    }

    /// Feed a byte into the reader. Returns a complete line (without
    /// newline) when one is detected. A line longer than the buffer is
    /// discarded whole.
    pub fn feed(&mut self, byte: u8) -> Option<&[u8]> {
        if byte == b'\n' || byte == b'\r' {
            let len = core::mem::take(&mut self.pos);
            if core::mem::take(&mut self.overflowed) || len == 0 {
                return None;
            }
            Some(&self.buf[..len])
        } else if self.overflowed {
            None
        } else if self.pos < self.buf.len() {
            self.buf[self.pos] = byte;
            self.pos += 1;
            None
        } else {
            self.overflowed = true;
            None
        }
    }
}

impl Default for LineReader {
    fn default() -> Self {
        Self::new()
    }
}
