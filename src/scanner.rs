/// Scan path glue: radio sightings in, dedup store observations out.
///
/// WiFi: promiscuous-mode frames parsed with the ieee80211 crate. Only
/// probe requests are counted; they are what client devices send while
/// looking for networks, whereas beacons come from infrastructure.
/// BLE: advertisement reports, one per advertiser address.
///
/// Everything here runs in the radio callbacks: no allocation, no
/// logging, no blocking.
use ieee80211::match_frames;
use ieee80211::mgmt_frame::{BeaconFrame, ProbeRequestFrame, ProbeResponseFrame};

use crate::config::Config;
use crate::dedup::{Category, DedupStore};
use crate::filter;

/// A parsed WiFi frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WifiSighting {
    /// Transmitter address (Address 2)
    pub mac: [u8; 6],
    pub rssi: i8,
    pub channel: u8,
    pub frame_type: FrameType,
}

impl WifiSighting {
    /// Whether this frame identifies a client device worth counting.
    pub fn is_countable(&self) -> bool {
        self.frame_type == FrameType::ProbeRequest
    }
}

/// WiFi frame type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Beacon,
    ProbeRequest,
    ProbeResponse,
    Data,
    Other,
}

impl FrameType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Beacon => "beacon",
            FrameType::ProbeRequest => "probe_req",
            FrameType::ProbeResponse => "probe_resp",
            FrameType::Data => "data",
            FrameType::Other => "other",
        }
    }
}

/// Parse a raw 802.11 frame.
///
/// Management frames go through the ieee80211 crate. Anything else falls
/// back to a raw header read of the transmitter address (offset 10).
pub fn parse_wifi_frame(frame: &[u8], rssi: i8, channel: u8) -> Option<WifiSighting> {
    let sighting = |mac: [u8; 6], frame_type| WifiSighting {
        mac,
        rssi,
        channel,
        frame_type,
    };

    let result = match_frames! {
        frame,
        probe_req = ProbeRequestFrame<'_> => {
            sighting(probe_req.header.transmitter_address.0, FrameType::ProbeRequest)
        }
        beacon = BeaconFrame<'_> => {
            sighting(beacon.header.transmitter_address.0, FrameType::Beacon)
        }
        probe_resp = ProbeResponseFrame<'_> => {
            sighting(probe_resp.header.transmitter_address.0, FrameType::ProbeResponse)
        }
    };

    match result {
        Ok(s) => Some(s),
        Err(_) => {
            // 2 (frame ctrl) + 2 (duration) + 6 (addr1) + 6 (addr2)
            if frame.len() < 16 {
                return None;
            }
            let frame_type = match (frame[0] >> 2) & 0x3 {
                2 => FrameType::Data,
                _ => FrameType::Other,
            };
            let mac: [u8; 6] = frame[10..16].try_into().ok()?;
            Some(sighting(mac, frame_type))
        }
    }
}

/// Sniffer callback body. Returns `true` if the frame counted a new
/// device in the current window.
pub fn record_wifi_frame(
    frame: &[u8],
    rssi: i8,
    channel: u8,
    store: &DedupStore,
    config: &Config,
) -> bool {
    if !filter::accepts(Category::Wifi, rssi, config) {
        return false;
    }
    match parse_wifi_frame(frame, rssi, channel) {
        Some(s) if s.is_countable() => store.observe(Category::Wifi, &s.mac),
        _ => false,
    }
}

/// BLE advertisement report handler body. Returns `true` if the
/// advertiser is new in the current window.
pub fn record_ble_report(addr: &[u8; 6], rssi: i8, store: &DedupStore, config: &Config) -> bool {
    filter::accepts(Category::Ble, rssi, config) && store.observe(Category::Ble, addr)
}
