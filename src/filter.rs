/// Admission filter for scan results.
///
/// Runs in the scan callbacks before anything touches the dedup store, so
/// it is a pure function of the sighting and a config snapshot.
use crate::config::Config;
use crate::dedup::Category;

/// Whether a sighting of `category` at `rssi` dBm should be counted.
pub fn accepts(category: Category, rssi: i8, config: &Config) -> bool {
    let enabled = match category {
        Category::Wifi => config.wifi_scan,
        Category::Ble => config.ble_scan,
    };
    enabled && rssi >= config.min_rssi
}
