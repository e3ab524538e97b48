//! Hardware abstraction for supported boards.
//!
//! Each board module defines pin assignments and capabilities
//! selected at compile time via feature flags. The dispatcher and the
//! firmware only look at [`CAPABILITIES`]; which optional subsystems a
//! board carries never leaks into the counting logic.

/// Optional subsystems present on a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub wifi: bool,
    pub ble: bool,
    pub display: bool,
    pub button: bool,
    pub battery_probe: bool,
}

#[cfg(feature = "board-xiao")]
mod hw {
    use super::Capabilities;

    pub const LED_PIN: u8 = 21;
    pub const BOARD_NAME: &str = "xiao_esp32s3";
    pub const CAPABILITIES: Capabilities = Capabilities {
        wifi: true,
        ble: true,
        display: false,
        button: false,
        battery_probe: false,
    };
}

#[cfg(feature = "board-m5stickc")]
mod hw {
    use super::Capabilities;

    pub const LED_PIN: u8 = 19;
    pub const BUTTON_PIN: u8 = 37; // Button A, active low
    pub const DISPLAY_WIDTH: u16 = 135;
    pub const DISPLAY_HEIGHT: u16 = 240;
    pub const DISPLAY_SPI_FREQ_MHZ: u32 = 40;
    pub const BOARD_NAME: &str = "m5stickc_plus2";
    pub const CAPABILITIES: Capabilities = Capabilities {
        wifi: true,
        ble: true,
        display: true,
        button: true,
        battery_probe: false,
    };
}

#[cfg(not(any(feature = "board-xiao", feature = "board-m5stickc")))]
mod hw {
    use super::Capabilities;

    pub const BOARD_NAME: &str = "unknown";
    pub const CAPABILITIES: Capabilities = Capabilities {
        wifi: true,
        ble: true,
        display: false,
        button: false,
        battery_probe: false,
    };
}

pub use hw::*;

impl Capabilities {
    /// Short feature list for the boot banner, e.g. `" WIFI BLE OLED BTN"`.
    pub fn describe(&self, out: &mut heapless::String<32>) {
        let tags = [
            (self.wifi, " WIFI"),
            (self.ble, " BLE"),
            (self.display, " OLED"),
            (self.button, " BTN"),
            (self.battery_probe, " BATT"),
        ];
        for (present, tag) in tags {
            if present {
                let _ = out.push_str(tag);
            }
        }
    }
}
