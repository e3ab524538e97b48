//! Wi-Fi channel rotation.
//!
//! The rotation timer does nothing in interrupt context beyond raising its
//! flag and releasing the hand-off signal. Retuning the radio happens here,
//! in a dedicated task that sleeps on that signal.

use core::sync::atomic::{AtomicU8, Ordering};

use crate::flags::{IrqFlags, TimerSource};

/// WiFi channels to scan (2.4 GHz only, ESP32/ESP32-S3 promiscuous mode is 2.4 GHz)
pub const WIFI_CHANNELS: &[u8] = &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13];

/// Position in a fixed channel list.
#[derive(Debug, Clone)]
pub struct ChannelRotation {
    channels: &'static [u8],
    index: usize,
}

impl ChannelRotation {
    /// Start at the first channel of `channels`.
    ///
    /// # Panics
    /// If `channels` is empty.
    pub const fn new(channels: &'static [u8]) -> Self {
        assert!(!channels.is_empty(), "channel list must not be empty");
        Self { channels, index: 0 }
    }

    pub fn current(&self) -> u8 {
        self.channels[self.index]
    }

    /// Move one position, wrapping at the end of the list.
    pub fn advance(&mut self) -> u8 {
        self.advance_by(1)
    }

    /// Move `steps` positions at once.
    pub fn advance_by(&mut self, steps: u32) -> u8 {
        let len = self.channels.len();
        self.index = (self.index + steps as usize % len) % len;
        self.current()
    }
}

/// Radio driver seam.
pub trait ChannelTuner {
    fn tune(&mut self, channel: u8);
}

/// The channel rotation task body.
pub struct ChannelHopper<'a, T: ChannelTuner> {
    flags: &'a IrqFlags,
    rotation: ChannelRotation,
    tuner: T,
    current: &'a AtomicU8,
}

impl<'a, T: ChannelTuner> ChannelHopper<'a, T> {
    /// `current` mirrors the tuned channel for readers outside this task
    /// (the display).
    pub fn new(
        flags: &'a IrqFlags,
        rotation: ChannelRotation,
        tuner: T,
        current: &'a AtomicU8,
    ) -> Self {
        Self {
            flags,
            rotation,
            tuner,
            current,
        }
    }

    /// Tune to the rotation's current channel without advancing.
    pub fn start(&mut self) {
        let ch = self.rotation.current();
        self.tuner.tune(ch);
        self.current.store(ch, Ordering::Relaxed);
    }

    /// Wait for the hand-off, then advance once per timer firing since the
    /// last step. Returns the channel the radio is on afterwards.
    ///
    /// Firings that coalesced into one wake-up still advance one position
    /// each, but the radio is retuned only once.
    pub async fn step(&mut self) -> u8 {
        self.flags.rotation_handoff().wait().await;
        let firings = self.flags.flag(TimerSource::ChannelRotation).take();
        if firings > 0 {
            let ch = self.rotation.advance_by(firings);
            self.tuner.tune(ch);
            self.current.store(ch, Ordering::Relaxed);
        }
        self.rotation.current()
    }

    pub async fn run(mut self) -> ! {
        self.start();
        loop {
            self.step().await;
        }
    }

    pub fn tuner(&self) -> &T {
        &self.tuner
    }
}
