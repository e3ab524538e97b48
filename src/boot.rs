//! Startup wiring.
//!
//! Every task gets its shared state through a [`Registry`] built once in
//! `main`, instead of reaching for globals itself.

use core::sync::atomic::AtomicU8;

use crate::board::{Capabilities, BOARD_NAME};
use crate::comm::CommandChannel;
use crate::config::{Config, ConfigCell, ConfigStore};
use crate::dedup::DedupStore;
use crate::error::BootError;
use crate::flags::IrqFlags;
use crate::payload::VERSION;
use crate::queue::Transport;

/// Typed handles to the state shared between tasks.
#[derive(Clone, Copy)]
pub struct Registry<'a> {
    pub flags: &'a IrqFlags,
    pub store: &'a DedupStore,
    pub config: &'a ConfigCell,
    pub commands: &'a CommandChannel,
    /// Channel the radio is tuned to, written by the channel hopper
    pub channel: &'a AtomicU8,
    transports: &'a [&'a dyn Transport],
}

impl<'a> Registry<'a> {
    /// Fails if `transports` is empty: without a transmit path the device
    /// has no reason to run.
    pub fn new(
        flags: &'a IrqFlags,
        store: &'a DedupStore,
        config: &'a ConfigCell,
        commands: &'a CommandChannel,
        channel: &'a AtomicU8,
        transports: &'a [&'a dyn Transport],
    ) -> Result<Self, BootError> {
        if transports.is_empty() {
            return Err(BootError::NoTransport);
        }
        Ok(Self {
            flags,
            store,
            config,
            commands,
            channel,
            transports,
        })
    }

    pub fn transports(&self) -> &'a [&'a dyn Transport] {
        self.transports
    }

    /// Payloads dropped on full queues, summed over every transport.
    pub fn dropped(&self) -> u32 {
        self.transports
            .iter()
            .fold(0u32, |acc, t| acc.saturating_add(t.dropped()))
    }
}

/// Load the persisted configuration. Anything unusable (first boot,
/// corrupt, other version, out of range) falls back to the defaults,
/// which are then written back.
pub fn load_config(store: &mut impl ConfigStore) -> Config {
    match store.load() {
        Ok(config) => {
            log::info!("Config loaded from storage");
            config
        }
        Err(e) => {
            log::warn!("Stored config unusable ({}), using defaults", e);
            let config = Config::DEFAULT;
            if let Err(e) = store.save(&config) {
                log::warn!("Could not save default config: {}", e);
            }
            config
        }
    }
}

/// Boot banner with firmware version, board and compiled-in features.
pub fn log_banner(caps: &Capabilities) {
    let mut features = heapless::String::<32>::new();
    caps.describe(&mut features);
    log::info!("Paxcount v{} starting on {}", VERSION, BOARD_NAME);
    log::info!("Features:{}", features);
}
