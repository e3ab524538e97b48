//! Paxcount library: portable core of an anonymous device-counting node.
//!
//! Everything that decides *what* gets counted and *when* it gets reported
//! lives here with no platform dependencies, testable on any host with
//! `cargo test`. The ESP32 firmware binary is a thin consumer that wires
//! hardware timers, radio callbacks and transports onto these types.
//!
//! Data flow:
//! - radio callbacks → [`scanner`] → [`dedup::DedupStore`]
//! - hardware timers → [`flags::IrqFlags`] → [`dispatcher::Dispatcher`]
//! - dispatcher → [`payload`] → [`queue::SendQueue`] → transport tasks
//! - rotation timer → hand-off signal → [`rotation::ChannelHopper`]

#![cfg_attr(not(test), no_std)]

pub mod board;
pub mod boot;
pub mod comm;
pub mod config;
pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod flags;
pub mod payload;
pub mod queue;
pub mod rotation;
pub mod scanner;
pub mod storage;
