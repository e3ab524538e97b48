//! Bounded send queues between the dispatcher and the transport tasks.
//!
//! The dispatcher only ever calls [`SendQueue::try_enqueue`]: a stalled
//! transport costs one dropped payload and a counter bump, never a stalled
//! counting pipeline. Transport tasks wait on [`SendQueue::dequeue`] with a
//! bound so they can do other work between payloads.

use core::sync::atomic::{AtomicU32, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{with_timeout, Duration, TimeoutError};

use crate::payload::{Payload, PayloadFormat};

/// Elements per transport queue
pub const SEND_QUEUE_SIZE: usize = 4;

/// Destination category of a payload, carried alongside it so the
/// transport can route it (e.g. onto a LoRaWAN port).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    Counter,
    Status,
    Config,
}

impl Port {
    pub fn number(&self) -> u8 {
        match self {
            Port::Counter => 1,
            Port::Status => 2,
            Port::Config => 3,
        }
    }
}

/// One send queue element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub port: Port,
    /// How `payload` was encoded. Transports frame by this, never by
    /// sniffing the bytes.
    pub format: PayloadFormat,
    pub payload: Payload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Serial,
    Ble,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Serial => "serial",
            TransportKind::Ble => "ble",
        }
    }
}

/// The queue was at capacity; the message was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

/// Producer side of a transport, as seen by the dispatcher.
pub trait Transport {
    fn kind(&self) -> TransportKind;
    fn try_enqueue(&self, msg: Message) -> Result<(), QueueFull>;
    /// Messages discarded because the queue was full
    fn dropped(&self) -> u32;
}

/// FIFO of `N` messages feeding one transport task.
pub struct SendQueue<const N: usize> {
    kind: TransportKind,
    channel: Channel<CriticalSectionRawMutex, Message, N>,
    dropped: AtomicU32,
}

impl<const N: usize> SendQueue<N> {
    pub const fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            channel: Channel::new(),
            dropped: AtomicU32::new(0),
        }
    }

    /// Non-blocking enqueue. When full, `msg` is dropped, the queued
    /// messages are left untouched and the drop counter increments.
    pub fn try_enqueue(&self, msg: Message) -> Result<(), QueueFull> {
        self.channel.try_send(msg).map_err(|_| {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            QueueFull
        })
    }

    /// Wait up to `timeout` for the oldest message.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Message, TimeoutError> {
        with_timeout(timeout, self.channel.receive()).await
    }

    pub fn try_dequeue(&self) -> Option<Message> {
        self.channel.try_receive().ok()
    }

    pub fn len(&self) -> usize {
        self.channel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channel.is_empty()
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<const N: usize> Transport for SendQueue<N> {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn try_enqueue(&self, msg: Message) -> Result<(), QueueFull> {
        SendQueue::try_enqueue(self, msg)
    }

    fn dropped(&self) -> u32 {
        SendQueue::dropped(self)
    }
}
