//! Interrupt flag layer.
//!
//! Every periodic timer and the button own one [`IrqFlag`]: a counter the
//! handler bumps and the dispatcher reads-and-clears. Counters instead of
//! booleans so that several firings between two dispatcher polls are not
//! collapsed into one.
//!
//! Handlers only touch atomics and [`Signal`]s here. Nothing in this module
//! allocates, logs or blocks, so all of it is safe to call from interrupt
//! context.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;

use crate::board::Capabilities;

/// Edges closer than this to the last accepted press are bounce.
pub const BUTTON_REFRACTORY_MS: u32 = 250;

/// Wake-up primitive with no payload, used to move work out of interrupt
/// context.
pub type Handoff = Signal<CriticalSectionRawMutex, ()>;

/// Event counter with a single writer (the handler) and a single reader
/// (the dispatcher).
pub struct IrqFlag {
    count: AtomicU32,
}

impl IrqFlag {
    pub const fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
        }
    }

    /// Record one firing.
    #[inline]
    pub fn raise(&self) {
        self.count.fetch_add(1, Ordering::Release);
    }

    /// Read and clear in one atomic step. An increment racing with this
    /// call lands either in the returned value or in the next `take`.
    #[inline]
    pub fn take(&self) -> u32 {
        self.count.swap(0, Ordering::AcqRel)
    }

    /// Firings since the last `take`, without clearing.
    #[inline]
    pub fn pending(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }
}

impl Default for IrqFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Debounced button flag.
pub struct ButtonFlag {
    flag: IrqFlag,
    last_press_ms: AtomicU32,
    seen: AtomicBool,
}

impl ButtonFlag {
    pub const fn new() -> Self {
        Self {
            flag: IrqFlag::new(),
            last_press_ms: AtomicU32::new(0),
            seen: AtomicBool::new(false),
        }
    }

    /// Edge handler. Returns `false` when the edge fell inside the
    /// refractory window of the previous accepted press and was ignored.
    pub fn press(&self, now_ms: u32) -> bool {
        if self.seen.load(Ordering::Relaxed) {
            let last = self.last_press_ms.load(Ordering::Relaxed);
            if now_ms.wrapping_sub(last) < BUTTON_REFRACTORY_MS {
                return false;
            }
        }
        self.last_press_ms.store(now_ms, Ordering::Relaxed);
        self.seen.store(true, Ordering::Relaxed);
        self.flag.raise();
        true
    }

    pub fn take(&self) -> u32 {
        self.flag.take()
    }

    pub fn pending(&self) -> u32 {
        self.flag.pending()
    }
}

impl Default for ButtonFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// The four periodic hardware timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerSource {
    ChannelRotation,
    ReportCycle,
    Housekeeping,
    DisplayRefresh,
}

impl TimerSource {
    pub const ALL: [TimerSource; 4] = [
        TimerSource::ChannelRotation,
        TimerSource::ReportCycle,
        TimerSource::Housekeeping,
        TimerSource::DisplayRefresh,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimerSource::ChannelRotation => "chanrot",
            TimerSource::ReportCycle => "report",
            TimerSource::Housekeeping => "homecycle",
            TimerSource::DisplayRefresh => "display",
        }
    }

    /// Whether a board with `caps` has any use for this timer. A timer
    /// that is not needed is never armed, so it never rings the doorbell.
    pub fn needed_by(&self, caps: &Capabilities) -> bool {
        match self {
            TimerSource::ChannelRotation => caps.wifi,
            TimerSource::ReportCycle | TimerSource::Housekeeping => true,
            TimerSource::DisplayRefresh => caps.display,
        }
    }
}

/// Flag counts taken in one dispatcher poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlagSnapshot {
    pub reports: u32,
    pub housekeeping: u32,
    pub display: u32,
    pub button: u32,
}

impl FlagSnapshot {
    pub fn is_empty(&self) -> bool {
        self.reports == 0 && self.housekeeping == 0 && self.display == 0 && self.button == 0
    }
}

/// All interrupt-shared flags plus the two hand-off signals.
///
/// Constructed once (usually as a `static`) and handed to the timer
/// handlers, the dispatcher and the channel hopper by reference.
pub struct IrqFlags {
    channel: IrqFlag,
    report: IrqFlag,
    housekeeping: IrqFlag,
    display: IrqFlag,
    button: ButtonFlag,
    doorbell: Handoff,
    rotation: Handoff,
}

impl IrqFlags {
    pub const fn new() -> Self {
        Self {
            channel: IrqFlag::new(),
            report: IrqFlag::new(),
            housekeeping: IrqFlag::new(),
            display: IrqFlag::new(),
            button: ButtonFlag::new(),
            doorbell: Signal::new(),
            rotation: Signal::new(),
        }
    }

    /// Timer handler body: count the firing and wake whoever consumes it.
    ///
    /// The rotation timer releases the channel hopper; the others ring the
    /// dispatcher's doorbell.
    pub fn fire(&self, source: TimerSource) {
        self.flag(source).raise();
        match source {
            TimerSource::ChannelRotation => self.rotation.signal(()),
            _ => self.doorbell.signal(()),
        }
    }

    /// Button edge handler.
    pub fn press_button(&self, now_ms: u32) {
        if self.button.press(now_ms) {
            self.doorbell.signal(());
        }
    }

    pub fn flag(&self, source: TimerSource) -> &IrqFlag {
        match source {
            TimerSource::ChannelRotation => &self.channel,
            TimerSource::ReportCycle => &self.report,
            TimerSource::Housekeeping => &self.housekeeping,
            TimerSource::DisplayRefresh => &self.display,
        }
    }

    pub fn button(&self) -> &ButtonFlag {
        &self.button
    }

    /// Read-and-clear every flag the dispatcher owns. The rotation flag is
    /// read by the channel hopper alone.
    pub fn take_all(&self) -> FlagSnapshot {
        FlagSnapshot {
            reports: self.report.take(),
            housekeeping: self.housekeeping.take(),
            display: self.display.take(),
            button: self.button.take(),
        }
    }

    /// Signal the dispatcher waits on between polls.
    pub fn doorbell(&self) -> &Handoff {
        &self.doorbell
    }

    /// Signal the channel hopper waits on.
    pub fn rotation_handoff(&self) -> &Handoff {
        &self.rotation
    }
}

impl Default for IrqFlags {
    fn default() -> Self {
        Self::new()
    }
}
