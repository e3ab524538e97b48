//! Central state machine.
//!
//! The dispatcher is the only consumer of the cycle flags and the only
//! task that closes counting windows, builds payloads and logs. One
//! [`Dispatcher::poll`] reads and clears every flag, then walks the states
//! in a fixed order:
//!
//! `Reporting` → `Housekeeping` → `DisplayRefresh` → `ButtonAction`,
//! then pending host commands, then back to `Idle`.
//!
//! Counting work always runs before UI work in the same quantum.

use core::sync::atomic::Ordering;

use embassy_time::{with_timeout, Duration, Instant};

use crate::boot::Registry;
use crate::comm::{apply_command, CommandEffect, HostCommand};
use crate::config::{Config, ConfigStore};
use crate::dedup::{Counts, SaltSource};
use crate::payload::{
    encode_config, encode_status, Metadata, Payload, PayloadEncoder, PayloadFormat, Status,
};
use crate::queue::{Message, Port};

/// Upper bound on flag latency when no doorbell rings.
pub const POLL_QUANTUM: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Reporting,
    Housekeeping,
    DisplayRefresh,
    ButtonAction,
}

/// One auxiliary sensor sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Telemetry {
    pub battery_mv: Option<u16>,
    pub heap_free: Option<u32>,
}

/// Battery, heap and whatever else housekeeping samples.
pub trait SensorSource {
    fn sample(&mut self) -> Telemetry;
}

/// What the display shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayView {
    /// Distinct devices so far in the current window
    pub counts: Counts,
    pub channel: u8,
    pub battery_mv: Option<u16>,
    pub dropped: u32,
    pub uptime_s: u32,
}

/// Display and button collaborator.
pub trait UiSink {
    fn refresh(&mut self, view: &DisplayView);
    /// Screen switched on or off by the button.
    fn set_screen(&mut self, on: bool);
}

/// Running totals, logged at every housekeeping cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub reports: u32,
    /// Report cycles skipped because the payload could not be encoded
    pub skipped: u32,
    pub status_sent: u32,
    pub commands: u32,
    /// Commands that failed validation
    pub rejected: u32,
}

/// Work done by one poll, states in the order they ran.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Serviced {
    pub states: heapless::Vec<State, 4>,
    pub commands: u32,
}

impl Serviced {
    pub fn is_idle(&self) -> bool {
        self.states.is_empty() && self.commands == 0
    }

    fn mark(&mut self, state: State) {
        let _ = self.states.push(state);
    }
}

pub struct Dispatcher<'a, E, R, S, U, C> {
    reg: Registry<'a>,
    encoder: E,
    salts: R,
    sensors: S,
    ui: U,
    persist: C,
    state: State,
    seq: u16,
    telemetry: Telemetry,
    stats: DispatchStats,
    /// Screen state as toggled by the button. Starts from the stored
    /// setting and follows it whenever a command changes it.
    screen_on: bool,
}

impl<'a, E, R, S, U, C> Dispatcher<'a, E, R, S, U, C>
where
    E: PayloadEncoder,
    R: SaltSource,
    S: SensorSource,
    U: UiSink,
    C: ConfigStore,
{
    pub fn new(reg: Registry<'a>, encoder: E, salts: R, sensors: S, ui: U, persist: C) -> Self {
        Self {
            reg,
            encoder,
            salts,
            sensors,
            ui,
            persist,
            state: State::Idle,
            seq: 0,
            telemetry: Telemetry::default(),
            stats: DispatchStats::default(),
            screen_on: reg.config.get().screen_on,
        }
    }

    /// Open the first counting window with a fresh salt.
    pub fn start(&mut self) {
        self.reg.store.reset_window(&mut self.salts);
        log::info!(
            "Dispatcher started, {} transport(s), report every {} s",
            self.reg.transports().len(),
            self.reg.config.get().report_interval_s
        );
    }

    /// Service everything pending. `now_ms` is time since boot.
    pub fn poll(&mut self, now_ms: u64) -> Serviced {
        let pending = self.reg.flags.take_all();
        let mut done = Serviced::default();

        if pending.reports > 0 {
            if pending.reports > 1 {
                log::warn!("{} report cycles coalesced into one", pending.reports);
            }
            self.enter(State::Reporting, &mut done);
            self.report(now_ms);
        }
        if pending.housekeeping > 0 {
            self.enter(State::Housekeeping, &mut done);
            self.housekeeping();
        }
        if pending.display > 0 {
            self.enter(State::DisplayRefresh, &mut done);
            self.refresh_display(now_ms);
        }
        if pending.button > 0 {
            self.enter(State::ButtonAction, &mut done);
            for _ in 0..pending.button {
                self.button_action();
            }
        }

        while let Ok(cmd) = self.reg.commands.try_receive() {
            self.handle_command(cmd, now_ms);
            done.commands += 1;
        }

        self.state = State::Idle;
        done
    }

    /// Dispatcher task body. Never returns.
    pub async fn run(mut self) -> ! {
        self.start();
        loop {
            let _ = with_timeout(POLL_QUANTUM, self.reg.flags.doorbell().wait()).await;
            self.poll(Instant::now().as_millis());
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    pub fn screen_on(&self) -> bool {
        self.screen_on
    }

    fn enter(&mut self, state: State, done: &mut Serviced) {
        self.state = state;
        done.mark(state);
    }

    // ── Reporting ─────────────────────────────────────────────────────

    fn report(&mut self, now_ms: u64) {
        let counts = self.reg.store.close_window(&mut self.salts);
        let config = self.reg.config.get();
        let meta = Metadata {
            seq: self.seq,
            uptime_s: uptime_s(now_ms),
            battery_mv: self.telemetry.battery_mv,
            format: config.payload_format,
        };
        self.seq = self.seq.wrapping_add(1);

        log::info!(
            "Window #{} closed: wifi={} ble={}",
            meta.seq,
            counts.wifi,
            counts.ble
        );

        match self.encoder.encode(&counts, &meta) {
            Ok(payload) => {
                self.stats.reports += 1;
                self.send(Port::Counter, payload, meta.format);
            }
            Err(e) => {
                self.stats.skipped += 1;
                log::warn!("Report #{} skipped: {}", meta.seq, e);
            }
        }
    }

    fn send(&self, port: Port, payload: Payload, format: PayloadFormat) {
        for transport in self.reg.transports() {
            let msg = Message {
                port,
                format,
                payload: payload.clone(),
            };
            if transport.try_enqueue(msg).is_err() {
                log::warn!("{} queue full, payload dropped", transport.kind().as_str());
            }
        }
    }

    // ── Housekeeping ──────────────────────────────────────────────────

    fn housekeeping(&mut self) {
        self.telemetry = self.sensors.sample();
        if let Some(mv) = self.telemetry.battery_mv {
            log::info!("Battery: {} mV", mv);
        }
        if let Some(free) = self.telemetry.heap_free {
            log::info!("Free heap: {} bytes", free);
        }
        for transport in self.reg.transports() {
            let dropped = transport.dropped();
            if dropped > 0 {
                log::warn!("{} queue: {} payload(s) dropped", transport.kind().as_str(), dropped);
            }
        }
        log::info!(
            "Stats: reports={} skipped={} status={} commands={} rejected={}",
            self.stats.reports,
            self.stats.skipped,
            self.stats.status_sent,
            self.stats.commands,
            self.stats.rejected
        );
    }

    // ── UI ────────────────────────────────────────────────────────────

    fn refresh_display(&mut self, now_ms: u64) {
        if !self.screen_on {
            return;
        }
        let view = DisplayView {
            counts: self.reg.store.counts(),
            channel: self.reg.channel.load(Ordering::Relaxed),
            battery_mv: self.telemetry.battery_mv,
            dropped: self.reg.dropped(),
            uptime_s: uptime_s(now_ms),
        };
        self.ui.refresh(&view);
    }

    /// The button toggles the screen. The toggle never reaches the
    /// config, so a reboot restores the stored setting.
    fn button_action(&mut self) {
        self.screen_on = !self.screen_on;
        self.ui.set_screen(self.screen_on);
    }

    // ── Host commands ─────────────────────────────────────────────────

    fn handle_command(&mut self, cmd: HostCommand, now_ms: u64) {
        self.stats.commands += 1;
        let mut config = self.reg.config.get();
        match apply_command(cmd, &mut config) {
            Ok(CommandEffect::ConfigChanged) => self.commit(config),
            Ok(CommandEffect::ResetCounters) => {
                let dropped = self.reg.store.close_window(&mut self.salts);
                log::info!("Counters reset, {} device(s) discarded", dropped.total());
            }
            Ok(CommandEffect::SendStatus) => self.send_status(now_ms, &config),
            Ok(CommandEffect::SendConfig) => match encode_config(&config, config.payload_format) {
                Ok(payload) => self.send(Port::Config, payload, config.payload_format),
                Err(e) => log::warn!("Config response not sent: {}", e),
            },
            Err(e) => {
                self.stats.rejected += 1;
                log::warn!("Command {:?} rejected: {}", cmd, e);
            }
        }
    }

    /// Persist and publish. Timers pick up changed periods when they next
    /// rearm.
    fn commit(&mut self, config: Config) {
        if let Err(e) = self.persist.save(&config) {
            log::warn!("Config not persisted: {}", e);
        }
        let previous = self.reg.config.get();
        self.reg.config.set(config);
        if config.screen_on != previous.screen_on && config.screen_on != self.screen_on {
            self.screen_on = config.screen_on;
            self.ui.set_screen(self.screen_on);
        }
    }

    fn send_status(&mut self, now_ms: u64, config: &Config) {
        let status = Status {
            uptime_s: uptime_s(now_ms),
            battery_mv: self.telemetry.battery_mv,
            heap_free: self.telemetry.heap_free.unwrap_or(0),
            dropped: self.reg.dropped(),
        };
        match encode_status(&status, config.payload_format) {
            Ok(payload) => {
                self.stats.status_sent += 1;
                self.send(Port::Status, payload, config.payload_format);
            }
            Err(e) => log::warn!("Status response not sent: {}", e),
        }
    }
}

fn uptime_s(now_ms: u64) -> u32 {
    (now_ms / 1000).min(u32::MAX as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;
    use core::sync::atomic::AtomicU8;
    use std::vec::Vec;

    use crate::comm::CommandChannel;
    use crate::config::{ConfigCell, MemoryStore};
    use crate::dedup::{Category, DedupStore};
    use crate::error::EncodeError;
    use crate::flags::{IrqFlags, TimerSource};
    use crate::payload::Encoder;
    use crate::queue::{SendQueue, Transport, TransportKind};

    type Journal = RefCell<Vec<&'static str>>;

    struct JournalEncoder<'j> {
        journal: &'j Journal,
        metas: Vec<Metadata>,
        fail: bool,
    }

    impl PayloadEncoder for JournalEncoder<'_> {
        fn encode(&mut self, counts: &Counts, meta: &Metadata) -> Result<Payload, EncodeError> {
            self.journal.borrow_mut().push("encode");
            self.metas.push(*meta);
            if self.fail {
                return Err(EncodeError::Overflow(0));
            }
            Encoder.encode(counts, meta)
        }
    }

    struct Sensors<'j>(&'j Journal);

    impl SensorSource for Sensors<'_> {
        fn sample(&mut self) -> Telemetry {
            self.0.borrow_mut().push("sample");
            Telemetry {
                battery_mv: Some(3900),
                heap_free: Some(42_000),
            }
        }
    }

    #[derive(Default)]
    struct Ui {
        views: Vec<DisplayView>,
        screen: Vec<bool>,
    }

    impl UiSink for &mut Ui {
        fn refresh(&mut self, view: &DisplayView) {
            self.views.push(*view);
        }
        fn set_screen(&mut self, on: bool) {
            self.screen.push(on);
        }
    }

    struct Rig {
        flags: IrqFlags,
        store: DedupStore,
        config: ConfigCell,
        commands: CommandChannel,
        channel: AtomicU8,
        serial: SendQueue<4>,
        ble: SendQueue<4>,
        journal: Journal,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                flags: IrqFlags::new(),
                store: DedupStore::new(),
                config: ConfigCell::new(Config::DEFAULT),
                commands: CommandChannel::new(),
                channel: AtomicU8::new(6),
                serial: SendQueue::new(TransportKind::Serial),
                ble: SendQueue::new(TransportKind::Ble),
                journal: RefCell::new(Vec::new()),
            }
        }
    }

    fn mac(n: u8) -> [u8; 6] {
        [0x02, 0, 0, 0, 0, n]
    }

    /// Build a dispatcher over `rig` feeding `transports`.
    macro_rules! dispatcher {
        ($rig:expr, $transports:expr, $ui:expr, $persist:expr, fail = $fail:expr) => {{
            let reg = Registry::new(
                &$rig.flags,
                &$rig.store,
                &$rig.config,
                &$rig.commands,
                &$rig.channel,
                $transports,
            )
            .unwrap();
            let mut salt = 0u16;
            let salts = move || {
                salt = salt.wrapping_add(0x1111);
                salt
            };
            let encoder = JournalEncoder {
                journal: &$rig.journal,
                metas: Vec::new(),
                fail: $fail,
            };
            Dispatcher::new(reg, encoder, salts, Sensors(&$rig.journal), $ui, $persist)
        }};
        ($rig:expr, $transports:expr, $ui:expr, $persist:expr) => {
            dispatcher!($rig, $transports, $ui, $persist, fail = false)
        };
    }

    #[test]
    fn report_runs_before_housekeeping_and_clears_both_flags() {
        let rig = Rig::new();
        let transports: [&dyn Transport; 1] = [&rig.serial];
        let mut ui = Ui::default();
        let mut d = dispatcher!(rig, &transports, &mut ui, MemoryStore::new());

        for n in 0..3 {
            rig.store.observe(Category::Wifi, &mac(n));
        }
        rig.flags.fire(TimerSource::Housekeeping);
        rig.flags.fire(TimerSource::ReportCycle);

        let done = d.poll(1_000);
        assert_eq!(done.states.as_slice(), &[State::Reporting, State::Housekeeping]);
        assert_eq!(*rig.journal.borrow(), ["encode", "sample"]);
        assert!(rig.flags.take_all().is_empty());
        assert_eq!(d.state(), State::Idle);

        let msg = rig.serial.try_dequeue().unwrap();
        assert_eq!(msg.port, Port::Counter);
        assert_eq!(msg.payload.as_slice(), &[0, 3, 0, 0]);
    }

    #[test]
    fn report_closes_the_window() {
        let rig = Rig::new();
        let transports: [&dyn Transport; 1] = [&rig.serial];
        let mut ui = Ui::default();
        let mut d = dispatcher!(rig, &transports, &mut ui, MemoryStore::new());
        d.start();

        rig.store.observe(Category::Ble, &mac(1));
        let salt = rig.store.salt();
        rig.flags.fire(TimerSource::ReportCycle);
        d.poll(0);

        assert_eq!(rig.store.counts(), Counts::default());
        assert_ne!(rig.store.salt(), salt);
        assert!(rig.store.observe(Category::Ble, &mac(1)));
    }

    #[test]
    fn every_transport_gets_the_report() {
        let rig = Rig::new();
        let transports: [&dyn Transport; 2] = [&rig.serial, &rig.ble];
        let mut ui = Ui::default();
        let mut d = dispatcher!(rig, &transports, &mut ui, MemoryStore::new());

        rig.flags.fire(TimerSource::ReportCycle);
        d.poll(0);
        assert_eq!(rig.serial.len(), 1);
        assert_eq!(rig.ble.len(), 1);
    }

    #[test]
    fn fifth_report_into_full_queue_is_dropped() {
        let rig = Rig::new();
        let transports: [&dyn Transport; 1] = [&rig.serial];
        let mut ui = Ui::default();
        let mut d = dispatcher!(rig, &transports, &mut ui, MemoryStore::new());

        for n in 0..5u8 {
            rig.store.observe(Category::Wifi, &mac(n));
            rig.flags.fire(TimerSource::ReportCycle);
            d.poll(n as u64 * 1000);
        }

        assert_eq!(d.stats().reports, 5);
        assert_eq!(rig.serial.len(), 4);
        assert_eq!(rig.serial.dropped(), 1);
        // oldest first, untouched by the drop
        for _ in 0..4 {
            let msg = rig.serial.try_dequeue().unwrap();
            assert_eq!(msg.payload.as_slice(), &[0, 1, 0, 0]);
        }
    }

    #[test]
    fn encode_failure_skips_the_cycle() {
        let rig = Rig::new();
        let transports: [&dyn Transport; 1] = [&rig.serial];
        let mut ui = Ui::default();
        let mut d = dispatcher!(rig, &transports, &mut ui, MemoryStore::new(), fail = true);

        rig.flags.fire(TimerSource::ReportCycle);
        let done = d.poll(0);
        assert_eq!(done.states.as_slice(), &[State::Reporting]);
        assert!(rig.serial.is_empty());
        assert_eq!(d.stats().skipped, 1);
        assert_eq!(d.stats().reports, 0);

        // the next cycle still runs
        rig.flags.fire(TimerSource::ReportCycle);
        d.poll(1_000);
        assert_eq!(d.stats().skipped, 2);
    }

    #[test]
    fn report_metadata_carries_sequence_and_last_battery_sample() {
        let rig = Rig::new();
        let transports: [&dyn Transport; 1] = [&rig.serial];
        let mut ui = Ui::default();
        let mut d = dispatcher!(rig, &transports, &mut ui, MemoryStore::new());

        rig.flags.fire(TimerSource::ReportCycle);
        d.poll(5_000);
        rig.flags.fire(TimerSource::Housekeeping);
        d.poll(6_000);
        rig.flags.fire(TimerSource::ReportCycle);
        d.poll(125_000);

        let metas = &d.encoder.metas;
        assert_eq!(metas.len(), 2);
        assert_eq!((metas[0].seq, metas[0].battery_mv), (0, None));
        assert_eq!((metas[1].seq, metas[1].battery_mv), (1, Some(3900)));
        assert_eq!(metas[1].uptime_s, 125);
        assert_eq!(metas[1].format, PayloadFormat::Plain);
    }

    #[test]
    fn display_refresh_shows_live_counts_when_screen_on() {
        let rig = Rig::new();
        let transports: [&dyn Transport; 1] = [&rig.serial];
        let mut ui = Ui::default();
        {
            let mut d = dispatcher!(rig, &transports, &mut ui, MemoryStore::new());
            rig.store.observe(Category::Wifi, &mac(1));
            rig.store.observe(Category::Ble, &mac(2));
            rig.flags.fire(TimerSource::DisplayRefresh);
            d.poll(2_000);

            rig.flags.press_button(2_500);
            d.poll(2_600);
            rig.flags.fire(TimerSource::DisplayRefresh);
            d.poll(3_000);
        }

        assert_eq!(ui.views.len(), 1);
        let view = ui.views[0];
        assert_eq!(view.counts, Counts { wifi: 1, ble: 1 });
        assert_eq!(view.channel, 6);
        assert_eq!(view.uptime_s, 2);
        // counts are read, not drained
        assert_eq!(rig.store.counts().total(), 2);
    }

    #[test]
    fn button_toggles_screen() {
        let rig = Rig::new();
        let transports: [&dyn Transport; 1] = [&rig.serial];
        let mut ui = Ui::default();
        {
            let mut d = dispatcher!(rig, &transports, &mut ui, MemoryStore::new());
            rig.flags.press_button(100);
            let done = d.poll(200);
            assert_eq!(done.states.as_slice(), &[State::ButtonAction]);
            assert!(!d.screen_on());

            rig.flags.press_button(1_000);
            d.poll(1_100);
            assert!(d.screen_on());
        }
        assert_eq!(ui.screen, [false, true]);
        assert!(rig.config.get().screen_on);
    }

    #[test]
    fn button_toggle_is_not_persisted_by_a_later_command() {
        let rig = Rig::new();
        let transports: [&dyn Transport; 1] = [&rig.serial];
        let mut ui = Ui::default();
        let mut persisted = MemoryStore::new();
        {
            let mut d = dispatcher!(rig, &transports, &mut ui, &mut persisted);
            rig.flags.press_button(100);
            d.poll(200);
            assert!(!d.screen_on());

            rig.commands
                .try_send(HostCommand::SetRssi { min_rssi: -70 })
                .unwrap();
            d.poll(300);
            // the unrelated command leaves the toggled screen alone
            assert!(!d.screen_on());
        }
        let stored = persisted.load().unwrap();
        assert_eq!(stored.min_rssi, -70);
        assert!(stored.screen_on);
        assert!(rig.config.get().screen_on);
    }

    #[test]
    fn screen_command_overrides_the_button() {
        let rig = Rig::new();
        let transports: [&dyn Transport; 1] = [&rig.serial];
        let mut ui = Ui::default();
        {
            let mut d = dispatcher!(rig, &transports, &mut ui, MemoryStore::new());
            rig.commands
                .try_send(HostCommand::SetScreen { enabled: false })
                .unwrap();
            d.poll(0);
            assert!(!d.screen_on());

            rig.flags.press_button(100);
            d.poll(200);
            assert!(d.screen_on());
            assert!(!rig.config.get().screen_on);
        }
        assert_eq!(ui.screen, [false, true]);
    }

    #[test]
    fn display_and_button_come_after_counting_work() {
        let rig = Rig::new();
        let transports: [&dyn Transport; 1] = [&rig.serial];
        let mut ui = Ui::default();
        let mut d = dispatcher!(rig, &transports, &mut ui, MemoryStore::new());

        rig.flags.press_button(0);
        rig.flags.fire(TimerSource::DisplayRefresh);
        rig.flags.fire(TimerSource::Housekeeping);
        rig.flags.fire(TimerSource::ReportCycle);

        let done = d.poll(500);
        assert_eq!(
            done.states.as_slice(),
            &[
                State::Reporting,
                State::Housekeeping,
                State::DisplayRefresh,
                State::ButtonAction
            ]
        );
    }

    #[test]
    fn empty_poll_does_nothing() {
        let rig = Rig::new();
        let transports: [&dyn Transport; 1] = [&rig.serial];
        let mut ui = Ui::default();
        let mut d = dispatcher!(rig, &transports, &mut ui, MemoryStore::new());
        assert!(d.poll(0).is_idle());
        assert!(rig.journal.borrow().is_empty());
    }

    #[test]
    fn config_command_is_applied_and_persisted() {
        let rig = Rig::new();
        let transports: [&dyn Transport; 1] = [&rig.serial];
        let mut ui = Ui::default();
        let mut persisted = MemoryStore::new();
        {
            let mut d = dispatcher!(rig, &transports, &mut ui, &mut persisted);
            rig.commands
                .try_send(HostCommand::SetReportInterval { seconds: 60 })
                .unwrap();
            let done = d.poll(0);
            assert_eq!(done.commands, 1);
        }

        assert_eq!(rig.config.get().report_interval_s, 60);
        assert_eq!(
            rig.config.period(TimerSource::ReportCycle),
            Duration::from_secs(60)
        );
        assert_eq!(persisted.load().unwrap().report_interval_s, 60);
    }

    #[test]
    fn invalid_command_is_rejected_without_side_effects() {
        let rig = Rig::new();
        let transports: [&dyn Transport; 1] = [&rig.serial];
        let mut ui = Ui::default();
        let mut persisted = MemoryStore::new();
        {
            let mut d = dispatcher!(rig, &transports, &mut ui, &mut persisted);
            rig.commands
                .try_send(HostCommand::SetChannelDwell { ms: 1 })
                .unwrap();
            d.poll(0);
            assert_eq!(d.stats().rejected, 1);
        }
        assert_eq!(rig.config.get(), Config::DEFAULT);
        assert!(persisted.as_bytes().is_empty());
    }

    #[test]
    fn status_and_config_requests_are_answered() {
        let rig = Rig::new();
        let transports: [&dyn Transport; 1] = [&rig.serial];
        let mut ui = Ui::default();
        let mut d = dispatcher!(rig, &transports, &mut ui, MemoryStore::new());

        rig.commands.try_send(HostCommand::GetStatus).unwrap();
        rig.commands.try_send(HostCommand::GetConfig).unwrap();
        d.poll(90_000);

        let status = rig.serial.try_dequeue().unwrap();
        assert_eq!(status.port, Port::Status);
        assert_eq!(&status.payload[2..6], &90u32.to_be_bytes());
        let config = rig.serial.try_dequeue().unwrap();
        assert_eq!(config.port, Port::Config);
        assert_eq!(config.payload.len(), 11);
        assert_eq!(d.stats().status_sent, 1);
    }

    #[test]
    fn reset_counters_discards_window_without_reporting() {
        let rig = Rig::new();
        let transports: [&dyn Transport; 1] = [&rig.serial];
        let mut ui = Ui::default();
        let mut d = dispatcher!(rig, &transports, &mut ui, MemoryStore::new());

        rig.store.observe(Category::Wifi, &mac(9));
        rig.commands.try_send(HostCommand::ResetCounters).unwrap();
        d.poll(0);

        assert_eq!(rig.store.counts(), Counts::default());
        assert!(rig.serial.is_empty());
        assert_eq!(d.stats().reports, 0);
    }

    #[test]
    fn json_format_switch_applies_to_next_report() {
        let rig = Rig::new();
        let transports: [&dyn Transport; 1] = [&rig.serial];
        let mut ui = Ui::default();
        let mut d = dispatcher!(rig, &transports, &mut ui, MemoryStore::new());

        rig.commands
            .try_send(HostCommand::SetPayloadFormat {
                format: PayloadFormat::Json,
            })
            .unwrap();
        rig.flags.fire(TimerSource::ReportCycle);
        // the report runs first with the format in force at that moment
        d.poll(0);
        rig.flags.fire(TimerSource::ReportCycle);
        d.poll(1_000);

        let first = rig.serial.try_dequeue().unwrap();
        assert_eq!(first.payload.len(), 4);
        assert_eq!(first.format, PayloadFormat::Plain);
        let second = rig.serial.try_dequeue().unwrap();
        assert!(second.payload.starts_with(br#"{"type":"counts""#));
        assert_eq!(second.format, PayloadFormat::Json);
    }
}
