//! Paxcount: anonymous Wi-Fi/BLE device counter.
//!
//! Counts distinct nearby devices per reporting window using salted,
//! rotating fingerprints, and uplinks the totals over serial and BLE GATT
//! notifications. This binary only wires ESP32 hardware onto the portable
//! core in the `paxcount` library.

#![no_std]
#![no_main]

use esp_backtrace as _;

esp_bootloader_esp_idf::esp_app_desc!();

#[cfg(feature = "m5stickc")]
mod display;

// Re-export library modules so binary submodules (display) can use crate::*
pub(crate) use paxcount::{board, dispatcher, payload};

use core::sync::atomic::{AtomicU8, Ordering};
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Instant, Timer};
use esp_hal::interrupt::software::SoftwareInterruptControl;
use esp_hal::interrupt::Priority;
use esp_hal::rng::Rng;
use esp_hal::timer::timg::TimerGroup;
use static_cell::StaticCell;

use trouble_host::prelude::*;

use paxcount::boot::{self, Registry};
use paxcount::comm::{self, CommandChannel, LineReader};
use paxcount::config::{Config, ConfigCell};
use paxcount::dedup::{DedupStore, SaltSource};
use paxcount::dispatcher::{Dispatcher, SensorSource, Telemetry};
use paxcount::error::BootError;
use paxcount::flags::{IrqFlags, TimerSource};
use paxcount::payload::{Encoder, PayloadFormat};
use paxcount::queue::{SendQueue, Transport, TransportKind, SEND_QUEUE_SIZE};
use paxcount::rotation::{ChannelHopper, ChannelRotation, ChannelTuner, WIFI_CHANNELS};
use paxcount::scanner;
use paxcount::storage::{FlashStore, CONFIG_FLASH_OFFSET};

// ── BLE GATT server definition ──────────────────────────────────────
//
// Proc macros depend on trouble-host which is firmware-only. The UUID
// constants in comm::ble_uuids are the reference copy; proc macros
// require string literals.

#[gatt_service(uuid = "7c0e0001-5b2d-4f0a-9c61-3a8d2e94b1f0")]
struct PaxGattService {
    /// TX: payloads, notify-only. See `comm::notify_frames` for framing.
    #[characteristic(uuid = "7c0e0002-5b2d-4f0a-9c61-3a8d2e94b1f0", notify)]
    tx: [u8; 20],

    /// RX: NDJSON host commands, write-only, accumulated via LineReader.
    #[characteristic(uuid = "7c0e0003-5b2d-4f0a-9c61-3a8d2e94b1f0", write)]
    rx: [u8; 20],
}

#[gatt_server]
struct PaxServer {
    pax_service: PaxGattService,
}

// ── Static shared state ──────────────────────────────────────────────

type TransportQueue = SendQueue<SEND_QUEUE_SIZE>;

static FLAGS: IrqFlags = IrqFlags::new();
static STORE: DedupStore = DedupStore::new();
static CONFIG: ConfigCell = ConfigCell::new(Config::DEFAULT);
static COMMANDS: CommandChannel = Channel::new();

/// Channel the sniffer is tuned to, for the display
static CHANNEL: AtomicU8 = AtomicU8::new(1);

/// Number of connected BLE clients
static BLE_CLIENTS: AtomicU8 = AtomicU8::new(0);

static SERIAL_QUEUE: StaticCell<TransportQueue> = StaticCell::new();
static BLE_QUEUE: StaticCell<TransportQueue> = StaticCell::new();
static TRANSPORTS: StaticCell<[&'static dyn Transport; 2]> = StaticCell::new();

/// Runs the channel rotation above the thread-mode executor, so blocking
/// display draws and window resets never delay a retune.
static ROTATION_EXECUTOR: StaticCell<esp_rtos::embassy::InterruptExecutor<2>> = StaticCell::new();

/// How long a transport task waits for a payload before checking again
const TRANSPORT_IDLE: Duration = Duration::from_secs(1);

/// Log and stop. Nothing useful can run on a half-initialized device.
fn halt(e: BootError) -> ! {
    log::error!("Fatal: {}", e);
    loop {
        core::hint::spin_loop();
    }
}

macro_rules! spawn {
    ($spawner:expr, $task:expr) => {
        if $spawner.spawn($task).is_err() {
            halt(BootError::Spawn(stringify!($task)));
        }
    };
}

// ── Hardware seams ───────────────────────────────────────────────────

// FFI binding for WiFi channel control.
// The symbol is linked via esp-radio's WiFi driver.
unsafe extern "C" {
    fn esp_wifi_set_channel(primary: u8, second: u32) -> i32;
}

struct RadioTuner;

impl ChannelTuner for RadioTuner {
    fn tune(&mut self, channel: u8) {
        unsafe {
            esp_wifi_set_channel(channel, 0);
        }
    }
}

/// Hardware RNG as the salt source.
struct RngSalt(Rng);

impl SaltSource for RngSalt {
    fn next_salt(&mut self) -> u16 {
        self.0.random() as u16
    }
}

struct BoardSensors;

impl SensorSource for BoardSensors {
    fn sample(&mut self) -> Telemetry {
        Telemetry {
            // no battery probe on the supported boards
            battery_mv: None,
            heap_free: Some(esp_alloc::HEAP.free() as u32),
        }
    }
}

/// Boards without a screen.
#[cfg(not(feature = "m5stickc"))]
struct NoDisplay;

#[cfg(not(feature = "m5stickc"))]
impl dispatcher::UiSink for NoDisplay {
    fn refresh(&mut self, _view: &dispatcher::DisplayView) {}

    fn set_screen(&mut self, on: bool) {
        log::info!("Screen {}", if on { "on" } else { "off" });
    }
}

#[cfg(feature = "m5stickc")]
type BoardUi = display::SignalUi;
#[cfg(not(feature = "m5stickc"))]
type BoardUi = NoDisplay;

fn board_ui() -> BoardUi {
    #[cfg(feature = "m5stickc")]
    {
        display::SignalUi
    }
    #[cfg(not(feature = "m5stickc"))]
    {
        NoDisplay
    }
}

type ConfigFlash = FlashStore<esp_storage::FlashStorage<'static>>;

type FirmwareDispatcher = Dispatcher<'static, Encoder, RngSalt, BoardSensors, BoardUi, ConfigFlash>;

// ── Scan callbacks ───────────────────────────────────────────────────

/// WiFi sniffer callback, called from the radio driver's context.
fn wifi_sniffer_callback(pkt: esp_radio::wifi::sniffer::PromiscuousPkt<'_>) {
    let rssi = pkt.rx_cntl.rssi as i8;
    let channel = pkt.rx_cntl.channel as u8;
    scanner::record_wifi_frame(pkt.data, rssi, channel, &STORE, &CONFIG.get());
}

/// EventHandler for BLE advertisement reports from trouble-host.
/// Called synchronously from the runner, must not block.
struct ScanEventHandler;

impl EventHandler for ScanEventHandler {
    fn on_adv_reports(&self, mut it: LeAdvReportsIter<'_>) {
        let config = CONFIG.get();
        while let Some(Ok(report)) = it.next() {
            if let Ok(addr) = <&[u8; 6]>::try_from(report.addr.raw()) {
                scanner::record_ble_report(addr, report.rssi, &STORE, &config);
            }
        }
    }
}

// ── Tasks ────────────────────────────────────────────────────────────

/// One periodic timer. The period is read from the config at every rearm,
/// so a changed period applies from the next cycle on.
#[embassy_executor::task(pool_size = 4)]
async fn cycle_timer_task(source: TimerSource) {
    let mut deadline = Instant::now();
    loop {
        deadline += CONFIG.period(source);
        Timer::at(deadline).await;
        FLAGS.fire(source);
    }
}

/// Button A on the M5StickC (active low).
#[cfg(feature = "m5stickc")]
#[embassy_executor::task]
async fn button_task(pin: esp_hal::peripherals::GPIO37<'static>) {
    use esp_hal::gpio::{Input, InputConfig, Pull};

    let mut button = Input::new(pin, InputConfig::default().with_pull(Pull::None));
    loop {
        button.wait_for_falling_edge().await;
        FLAGS.press_button(Instant::now().as_millis() as u32);
    }
}

#[embassy_executor::task]
async fn channel_hop_task() {
    ChannelHopper::new(&FLAGS, ChannelRotation::new(WIFI_CHANNELS), RadioTuner, &CHANNEL)
        .run()
        .await
}

#[embassy_executor::task]
async fn dispatcher_task(dispatcher: FirmwareDispatcher) {
    dispatcher.run().await
}

/// Serial transport: payloads go out through the log sink.
#[embassy_executor::task]
async fn serial_transport_task(queue: &'static TransportQueue) {
    log::info!("Serial transport started");
    loop {
        let Ok(msg) = queue.dequeue(TRANSPORT_IDLE).await else {
            continue;
        };
        match (msg.format, core::str::from_utf8(&msg.payload)) {
            (PayloadFormat::Json, Ok(line)) => log::info!("{}", line.trim_end()),
            _ => log::info!("port {} {:02X?}", msg.port.number(), msg.payload.as_slice()),
        }
    }
}

// ── Entry point ──────────────────────────────────────────────────────

fn claim_transports() -> Result<(&'static TransportQueue, &'static TransportQueue), BootError> {
    let serial: &'static TransportQueue = SERIAL_QUEUE
        .try_init(SendQueue::new(TransportKind::Serial))
        .ok_or(BootError::QueueAlloc("serial"))?;
    let ble: &'static TransportQueue = BLE_QUEUE
        .try_init(SendQueue::new(TransportKind::Ble))
        .ok_or(BootError::QueueAlloc("ble"))?;
    Ok((serial, ble))
}

#[esp_rtos::main]
async fn main(spawner: embassy_executor::Spawner) {
    esp_println::logger::init_logger_from_env();

    let peripherals = esp_hal::init(esp_hal::Config::default());

    // Set up heap allocator (needed for BLE + WiFi coex stacks).
    // ESP32-S3 needs more heap for coex; ESP32 is tighter on DRAM.
    #[cfg(feature = "esp32")]
    {
        esp_alloc::heap_allocator!(size: 64 * 1024);
    }
    #[cfg(not(feature = "esp32"))]
    {
        esp_alloc::heap_allocator!(size: 128 * 1024);
    }

    // Start the RTOS, requires timer + software interrupt
    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let sw_int = SoftwareInterruptControl::new(peripherals.SW_INTERRUPT);
    esp_rtos::start(timg0.timer0, sw_int.software_interrupt0);

    boot::log_banner(&board::CAPABILITIES);

    // ── Configuration and shared state ─────────────────────────────────

    let mut persist: ConfigFlash = FlashStore::new(
        esp_storage::FlashStorage::new(peripherals.FLASH),
        CONFIG_FLASH_OFFSET,
    );
    CONFIG.set(boot::load_config(&mut persist));

    let (serial_queue, ble_queue) = claim_transports().unwrap_or_else(|e| halt(e));
    let transports: &'static [&'static dyn Transport] = TRANSPORTS
        .try_init([serial_queue, ble_queue])
        .unwrap_or_else(|| halt(BootError::StoreAlloc("transport table")));

    let registry = Registry::new(&FLAGS, &STORE, &CONFIG, &COMMANDS, &CHANNEL, transports)
        .unwrap_or_else(|e| halt(e));

    let dispatcher = Dispatcher::new(
        registry,
        Encoder,
        RngSalt(Rng::new()),
        BoardSensors,
        board_ui(),
        persist,
    );

    // ── Tasks ──────────────────────────────────────────────────────────

    spawn!(spawner, dispatcher_task(dispatcher));
    spawn!(spawner, serial_transport_task(serial_queue));
    for source in [
        TimerSource::ReportCycle,
        TimerSource::Housekeeping,
        TimerSource::DisplayRefresh,
    ] {
        if source.needed_by(&board::CAPABILITIES) {
            spawn!(spawner, cycle_timer_task(source));
        }
    }

    // Hold power on (M5StickC Plus2 needs GPIO4 HIGH to stay powered)
    #[cfg(feature = "m5stickc")]
    let _power_hold = esp_hal::gpio::Output::new(
        peripherals.GPIO4,
        esp_hal::gpio::Level::High,
        esp_hal::gpio::OutputConfig::default(),
    );

    #[cfg(feature = "m5stickc")]
    {
        spawn!(
            spawner,
            display::display_task(
                peripherals.SPI2,
                peripherals.GPIO15,
                peripherals.GPIO13,
                peripherals.GPIO5,
                peripherals.GPIO14,
                peripherals.GPIO12,
                peripherals.GPIO27,
            )
        );
        spawn!(spawner, button_task(peripherals.GPIO37));
        log::info!("Display and button tasks spawned");
    }

    // ── BLE radio initialization ───────────────────────────────────────
    // BLE must be initialized BEFORE WiFi for coexistence to work
    // (especially on ESP32-S3).

    let connector =
        esp_radio::ble::controller::BleConnector::new(peripherals.BT, Default::default())
            .unwrap_or_else(|_| halt(BootError::Radio("BLE")));

    // ── WiFi sniffer initialization ─────────────────────────────────────

    let (_wifi_controller, wifi_interfaces) =
        esp_radio::wifi::new(peripherals.WIFI, Default::default())
            .unwrap_or_else(|_| halt(BootError::Radio("WiFi")));

    let mut sniffer = wifi_interfaces.sniffer;
    sniffer.set_receive_cb(wifi_sniffer_callback);
    if sniffer.set_promiscuous_mode(true).is_err() {
        halt(BootError::Radio("WiFi promiscuous mode"));
    }

    // Rotation starts only once the sniffer can be retuned
    let rotation_executor = ROTATION_EXECUTOR
        .try_init(esp_rtos::embassy::InterruptExecutor::new(sw_int.software_interrupt2))
        .unwrap_or_else(|| halt(BootError::StoreAlloc("rotation executor")));
    let rotation_spawner = rotation_executor.start(Priority::Priority2);
    spawn!(rotation_spawner, channel_hop_task());
    spawn!(rotation_spawner, cycle_timer_task(TimerSource::ChannelRotation));

    log::info!("WiFi sniffer initialized in promiscuous mode");

    let controller: ExternalController<_, 20> = ExternalController::new(connector);

    static HOST_RESOURCES: StaticCell<HostResources<DefaultPacketPool, 1, 2>> = StaticCell::new();
    let resources = HOST_RESOURCES
        .try_init(HostResources::new())
        .unwrap_or_else(|| halt(BootError::StoreAlloc("BLE host resources")));

    let address = Address::random([0xff, 0x8f, 0x1a, 0x05, 0xe4, 0xab]);

    let stack = trouble_host::new(controller, resources).set_random_address(address);
    let Host {
        mut peripheral,
        central,
        mut runner,
        ..
    } = stack.build();

    let server = PaxServer::new_with_config(GapConfig::Peripheral(PeripheralConfig {
        name: comm::BLE_ADV_NAME,
        appearance: &appearance::UNKNOWN,
    }))
    .unwrap_or_else(|_| halt(BootError::Radio("GATT server")));

    log::info!("BLE radio initialized");

    let scan_handler = ScanEventHandler;

    // ── BLE orchestration ──────────────────────────────────────────────
    //
    // Three concurrent futures via join3:
    //   1. BLE stack runner (drives HCI, delivers scan reports to handler)
    //   2. BLE scanner (starts scan, keeps session alive)
    //   3. GATT server (advertise, accept connections, BLE transport)

    let _ = embassy_futures::join::join3(
        // ── Runner: drives the BLE stack ────────────────────────────────
        async {
            loop {
                if let Err(e) = runner.run_with_handler(&scan_handler).await {
                    log::error!("BLE runner error: {:?}", e);
                    Timer::after(Duration::from_secs(1)).await;
                }
            }
        },
        // ── Scanner: start BLE scan and keep session alive ──────────────
        async {
            let mut scanner = trouble_host::scan::Scanner::new(central);
            let config = ScanConfig::default();

            let _session = match scanner.scan(&config).await {
                Ok(session) => session,
                Err(e) => {
                    log::error!("BLE scan failed to start: {:?}", e);
                    return;
                }
            };

            log::info!("BLE scan started (continuous)");
            // Reports flow through ScanEventHandler on the runner
            // for as long as _session lives.
            loop {
                Timer::after(Duration::from_secs(60)).await;
            }
        },
        // ── GATT server: advertise, connect, notify ─────────────────────
        async {
            loop {
                let mut adv_data = [0u8; 31];
                let adv_len = match AdStructure::encode_slice(
                    &[
                        AdStructure::Flags(LE_GENERAL_DISCOVERABLE | BR_EDR_NOT_SUPPORTED),
                        AdStructure::CompleteLocalName(comm::BLE_ADV_NAME.as_bytes()),
                    ],
                    &mut adv_data[..],
                ) {
                    Ok(len) => len,
                    Err(e) => {
                        log::error!("Ad encode error: {:?}", e);
                        Timer::after(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let advertiser = match peripheral
                    .advertise(
                        &Default::default(),
                        Advertisement::ConnectableScannableUndirected {
                            adv_data: &adv_data[..adv_len],
                            scan_data: &[],
                        },
                    )
                    .await
                {
                    Ok(adv) => adv,
                    Err(e) => {
                        log::error!("BLE advertise error: {:?}", e);
                        Timer::after(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                log::info!("BLE advertising as '{}'", comm::BLE_ADV_NAME);

                let conn = match advertiser.accept().await {
                    Ok(c) => c,
                    Err(e) => {
                        log::error!("BLE accept error: {:?}", e);
                        continue;
                    }
                };

                let gatt_conn = match conn.with_attribute_server(&server) {
                    Ok(gc) => gc,
                    Err(e) => {
                        log::error!("GATT setup error: {:?}", e);
                        continue;
                    }
                };

                let clients = BLE_CLIENTS.fetch_add(1, Ordering::Relaxed) + 1;
                log::info!("BLE client connected ({} active)", clients);

                handle_gatt_connection(&gatt_conn, &server, ble_queue).await;

                BLE_CLIENTS.fetch_sub(1, Ordering::Relaxed);
                log::info!("BLE client disconnected, re-advertising");
            }
        },
    )
    .await;
}

/// BLE transport for one connection: drain the BLE send queue into TX
/// notifications and feed RX writes to the dispatcher as host commands.
///
/// While no client is connected the queue fills up and further payloads
/// are dropped and counted.
async fn handle_gatt_connection<'s, P: PacketPool>(
    conn: &GattConnection<'_, 's, P>,
    server: &'s PaxServer<'_>,
    queue: &'static TransportQueue,
) {
    use embassy_futures::select::{select, Either};

    let mut line_reader = LineReader::new();

    loop {
        match select(queue.dequeue(TRANSPORT_IDLE), conn.next()).await {
            Either::First(Ok(msg)) => {
                for frame in comm::notify_frames(&msg) {
                    if server.pax_service.tx.notify(conn, &frame).await.is_err() {
                        return;
                    }
                }
            }
            Either::First(Err(_)) => {}
            Either::Second(event) => match event {
                GattConnectionEvent::Disconnected { .. } => return,
                GattConnectionEvent::Gatt { event } => {
                    if let GattEvent::Write(ref write_event) = event {
                        if write_event.handle() == server.pax_service.rx.handle {
                            for &byte in write_event.data() {
                                if let Some(cmd) = line_reader.feed(byte).and_then(comm::parse_command) {
                                    if COMMANDS.try_send(cmd).is_ok() {
                                        FLAGS.doorbell().signal(());
                                    } else {
                                        log::warn!("Command queue full, {:?} dropped", cmd);
                                    }
                                }
                            }
                        }
                    }
                    // Must accept/reply to all GATT events
                    if let Ok(reply) = event.accept() {
                        reply.send().await;
                    }
                }
                _ => {}
            },
        }
    }
}
