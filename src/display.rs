/// Display driver for M5StickC Plus2 (ST7789V2, 135x240, SPI).
///
/// Passive renderer: the dispatcher decides when to draw and hands over a
/// [`DisplayView`] through [`SignalUi`]. Draws straight over SPI (no
/// framebuffer, the 64KB required would exceed ESP32's heap).
use core::fmt::Write;

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Timer};
use embedded_graphics::mono_font::ascii::{FONT_10X20, FONT_6X10};
use embedded_graphics::mono_font::MonoTextStyle;
use embedded_graphics::pixelcolor::Rgb565;
use embedded_graphics::prelude::*;
use embedded_graphics::primitives::{PrimitiveStyle, Rectangle};
use embedded_graphics::text::Text;
use embedded_hal_bus::spi::ExclusiveDevice;
use esp_hal::delay::Delay;
use esp_hal::gpio::{Level, Output, OutputConfig};
use esp_hal::spi::master::{Config as SpiConfig, Spi};
use esp_hal::spi::Mode;
use esp_hal::time::Rate;
use mipidsi::interface::SpiInterface;
use mipidsi::models::ST7789;
use mipidsi::options::{ColorInversion, ColorOrder, Orientation, Rotation};
use mipidsi::Builder;

use crate::board;
use crate::dispatcher::{DisplayView, UiSink};
use crate::payload::VERSION;

/// Landscape width after 90-degree rotation
const W: i32 = 240;

/// Colors
const BG: Rgb565 = Rgb565::BLACK;
const HEADER_BG: Rgb565 = Rgb565::new(2, 4, 12);
const TEXT: Rgb565 = Rgb565::WHITE;
const ACCENT: Rgb565 = Rgb565::new(0, 50, 0);
const DIM: Rgb565 = Rgb565::new(12, 24, 12);

static VIEW: Signal<CriticalSectionRawMutex, DisplayView> = Signal::new();
static SCREEN: Signal<CriticalSectionRawMutex, bool> = Signal::new();

/// Dispatcher side of the display. Never blocks: a view not yet drawn is
/// simply replaced by the newer one.
pub struct SignalUi;

impl UiSink for SignalUi {
    fn refresh(&mut self, view: &DisplayView) {
        VIEW.signal(*view);
    }

    fn set_screen(&mut self, on: bool) {
        SCREEN.signal(on);
    }
}

#[embassy_executor::task]
pub async fn display_task(
    spi2: esp_hal::peripherals::SPI2<'static>,
    mosi: esp_hal::peripherals::GPIO15<'static>,
    clk: esp_hal::peripherals::GPIO13<'static>,
    cs_pin: esp_hal::peripherals::GPIO5<'static>,
    dc_pin: esp_hal::peripherals::GPIO14<'static>,
    rst_pin: esp_hal::peripherals::GPIO12<'static>,
    bl_pin: esp_hal::peripherals::GPIO27<'static>,
) {
    let mut backlight = Output::new(bl_pin, Level::High, OutputConfig::default());

    // Configure SPI bus (40 MHz, Mode 0)
    let spi_config = SpiConfig::default()
        .with_frequency(Rate::from_mhz(board::DISPLAY_SPI_FREQ_MHZ))
        .with_mode(Mode::_0);
    let spi = match Spi::new(spi2, spi_config) {
        Ok(spi) => spi.with_sck(clk).with_mosi(mosi),
        Err(e) => {
            log::error!("Display SPI config rejected: {:?}", e);
            return;
        }
    };

    let cs = Output::new(cs_pin, Level::High, OutputConfig::default());
    let Ok(spi_device) = ExclusiveDevice::new_no_delay(spi, cs) else {
        log::error!("Display SPI device setup failed");
        return;
    };

    // Create mipidsi SPI interface (buffer on task stack)
    let dc = Output::new(dc_pin, Level::Low, OutputConfig::default());
    let mut buffer = [0u8; 512];
    let di = SpiInterface::new(spi_device, dc, &mut buffer);

    // Build display: ST7789V2, 135x240, landscape, inverted colors
    let rst = Output::new(rst_pin, Level::High, OutputConfig::default());
    let mut delay = Delay::new();
    let mut display = match Builder::new(ST7789, di)
        .display_size(board::DISPLAY_WIDTH, board::DISPLAY_HEIGHT)
        .display_offset(52, 40)
        .invert_colors(ColorInversion::Inverted)
        .color_order(ColorOrder::Bgr)
        .orientation(Orientation::new().rotate(Rotation::Deg90))
        .reset_pin(rst)
        .init(&mut delay)
    {
        Ok(display) => display,
        Err(_) => {
            log::error!("Display init failed");
            return;
        }
    };

    log::info!("Display initialized (240x135 landscape)");

    draw_splash(&mut display);
    Timer::after(Duration::from_secs(2)).await;

    loop {
        match select(VIEW.wait(), SCREEN.wait()).await {
            Either::First(view) => draw_status(&mut display, &view),
            Either::Second(true) => backlight.set_high(),
            Either::Second(false) => {
                let _ = display.clear(BG);
                backlight.set_low();
            }
        }
    }
}

fn draw_splash(display: &mut impl DrawTarget<Color = Rgb565>) {
    let _ = display.clear(BG);

    let style = MonoTextStyle::new(&FONT_6X10, TEXT);
    let accent = MonoTextStyle::new(&FONT_6X10, ACCENT);

    // Center "PAXCOUNT" (8 chars × 6px = 48px)
    let _ = Text::new("PAXCOUNT", Point::new((W - 48) / 2, 55), style).draw(display);

    let mut ver = heapless::String::<20>::new();
    let _ = write!(ver, "v{}", VERSION);
    let vw = ver.len() as i32 * 6;
    let _ = Text::new(&ver, Point::new((W - vw) / 2, 70), accent).draw(display);

    let tag = board::BOARD_NAME;
    let tw = tag.len() as i32 * 6;
    let _ = Text::new(tag, Point::new((W - tw) / 2, 95), MonoTextStyle::new(&FONT_6X10, DIM))
        .draw(display);
}

fn draw_status(display: &mut impl DrawTarget<Color = Rgb565>, view: &DisplayView) {
    let _ = display.clear(BG);

    let white = MonoTextStyle::new(&FONT_6X10, TEXT);
    let big = MonoTextStyle::new(&FONT_10X20, Rgb565::GREEN);
    let dim = MonoTextStyle::new(&FONT_6X10, DIM);

    // ── Header bar ──────────────────────────────────────────────────────
    let _ = Rectangle::new(Point::zero(), Size::new(W as u32, 14))
        .into_styled(PrimitiveStyle::with_fill(HEADER_BG))
        .draw(display);

    let mut header = heapless::String::<40>::new();
    let _ = write!(header, " PAXCOUNT v{}", VERSION);
    let _ = Text::new(&header, Point::new(0, 10), white).draw(display);

    let mut chan = heapless::String::<8>::new();
    let _ = write!(chan, "[CH{:2}]", view.channel);
    let _ = Text::new(&chan, Point::new(W - 6 * chan.len() as i32 - 2, 10), white).draw(display);

    // ── Counts ──────────────────────────────────────────────────────────
    let mut total = heapless::String::<16>::new();
    let _ = write!(total, "PAX {}", view.counts.total());
    let _ = Text::new(&total, Point::new(6, 40), big).draw(display);

    let mut line = heapless::String::<40>::new();
    let _ = write!(line, " WiFi: {}    BLE: {}", view.counts.wifi, view.counts.ble);
    let _ = Text::new(&line, Point::new(0, 60), white).draw(display);

    // ── Divider ─────────────────────────────────────────────────────────
    let _ = Rectangle::new(Point::new(0, 70), Size::new(W as u32, 1))
        .into_styled(PrimitiveStyle::with_fill(DIM))
        .draw(display);

    // ── Status info ─────────────────────────────────────────────────────
    let hours = view.uptime_s / 3600;
    let mins = (view.uptime_s % 3600) / 60;
    let secs = view.uptime_s % 60;

    let mut status1 = heapless::String::<40>::new();
    let _ = write!(status1, " Up: {:02}:{:02}:{:02}  Dropped: {}", hours, mins, secs, view.dropped);
    let _ = Text::new(&status1, Point::new(0, 88), dim).draw(display);

    let mut status2 = heapless::String::<40>::new();
    match view.battery_mv {
        Some(mv) => {
            let _ = write!(status2, " Batt: {} mV", mv);
        }
        None => {
            let _ = write!(status2, " Batt: ---");
        }
    }
    let _ = Text::new(&status2, Point::new(0, 104), dim).draw(display);
}
