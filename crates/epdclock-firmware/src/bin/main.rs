//! epdclock firmware entry point.
//!
//! One run of `main` is one wake: restore the record from RTC fast memory,
//! synchronize and measure as scheduled, flip the display at the minute
//! boundary, commit, then deep sleep until the next minute.
//!
//! Wi-Fi credentials come from `WIFI_SSID` / `WIFI_PASS` at build time.

#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]
#![deny(clippy::large_stack_frames)]

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;
use core::time::Duration as CoreDuration;

use embassy_executor::Spawner;
use embassy_futures::select::{Either, select};
use embassy_net::StackResources;
use embassy_time::Timer;
use embedded_hal_bus::spi::ExclusiveDevice;
use esp_hal::clock::CpuClock;
use esp_hal::gpio::{Level, Output, OutputConfig};
use esp_hal::i2c::master::{Config as I2cConfig, I2c};
use esp_hal::rng::Rng;
use esp_hal::rtc_cntl::sleep::TimerWakeupSource;
use esp_hal::rtc_cntl::{Rtc, wakeup_cause};
use esp_hal::spi::Mode;
use esp_hal::spi::master::{Config as SpiConfig, Spi};
use esp_hal::system::SleepSource;
use esp_hal::time::Rate;
use esp_hal::timer::timg::TimerGroup;
use esp_radio::Controller;
use esp_storage::FlashStorage;
use log::{error, info, warn};
use static_cell::StaticCell;

use epdclock_core::clock::Clock;
use epdclock_core::config::ClockConfig;
use epdclock_core::persistent_state::PersistentState;
use epdclock_core::storage::{StorageBackend, StorageError};
use epdclock_core::wake_cycle::WakeCycleController;
use epdclock_firmware::clock::SystemClock;
use epdclock_firmware::i2c_bus::{I2cBus, SharedI2c};
use epdclock_firmware::net::{SocketBuffers, WifiCredentials, WifiUdpTransport};
use epdclock_firmware::sensor::ClimateSensor;
use epdclock_firmware::storage::{mount_card, mount_internal_flash};

/// 400x300 panel at one bit per pixel.
const FRAME_LEN: usize = 400 * 300 / 8;

/// Card supply ramp before the first SPI command.
const SD_POWER_SETTLE_MS: u64 = 20;

const WIFI_SSID: &str = match option_env!("WIFI_SSID") {
    Some(ssid) => ssid,
    None => "",
};
const WIFI_PASS: &str = match option_env!("WIFI_PASS") {
    Some(pass) => pass,
    None => "",
};

/// The wake-to-wake record. Never initialized by the runtime; the marker
/// inside decides whether its contents are used.
#[esp_hal::ram(unstable(rtc_fast, persistent))]
static mut STATE_IMAGE: [u8; PersistentState::ENCODED_LEN] = [0; PersistentState::ENCODED_LEN];

static RADIO: StaticCell<Controller<'static>> = StaticCell::new();
static NET_RESOURCES: StaticCell<StackResources<3>> = StaticCell::new();
static I2C_BUS: StaticCell<I2cBus<I2c<'static, esp_hal::Async>>> = StaticCell::new();

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    rtt_target::rprintln!("PANIC: {}", info);
    loop {}
}

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

/// Stand-in for the clock face until the panel driver is wired in.
// TODO: draw the face with the e-paper driver and refresh the panel here.
fn render(hour: u8, minute: u8) -> Vec<u8> {
    let mut frame = vec![0xFF; FRAME_LEN];
    frame[0] = hour;
    frame[1] = minute;
    frame
}

#[allow(
    clippy::large_stack_frames,
    reason = "it's not unusual to allocate larger buffers etc. in main"
)]
#[esp_rtos::main]
async fn main(_spawner: Spawner) -> ! {
    rtt_target::rtt_init_log!();

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 73744);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    // Anything but a deep-sleep wake means RTC memory holds garbage.
    let cause = wakeup_cause();
    let warm = !matches!(cause, SleepSource::Undefined);
    info!("Wake cause: {:?}", cause);

    // SAFETY: nothing else touches the image; it is copied out once here and
    // written once just before deep sleep.
    let image = unsafe { &mut *(&raw mut STATE_IMAGE) };
    let retained = *image;

    // ---------------------------------------------------------------- storage
    let mut sd_power = Output::new(peripherals.GPIO21, Level::High, OutputConfig::default());
    Timer::after_millis(SD_POWER_SETTLE_MS).await;
    let sd_spi = Spi::new(
        peripherals.SPI2,
        SpiConfig::default()
            .with_frequency(Rate::from_khz(400))
            .with_mode(Mode::_0),
    )
    .map(|spi| {
        spi.with_sck(peripherals.GPIO39)
            .with_mosi(peripherals.GPIO40)
            .with_miso(peripherals.GPIO41)
    });
    let sd_cs = Output::new(peripherals.GPIO38, Level::High, OutputConfig::default());
    let card = sd_spi
        .map_err(|e| {
            warn!("SD card: SPI setup failed: {:?}", e);
            StorageError::Medium {
                medium: "sd-card",
                operation: "spi setup",
            }
        })
        .and_then(|spi| {
            ExclusiveDevice::new_no_delay(spi, sd_cs).map_err(|_| StorageError::Medium {
                medium: "sd-card",
                operation: "chip select",
            })
        })
        .and_then(mount_card);
    let flash = FlashStorage::new(peripherals.FLASH);
    let mut storage = StorageBackend::select(card, move || mount_internal_flash(flash));

    let clock_config = ClockConfig::load(&mut storage);
    let port = clock_config.sync.port;
    let utc_offset = clock_config.utc_offset_secs;
    let fallback_sleep_us = clock_config.schedule.fallback_sleep_s * 1_000_000;

    let mut controller = WakeCycleController::boot(
        warm.then_some(&retained[..]),
        storage,
        SystemClock::new(),
        clock_config,
    );

    let mut frame = vec![0u8; FRAME_LEN];
    if let Err(e) = controller.load_frame_buffer(&mut frame) {
        info!("No previous frame ({}), full refresh", e);
    }

    // ---------------------------------------------------------------- network
    // A radio that fails to come up only costs this wake its sync; the wake
    // still runs to the commit below.
    let radio_parts = 'radio: {
        let radio: &'static Controller<'static> = match esp_radio::init() {
            Ok(radio) => RADIO.init(radio),
            Err(e) => {
                error!("esp-radio init failed: {:?}", e);
                break 'radio None;
            }
        };
        match esp_radio::wifi::new(radio, peripherals.WIFI, Default::default()) {
            Ok(parts) => Some(parts),
            Err(e) => {
                error!("Wi-Fi init failed: {:?}", e);
                None
            }
        }
    };
    let (mut wifi, net) = match radio_parts {
        Some((wifi, interfaces)) => {
            let rng = Rng::new();
            let seed = (rng.random() as u64) << 32 | rng.random() as u64;
            let net = embassy_net::new(
                interfaces.sta,
                embassy_net::Config::dhcpv4(Default::default()),
                NET_RESOURCES.init(StackResources::<3>::new()),
                seed,
            );
            (Some(wifi), Some(net))
        }
        None => (None, None),
    };
    let (stack, mut net_runner) = net.unzip();

    // ---------------------------------------------------------------- sensors
    let i2c = match I2c::new(
        peripherals.I2C0,
        I2cConfig::default().with_frequency(Rate::from_khz(100)),
    ) {
        Ok(i2c) => Some(
            i2c.with_sda(peripherals.GPIO8)
                .with_scl(peripherals.GPIO9)
                .into_async(),
        ),
        Err(e) => {
            error!("I2C setup failed: {:?}", e);
            None
        }
    };
    let mut sensor = i2c.map(|i2c| {
        let bus: &'static I2cBus<_> = I2C_BUS.init(I2cBus::new(i2c));
        ClimateSensor::new(SharedI2c::new(bus), SharedI2c::new(bus))
    });

    // ---------------------------------------------------------------- wake
    let mut buffers = SocketBuffers::new();
    let mut transport = stack.zip(wifi.as_mut()).map(|(stack, wifi)| {
        WifiUdpTransport::new(
            stack,
            wifi,
            WifiCredentials {
                ssid: WIFI_SSID,
                password: WIFI_PASS,
            },
            &mut buffers,
            port,
        )
    });

    let plan = controller.decide_sync();
    info!("Sync plan: {:?}", plan);

    // The stack runner never finishes; it only needs to run while the workers do.
    let runner = async {
        match net_runner.as_mut() {
            Some(runner) => runner.run().await,
            None => core::future::pending::<()>().await,
        }
    };
    let workers = async {
        controller.run_workers(&mut transport, &mut sensor).await;
    };
    if let Either::First(()) = select(runner, workers).await {
        error!("Network runner stopped");
    }
    if let Some(transport) = transport.as_mut() {
        transport.shutdown().await;
    }

    if let Err(e) = controller.append_sensor_log() {
        warn!("Sensor log not written: {}", e);
    }

    let mut drawn = None;
    match controller.display_target() {
        Some(target) if controller.needs_redraw(target.minute) => {
            if target.wait_us > 0 {
                Timer::after_micros(target.wait_us).await;
            }
            let hour = controller
                .clock()
                .now()
                .map_or(0, |now| now.local_hms(utc_offset).0);
            info!("Display {:02}:{:02}", hour, target.minute);
            frame = render(hour, target.minute);
            controller.mark_displayed(target.minute, target.wait_us);
            drawn = Some(&frame[..]);
        }
        Some(target) => info!("Minute {} already shown", target.minute),
        None => warn!("Time unknown, display left as is"),
    }

    let sleep_us = match controller.commit(image, drawn) {
        Ok(summary) => summary.sleep_us,
        Err(e) => {
            error!("Commit failed: {}", e);
            fallback_sleep_us
        }
    };
    deep_sleep(peripherals.LPWR, &mut sd_power, sleep_us);
}

fn deep_sleep(
    lpwr: esp_hal::peripherals::LPWR<'static>,
    sd_power: &mut Output<'_>,
    sleep_us: u64,
) -> ! {
    sd_power.set_low();
    info!("Deep sleep for {} ms", sleep_us / 1000);
    let mut rtc = Rtc::new(lpwr);
    let timer = TimerWakeupSource::new(CoreDuration::from_micros(sleep_us));
    rtc.sleep_deep(&[&timer])
}
