//! Host simulator for the epdclock wake cycle.
//!
//! Runs many wakes back to back against a simulated oscillator that loses a
//! configurable number of milliseconds per minute of deep sleep. The card is
//! a directory on disk and internal flash is a file, so drift calibration,
//! the frame buffer and the daily sensor logs survive between runs just as they
//! would on the device. Time servers and the sensor are in-memory doubles.
//!
//! ```text
//! cargo run -p epdclock-sim -- --boots 180 --drift 35
//! ```

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;
use embassy_futures::block_on;
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use log::{debug, error, info, warn};

use epdclock_core::clock::{Clock, Timestamp};
use epdclock_core::config::ClockConfig;
use epdclock_core::mock::{MockClock, MockNtpServer, MockSensor};
use epdclock_core::persistent_state::{PersistentState, StateError};
use epdclock_core::sensors::EnvironmentReadings;
use epdclock_core::storage::flash::{FLASH_REGION_LEN, FlashMedium};
use epdclock_core::storage::{StorageBackend, StorageError, StorageMedium};
use epdclock_core::upload::{MAX_READINGS_PER_UPLOAD, collect_unsent, pending_logs};
use epdclock_core::wake_cycle::{CommitSummary, WakeCycleController};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// 400x300 panel at one bit per pixel.
const FRAME_LEN: usize = 400 * 300 / 8;

type Image = [u8; PersistentState::ENCODED_LEN];
type Backend = StorageBackend<DirMedium, FlashMedium<FileFlash>>;
type Controller = WakeCycleController<MockClock, DirMedium, FlashMedium<FileFlash>>;

#[derive(Parser, Debug)]
#[command(name = "epdclock-sim")]
#[command(about = "Run epdclock wake cycles against a simulated drifting oscillator")]
struct Args {
    /// Number of wakes to simulate
    #[arg(short, long, default_value_t = 180)]
    boots: u32,

    /// True oscillator loss in ms per minute of deep sleep
    #[arg(short, long, default_value_t = 35.0)]
    drift: f32,

    /// Unix time of the first power-up (defaults to now)
    #[arg(long)]
    start: Option<u64>,

    /// Awake time spent before the display can flip, in ms
    #[arg(long, default_value_t = 1_500)]
    boot_work_ms: u64,

    /// Directory holding the simulated card and flash image
    #[arg(long, default_value = "target/epdclock-sim")]
    data_dir: PathBuf,

    /// Leave the card out so storage falls back to internal flash
    #[arg(long)]
    no_card: bool,

    /// Keep the network link down for the whole run
    #[arg(long)]
    offline: bool,

    /// Wipe the data directory before starting
    #[arg(long)]
    fresh: bool,
}

// ---------------------------------------------------------------------------
// Card: one file per key in a directory
// ---------------------------------------------------------------------------

struct DirMedium {
    root: PathBuf,
}

impl DirMedium {
    fn mount(root: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(root).map_err(|e| io_error("mount", e))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

fn io_error(operation: &'static str, e: std::io::Error) -> StorageError {
    warn!("card: {} failed: {}", operation, e);
    StorageError::Medium {
        medium: "card",
        operation,
    }
}

impl StorageMedium for DirMedium {
    fn name(&self) -> &'static str {
        "card"
    }

    fn exists(&mut self, key: &str) -> Result<bool, StorageError> {
        Ok(self.path(key).is_file())
    }

    fn size(&mut self, key: &str) -> Result<usize, StorageError> {
        fs::metadata(self.path(key))
            .map(|m| m.len() as usize)
            .map_err(|e| io_error("size", e))
    }

    fn write(&mut self, key: &str, bytes: &[u8]) -> Result<usize, StorageError> {
        fs::write(self.path(key), bytes).map_err(|e| io_error("write", e))?;
        Ok(bytes.len())
    }

    fn append(&mut self, key: &str, bytes: &[u8]) -> Result<usize, StorageError> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(key))
            .and_then(|mut f| f.write_all(bytes))
            .map_err(|e| io_error("append", e))?;
        Ok(bytes.len())
    }

    fn read(&mut self, key: &str, buf: &mut [u8]) -> Result<usize, StorageError> {
        let data = fs::read(self.path(key)).map_err(|e| io_error("read", e))?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn format(&mut self) -> Result<(), StorageError> {
        Err(StorageError::Unsupported)
    }

    fn list(&mut self, visit: &mut dyn FnMut(&str)) -> Result<(), StorageError> {
        for entry in fs::read_dir(&self.root).map_err(|e| io_error("list", e))? {
            let entry = entry.map_err(|e| io_error("list", e))?;
            if entry.file_type().is_ok_and(|t| t.is_file()) {
                if let Some(name) = entry.file_name().to_str() {
                    visit(name);
                }
            }
        }
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound),
            Err(e) => Err(io_error("remove", e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal flash: a NOR image kept in a file
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum FileFlashError {
    OutOfBounds,
    NotAligned,
    Io,
}

impl NorFlashError for FileFlashError {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            FileFlashError::OutOfBounds => NorFlashErrorKind::OutOfBounds,
            FileFlashError::NotAligned => NorFlashErrorKind::NotAligned,
            FileFlashError::Io => NorFlashErrorKind::Other,
        }
    }
}

struct FileFlash {
    path: PathBuf,
    data: Vec<u8>,
}

impl FileFlash {
    fn open(path: PathBuf, capacity: usize) -> std::io::Result<Self> {
        let mut data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };
        data.resize(capacity, 0xFF);
        Ok(Self { path, data })
    }

    fn range(&self, offset: u32, len: usize) -> Result<std::ops::Range<usize>, FileFlashError> {
        let start = offset as usize;
        let end = start + len;
        if end > self.data.len() {
            return Err(FileFlashError::OutOfBounds);
        }
        Ok(start..end)
    }

    fn flush(&self) -> Result<(), FileFlashError> {
        fs::write(&self.path, &self.data).map_err(|_| FileFlashError::Io)
    }
}

impl ErrorType for FileFlash {
    type Error = FileFlashError;
}

impl ReadNorFlash for FileFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let range = self.range(offset, bytes.len())?;
        bytes.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl NorFlash for FileFlash {
    const WRITE_SIZE: usize = 4;
    const ERASE_SIZE: usize = 4096;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from as usize % Self::ERASE_SIZE != 0 || to as usize % Self::ERASE_SIZE != 0 {
            return Err(FileFlashError::NotAligned);
        }
        let range = self.range(from, (to - from) as usize)?;
        self.data[range].fill(0xFF);
        self.flush()
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if offset as usize % Self::WRITE_SIZE != 0 || bytes.len() % Self::WRITE_SIZE != 0 {
            return Err(FileFlashError::NotAligned);
        }
        let range = self.range(offset, bytes.len())?;
        for (cell, b) in self.data[range].iter_mut().zip(bytes) {
            *cell &= *b;
        }
        self.flush()
    }
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

/// Everything that outlives a single wake.
struct Device {
    clock: MockClock,
    server: MockNtpServer,
    sensor: MockSensor,
    /// Retained memory; lost only on power loss.
    image: Option<Image>,
    worst_restore_error_us: i64,
}

fn mount_storage(args: &Args) -> Backend {
    let primary = if args.no_card {
        Err(StorageError::Unavailable)
    } else {
        DirMedium::mount(&args.data_dir.join("card"))
    };
    let flash_path = args.data_dir.join("flash.bin");
    Backend::select(primary, || {
        let flash = FileFlash::open(flash_path, FLASH_REGION_LEN as usize)
            .map_err(|e| io_error("flash open", e))?;
        FlashMedium::mount(flash, 0, FLASH_REGION_LEN)
    })
}

/// Stand-in for the rendered clock face.
fn render(hour: u8, minute: u8) -> Vec<u8> {
    let mut frame = vec![0xFF; FRAME_LEN];
    frame[0] = hour;
    frame[1] = minute;
    frame
}

/// Concatenates every daily log that may still hold unsent readings.
fn read_pending_logs(controller: &mut Controller, utc_offset: i32) -> String {
    let last_uploaded = controller.state().last_uploaded_timestamp;
    let storage = controller.storage_mut();
    let names = match storage.list() {
        Ok(names) => names,
        Err(e) => {
            warn!("Cannot list logs: {}", e);
            return String::new();
        }
    };
    let mut log = String::new();
    for key in pending_logs(&names, last_uploaded, utc_offset) {
        match storage.load_to_vec(key) {
            Ok(bytes) => log.push_str(&String::from_utf8_lossy(&bytes)),
            Err(e) => warn!("Skipping {}: {}", key, e),
        }
    }
    log
}

fn run_wake(args: &Args, device: &mut Device) -> Result<CommitSummary, StateError> {
    let mut storage = mount_storage(args);
    let config = ClockConfig::load(&mut storage);
    let utc_offset = config.utc_offset_secs;

    let mut controller = WakeCycleController::boot(
        device.image.as_ref().map(|i| &i[..]),
        storage,
        device.clock.clone(),
        config,
    );
    if let Some(error_us) = device.clock.error_us() {
        info!("Restored clock is {} ms off true time", error_us as f64 / 1000.0);
        device.worst_restore_error_us = device.worst_restore_error_us.max(error_us.abs());
    }

    let mut previous = vec![0u8; FRAME_LEN];
    match controller.load_frame_buffer(&mut previous) {
        Ok(()) => debug!("Previous frame restored, partial refresh possible"),
        Err(e) => debug!("No previous frame ({}), full refresh", e),
    }

    controller.decide_sync();
    block_on(controller.run_workers(&mut device.server, &mut device.sensor));
    device.clock.advance(args.boot_work_ms * 1000);

    if let Err(e) = controller.append_sensor_log() {
        warn!("Sensor log not written: {}", e);
    }
    if controller.report().synced.is_some() {
        let log = read_pending_logs(&mut controller, utc_offset);
        let batch = collect_unsent(
            &log,
            controller.state().last_uploaded_timestamp,
            MAX_READINGS_PER_UPLOAD,
        );
        if let Some(latest) = batch.latest_timestamp {
            info!("Uploading {} readings ({} bytes)", batch.count, batch.payload.len());
            controller.record_upload(latest);
        }
    }

    let mut frame = None;
    if let Some(target) = controller.display_target() {
        if controller.needs_redraw(target.minute) {
            device.clock.advance(target.wait_us);
            let hour = controller
                .clock()
                .now()
                .map_or(0, |now| now.local_hms(utc_offset).0);
            info!("Display {:02}:{:02}", hour, target.minute);
            frame = Some(render(hour, target.minute));
            controller.mark_displayed(target.minute, target.wait_us);
        }
    } else {
        warn!("Time unknown, display left as is");
    }

    let mut next = [0u8; PersistentState::ENCODED_LEN];
    let summary = controller.commit(&mut next, frame.as_deref())?;
    device.image = Some(next);
    Ok(summary)
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(1_767_225_600, |d| d.as_secs())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if args.fresh {
        if let Err(e) = fs::remove_dir_all(&args.data_dir) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Could not clear {}: {}", args.data_dir.display(), e);
            }
        }
    }
    if let Err(e) = fs::create_dir_all(&args.data_dir) {
        error!("Cannot create {}: {}", args.data_dir.display(), e);
        std::process::exit(1);
    }

    let start = Timestamp::new(args.start.unwrap_or_else(now_unix), 0);
    info!(
        "Simulating {} wakes from {} with {} ms/min oscillator loss",
        args.boots, start.secs, args.drift
    );

    let clock = MockClock::power_on(start);
    let mut server = MockNtpServer::new(clock.clone());
    if args.offline {
        server = server.link_down();
    }
    let mut device = Device {
        server,
        sensor: MockSensor::new(EnvironmentReadings {
            temperature_c: 22.4,
            humidity_pct: 41.0,
            co2_ppm: 640,
        }),
        clock,
        image: None,
        worst_restore_error_us: 0,
    };

    for _ in 0..args.boots {
        let summary = match run_wake(&args, &mut device) {
            Ok(summary) => summary,
            Err(e) => {
                error!("Commit failed: {}", e);
                std::process::exit(1);
            }
        };
        info!(
            "Wake #{}: {:?}, rate {:.2} ms/min, sleeping {} ms",
            summary.state.boot_count,
            summary.report.plan,
            summary.state.drift_rate_ms_per_min,
            summary.sleep_us / 1000
        );
        device.clock.deep_sleep(summary.sleep_us, args.drift);
    }

    info!(
        "Done. Worst restored-time error: {:.1} ms",
        device.worst_restore_error_us as f64 / 1000.0
    );
}
