//! In-memory stand-ins for the hardware collaborators
//!
//! Used by the unit tests and by the host simulator. Handles are cheap to
//! clone and share their state, so a test can keep one handle for inspection
//! while the code under test owns another.

use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

use crate::clock::{Clock, Timestamp};
use crate::ntp::client::{NtpTransport, TransportError};
use crate::ntp::packet::NTP_PACKET_LEN;
use crate::sensors::{EnvironmentReadings, EnvironmentSensor, SensorError};
use crate::storage::{StorageError, StorageMedium};

// ---------------------------------------------------------------- clock

struct ClockInner {
    true_us: Cell<i64>,
    boot_true_us: Cell<i64>,
    /// Device time minus true time, `None` while the device clock is unset.
    device_error_us: Cell<Option<i64>>,
}

/// A device clock running against a simulated true time.
#[derive(Clone)]
pub struct MockClock {
    inner: Rc<ClockInner>,
}

impl MockClock {
    /// A freshly powered device: clock unset, uptime zero.
    pub fn power_on(true_time: Timestamp) -> Self {
        let t = true_time.as_micros();
        Self {
            inner: Rc::new(ClockInner {
                true_us: Cell::new(t),
                boot_true_us: Cell::new(t),
                device_error_us: Cell::new(None),
            }),
        }
    }

    pub fn true_time(&self) -> Timestamp {
        Timestamp::from_micros(self.inner.true_us.get())
    }

    /// Device time minus true time.
    pub fn error_us(&self) -> Option<i64> {
        self.inner.device_error_us.get()
    }

    /// Let awake time pass. The device clock runs at true rate while awake.
    pub fn advance(&self, us: u64) {
        self.inner.true_us.set(self.inner.true_us.get() + us as i64);
    }

    /// Deep-sleep for `requested_us` on an oscillator that loses
    /// `drift_ms_per_min`, then reboot with the clock unset.
    pub fn deep_sleep(&self, requested_us: u64, drift_ms_per_min: f32) {
        let extra_us = (requested_us as f64 * drift_ms_per_min as f64 / 60_000.0) as i64;
        self.inner
            .true_us
            .set(self.inner.true_us.get() + requested_us as i64 + extra_us);
        self.inner.boot_true_us.set(self.inner.true_us.get());
        self.inner.device_error_us.set(None);
    }
}

impl Clock for MockClock {
    fn now(&self) -> Option<Timestamp> {
        let error = self.inner.device_error_us.get()?;
        let t = Timestamp::from_micros(self.inner.true_us.get() + error);
        t.is_plausible().then_some(t)
    }

    fn set(&mut self, time: Timestamp) {
        self.inner
            .device_error_us
            .set(Some(time.as_micros() - self.inner.true_us.get()));
    }

    fn uptime_us(&self) -> u64 {
        (self.inner.true_us.get() - self.inner.boot_true_us.get()) as u64
    }
}

// ---------------------------------------------------------------- storage

#[derive(Default)]
struct RamInner {
    files: BTreeMap<String, Vec<u8>>,
    write_limit: Option<usize>,
    read_limit: Option<usize>,
    formats: u32,
}

/// File store in RAM with failure injection.
#[derive(Clone)]
pub struct RamMedium {
    name: &'static str,
    inner: Rc<RefCell<RamInner>>,
}

impl Default for RamMedium {
    fn default() -> Self {
        Self::new()
    }
}

impl RamMedium {
    pub fn new() -> Self {
        Self::named("ram")
    }

    pub fn named(name: &'static str) -> Self {
        Self {
            name,
            inner: Rc::new(RefCell::new(RamInner::default())),
        }
    }

    /// Subsequent writes store at most `n` bytes.
    pub fn truncate_writes_to(&self, n: usize) {
        self.inner.borrow_mut().write_limit = Some(n);
    }

    /// Subsequent reads return at most `n` bytes.
    pub fn truncate_reads_to(&self, n: usize) {
        self.inner.borrow_mut().read_limit = Some(n);
    }

    pub fn format_count(&self) -> u32 {
        self.inner.borrow().formats
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.borrow().files.contains_key(key)
    }

    pub fn contents(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.borrow().files.get(key).cloned()
    }
}

impl StorageMedium for RamMedium {
    fn name(&self) -> &'static str {
        self.name
    }

    fn exists(&mut self, key: &str) -> Result<bool, StorageError> {
        Ok(self.contains(key))
    }

    fn size(&mut self, key: &str) -> Result<usize, StorageError> {
        self.inner
            .borrow()
            .files
            .get(key)
            .map(Vec::len)
            .ok_or(StorageError::NotFound)
    }

    fn write(&mut self, key: &str, bytes: &[u8]) -> Result<usize, StorageError> {
        let mut inner = self.inner.borrow_mut();
        let n = inner.write_limit.map_or(bytes.len(), |l| l.min(bytes.len()));
        inner.files.insert(key.to_string(), bytes[..n].to_vec());
        Ok(n)
    }

    fn append(&mut self, key: &str, bytes: &[u8]) -> Result<usize, StorageError> {
        let mut inner = self.inner.borrow_mut();
        let n = inner.write_limit.map_or(bytes.len(), |l| l.min(bytes.len()));
        inner
            .files
            .entry(key.to_string())
            .or_default()
            .extend_from_slice(&bytes[..n]);
        Ok(n)
    }

    fn read(&mut self, key: &str, buf: &mut [u8]) -> Result<usize, StorageError> {
        let inner = self.inner.borrow();
        let data = inner.files.get(key).ok_or(StorageError::NotFound)?;
        let mut n = data.len().min(buf.len());
        if let Some(limit) = inner.read_limit {
            n = n.min(limit);
        }
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn list(&mut self, visit: &mut dyn FnMut(&str)) -> Result<(), StorageError> {
        for key in self.inner.borrow().files.keys() {
            visit(key);
        }
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        self.inner
            .borrow_mut()
            .files
            .remove(key)
            .map(|_| ())
            .ok_or(StorageError::NotFound)
    }

    fn format(&mut self) -> Result<(), StorageError> {
        let mut inner = self.inner.borrow_mut();
        inner.files.clear();
        inner.formats += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RamFlashError {
    OutOfBounds,
    NotAligned,
    Injected,
}

impl NorFlashError for RamFlashError {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            RamFlashError::OutOfBounds => NorFlashErrorKind::OutOfBounds,
            RamFlashError::NotAligned => NorFlashErrorKind::NotAligned,
            RamFlashError::Injected => NorFlashErrorKind::Other,
        }
    }
}

/// NOR flash in RAM: writes can only clear bits, erase sets whole sectors to 0xFF.
pub struct RamFlash {
    data: Vec<u8>,
    writes_left: Option<usize>,
}

impl RamFlash {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0xFF; capacity],
            writes_left: None,
        }
    }

    /// Allow `n` more successful write calls, then fail.
    pub fn fail_writes_after(&mut self, n: usize) {
        self.writes_left = Some(n);
    }

    fn range(&self, offset: u32, len: usize) -> Result<core::ops::Range<usize>, RamFlashError> {
        let start = offset as usize;
        let end = start + len;
        if end > self.data.len() {
            return Err(RamFlashError::OutOfBounds);
        }
        Ok(start..end)
    }
}

impl ErrorType for RamFlash {
    type Error = RamFlashError;
}

impl ReadNorFlash for RamFlash {
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

impl NorFlash for RamFlash {
    const WRITE_SIZE: usize = 4;
    const ERASE_SIZE: usize = 4096;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from as usize % Self::ERASE_SIZE != 0 || to as usize % Self::ERASE_SIZE != 0 {
            return Err(RamFlashError::NotAligned);
        }
        let range = self.range(from, (to - from) as usize)?;
        self.data[range].fill(0xFF);
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if offset as usize % Self::WRITE_SIZE != 0 || bytes.len() % Self::WRITE_SIZE != 0 {
            return Err(RamFlashError::NotAligned);
        }
        if let Some(left) = self.writes_left.as_mut() {
            if *left == 0 {
                return Err(RamFlashError::Injected);
            }
            *left -= 1;
        }
        let range = self.range(offset, bytes.len())?;
        for (cell, b) in self.data[range].iter_mut().zip(bytes) {
            *cell &= *b;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------- network

/// How a simulated server behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerBehavior {
    Answer,
    /// Name does not resolve.
    Unresolvable,
    /// Never replies.
    Silent,
    /// Replies with a kiss-o'-death (stratum 0) packet.
    KissOfDeath,
}

struct NtpInner {
    servers: Vec<(String, ServerBehavior)>,
    link_up: bool,
    one_way_delay_us: u64,
    processing_us: u64,
    server_error_us: i64,
    pending: Option<(usize, [u8; NTP_PACKET_LEN])>,
    queried: Vec<String>,
}

/// NTP servers answering from the simulated true time of a [`MockClock`].
#[derive(Clone)]
pub struct MockNtpServer {
    clock: MockClock,
    inner: Rc<RefCell<NtpInner>>,
}

impl MockNtpServer {
    /// Every name resolves to a well-behaved server.
    pub fn new(clock: MockClock) -> Self {
        Self {
            clock,
            inner: Rc::new(RefCell::new(NtpInner {
                servers: Vec::new(),
                link_up: true,
                one_way_delay_us: 15_000,
                processing_us: 200,
                server_error_us: 0,
                pending: None,
                queried: Vec::new(),
            })),
        }
    }

    /// Override the behaviour of one server name.
    pub fn with_server(self, host: &str, behavior: ServerBehavior) -> Self {
        self.inner
            .borrow_mut()
            .servers
            .push((host.to_string(), behavior));
        self
    }

    pub fn with_delay(self, one_way_delay_us: u64) -> Self {
        self.inner.borrow_mut().one_way_delay_us = one_way_delay_us;
        self
    }

    pub fn link_down(self) -> Self {
        self.inner.borrow_mut().link_up = false;
        self
    }

    /// Hosts in the order they were resolved.
    pub fn queried(&self) -> Vec<String> {
        self.inner.borrow().queried.clone()
    }

    fn behavior(&self, id: usize) -> ServerBehavior {
        self.inner
            .borrow()
            .servers
            .get(id)
            .map_or(ServerBehavior::Answer, |(_, b)| *b)
    }

    fn ntp_time(&self) -> Timestamp {
        let error = self.inner.borrow().server_error_us;
        self.clock.true_time().offset_by(error)
    }
}

impl NtpTransport for MockNtpServer {
    type Addr = usize;

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.inner.borrow().link_up {
            Ok(())
        } else {
            Err(TransportError::LinkDown)
        }
    }

    async fn resolve(&mut self, host: &str) -> Result<usize, TransportError> {
        let mut inner = self.inner.borrow_mut();
        inner.queried.push(host.to_string());
        let id = match inner.servers.iter().position(|(h, _)| h == host) {
            Some(id) => id,
            None => {
                inner
                    .servers
                    .push((host.to_string(), ServerBehavior::Answer));
                inner.servers.len() - 1
            }
        };
        if inner.servers[id].1 == ServerBehavior::Unresolvable {
            return Err(TransportError::Dns);
        }
        Ok(id)
    }

    async fn send(&mut self, to: usize, packet: &[u8]) -> Result<(), TransportError> {
        let mut request = [0u8; NTP_PACKET_LEN];
        let n = packet.len().min(NTP_PACKET_LEN);
        request[..n].copy_from_slice(&packet[..n]);
        self.inner.borrow_mut().pending = Some((to, request));
        Ok(())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let pending = self.inner.borrow_mut().pending.take();
        let Some((id, request)) = pending else {
            return Err(TransportError::Recv);
        };
        match self.behavior(id) {
            ServerBehavior::Silent => core::future::pending::<()>().await,
            ServerBehavior::Unresolvable => return Err(TransportError::Recv),
            _ => {}
        }

        let (delay, processing) = {
            let inner = self.inner.borrow();
            (inner.one_way_delay_us, inner.processing_us)
        };
        self.clock.advance(delay);
        let t2 = self.ntp_time();
        self.clock.advance(processing);
        let t3 = self.ntp_time();
        self.clock.advance(delay);

        let mut reply = [0u8; NTP_PACKET_LEN];
        reply[0] = 0x24; // LI 0, VN 4, mode 4
        reply[1] = if self.behavior(id) == ServerBehavior::KissOfDeath {
            0
        } else {
            2
        };
        reply[24..32].copy_from_slice(&request[40..48]);
        put_ntp(&mut reply[32..40], t2);
        put_ntp(&mut reply[40..48], t3);

        if buf.len() < NTP_PACKET_LEN {
            return Err(TransportError::Recv);
        }
        buf[..NTP_PACKET_LEN].copy_from_slice(&reply);
        Ok(NTP_PACKET_LEN)
    }
}

fn put_ntp(out: &mut [u8], t: Timestamp) {
    let (secs, frac) = t.to_ntp();
    out[..4].copy_from_slice(&secs.to_be_bytes());
    out[4..8].copy_from_slice(&frac.to_be_bytes());
}

// ---------------------------------------------------------------- sensor

struct SensorInner {
    readings: Option<EnvironmentReadings>,
    measure_delay_ms: u64,
    begin_calls: Vec<bool>,
}

#[derive(Clone)]
pub struct MockSensor {
    inner: Rc<RefCell<SensorInner>>,
}

impl MockSensor {
    pub fn new(readings: EnvironmentReadings) -> Self {
        Self {
            inner: Rc::new(RefCell::new(SensorInner {
                readings: Some(readings),
                measure_delay_ms: 0,
                begin_calls: Vec::new(),
            })),
        }
    }

    /// A sensor whose reads always fail.
    pub fn broken() -> Self {
        let sensor = Self::new(EnvironmentReadings::default());
        sensor.inner.borrow_mut().readings = None;
        sensor
    }

    /// Make each measurement take this long in real time.
    pub fn with_measure_delay(self, ms: u64) -> Self {
        self.inner.borrow_mut().measure_delay_ms = ms;
        self
    }

    /// `wake_from_sleep` flag of every `begin` call so far.
    pub fn begin_calls(&self) -> Vec<bool> {
        self.inner.borrow().begin_calls.clone()
    }
}

impl EnvironmentSensor for MockSensor {
    async fn begin(&mut self, wake_from_sleep: bool) -> Result<(), SensorError> {
        self.inner.borrow_mut().begin_calls.push(wake_from_sleep);
        Ok(())
    }

    async fn measure(&mut self) -> Result<EnvironmentReadings, SensorError> {
        let delay = self.inner.borrow().measure_delay_ms;
        if delay > 0 {
            embassy_time::Timer::after_millis(delay).await;
        }
        self.inner
            .borrow()
            .readings
            .ok_or(SensorError::ReadFailed {
                sensor: "mock",
                operation: "measure",
                details: "sensor configured to fail",
            })
    }
}
