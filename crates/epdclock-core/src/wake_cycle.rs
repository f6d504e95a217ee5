//! One wake, from power-up to the next deep sleep
//!
//! ```text
//! Boot -> ValidateState -> FirstBoot | WarmWake -> DecideSyncNeed
//!      -> Sync | MeasureOnly | SkipSync -> UpdateSchedule -> Commit -> PowerDown
//! ```
//!
//! The controller owns the persistent record for the duration of the wake.
//! Workers never touch it: the network worker returns a sample and the
//! controller applies it once both workers are done. No step is fatal; every
//! path reaches [`WakeCycleController::commit`] with a consistent record.

use alloc::string::String;

use embassy_time::Duration;
use log::{debug, error, info, warn};

use crate::clock::{Clock, Timestamp};
use crate::config::ClockConfig;
use crate::drift::{DriftCompensator, Recalibration, SyncObservation};
use crate::ntp::{self, NtpTransport, SyncError, SyncSample, TimeSyncClient};
use crate::persistent_state::{BootKind, PersistentState, StateError};
use crate::scheduler::{DisplayTarget, SleepScheduler};
use crate::sensors::{EnvironmentReadings, EnvironmentSensor, SensorError};
use crate::storage::{
    DRIFT_RATE_KEY, LAST_UPLOAD_KEY, ScalarStore, StorageBackend, StorageError, StorageMedium,
};
use crate::tasks::{TaskCoordinator, TaskOutcome};
use crate::upload::{LOG_RETENTION_DAYS, format_log_line, local_day, log_key, prune_logs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakePhase {
    Boot,
    ValidateState,
    FirstBoot,
    WarmWake,
    DecideSyncNeed,
    Sync,
    MeasureOnly,
    SkipSync,
    UpdateSchedule,
    Commit,
    PowerDown,
}

/// What the network worker does this wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPlan {
    /// Set the clock and recalibrate the drift model.
    Full,
    /// Measure the offset only; clock and model are left alone.
    MeasureOnly,
    Skip,
}

/// Everything the workers produced this wake.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub plan: Option<SyncPlan>,
    /// Time committed by a full sync.
    pub synced: Option<Timestamp>,
    pub recalibration: Option<Recalibration>,
    /// Offset observed by a sync or measure-only check (server minus local).
    pub measured_offset_us: Option<i64>,
    pub sync_error: Option<SyncError>,
    pub sync_timed_out: bool,
    pub readings: Option<EnvironmentReadings>,
    pub sensor_error: Option<SensorError>,
    pub sensor_timed_out: bool,
}

/// Result of [`WakeCycleController::commit`].
#[derive(Debug, Clone, PartialEq)]
pub struct CommitSummary {
    /// Deep-sleep duration to request from the hardware.
    pub sleep_us: u64,
    /// The record as written to the image.
    pub state: PersistentState,
    pub report: CycleReport,
}

pub struct WakeCycleController<C, P, D> {
    config: ClockConfig,
    state: PersistentState,
    storage: StorageBackend<P, D>,
    clock: C,
    phase: WakePhase,
    boot_kind: BootKind,
    report: CycleReport,
}

impl<C, P, D> WakeCycleController<C, P, D>
where
    C: Clock,
    P: StorageMedium,
    D: StorageMedium,
{
    /// Validate the record left by the previous wake and restore the clock.
    ///
    /// `image` is the raw retained-memory image, `None` after a cold power-up.
    pub fn boot(
        image: Option<&[u8]>,
        storage: StorageBackend<P, D>,
        clock: C,
        config: ClockConfig,
    ) -> Self {
        let mut controller = Self {
            config,
            state: PersistentState::fresh(),
            storage,
            clock,
            phase: WakePhase::Boot,
            boot_kind: BootKind::FirstBoot,
            report: CycleReport::default(),
        };

        controller.transition(WakePhase::ValidateState);
        let (state, kind) = PersistentState::validate_or_reset(image);
        controller.state = state;
        controller.boot_kind = kind;
        controller.state.begin_wake();

        match kind {
            BootKind::FirstBoot => {
                controller.transition(WakePhase::FirstBoot);
                controller.state.drift_rate_ms_per_min =
                    controller.config.drift.default_rate_ms_per_min;
                controller.state.estimated_processing_time_s =
                    controller.config.schedule.default_processing_s;
            }
            BootKind::WarmWake => {
                controller.transition(WakePhase::WarmWake);
                controller.restore_time();
            }
        }
        controller.restore_from_storage();

        info!(
            "Wake #{} ({:?}), drift {} ms/min{}",
            controller.state.boot_count,
            kind,
            controller.state.drift_rate_ms_per_min,
            if controller.state.drift_rate_calibrated {
                ""
            } else {
                " (uncalibrated)"
            }
        );
        controller
    }

    fn transition(&mut self, next: WakePhase) {
        debug!("Wake: {:?} -> {:?}", self.phase, next);
        self.phase = next;
    }

    fn restore_time(&mut self) {
        let drift = DriftCompensator::new(&self.config.drift);
        match drift.restore(&self.state, self.clock.uptime_us()) {
            Some(restored) if restored.time.is_plausible() => {
                drift.apply_restore(&mut self.state, &restored);
                self.clock.set(restored.time);
                info!(
                    "Time restored to {}.{:06} (+{} us drift)",
                    restored.time.secs, restored.time.micros, restored.compensation_us
                );
            }
            _ => warn!("No usable saved time, clock left unset"),
        }
    }

    /// Fill in values the retained record lost from the slower storage tier.
    fn restore_from_storage(&mut self) {
        if !self.state.drift_rate_calibrated {
            if let Some(rate) = self.storage.load_scalar::<f32>(DRIFT_RATE_KEY) {
                let drift = &self.config.drift;
                let band = drift.min_rate_ms_per_min..=drift.max_rate_ms_per_min;
                if band.contains(&rate) {
                    info!("Drift rate {} ms/min restored from storage", rate);
                    self.state.drift_rate_ms_per_min = rate;
                    self.state.drift_rate_calibrated = true;
                } else {
                    warn!("Stored drift rate {} ms/min out of band, ignored", rate);
                }
            }
        }
        if self.state.last_uploaded_timestamp == 0 {
            if let Some(ts) = self.storage.load_scalar::<u64>(LAST_UPLOAD_KEY) {
                debug!("Last upload mark {} restored from storage", ts);
                self.state.last_uploaded_timestamp = ts;
            }
        }
    }

    /// The minute this wake should draw, `None` while the time is unknown.
    pub fn display_target(&self) -> Option<DisplayTarget> {
        let now = self.clock.now()?;
        Some(SleepScheduler::display_target(
            now,
            self.state.last_displayed_minute,
            self.config.utc_offset_secs,
        ))
    }

    pub fn decide_sync(&mut self) -> SyncPlan {
        self.transition(WakePhase::DecideSyncNeed);
        let schedule = &self.config.schedule;
        let last_displayed = self.state.last_displayed_minute;
        let since_sync = self
            .state
            .boot_count
            .saturating_sub(self.state.last_sync_boot_count);

        let plan = match self.display_target() {
            _ if self.state.never_synced() => SyncPlan::Full,
            None => SyncPlan::Full,
            Some(t) if t.minute == schedule.sync_minute && t.minute != last_displayed => {
                SyncPlan::Full
            }
            Some(_) if since_sync >= schedule.max_boots_between_syncs => {
                warn!("No sync for {} wakes, forcing one", since_sync);
                SyncPlan::Full
            }
            Some(t) if Some(t.minute) == schedule.measure_minute && t.minute != last_displayed => {
                SyncPlan::MeasureOnly
            }
            Some(_) => SyncPlan::Skip,
        };

        self.transition(match plan {
            SyncPlan::Full => WakePhase::Sync,
            SyncPlan::MeasureOnly => WakePhase::MeasureOnly,
            SyncPlan::Skip => WakePhase::SkipSync,
        });
        info!("Sync plan: {:?}", plan);
        self.report.plan = Some(plan);
        plan
    }

    /// Run the network and sensor workers side by side, then apply their results.
    pub async fn run_workers<T, S>(&mut self, transport: &mut T, sensor: &mut S) -> &CycleReport
    where
        T: NtpTransport,
        S: EnvironmentSensor,
    {
        let plan = match self.report.plan {
            Some(plan) => plan,
            None => self.decide_sync(),
        };

        let coordinator =
            TaskCoordinator::new(Duration::from_millis(self.config.worker_timeout_ms));
        let client = TimeSyncClient::new(&self.config.sync);
        let clock = &self.clock;
        let wake_from_sleep = self.state.sensor_initialized;

        let network = async {
            match plan {
                SyncPlan::Skip => None,
                SyncPlan::Full | SyncPlan::MeasureOnly => Some(client.sync(transport, clock).await),
            }
        };
        let measurement = async {
            match sensor.begin(wake_from_sleep).await {
                Ok(()) => sensor.measure().await,
                Err(e) => Err(e),
            }
        };
        let (network, measurement) = coordinator.run(network, measurement).await;

        match network {
            TaskOutcome::Completed(Some(Ok(sample))) => self.apply_sample(plan, &sample),
            TaskOutcome::Completed(Some(Err(e))) => {
                warn!("Sync failed ({}), keeping restored time", e);
                self.report.sync_error = Some(e);
            }
            TaskOutcome::Completed(None) => {}
            TaskOutcome::TimedOut => {
                warn!("Sync abandoned at deadline, keeping restored time");
                self.report.sync_timed_out = true;
            }
        }

        match measurement {
            TaskOutcome::Completed(Ok(readings)) => {
                info!(
                    "Sensor: {:.1} C, {:.1} %, {} ppm",
                    readings.temperature_c, readings.humidity_pct, readings.co2_ppm
                );
                self.state.sensor_initialized = true;
                self.report.readings = Some(readings);
            }
            TaskOutcome::Completed(Err(e)) => {
                error!("Sensor: {}", e);
                self.state.sensor_initialized = false;
                self.report.sensor_error = Some(e);
            }
            TaskOutcome::TimedOut => {
                self.state.sensor_initialized = false;
                self.report.sensor_timed_out = true;
            }
        }

        &self.report
    }

    fn apply_sample(&mut self, plan: SyncPlan, sample: &SyncSample) {
        self.report.measured_offset_us = Some(sample.offset_us);
        let drift = DriftCompensator::new(&self.config.drift);
        match plan {
            SyncPlan::Full => {
                let uptime_us = self.clock.uptime_us();
                let synced = ntp::commit(sample, &mut self.clock, uptime_us);
                let sync_wait_us = uptime_us.saturating_sub(sample.pre_sync_uptime_us);
                let observation = SyncObservation {
                    synced,
                    pre_sync_local: sample.pre_sync_local,
                    sync_wait_us,
                };
                let recalibration =
                    drift.recalibrate(&mut self.state, observation, &mut self.storage);
                self.report.synced = Some(synced);
                self.report.recalibration = Some(recalibration);
            }
            SyncPlan::MeasureOnly => drift.record_measurement(&mut self.state, sample.offset_us),
            SyncPlan::Skip => {}
        }
    }

    pub fn needs_redraw(&self, minute: u8) -> bool {
        minute != self.state.last_displayed_minute
    }

    /// Record that `minute` is on screen. `waited_us` is the time spent
    /// waiting for the boundary; the rest of the uptime is processing.
    pub fn mark_displayed(&mut self, minute: u8, waited_us: u64) {
        self.state.last_displayed_minute = minute;
        let measured_s = self.clock.uptime_us().saturating_sub(waited_us) as f32 / 1_000_000.0;
        let previous = self.state.estimated_processing_time_s;
        self.state.estimated_processing_time_s =
            SleepScheduler::update_processing_estimate(previous, measured_s);
        debug!(
            "Displayed minute {}, processing {} s, estimate {} -> {} s",
            minute, measured_s, previous, self.state.estimated_processing_time_s
        );
    }

    /// Restore the frame buffer saved by an earlier wake.
    pub fn load_frame_buffer(&mut self, buf: &mut [u8]) -> Result<(), StorageError> {
        self.storage.load_frame_buffer(&self.state, buf)
    }

    /// Record the newest uploaded reading in both tiers.
    pub fn record_upload(&mut self, latest_timestamp: u64) {
        self.state.last_uploaded_timestamp = latest_timestamp;
        if let Err(e) = self.storage.save_scalar(LAST_UPLOAD_KEY, &latest_timestamp) {
            warn!("Upload mark not persisted: {}", e);
        }
    }

    /// This wake's sensor log line, if there is a reading and a valid time.
    pub fn log_line(&self) -> Option<String> {
        let readings = self.report.readings.as_ref()?;
        let now = self.clock.now()?;
        let drift_ms = self.report.measured_offset_us.map(|us| (us / 1000) as i32);
        Some(format_log_line(now, self.config.utc_offset_secs, readings, drift_ms))
    }

    /// Append this wake's line to the log file of the local day. The first
    /// line of a new day also deletes files past the retention window.
    ///
    /// Returns whether a line was written.
    pub fn append_sensor_log(&mut self) -> Result<bool, StorageError> {
        let (Some(line), Some(now)) = (self.log_line(), self.clock.now()) else {
            return Ok(false);
        };
        let offset = self.config.utc_offset_secs;
        let key = log_key(now, offset);
        let new_day = !self.storage.exists(&key)?;
        self.storage.append(&key, line.as_bytes())?;

        if new_day {
            info!("Sensor log: started {}", key);
            match prune_logs(&mut self.storage, local_day(now, offset), LOG_RETENTION_DAYS) {
                Ok(_) | Err(StorageError::Unsupported) => {}
                Err(e) => warn!("Sensor log: retention sweep failed ({})", e),
            }
        }
        Ok(true)
    }

    /// Schedule the next wake and write the record.
    ///
    /// The record is written once with the frame size cleared, then the
    /// frame buffer is saved, then the record is rewritten with the new size.
    /// An interruption between the two writes leaves a record that ignores
    /// the half-written frame.
    pub fn commit(
        mut self,
        image_out: &mut [u8],
        frame: Option<&[u8]>,
    ) -> Result<CommitSummary, StateError> {
        self.transition(WakePhase::UpdateSchedule);
        let now = self.clock.now();
        let scheduler = SleepScheduler::new(&self.config.schedule);
        let sleep_us =
            scheduler.compute_sleep_duration(now, self.state.estimated_processing_time_s);

        self.transition(WakePhase::Commit);
        self.state.set_saved_time(now.unwrap_or_default());
        self.state.sleep_duration_requested_us = sleep_us;

        if let Some(frame) = frame {
            self.state.frame_buffer_size = 0;
            self.state.encode(image_out)?;
            if let Err(e) = self.storage.save_frame_buffer(&mut self.state, frame) {
                warn!("Frame buffer not saved: {}", e);
            }
        }
        self.state.encode(image_out)?;

        self.transition(WakePhase::PowerDown);
        info!(
            "Sleeping {} ms (estimate {} s)",
            sleep_us / 1000,
            self.state.estimated_processing_time_s
        );
        Ok(CommitSummary {
            sleep_us,
            state: self.state,
            report: self.report,
        })
    }

    pub fn state(&self) -> &PersistentState {
        &self.state
    }

    pub fn config(&self) -> &ClockConfig {
        &self.config
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn phase(&self) -> WakePhase {
        self.phase
    }

    pub fn boot_kind(&self) -> BootKind {
        self.boot_kind
    }

    pub fn report(&self) -> &CycleReport {
        &self.report
    }

    pub fn storage_mut(&mut self) -> &mut StorageBackend<P, D> {
        &mut self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockClock, MockNtpServer, MockSensor, RamMedium};
    use crate::ntp::TransportError;
    use crate::storage::{FRAME_KEY, Rate};
    use embassy_futures::block_on;

    type Backend = StorageBackend<RamMedium, RamMedium>;
    type Controller = WakeCycleController<MockClock, RamMedium, RamMedium>;

    // 2026-01-01T00:00:10Z
    const START: Timestamp = Timestamp::new(1_767_225_610, 0);
    const TRUE_DRIFT: f32 = 30.0;

    fn backend(card: &RamMedium) -> Backend {
        Backend::select(Ok(card.clone()), || Err(StorageError::Unavailable))
    }

    fn readings() -> EnvironmentReadings {
        EnvironmentReadings {
            temperature_c: 22.0,
            humidity_pct: 45.0,
            co2_ppm: 700,
        }
    }

    struct Rig {
        clock: MockClock,
        card: RamMedium,
        server: MockNtpServer,
        sensor: MockSensor,
        image: Option<[u8; PersistentState::ENCODED_LEN]>,
    }

    impl Rig {
        fn new() -> Self {
            let clock = MockClock::power_on(START);
            Self {
                server: MockNtpServer::new(clock.clone()),
                sensor: MockSensor::new(readings()),
                card: RamMedium::new(),
                clock,
                image: None,
            }
        }

        /// One complete wake followed by deep sleep.
        fn cycle(&mut self) -> CommitSummary {
            let mut c = Controller::boot(
                self.image.as_ref().map(|i| &i[..]),
                backend(&self.card),
                self.clock.clone(),
                ClockConfig::default(),
            );
            c.decide_sync();
            block_on(c.run_workers(&mut self.server, &mut self.sensor));

            let mut frame = None;
            if let Some(target) = c.display_target() {
                self.clock.advance(target.wait_us);
                c.mark_displayed(target.minute, target.wait_us);
                frame = Some([target.minute; 64]);
            }

            let mut next = [0u8; PersistentState::ENCODED_LEN];
            let summary = c.commit(&mut next, frame.as_ref().map(|f| &f[..])).unwrap();
            self.image = Some(next);
            self.clock.deep_sleep(summary.sleep_us, TRUE_DRIFT);
            summary
        }
    }

    fn boot_with(state: &PersistentState, clock: &MockClock, card: &RamMedium) -> Controller {
        let mut image = [0u8; PersistentState::ENCODED_LEN];
        state.encode(&mut image).unwrap();
        Controller::boot(Some(&image), backend(card), clock.clone(), ClockConfig::default())
    }

    /// A record that restores exactly `at` and was last synced `boots_ago` wakes ago.
    fn synced_record(at: Timestamp, last_displayed: u8, boots_ago: u32) -> PersistentState {
        let mut state = PersistentState::fresh();
        state.boot_count = 500;
        state.last_sync_boot_count = 500 + 1 - boots_ago;
        state.last_sync_timestamp = at.secs - 600;
        state.drift_rate_calibrated = true;
        state.last_displayed_minute = last_displayed;
        state.set_saved_time(at);
        state.sleep_duration_requested_us = 0;
        state
    }

    #[test]
    fn test_hour_of_wakes_end_to_end() {
        let mut rig = Rig::new();

        // Boot 1: cold start, sync, anchor the model.
        let first = rig.cycle();
        assert_eq!(first.state.boot_count, 1);
        assert_eq!(first.report.plan, Some(SyncPlan::Full));
        assert!(first.report.synced.is_some());
        assert!(first.state.drift_rate_calibrated);
        assert_eq!(first.state.last_displayed_minute, 0);
        assert_eq!(first.state.frame_buffer_size, 64);
        assert_eq!(rig.card.contents(FRAME_KEY).unwrap(), [0u8; 64]);
        assert!(first.sleep_us >= 1_000_000 && first.sleep_us < 60_000_000);
        let image = rig.image.unwrap();
        assert_eq!(PersistentState::decode(&image).unwrap(), first.state);

        // Boot 2: warm wake, time restored within a few ms, no network.
        let mut c = Controller::boot(
            Some(&image),
            backend(&rig.card),
            rig.clock.clone(),
            ClockConfig::default(),
        );
        assert_eq!(c.boot_kind(), BootKind::WarmWake);
        assert_eq!(c.state().boot_count, 2);
        assert!(rig.clock.error_us().unwrap().abs() < 5_000);
        assert_eq!(c.decide_sync(), SyncPlan::Skip);
        let target = c.display_target().unwrap();
        assert_eq!(target.minute, 1);
        assert!(target.wait_us > 0);
        let mut frame = [0xAAu8; 64];
        c.load_frame_buffer(&mut frame).unwrap();
        assert_eq!(frame, [0u8; 64]);
        drop(c);

        let second = rig.cycle();
        assert_eq!(second.state.boot_count, 2);
        assert_eq!(second.report.plan, Some(SyncPlan::Skip));
        assert_eq!(second.state.last_displayed_minute, 1);
        assert_eq!(rig.sensor.begin_calls()[..2], [false, true]);

        // Boots 3..=60: one measure-only sync at minute 30, otherwise local only.
        for boot in 3..=60u32 {
            let summary = rig.cycle();
            assert_eq!(summary.state.boot_count, boot);
            assert_eq!(summary.state.last_displayed_minute as u32, boot - 1);
            if boot == 31 {
                assert_eq!(summary.report.plan, Some(SyncPlan::MeasureOnly));
                assert!(summary.report.measured_offset_us.unwrap() > 0);
                assert_eq!(summary.report.synced, None);
                assert_eq!(summary.state.last_sync_boot_count, 1);
            } else {
                assert_eq!(summary.report.plan, Some(SyncPlan::Skip), "boot {boot}");
            }
            assert!(summary.state.cumulative_compensation_us > 0);
        }

        // Boot 61: the hour boundary recalibrates from the drift built up over the hour.
        let last = rig.cycle();
        assert_eq!(last.report.plan, Some(SyncPlan::Full));
        let recal = last.report.recalibration.unwrap();
        assert!(recal.residual_us.unwrap() > 0);
        assert!(last.state.drift_rate_ms_per_min > 28.0);
        assert!(last.state.drift_rate_ms_per_min < TRUE_DRIFT);
        assert_eq!(last.state.cumulative_compensation_us, 0);
        assert_eq!(last.state.last_sync_boot_count, 61);
        assert_eq!(last.state.last_displayed_minute, 0);
        assert!(rig.card.contains(DRIFT_RATE_KEY));
    }

    #[test]
    fn test_first_boot_restores_rate_and_upload_mark_from_storage() {
        let card = RamMedium::new();
        let mut store = backend(&card);
        store.save_scalar(DRIFT_RATE_KEY, &Rate(41.5)).unwrap();
        store.save_scalar(LAST_UPLOAD_KEY, &1_767_000_000u64).unwrap();

        let c = Controller::boot(
            None,
            backend(&card),
            MockClock::power_on(START),
            ClockConfig::default(),
        );
        assert_eq!(c.boot_kind(), BootKind::FirstBoot);
        assert_eq!(c.state().drift_rate_ms_per_min, 41.5);
        assert!(c.state().drift_rate_calibrated);
        assert_eq!(c.state().last_uploaded_timestamp, 1_767_000_000);
    }

    #[test]
    fn test_out_of_band_stored_rate_ignored() {
        let card = RamMedium::new();
        backend(&card).save_scalar(DRIFT_RATE_KEY, &Rate(900.0)).unwrap();
        let c = Controller::boot(
            None,
            backend(&card),
            MockClock::power_on(START),
            ClockConfig::default(),
        );
        assert_eq!(c.state().drift_rate_ms_per_min, 28.0);
        assert!(!c.state().drift_rate_calibrated);
    }

    #[test]
    fn test_decide_sync_boundaries() {
        let card = RamMedium::new();
        // 00:59:57 UTC, so the upcoming displayed minute is 0 when 59 is on screen.
        let before_hour = Timestamp::new(1_767_229_197, 0);
        let clock = MockClock::power_on(before_hour);

        let mut c = boot_with(&synced_record(before_hour, 59, 10), &clock, &card);
        assert_eq!(c.decide_sync(), SyncPlan::Full);
        assert_eq!(c.phase(), WakePhase::Sync);

        // Minute 0 already drawn: the upcoming minute is 1.
        let after_hour = Timestamp::new(1_767_229_202, 0);
        let mut c = boot_with(&synced_record(after_hour, 0, 10), &clock, &card);
        assert_eq!(c.decide_sync(), SyncPlan::Skip);

        let before_half = Timestamp::new(1_767_227_397, 0);
        let mut c = boot_with(&synced_record(before_half, 29, 10), &clock, &card);
        assert_eq!(c.decide_sync(), SyncPlan::MeasureOnly);
        assert_eq!(c.phase(), WakePhase::MeasureOnly);

        let mid = Timestamp::new(1_767_226_617, 0);
        let mut c = boot_with(&synced_record(mid, 16, 10), &clock, &card);
        assert_eq!(c.decide_sync(), SyncPlan::Skip);
        assert_eq!(c.phase(), WakePhase::SkipSync);

        // Backstop after many wakes without a sync.
        let mut c = boot_with(&synced_record(mid, 16, 120), &clock, &card);
        assert_eq!(c.decide_sync(), SyncPlan::Full);
    }

    #[test]
    fn test_never_synced_or_unknown_time_forces_sync() {
        let card = RamMedium::new();
        let clock = MockClock::power_on(START);
        let mut state = synced_record(START, 16, 10);
        state.last_sync_boot_count = 0;
        assert_eq!(boot_with(&state, &clock, &card).decide_sync(), SyncPlan::Full);

        let mut state = synced_record(START, 16, 10);
        state.saved_time_secs = 0;
        let mut c = boot_with(&state, &MockClock::power_on(START), &card);
        assert!(c.clock().now().is_none());
        assert_eq!(c.decide_sync(), SyncPlan::Full);
    }

    #[test]
    fn test_failed_sync_keeps_restored_time_and_model() {
        let card = RamMedium::new();
        let before_hour = Timestamp::new(1_767_229_197, 0);
        let clock = MockClock::power_on(before_hour);
        let state = synced_record(before_hour, 59, 10);
        let mut c = boot_with(&state, &clock, &card);

        let mut server = MockNtpServer::new(clock.clone()).link_down();
        let mut sensor = MockSensor::broken();
        let report = block_on(c.run_workers(&mut server, &mut sensor)).clone();
        assert_eq!(report.plan, Some(SyncPlan::Full));
        assert!(report.sync_error.is_some());
        assert!(report.sensor_error.is_some());
        assert_eq!(clock.error_us(), Some(0));
        assert_eq!(c.state().last_sync_boot_count, state.last_sync_boot_count);
        assert!(!c.state().sensor_initialized);
        assert!(c.log_line().is_none());

        let mut image = [0u8; PersistentState::ENCODED_LEN];
        let summary = c.commit(&mut image, None).unwrap();
        assert_eq!(summary.state.saved_time(), Some(before_hour));
        assert!(summary.sleep_us >= 1_000_000);
    }

    #[test]
    fn test_wake_without_radio_or_sensor_still_commits() {
        let card = RamMedium::new();
        let clock = MockClock::power_on(START);
        let state = synced_record(START, 59, 10);
        let mut c = boot_with(&state, &clock, &card);
        assert_eq!(c.state().boot_count, state.boot_count + 1);

        let mut transport: Option<MockNtpServer> = None;
        let mut sensor: Option<MockSensor> = None;
        let report = block_on(c.run_workers(&mut transport, &mut sensor)).clone();
        assert_eq!(report.sync_error, Some(SyncError::Network(TransportError::LinkDown)));
        assert!(report.sensor_error.is_some());
        assert!(!c.state().sensor_initialized);

        clock.advance(3_000_000);
        let mut image = [0u8; PersistentState::ENCODED_LEN];
        let summary = c.commit(&mut image, None).unwrap();
        assert_eq!(summary.state.boot_count, state.boot_count + 1);
        assert_eq!(summary.state.saved_time(), Some(START.offset_by(3_000_000)));
        assert_eq!(summary.state.last_sync_boot_count, state.last_sync_boot_count);

        // The following wake picks up from this record, not the one before it
        clock.deep_sleep(summary.sleep_us, TRUE_DRIFT);
        let next = Controller::boot(
            Some(&image),
            backend(&card),
            clock.clone(),
            ClockConfig::default(),
        );
        assert_eq!(next.state().boot_count, state.boot_count + 2);
        assert!(next.state().cumulative_compensation_us > 0);
        assert!(clock.error_us().unwrap().abs() < 5_000);
    }

    #[test]
    fn test_commit_without_storage_still_writes_record() {
        let clock = MockClock::power_on(START);
        let mut clock_handle = clock.clone();
        clock_handle.set(START);
        let c = Controller::boot(None, Backend::unavailable(), clock, ClockConfig::default());

        let mut image = [0u8; PersistentState::ENCODED_LEN];
        let summary = c.commit(&mut image, Some(&[1u8, 2, 3][..])).unwrap();
        assert_eq!(summary.state.frame_buffer_size, 0);
        assert_eq!(PersistentState::decode(&image).unwrap(), summary.state);
        // 10 s into the minute with the default 5 s estimate
        assert_eq!(summary.sleep_us, 45_000_000);
    }

    #[test]
    fn test_commit_without_time_uses_fallback() {
        let c = Controller::boot(
            None,
            Backend::unavailable(),
            MockClock::power_on(START),
            ClockConfig::default(),
        );
        let mut image = [0u8; PersistentState::ENCODED_LEN];
        let summary = c.commit(&mut image, None).unwrap();
        assert_eq!(summary.sleep_us, 60_000_000);
        assert_eq!(summary.state.saved_time(), None);
    }

    #[test]
    fn test_record_upload_and_log_line() {
        let card = RamMedium::new();
        let clock = MockClock::power_on(START);
        let mut c = Controller::boot(None, backend(&card), clock.clone(), ClockConfig::default());
        let mut server = MockNtpServer::new(clock.clone());
        let mut sensor = MockSensor::new(readings());
        block_on(c.run_workers(&mut server, &mut sensor));

        let line = c.log_line().unwrap();
        assert!(line.contains("\"co2\":700"));
        assert!(line.contains("\"rtc_drift_ms\":"));

        c.record_upload(1_767_225_600);
        assert_eq!(c.state().last_uploaded_timestamp, 1_767_225_600);
        assert_eq!(card.contents(LAST_UPLOAD_KEY).unwrap(), b"1767225600\n");
    }

    #[test]
    fn test_sensor_log_rolls_daily_and_prunes() {
        let card = RamMedium::new();
        // 2026-01-31T14:59:50Z, 23:59:50 local
        let clock = MockClock::power_on(Timestamp::new(1_769_871_590, 0));
        let mut stale = backend(&card);
        stale.save("20251231.LOG", b"old\n").unwrap();
        stale.save("20260101.LOG", b"kept\n").unwrap();

        let mut c = Controller::boot(None, backend(&card), clock.clone(), ClockConfig::default());
        let mut server = MockNtpServer::new(clock.clone());
        let mut sensor = MockSensor::new(readings());
        block_on(c.run_workers(&mut server, &mut sensor));
        assert_eq!(c.append_sensor_log(), Ok(true));
        assert_eq!(c.append_sensor_log(), Ok(true));

        let today = card.contents("20260131.LOG").unwrap();
        assert_eq!(today.iter().filter(|&&b| b == b'\n').count(), 2);
        assert!(!card.contains("20251231.LOG"));
        assert!(card.contains("20260101.LOG"));

        // Twenty seconds later it is the next local day
        clock.advance(20_000_000);
        assert_eq!(c.append_sensor_log(), Ok(true));
        assert!(card.contains("20260201.LOG"));
        assert!(!card.contains("20260101.LOG"));
    }

    #[test]
    fn test_sensor_log_needs_reading() {
        let card = RamMedium::new();
        let clock = MockClock::power_on(START);
        let mut c = Controller::boot(None, backend(&card), clock.clone(), ClockConfig::default());
        assert_eq!(c.append_sensor_log(), Ok(false));
        assert!(card.contents("20260101.LOG").is_none());
    }

    #[test]
    fn test_needs_redraw() {
        let clock = MockClock::power_on(START);
        let card = RamMedium::new();
        let c = boot_with(&synced_record(START, 16, 1), &clock, &card);
        assert!(!c.needs_redraw(16));
        assert!(c.needs_redraw(17));
    }
}
