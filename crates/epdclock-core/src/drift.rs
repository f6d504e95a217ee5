//! Oscillator drift model
//!
//! The low-power oscillator that times deep sleep runs slow by a roughly
//! constant number of milliseconds per minute. On every wake the restored
//! time is pushed forward by `sleep minutes x rate`, and the compensation
//! applied since the last sync is accumulated. At a sync, the accumulated
//! compensation plus the residual error observed at that sync gives the true
//! drift over the interval, from which the rate is re-estimated.

use log::{debug, info, warn};

use crate::clock::{MIN_PLAUSIBLE_UNIX, Timestamp};
use crate::config::DriftConfig;
use crate::persistent_state::PersistentState;
use crate::storage::{DRIFT_RATE_KEY, Rate, ScalarStore};

/// Time reconstructed on a warm wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Restored {
    pub time: Timestamp,
    /// Drift compensation included in `time`.
    pub compensation_us: i64,
}

/// What a full sync observed about the local clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncObservation {
    /// Time committed to the clock.
    pub synced: Timestamp,
    /// Local time just before the sync started, if the clock was set.
    pub pre_sync_local: Option<Timestamp>,
    /// Wall time spent between capturing `pre_sync_local` and committing.
    pub sync_wait_us: u64,
}

/// Outcome of a recalibration attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Recalibration {
    pub residual_us: Option<i64>,
    /// Rate measured over the interval, before clamping.
    pub measured_rate: Option<f32>,
    /// Measured rate after clamping to the plausible band.
    pub clamped_rate: Option<f32>,
    pub clamped: bool,
    pub previous_rate: f32,
    pub new_rate: f32,
}

pub struct DriftCompensator<'a> {
    config: &'a DriftConfig,
}

impl<'a> DriftCompensator<'a> {
    pub fn new(config: &'a DriftConfig) -> Self {
        Self { config }
    }

    /// Compensation for a sleep of `sleep_us` at `rate_ms_per_min`.
    pub fn compensation_us(sleep_us: u64, rate_ms_per_min: f32) -> i64 {
        // ms per minute is the same ratio as us per 60_000 us
        let us = sleep_us as f64 * rate_ms_per_min as f64 / 60_000.0;
        if us >= 0.0 {
            (us + 0.5) as i64
        } else {
            (us - 0.5) as i64
        }
    }

    /// Reconstruct the current time from the saved record. Pure: does not touch `state`.
    pub fn restore(&self, state: &PersistentState, uptime_us: u64) -> Option<Restored> {
        let saved = state.saved_time()?;
        let compensation_us = Self::compensation_us(
            state.sleep_duration_requested_us,
            state.drift_rate_ms_per_min,
        );
        let elapsed = state.sleep_duration_requested_us as i64 + uptime_us as i64;
        Some(Restored {
            time: saved.offset_by(elapsed + compensation_us),
            compensation_us,
        })
    }

    /// Record that `restored` was applied to the clock.
    pub fn apply_restore(&self, state: &mut PersistentState, restored: &Restored) {
        state.cumulative_compensation_us += restored.compensation_us;
        debug!(
            "Drift: compensated {} us, {} us since last sync",
            restored.compensation_us, state.cumulative_compensation_us
        );
    }

    fn clamp(&self, rate: f32) -> (f32, bool) {
        // Not f32::clamp, which panics when min > max.
        let clamped = rate
            .max(self.config.min_rate_ms_per_min)
            .min(self.config.max_rate_ms_per_min);
        (clamped, clamped != rate)
    }

    /// Update the model after a successful full sync.
    pub fn recalibrate<S: ScalarStore>(
        &self,
        state: &mut PersistentState,
        observation: SyncObservation,
        store: &mut S,
    ) -> Recalibration {
        let previous_sync = state.last_sync_timestamp;
        state.last_sync_boot_count = state.boot_count;
        state.last_sync_timestamp = observation.synced.secs;

        let previous_rate = state.drift_rate_ms_per_min;
        let mut result = Recalibration {
            residual_us: None,
            measured_rate: None,
            clamped_rate: None,
            clamped: false,
            previous_rate,
            new_rate: previous_rate,
        };

        match observation.pre_sync_local.filter(Timestamp::is_plausible) {
            Some(local) => {
                let residual = observation.synced.micros_since(&local)
                    - observation.sync_wait_us as i64;
                state.last_drift_residual_us = residual;
                state.last_drift_valid = true;
                result.residual_us = Some(residual);
                info!("Drift: residual {} us at sync", residual);

                let minutes = observation.synced.secs.saturating_sub(previous_sync) as f32 / 60.0;
                if previous_sync >= MIN_PLAUSIBLE_UNIX && minutes >= 1.0 {
                    let true_drift_ms =
                        (residual + state.cumulative_compensation_us) as f32 / 1000.0;
                    let measured = true_drift_ms / minutes;
                    let (clamped, was_clamped) = self.clamp(measured);
                    if was_clamped {
                        warn!(
                            "Drift: measured {} ms/min outside band, clamped to {}",
                            measured, clamped
                        );
                    }

                    let new_rate = if state.drift_rate_calibrated {
                        let w = self.config.new_sample_weight;
                        (1.0 - w) * previous_rate + w * clamped
                    } else {
                        clamped
                    };
                    state.drift_rate_ms_per_min = new_rate;
                    state.drift_rate_calibrated = true;

                    result.measured_rate = Some(measured);
                    result.clamped_rate = Some(clamped);
                    result.clamped = was_clamped;
                    result.new_rate = new_rate;
                    info!(
                        "Drift: rate {} -> {} ms/min over {} min",
                        previous_rate, new_rate, minutes
                    );

                    if let Err(e) = store.save_scalar(DRIFT_RATE_KEY, &Rate(new_rate)) {
                        warn!("Drift: rate not persisted: {}", e);
                    }
                }
            }
            None => {
                state.last_drift_residual_us = 0;
                state.last_drift_valid = false;
            }
        }

        if !state.drift_rate_calibrated {
            // First sync ever: nothing to measure against yet, keep the current rate as the seed.
            state.drift_rate_calibrated = true;
            info!("Drift: model anchored at {} ms/min", state.drift_rate_ms_per_min);
        }

        state.cumulative_compensation_us = 0;
        result
    }

    /// Record a measure-only check. The rate and accumulated compensation are left alone.
    pub fn record_measurement(&self, state: &mut PersistentState, offset_us: i64) {
        state.last_drift_residual_us = offset_us;
        state.last_drift_valid = true;
        info!("Drift: measure-only offset {} us", offset_us);
    }
}
