//! Wake scheduling
//!
//! The device should come up just early enough that, after its boot work,
//! the display flips at the minute boundary. The lead time is an estimate of
//! that boot work, refined from what each wake actually measured.

use log::debug;

use crate::clock::Timestamp;
use crate::config::ScheduleConfig;
use crate::persistent_state::MINUTE_NEVER;

/// Weight of a new measurement in the processing-time estimate.
const PROCESSING_NEW_WEIGHT: f32 = 0.3;
const PROCESSING_MIN_S: f32 = 1.0;
const PROCESSING_MAX_S: f32 = 20.0;

/// The minute to draw and how long to wait before drawing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayTarget {
    pub minute: u8,
    /// Non-zero when the device woke before the boundary it is meant to show.
    pub wait_us: u64,
}

pub struct SleepScheduler<'a> {
    config: &'a ScheduleConfig,
}

impl<'a> SleepScheduler<'a> {
    pub fn new(config: &'a ScheduleConfig) -> Self {
        Self { config }
    }

    /// Microseconds to sleep so the next wake lands `estimated_processing_s` before the boundary.
    pub fn compute_sleep_duration(
        &self,
        now: Option<Timestamp>,
        estimated_processing_s: f32,
    ) -> u64 {
        let Some(now) = now else {
            debug!("Scheduler: no valid time, fixed interval");
            return self.config.fallback_sleep_s * 1_000_000;
        };
        let to_boundary_ms = (now.micros_to_next_minute() / 1000) as i64;
        let lead_ms = (estimated_processing_s * 1000.0) as i64;
        let ms = (to_boundary_ms - lead_ms).max(self.config.min_sleep_ms as i64);
        ms as u64 * 1000
    }

    /// Blend a measured boot-to-display latency into the estimate.
    pub fn update_processing_estimate(current_s: f32, measured_s: f32) -> f32 {
        let blended =
            (1.0 - PROCESSING_NEW_WEIGHT) * current_s + PROCESSING_NEW_WEIGHT * measured_s;
        blended.clamp(PROCESSING_MIN_S, PROCESSING_MAX_S)
    }

    /// Which minute this wake should draw.
    ///
    /// Waking inside the lead window means the current minute is already on
    /// screen; the wake is for the next one, after the boundary passes.
    pub fn display_target(
        now: Timestamp,
        last_displayed: u8,
        utc_offset_secs: i32,
    ) -> DisplayTarget {
        let minute = now.local_minute(utc_offset_secs);
        if last_displayed != MINUTE_NEVER && minute == last_displayed {
            DisplayTarget {
                minute: (minute + 1) % 60,
                wait_us: now.micros_to_next_minute(),
            }
        } else {
            DisplayTarget { minute, wait_us: 0 }
        }
    }
}
