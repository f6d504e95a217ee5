//! System clock for the ESP32-S3
//!
//! Wall time is kept as an offset over the embassy time base, which starts
//! at zero on every boot. Until `set` is called the wall time is unknown.

use embassy_time::Instant;
use epdclock_core::clock::{Clock, Timestamp};

pub struct SystemClock {
    /// Wall time in microseconds at uptime zero; `None` until set.
    epoch_at_boot_us: Option<i64>,
}

impl SystemClock {
    pub const fn new() -> Self {
        Self {
            epoch_at_boot_us: None,
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Option<Timestamp> {
        let base = self.epoch_at_boot_us?;
        let now = Timestamp::from_micros(base + self.uptime_us() as i64);
        now.is_plausible().then_some(now)
    }

    fn set(&mut self, time: Timestamp) {
        self.epoch_at_boot_us = Some(time.as_micros() - self.uptime_us() as i64);
    }

    fn uptime_us(&self) -> u64 {
        Instant::now().as_micros()
    }
}
