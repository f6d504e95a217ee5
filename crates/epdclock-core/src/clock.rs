//! Wall-clock time representation and the clock seam
//!
//! All arithmetic on time is done in signed microseconds so that drift
//! corrections and NTP offsets (which may be negative) compose without
//! special cases.

/// Seconds between the NTP era 0 epoch (1900-01-01) and the Unix epoch.
pub const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// 2020-01-01T00:00:00Z. Anything earlier is treated as "time not set".
pub const MIN_PLAUSIBLE_UNIX: u64 = 1_577_836_800;

const MICROS_PER_SEC: i64 = 1_000_000;

/// Unix time with microsecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp {
    pub secs: u64,
    pub micros: u32,
}

impl Timestamp {
    pub const fn new(secs: u64, micros: u32) -> Self {
        Self { secs, micros }
    }

    /// Total microseconds since the Unix epoch.
    pub const fn as_micros(&self) -> i64 {
        self.secs as i64 * MICROS_PER_SEC + self.micros as i64
    }

    /// Build a timestamp from signed microseconds. Negative values clamp to the epoch.
    pub const fn from_micros(us: i64) -> Self {
        if us <= 0 {
            return Self { secs: 0, micros: 0 };
        }
        Self {
            secs: (us / MICROS_PER_SEC) as u64,
            micros: (us % MICROS_PER_SEC) as u32,
        }
    }

    pub const fn offset_by(&self, delta_us: i64) -> Self {
        Self::from_micros(self.as_micros() + delta_us)
    }

    /// Signed difference `self - earlier` in microseconds.
    pub const fn micros_since(&self, earlier: &Timestamp) -> i64 {
        self.as_micros() - earlier.as_micros()
    }

    pub const fn is_plausible(&self) -> bool {
        self.secs >= MIN_PLAUSIBLE_UNIX
    }

    /// Convert an NTP seconds/fraction pair.
    ///
    /// Seconds are taken modulo 2^32 relative to the Unix epoch, so era 1
    /// values (February 2036 onwards) map forward instead of before 1970.
    pub fn from_ntp(ntp_secs: u32, ntp_frac: u32) -> Self {
        let secs = ntp_secs.wrapping_sub(NTP_UNIX_OFFSET as u32) as u64;
        let micros = ((ntp_frac as u64 * 1_000_000) >> 32) as u32;
        Self { secs, micros }
    }

    /// Convert to an NTP seconds/fraction pair, wrapping into the current era.
    ///
    /// The fraction is rounded up so that `from_ntp(to_ntp(t)) == t`.
    pub fn to_ntp(&self) -> (u32, u32) {
        let secs = self.secs.wrapping_add(NTP_UNIX_OFFSET) as u32;
        let frac = (((self.micros as u64) << 32) + 999_999) / 1_000_000;
        (secs, frac as u32)
    }

    fn local_secs(&self, utc_offset_secs: i32) -> u64 {
        (self.secs as i64 + utc_offset_secs as i64).max(0) as u64
    }

    /// Minute of the hour in the given fixed UTC offset.
    pub fn local_minute(&self, utc_offset_secs: i32) -> u8 {
        ((self.local_secs(utc_offset_secs) / 60) % 60) as u8
    }

    /// `(hour, minute, second)` in the given fixed UTC offset.
    pub fn local_hms(&self, utc_offset_secs: i32) -> (u8, u8, u8) {
        let day_secs = self.local_secs(utc_offset_secs) % 86_400;
        (
            (day_secs / 3600) as u8,
            ((day_secs / 60) % 60) as u8,
            (day_secs % 60) as u8,
        )
    }

    /// `(year, month, day)` in the given fixed UTC offset.
    pub fn local_date(&self, utc_offset_secs: i32) -> (u16, u8, u8) {
        civil_from_days((self.local_secs(utc_offset_secs) / 86_400) as i64)
    }

    /// Microseconds left until the next whole minute.
    pub fn micros_to_next_minute(&self) -> u64 {
        let into_minute = (self.secs % 60) * 1_000_000 + self.micros as u64;
        60_000_000 - into_minute
    }
}

/// Days since 1970-01-01 to a proleptic Gregorian date (Hinnant's algorithm).
fn civil_from_days(days: i64) -> (u16, u8, u8) {
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u8;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u8;
    let year = yoe as i64 + era * 400 + i64::from(month <= 2);
    (year as u16, month, day)
}

/// Proleptic Gregorian date to days since 1970-01-01, the inverse of `civil_from_days`.
pub fn days_from_civil(year: u16, month: u8, day: u8) -> i64 {
    let y = i64::from(year) - i64::from(month <= 2);
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let m = i64::from(month);
    let mp = if m > 2 { m - 3 } else { m + 9 };
    let doy = (153 * mp + 2) / 5 + i64::from(day) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// The device's system clock.
///
/// `now` returns `None` while wall-clock time is unknown (never set since
/// power-up, or set to something implausible). `uptime_us` is monotonic time
/// since this wake and keeps running regardless.
pub trait Clock {
    fn now(&self) -> Option<Timestamp>;

    fn set(&mut self, time: Timestamp);

    fn uptime_us(&self) -> u64;
}
