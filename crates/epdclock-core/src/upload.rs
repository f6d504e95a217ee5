//! Sensor log files, lines and upload batching
//!
//! Each wake appends one JSON object per line to the log file of its local
//! day, `YYYYMMDD.LOG`. Files older than [`LOG_RETENTION_DAYS`] are deleted.
//! Uploads send every line newer than the last uploaded reading, oldest
//! first, in batches bounded by [`MAX_READINGS_PER_UPLOAD`]. Only the
//! `"unixtimestamp"` field is ever parsed back.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;

use log::{info, warn};

use crate::clock::{Timestamp, days_from_civil};
use crate::sensors::EnvironmentReadings;
use crate::storage::{StorageBackend, StorageError, StorageMedium};

pub const MAX_READINGS_PER_UPLOAD: usize = 120;

pub const LOG_RETENTION_DAYS: i64 = 30;

const LOG_EXTENSION: &str = ".LOG";

/// An 8.3 log file name.
pub type LogKey = heapless::String<12>;

/// Days since 1970-01-01 of the local date of `time`.
pub fn local_day(time: Timestamp, utc_offset_secs: i32) -> i64 {
    let (year, month, day) = time.local_date(utc_offset_secs);
    days_from_civil(year, month, day)
}

/// Log file for the local day of `time`.
pub fn log_key(time: Timestamp, utc_offset_secs: i32) -> LogKey {
    let (year, month, day) = time.local_date(utc_offset_secs);
    let mut key = LogKey::new();
    let _ = write!(key, "{:04}{:02}{:02}{}", year, month, day, LOG_EXTENSION);
    key
}

/// The day a log file name stands for, `None` for any other file.
pub fn log_key_day(name: &str) -> Option<i64> {
    let stem = name.strip_suffix(LOG_EXTENSION)?;
    if stem.len() != 8 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year: u16 = stem[..4].parse().ok()?;
    let month: u8 = stem[4..6].parse().ok()?;
    let day: u8 = stem[6..].parse().ok()?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    Some(days_from_civil(year, month, day))
}

/// Log files that may hold readings newer than `last_uploaded`, oldest first.
pub fn pending_logs(names: &[String], last_uploaded: u64, utc_offset_secs: i32) -> Vec<&str> {
    let first_day = local_day(Timestamp::new(last_uploaded, 0), utc_offset_secs);
    let mut pending: Vec<(i64, &str)> = names
        .iter()
        .filter_map(|name| Some((log_key_day(name)?, name.as_str())))
        .filter(|(day, _)| *day >= first_day)
        .collect();
    pending.sort_unstable();
    pending.into_iter().map(|(_, name)| name).collect()
}

/// Delete log files dated more than `retention_days` before `today`.
/// Returns how many were removed.
pub fn prune_logs<P, D>(
    storage: &mut StorageBackend<P, D>,
    today: i64,
    retention_days: i64,
) -> Result<usize, StorageError>
where
    P: StorageMedium,
    D: StorageMedium,
{
    let cutoff = today - retention_days;
    let mut removed = 0;
    for name in storage.list()? {
        let Some(day) = log_key_day(&name) else {
            continue;
        };
        if day >= cutoff {
            continue;
        }
        match storage.remove(&name) {
            Ok(()) => {
                info!("Sensor log: deleted old file {}", name);
                removed += 1;
            }
            Err(e) => warn!("Sensor log: could not delete {} ({})", name, e),
        }
    }
    if removed > 0 {
        info!(
            "Sensor log: deleted {} files older than {} days",
            removed, retention_days
        );
    }
    Ok(removed)
}

const TIMESTAMP_FIELD: &str = "\"unixtimestamp\"";

/// Format one log line (with trailing newline).
///
/// `rtc_drift_ms` is included only on wakes that measured drift.
pub fn format_log_line(
    time: Timestamp,
    utc_offset_secs: i32,
    readings: &EnvironmentReadings,
    rtc_drift_ms: Option<i32>,
) -> String {
    let (year, month, day) = time.local_date(utc_offset_secs);
    let (hour, minute, second) = time.local_hms(utc_offset_secs);
    let mut line = String::new();
    let _ = write!(
        line,
        "{{\"date\":\"{:04}.{:02}.{:02}\",\"time\":\"{:02}:{:02}:{:02}\",\"unixtimestamp\":{}",
        year, month, day, hour, minute, second, time.secs
    );
    if let Some(drift) = rtc_drift_ms {
        let _ = write!(line, ",\"rtc_drift_ms\":{}", drift);
    }
    let _ = writeln!(
        line,
        ",\"temp\":{:.1},\"humidity\":{:.1},\"co2\":{}}}",
        readings.temperature_c, readings.humidity_pct, readings.co2_ppm
    );
    line
}

/// Extract the `"unixtimestamp"` value of one log line.
pub fn line_timestamp(line: &str) -> Option<u64> {
    let start = line.find(TIMESTAMP_FIELD)? + TIMESTAMP_FIELD.len();
    let rest = line[start..].trim_start().strip_prefix(':')?.trim_start();
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// Readings not yet uploaded, as a JSON array payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsentBatch {
    pub payload: String,
    pub count: usize,
    /// Newest reading in the batch; becomes the last-uploaded mark once the upload succeeds.
    pub latest_timestamp: Option<u64>,
}

/// Collect up to `max_readings` lines newer than `last_uploaded`.
pub fn collect_unsent(log: &str, last_uploaded: u64, max_readings: usize) -> UnsentBatch {
    let mut payload = String::from("[");
    let mut count = 0;
    let mut latest = None;

    for line in log.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if count >= max_readings {
            break;
        }
        let Some(ts) = line_timestamp(line) else {
            continue;
        };
        if ts <= last_uploaded {
            continue;
        }
        if count > 0 {
            payload.push(',');
        }
        payload.push_str(line);
        count += 1;
        latest = Some(latest.map_or(ts, |l: u64| l.max(ts)));
    }
    payload.push(']');

    UnsentBatch {
        payload,
        count,
        latest_timestamp: latest,
    }
}
