//! Runtime configuration
//!
//! Defaults are compiled in. A postcard-encoded override may be placed on the
//! storage medium under [`CONFIG_KEY`]; it is read once per wake.

use heapless::{String, Vec};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::storage::{CONFIG_KEY, StorageBackend, StorageError, StorageMedium};

pub const MAX_SERVERS: usize = 4;
pub const SERVER_NAME_LEN: usize = 48;

/// Largest accepted encoded config blob.
const CONFIG_BLOB_MAX: usize = 512;

pub type ServerName = String<SERVER_NAME_LEN>;

/// Longest accepted fallback sleep, one day.
const MAX_FALLBACK_SLEEP_S: u64 = 86_400;
/// Longest accepted worker budget, ten minutes.
const MAX_WORKER_TIMEOUT_MS: u64 = 600_000;
const MAX_SERVER_TIMEOUT_MS: u64 = 60_000;
const MAX_UTC_OFFSET_SECS: i32 = 14 * 3600;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("config field out of range: {0}")]
    OutOfRange(&'static str),
    #[error("config field not a finite number: {0}")]
    NotFinite(&'static str),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClockConfig {
    /// Fixed offset of the displayed local time from UTC.
    pub utc_offset_secs: i32,
    /// Upper bound for the concurrent network and sensor workers.
    pub worker_timeout_ms: u64,
    pub sync: SyncConfig,
    pub drift: DriftConfig,
    pub schedule: ScheduleConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Tried in order; the first good answer wins.
    pub servers: Vec<ServerName, MAX_SERVERS>,
    pub port: u16,
    /// Covers DNS, send and receive for one server.
    pub per_server_timeout_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DriftConfig {
    pub default_rate_ms_per_min: f32,
    pub min_rate_ms_per_min: f32,
    pub max_rate_ms_per_min: f32,
    /// Weight given to a fresh measurement when blending.
    pub new_sample_weight: f32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScheduleConfig {
    /// Displayed minute at which a full sync and recalibration happens.
    pub sync_minute: u8,
    /// Displayed minute at which the offset is only measured.
    pub measure_minute: Option<u8>,
    /// Force a sync after this many wakes without one.
    pub max_boots_between_syncs: u32,
    pub min_sleep_ms: u64,
    pub fallback_sleep_s: u64,
    pub default_processing_s: f32,
}

fn server_name(name: &str) -> ServerName {
    let mut s = ServerName::new();
    for c in name.chars() {
        if s.push(c).is_err() {
            break;
        }
    }
    s
}

impl Default for SyncConfig {
    fn default() -> Self {
        let mut servers = Vec::new();
        for name in ["ntp.nict.jp", "time.google.com", "pool.ntp.org"] {
            let _ = servers.push(server_name(name));
        }
        Self {
            servers,
            port: 123,
            per_server_timeout_ms: 2_000,
        }
    }
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            // Typical for the internal RTC oscillator at room temperature.
            default_rate_ms_per_min: 28.0,
            min_rate_ms_per_min: 20.0,
            max_rate_ms_per_min: 300.0,
            new_sample_weight: 0.6,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            sync_minute: 0,
            measure_minute: Some(30),
            max_boots_between_syncs: 120,
            min_sleep_ms: 1_000,
            fallback_sleep_s: 60,
            default_processing_s: 5.0,
        }
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            utc_offset_secs: 9 * 3600,
            worker_timeout_ms: 30_000,
            sync: SyncConfig::default(),
            drift: DriftConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

fn check(ok: bool, field: &'static str) -> Result<(), ConfigError> {
    if ok { Ok(()) } else { Err(ConfigError::OutOfRange(field)) }
}

fn finite(value: f32, field: &'static str) -> Result<f32, ConfigError> {
    if value.is_finite() { Ok(value) } else { Err(ConfigError::NotFinite(field)) }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check(!self.servers.is_empty(), "sync.servers")?;
        check(self.port != 0, "sync.port")?;
        check(
            (1..=MAX_SERVER_TIMEOUT_MS).contains(&self.per_server_timeout_ms),
            "sync.per_server_timeout_ms",
        )
    }
}

impl DriftConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let min = finite(self.min_rate_ms_per_min, "drift.min_rate_ms_per_min")?;
        let max = finite(self.max_rate_ms_per_min, "drift.max_rate_ms_per_min")?;
        let default = finite(self.default_rate_ms_per_min, "drift.default_rate_ms_per_min")?;
        let weight = finite(self.new_sample_weight, "drift.new_sample_weight")?;
        check(min <= max, "drift.min_rate_ms_per_min")?;
        check((min..=max).contains(&default), "drift.default_rate_ms_per_min")?;
        check((0.0..=1.0).contains(&weight), "drift.new_sample_weight")
    }
}

impl ScheduleConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check(self.sync_minute < 60, "schedule.sync_minute")?;
        check(
            self.measure_minute.is_none_or(|m| m < 60 && m != self.sync_minute),
            "schedule.measure_minute",
        )?;
        check(self.max_boots_between_syncs > 0, "schedule.max_boots_between_syncs")?;
        check(self.min_sleep_ms <= 60_000, "schedule.min_sleep_ms")?;
        check(
            (1..=MAX_FALLBACK_SLEEP_S).contains(&self.fallback_sleep_s),
            "schedule.fallback_sleep_s",
        )?;
        let processing = finite(self.default_processing_s, "schedule.default_processing_s")?;
        check(processing > 0.0, "schedule.default_processing_s")
    }
}

impl ClockConfig {
    /// Reject values that would panic or overflow on the wake path.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check(
            self.utc_offset_secs.abs() <= MAX_UTC_OFFSET_SECS,
            "utc_offset_secs",
        )?;
        check(
            (1..=MAX_WORKER_TIMEOUT_MS).contains(&self.worker_timeout_ms),
            "worker_timeout_ms",
        )?;
        self.sync.validate()?;
        self.drift.validate()?;
        self.schedule.validate()
    }

    /// Read the override blob, falling back to defaults when it is missing,
    /// unreadable or out of range.
    pub fn load<P, D>(storage: &mut StorageBackend<P, D>) -> Self
    where
        P: StorageMedium,
        D: StorageMedium,
    {
        let mut buf = [0u8; CONFIG_BLOB_MAX];
        match storage.load(CONFIG_KEY, &mut buf) {
            Ok(len) => match postcard::from_bytes::<ClockConfig>(&buf[..len]) {
                Ok(config) => match config.validate() {
                    Ok(()) => {
                        info!("Loaded config override ({} bytes)", len);
                        config
                    }
                    Err(e) => {
                        warn!("Config override rejected ({}), using defaults", e);
                        Self::default()
                    }
                },
                Err(e) => {
                    warn!("Config override unreadable ({:?}), using defaults", e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn store<P, D>(&self, storage: &mut StorageBackend<P, D>) -> Result<(), StorageError>
    where
        P: StorageMedium,
        D: StorageMedium,
    {
        let bytes = postcard::to_allocvec(self).map_err(|_| StorageError::Encode)?;
        storage.save(CONFIG_KEY, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Timestamp;
    use crate::drift::{DriftCompensator, SyncObservation};
    use crate::mock::RamMedium;
    use crate::persistent_state::PersistentState;

    #[test]
    fn test_defaults() {
        let config = ClockConfig::default();
        assert_eq!(config.sync.servers.len(), 3);
        assert_eq!(config.sync.servers[0].as_str(), "ntp.nict.jp");
        assert_eq!(config.drift.default_rate_ms_per_min, 28.0);
        assert_eq!(config.schedule.sync_minute, 0);
    }

    #[test]
    fn test_store_then_load_override() {
        let mut storage = StorageBackend::<RamMedium, RamMedium>::select(Ok(RamMedium::new()), || {
            Err(StorageError::Unavailable)
        });
        let mut config = ClockConfig::default();
        config.utc_offset_secs = 0;
        config.schedule.measure_minute = None;
        config.store(&mut storage).unwrap();

        assert_eq!(ClockConfig::load(&mut storage), config);
    }

    #[test]
    fn test_defaults_validate() {
        assert_eq!(ClockConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_bad_drift_band() {
        let mut config = ClockConfig::default();
        config.drift.min_rate_ms_per_min = 300.0;
        config.drift.max_rate_ms_per_min = 20.0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::OutOfRange("drift.min_rate_ms_per_min"))
        );

        let mut config = ClockConfig::default();
        config.drift.max_rate_ms_per_min = f32::NAN;
        assert_eq!(
            config.validate(),
            Err(ConfigError::NotFinite("drift.max_rate_ms_per_min"))
        );

        let mut config = ClockConfig::default();
        config.drift.new_sample_weight = 1.5;
        assert_eq!(
            config.validate(),
            Err(ConfigError::OutOfRange("drift.new_sample_weight"))
        );
    }

    #[test]
    fn test_validate_rejects_overflowing_durations() {
        let mut config = ClockConfig::default();
        config.schedule.fallback_sleep_s = u64::MAX;
        assert_eq!(
            config.validate(),
            Err(ConfigError::OutOfRange("schedule.fallback_sleep_s"))
        );

        let mut config = ClockConfig::default();
        config.worker_timeout_ms = u64::MAX;
        assert_eq!(config.validate(), Err(ConfigError::OutOfRange("worker_timeout_ms")));

        let mut config = ClockConfig::default();
        config.schedule.sync_minute = 60;
        assert_eq!(
            config.validate(),
            Err(ConfigError::OutOfRange("schedule.sync_minute"))
        );
    }

    #[test]
    fn test_out_of_range_override_falls_back_to_defaults() {
        let mut storage = StorageBackend::<RamMedium, RamMedium>::select(Ok(RamMedium::new()), || {
            Err(StorageError::Unavailable)
        });
        let mut config = ClockConfig::default();
        config.drift.min_rate_ms_per_min = 300.0;
        config.drift.max_rate_ms_per_min = 20.0;
        config.store(&mut storage).unwrap();

        let loaded = ClockConfig::load(&mut storage);
        assert_eq!(loaded, ClockConfig::default());
        // Recalibrating against the fallback band clamps instead of panicking
        let mut state = PersistentState::fresh();
        state.last_sync_timestamp = 1_700_000_000;
        let result = DriftCompensator::new(&loaded.drift).recalibrate(
            &mut state,
            SyncObservation {
                synced: Timestamp::new(1_700_003_600, 0),
                pre_sync_local: Some(Timestamp::new(1_700_003_599, 0)),
                sync_wait_us: 0,
            },
            &mut storage,
        );
        assert!(result.clamped);
        assert_eq!(result.clamped_rate, Some(20.0));
    }

    #[test]
    fn test_garbage_blob_falls_back_to_defaults() {
        let mut storage = StorageBackend::<RamMedium, RamMedium>::select(Ok(RamMedium::new()), || {
            Err(StorageError::Unavailable)
        });
        storage.save(CONFIG_KEY, &[0xFF; 3]).unwrap();
        assert_eq!(ClockConfig::load(&mut storage), ClockConfig::default());
    }
}
