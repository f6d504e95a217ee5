//! The record that survives deep sleep
//!
//! The device keeps exactly one [`PersistentState`] in memory that stays
//! powered while the rest of the chip is off. Everything else is lost on each
//! power-down, so the record carries the clock, the drift model and the
//! bookkeeping needed to decide what the next wake has to do.
//!
//! The in-memory image is a fixed little-endian layout with the validity
//! marker first. A new layout must use a new marker value so that an image
//! written by older firmware reads as invalid and triggers a clean reset.

use log::{info, warn};
use thiserror_no_std::Error;

use crate::clock::Timestamp;

/// Validity marker for the current layout.
pub const STATE_MARKER: u32 = 0xE9DC_0003;

/// `last_displayed_minute` value meaning "nothing drawn yet".
pub const MINUTE_NEVER: u8 = 255;

pub const DEFAULT_DRIFT_RATE_MS_PER_MIN: f32 = 28.0;
pub const DEFAULT_PROCESSING_TIME_S: f32 = 5.0;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    #[error("state image too short: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
    #[error("state image marker mismatch: {0:#010x}")]
    InvalidMarker(u32),
    #[error("state image field out of range: {0}")]
    Corrupt(&'static str),
}

/// How this wake started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootKind {
    /// No valid record: everything was reset to defaults.
    FirstBoot,
    /// A valid record from the previous cycle was found.
    WarmWake,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistentState {
    pub boot_count: u32,
    pub last_displayed_minute: u8,
    pub sensor_initialized: bool,
    /// Boot count of the last successful sync, 0 when never synced.
    pub last_sync_boot_count: u32,
    /// Unix seconds of the last successful sync, 0 when never synced.
    pub last_sync_timestamp: u64,
    /// Drift observed by the most recent sync or measure-only check.
    pub last_drift_residual_us: i64,
    pub last_drift_valid: bool,
    pub saved_time_secs: u64,
    pub saved_time_micros: u32,
    pub sleep_duration_requested_us: u64,
    pub drift_rate_ms_per_min: f32,
    pub drift_rate_calibrated: bool,
    /// Compensation applied since the last sync.
    pub cumulative_compensation_us: i64,
    pub estimated_processing_time_s: f32,
    /// Recorded size of the persisted frame buffer, 0 when none.
    pub frame_buffer_size: u32,
    pub last_uploaded_timestamp: u64,
}

impl Default for PersistentState {
    fn default() -> Self {
        Self::fresh()
    }
}

/// Bounds-checked little-endian cursor.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], StateError> {
        let end = self.pos + N;
        let slice = self.bytes.get(self.pos..end).ok_or(StateError::Truncated {
            needed: PersistentState::ENCODED_LEN,
            got: self.bytes.len(),
        })?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, StateError> {
        Ok(self.take::<1>()?[0])
    }

    fn bool(&mut self, field: &'static str) -> Result<bool, StateError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(StateError::Corrupt(field)),
        }
    }

    fn u32(&mut self) -> Result<u32, StateError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn u64(&mut self) -> Result<u64, StateError> {
        Ok(u64::from_le_bytes(self.take()?))
    }

    fn i64(&mut self) -> Result<i64, StateError> {
        Ok(i64::from_le_bytes(self.take()?))
    }

    fn f32(&mut self, field: &'static str) -> Result<f32, StateError> {
        let value = f32::from_le_bytes(self.take()?);
        if value.is_finite() {
            Ok(value)
        } else {
            Err(StateError::Corrupt(field))
        }
    }
}

struct Writer<'a> {
    out: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn put(&mut self, bytes: &[u8]) {
        self.out[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }
}

impl PersistentState {
    pub const ENCODED_LEN: usize = 80;

    /// The record after a full reset.
    pub const fn fresh() -> Self {
        Self {
            boot_count: 0,
            last_displayed_minute: MINUTE_NEVER,
            sensor_initialized: false,
            last_sync_boot_count: 0,
            last_sync_timestamp: 0,
            last_drift_residual_us: 0,
            last_drift_valid: false,
            saved_time_secs: 0,
            saved_time_micros: 0,
            sleep_duration_requested_us: 0,
            drift_rate_ms_per_min: DEFAULT_DRIFT_RATE_MS_PER_MIN,
            drift_rate_calibrated: false,
            cumulative_compensation_us: 0,
            estimated_processing_time_s: DEFAULT_PROCESSING_TIME_S,
            frame_buffer_size: 0,
            last_uploaded_timestamp: 0,
        }
    }

    /// Validate the image left by the previous cycle, resetting on anything unusable.
    pub fn validate_or_reset(image: Option<&[u8]>) -> (Self, BootKind) {
        let Some(bytes) = image else {
            info!("No persistent state image, starting fresh");
            return (Self::fresh(), BootKind::FirstBoot);
        };
        match Self::decode(bytes) {
            Ok(state) => (state, BootKind::WarmWake),
            Err(StateError::InvalidMarker(marker)) => {
                info!("Persistent state marker {:#010x} invalid, starting fresh", marker);
                (Self::fresh(), BootKind::FirstBoot)
            }
            Err(e) => {
                warn!("Persistent state rejected: {}", e);
                (Self::fresh(), BootKind::FirstBoot)
            }
        }
    }

    /// Count this wake. Called exactly once per wake.
    pub fn begin_wake(&mut self) {
        self.boot_count = self.boot_count.saturating_add(1);
    }

    pub fn never_synced(&self) -> bool {
        self.last_sync_boot_count == 0
    }

    pub fn saved_time(&self) -> Option<Timestamp> {
        if self.saved_time_secs == 0 {
            None
        } else {
            Some(Timestamp::new(self.saved_time_secs, self.saved_time_micros))
        }
    }

    pub fn set_saved_time(&mut self, time: Timestamp) {
        self.saved_time_secs = time.secs;
        self.saved_time_micros = time.micros;
    }

    /// Write the fixed-layout image. Returns the number of bytes written.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, StateError> {
        if out.len() < Self::ENCODED_LEN {
            return Err(StateError::Truncated {
                needed: Self::ENCODED_LEN,
                got: out.len(),
            });
        }
        let mut w = Writer { out, pos: 0 };
        w.put(&STATE_MARKER.to_le_bytes());
        w.put(&self.boot_count.to_le_bytes());
        w.put(&[
            self.last_displayed_minute,
            self.sensor_initialized as u8,
            self.last_drift_valid as u8,
            self.drift_rate_calibrated as u8,
        ]);
        w.put(&self.last_sync_boot_count.to_le_bytes());
        w.put(&self.last_sync_timestamp.to_le_bytes());
        w.put(&self.last_drift_residual_us.to_le_bytes());
        w.put(&self.saved_time_secs.to_le_bytes());
        w.put(&self.saved_time_micros.to_le_bytes());
        w.put(&self.frame_buffer_size.to_le_bytes());
        w.put(&self.sleep_duration_requested_us.to_le_bytes());
        w.put(&self.drift_rate_ms_per_min.to_le_bytes());
        w.put(&self.estimated_processing_time_s.to_le_bytes());
        w.put(&self.cumulative_compensation_us.to_le_bytes());
        w.put(&self.last_uploaded_timestamp.to_le_bytes());
        debug_assert_eq!(w.pos, Self::ENCODED_LEN);
        Ok(w.pos)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StateError> {
        let mut r = Reader { bytes, pos: 0 };
        let marker = r.u32()?;
        if marker != STATE_MARKER {
            return Err(StateError::InvalidMarker(marker));
        }
        let boot_count = r.u32()?;
        let last_displayed_minute = r.u8()?;
        if last_displayed_minute >= 60 && last_displayed_minute != MINUTE_NEVER {
            return Err(StateError::Corrupt("last_displayed_minute"));
        }
        let sensor_initialized = r.bool("sensor_initialized")?;
        let last_drift_valid = r.bool("last_drift_valid")?;
        let drift_rate_calibrated = r.bool("drift_rate_calibrated")?;

        let state = Self {
            boot_count,
            last_displayed_minute,
            sensor_initialized,
            last_drift_valid,
            drift_rate_calibrated,
            last_sync_boot_count: r.u32()?,
            last_sync_timestamp: r.u64()?,
            last_drift_residual_us: r.i64()?,
            saved_time_secs: r.u64()?,
            saved_time_micros: r.u32()?,
            frame_buffer_size: r.u32()?,
            sleep_duration_requested_us: r.u64()?,
            drift_rate_ms_per_min: r.f32("drift_rate_ms_per_min")?,
            estimated_processing_time_s: r.f32("estimated_processing_time_s")?,
            cumulative_compensation_us: r.i64()?,
            last_uploaded_timestamp: r.u64()?,
        };
        if state.saved_time_micros >= 1_000_000 {
            return Err(StateError::Corrupt("saved_time_micros"));
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> PersistentState {
        PersistentState {
            boot_count: 61,
            last_displayed_minute: 59,
            sensor_initialized: true,
            last_sync_boot_count: 1,
            last_sync_timestamp: 1_767_193_200,
            last_drift_residual_us: -12_345,
            last_drift_valid: true,
            saved_time_secs: 1_767_196_795,
            saved_time_micros: 123_456,
            sleep_duration_requested_us: 54_876_544,
            drift_rate_ms_per_min: 41.2,
            drift_rate_calibrated: true,
            cumulative_compensation_us: 1_680_000,
            estimated_processing_time_s: 4.5,
            frame_buffer_size: 27_200,
            last_uploaded_timestamp: 1_767_190_000,
        }
    }

    #[test]
    fn test_encoded_len() {
        let mut buf = [0u8; 128];
        let len = populated().encode(&mut buf).unwrap();
        assert_eq!(len, PersistentState::ENCODED_LEN);
        assert_eq!(&buf[..4], &STATE_MARKER.to_le_bytes());
    }

    #[test]
    fn test_decode_recovers_every_field() {
        let state = populated();
        let mut buf = [0u8; PersistentState::ENCODED_LEN];
        state.encode(&mut buf).unwrap();
        assert_eq!(PersistentState::decode(&buf).unwrap(), state);
    }

    #[test]
    fn test_decode_rejects_truncated_image() {
        let mut buf = [0u8; PersistentState::ENCODED_LEN];
        populated().encode(&mut buf).unwrap();
        let err = PersistentState::decode(&buf[..PersistentState::ENCODED_LEN - 1]).unwrap_err();
        assert!(matches!(err, StateError::Truncated { .. }));
    }

    #[test]
    fn test_encode_rejects_small_buffer() {
        let mut buf = [0u8; 10];
        assert!(populated().encode(&mut buf).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_bool() {
        let mut buf = [0u8; PersistentState::ENCODED_LEN];
        populated().encode(&mut buf).unwrap();
        buf[9] = 7;
        assert_eq!(
            PersistentState::decode(&buf).unwrap_err(),
            StateError::Corrupt("sensor_initialized")
        );
    }

    #[test]
    fn test_invalid_marker_resets() {
        let mut buf = [0u8; PersistentState::ENCODED_LEN];
        populated().encode(&mut buf).unwrap();
        buf[0] ^= 0xFF;
        let (state, kind) = PersistentState::validate_or_reset(Some(&buf));
        assert_eq!(kind, BootKind::FirstBoot);
        assert_eq!(state, PersistentState::fresh());
    }

    #[test]
    fn test_garbage_image_resets() {
        let (_, kind) = PersistentState::validate_or_reset(Some(&[0xAA; 7]));
        assert_eq!(kind, BootKind::FirstBoot);
        let (_, kind) = PersistentState::validate_or_reset(None);
        assert_eq!(kind, BootKind::FirstBoot);
    }

    #[test]
    fn test_valid_image_is_warm_wake() {
        let mut buf = [0u8; PersistentState::ENCODED_LEN];
        populated().encode(&mut buf).unwrap();
        let (state, kind) = PersistentState::validate_or_reset(Some(&buf));
        assert_eq!(kind, BootKind::WarmWake);
        assert_eq!(state.boot_count, 61);
    }

    #[test]
    fn test_fresh_defaults() {
        let mut state = PersistentState::fresh();
        assert_eq!(state.last_displayed_minute, MINUTE_NEVER);
        assert!(state.never_synced());
        assert!(state.saved_time().is_none());
        state.begin_wake();
        assert_eq!(state.boot_count, 1);
    }
}
