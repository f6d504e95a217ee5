//! Persistence with a fallback chain of storage media
//!
//! A removable card is the primary medium. If it cannot be mounted, a region
//! of internal flash is used instead (the degraded medium). If neither mounts,
//! the backend is unavailable for the rest of the wake and every call reports
//! so without side effects. The choice is made once per wake by
//! [`StorageBackend::select`].

pub mod flash;
pub mod sd_card;

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt::{Display, Write};
use core::str::FromStr;

use log::{debug, error, info, warn};
use thiserror_no_std::Error;

use crate::persistent_state::PersistentState;

/// Last rendered frame buffer.
pub const FRAME_KEY: &str = "FRAME.BIN";
/// Calibrated drift rate, one decimal line.
pub const DRIFT_RATE_KEY: &str = "DRIFT.TXT";
/// Unix time of the newest uploaded sensor reading.
pub const LAST_UPLOAD_KEY: &str = "LASTUPL.TXT";
/// Postcard-encoded configuration override.
pub const CONFIG_KEY: &str = "CONFIG.BIN";

const SCALAR_LINE_LEN: usize = 32;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    #[error("no storage medium available")]
    Unavailable,
    #[error("file not found")]
    NotFound,
    #[error("key has no slot on this medium")]
    UnknownKey,
    #[error("{medium} failed during {operation}")]
    Medium {
        medium: &'static str,
        operation: &'static str,
    },
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
    #[error("short read: {read} of {expected} bytes")]
    ShortRead { read: usize, expected: usize },
    #[error("size mismatch: stored {stored}, expected {expected}")]
    SizeMismatch { stored: usize, expected: usize },
    #[error("no frame buffer recorded")]
    NoFrame,
    #[error("{0} bytes do not fit the slot")]
    TooLarge(usize),
    #[error("value could not be encoded")]
    Encode,
    #[error("operation not supported by this medium")]
    Unsupported,
}

/// One mounted storage medium holding flat, named files.
pub trait StorageMedium {
    /// Human-readable medium name for logs.
    fn name(&self) -> &'static str;

    fn exists(&mut self, key: &str) -> Result<bool, StorageError>;

    /// Size in bytes of a stored file.
    fn size(&mut self, key: &str) -> Result<usize, StorageError>;

    /// Replace the file contents. Returns how many bytes actually landed.
    fn write(&mut self, key: &str, bytes: &[u8]) -> Result<usize, StorageError>;

    /// Read from the start of the file. Returns how many bytes were read.
    fn read(&mut self, key: &str, buf: &mut [u8]) -> Result<usize, StorageError>;

    /// Add to the end of the file, creating it if needed. Returns how many
    /// bytes actually landed.
    fn append(&mut self, _key: &str, _bytes: &[u8]) -> Result<usize, StorageError> {
        Err(StorageError::Unsupported)
    }

    /// Call `visit` with the name of every stored file.
    fn list(&mut self, _visit: &mut dyn FnMut(&str)) -> Result<(), StorageError> {
        Err(StorageError::Unsupported)
    }

    fn remove(&mut self, _key: &str) -> Result<(), StorageError> {
        Err(StorageError::Unsupported)
    }

    /// Unmount, wipe and remount. Every stored file is lost.
    fn format(&mut self) -> Result<(), StorageError>;
}

/// Scalar persistence used by the drift model and bookkeeping.
pub trait ScalarStore {
    fn save_scalar<V: Display>(&mut self, key: &str, value: &V)
    -> Result<(), StorageError>;

    fn load_scalar<V: FromStr>(&mut self, key: &str) -> Option<V>;
}

/// The medium chosen for this wake.
pub enum ActiveMedium<P, D> {
    Primary(P),
    Degraded(D),
    Unavailable,
}

impl<P: StorageMedium, D: StorageMedium> ActiveMedium<P, D> {
    fn medium(&mut self) -> Result<&mut dyn StorageMedium, StorageError> {
        match self {
            ActiveMedium::Primary(p) => Ok(p),
            ActiveMedium::Degraded(d) => Ok(d),
            ActiveMedium::Unavailable => Err(StorageError::Unavailable),
        }
    }
}

pub struct StorageBackend<P, D> {
    active: ActiveMedium<P, D>,
}

impl<P: StorageMedium, D: StorageMedium> StorageBackend<P, D> {
    /// Pick the medium for this wake.
    ///
    /// `degraded` is only invoked when the primary failed to mount.
    pub fn select<F>(primary: Result<P, StorageError>, degraded: F) -> Self
    where
        F: FnOnce() -> Result<D, StorageError>,
    {
        let active = match primary {
            Ok(p) => {
                info!("Storage: using {}", p.name());
                ActiveMedium::Primary(p)
            }
            Err(e) => {
                warn!("Storage: primary medium unavailable ({}), trying fallback", e);
                match degraded() {
                    Ok(d) => {
                        warn!("Storage: running degraded on {}", d.name());
                        ActiveMedium::Degraded(d)
                    }
                    Err(e) => {
                        error!("Storage: no medium available ({})", e);
                        ActiveMedium::Unavailable
                    }
                }
            }
        };
        Self { active }
    }

    pub fn unavailable() -> Self {
        Self {
            active: ActiveMedium::Unavailable,
        }
    }

    pub fn active(&self) -> &ActiveMedium<P, D> {
        &self.active
    }

    pub fn is_available(&self) -> bool {
        !matches!(self.active, ActiveMedium::Unavailable)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.active, ActiveMedium::Degraded(_))
    }

    /// Write `bytes` under `key`, verifying the full length landed.
    ///
    /// A short write on the degraded medium formats it and leaves the backend
    /// unavailable until the next wake.
    pub fn save(&mut self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let written = self.active.medium()?.write(key, bytes)?;
        if written == bytes.len() {
            debug!("Storage: saved {} ({} bytes)", key, written);
            return Ok(());
        }

        let err = StorageError::ShortWrite {
            written,
            expected: bytes.len(),
        };
        error!("Storage: {} on {}", err, key);
        if let ActiveMedium::Degraded(d) = &mut self.active {
            warn!("Storage: formatting {} after short write", d.name());
            if let Err(e) = d.format() {
                error!("Storage: format failed ({})", e);
            }
            self.active = ActiveMedium::Unavailable;
        }
        Err(err)
    }

    /// Append `bytes` to a log-style file. Short appends are reported but
    /// never trigger a format.
    pub fn append(&mut self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let written = self.active.medium()?.append(key, bytes)?;
        if written != bytes.len() {
            let err = StorageError::ShortWrite {
                written,
                expected: bytes.len(),
            };
            warn!("Storage: {} appending to {}", err, key);
            return Err(err);
        }
        Ok(())
    }

    pub fn exists(&mut self, key: &str) -> Result<bool, StorageError> {
        self.active.medium()?.exists(key)
    }

    /// Names of every stored file, in medium order.
    pub fn list(&mut self) -> Result<Vec<String>, StorageError> {
        let mut names = Vec::new();
        self.active
            .medium()?
            .list(&mut |name: &str| names.push(String::from(name)))?;
        Ok(names)
    }

    pub fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        self.active.medium()?.remove(key)?;
        debug!("Storage: removed {}", key);
        Ok(())
    }

    /// Read the whole file into `buf`. Fails unless every stored byte was read.
    pub fn load(&mut self, key: &str, buf: &mut [u8]) -> Result<usize, StorageError> {
        let medium = self.active.medium()?;
        if !medium.exists(key)? {
            return Err(StorageError::NotFound);
        }
        let size = medium.size(key)?;
        if size > buf.len() {
            return Err(StorageError::SizeMismatch {
                stored: size,
                expected: buf.len(),
            });
        }
        let read = medium.read(key, &mut buf[..size])?;
        if read != size {
            return Err(StorageError::ShortRead {
                read,
                expected: size,
            });
        }
        Ok(read)
    }

    /// Read a whole file of unknown size.
    pub fn load_to_vec(&mut self, key: &str) -> Result<Vec<u8>, StorageError> {
        let medium = self.active.medium()?;
        if !medium.exists(key)? {
            return Err(StorageError::NotFound);
        }
        let mut buf = vec![0u8; medium.size(key)?];
        let len = self.load(key, &mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Read a file whose size must be exactly `expected`.
    pub fn load_exact(
        &mut self,
        key: &str,
        expected: usize,
        buf: &mut [u8],
    ) -> Result<(), StorageError> {
        if buf.len() < expected {
            return Err(StorageError::SizeMismatch {
                stored: expected,
                expected: buf.len(),
            });
        }
        let medium = self.active.medium()?;
        if !medium.exists(key)? {
            return Err(StorageError::NotFound);
        }
        let stored = medium.size(key)?;
        if stored != expected {
            return Err(StorageError::SizeMismatch { stored, expected });
        }
        let read = medium.read(key, &mut buf[..expected])?;
        if read != expected {
            return Err(StorageError::ShortRead { read, expected });
        }
        Ok(())
    }

    /// Persist the frame buffer and record its size in `state`.
    pub fn save_frame_buffer(
        &mut self,
        state: &mut PersistentState,
        frame: &[u8],
    ) -> Result<(), StorageError> {
        match self.save(FRAME_KEY, frame) {
            Ok(()) => {
                state.frame_buffer_size = frame.len() as u32;
                Ok(())
            }
            Err(e) => {
                state.frame_buffer_size = 0;
                Err(e)
            }
        }
    }

    /// Restore the frame buffer recorded in `state`. The buffer must match the recorded size.
    pub fn load_frame_buffer(
        &mut self,
        state: &PersistentState,
        buf: &mut [u8],
    ) -> Result<(), StorageError> {
        let recorded = state.frame_buffer_size as usize;
        if recorded == 0 {
            return Err(StorageError::NoFrame);
        }
        if recorded != buf.len() {
            return Err(StorageError::SizeMismatch {
                stored: recorded,
                expected: buf.len(),
            });
        }
        self.load_exact(FRAME_KEY, recorded, buf)
    }
}

impl<P: StorageMedium, D: StorageMedium> ScalarStore for StorageBackend<P, D> {
    fn save_scalar<V: Display>(
        &mut self,
        key: &str,
        value: &V,
    ) -> Result<(), StorageError> {
        let mut line: heapless::String<SCALAR_LINE_LEN> = heapless::String::new();
        writeln!(line, "{}", value).map_err(|_| StorageError::Encode)?;
        self.save(key, line.as_bytes())
    }

    fn load_scalar<V: FromStr>(&mut self, key: &str) -> Option<V> {
        let mut buf = [0u8; SCALAR_LINE_LEN];
        let len = self.load(key, &mut buf).ok()?;
        let text = core::str::from_utf8(&buf[..len]).ok()?;
        text.trim().parse().ok()
    }
}

/// Drift rates are stored with two decimals.
pub struct Rate(pub f32);

impl Display for Rate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RamMedium;

    type Backend = StorageBackend<RamMedium, RamMedium>;

    fn primary() -> (Backend, RamMedium) {
        let card = RamMedium::new();
        let backend = Backend::select(Ok(card.clone()), || panic!("fallback must not mount"));
        (backend, card)
    }

    fn degraded() -> (Backend, RamMedium) {
        let flash = RamMedium::named("flash");
        let handle = flash.clone();
        let backend = Backend::select(Err(StorageError::Unavailable), move || Ok(flash));
        (backend, handle)
    }

    #[test]
    fn test_primary_preferred() {
        let (backend, _) = primary();
        assert!(matches!(backend.active(), ActiveMedium::Primary(_)));
    }

    #[test]
    fn test_fallback_when_primary_fails() {
        let (backend, _) = degraded();
        assert!(backend.is_degraded());
    }

    #[test]
    fn test_unavailable_has_no_side_effects() {
        let mut backend = Backend::select(Err(StorageError::Unavailable), || {
            Err(StorageError::Unavailable)
        });
        assert!(!backend.is_available());
        assert_eq!(backend.save(FRAME_KEY, &[1, 2, 3]), Err(StorageError::Unavailable));
        let mut buf = [0u8; 4];
        assert_eq!(backend.load(FRAME_KEY, &mut buf), Err(StorageError::Unavailable));
        assert_eq!(backend.load_scalar::<f32>(DRIFT_RATE_KEY), None);
    }

    #[test]
    fn test_fallback_chain_equivalent_results() {
        // Same sequence on either medium gives the same observable results.
        for (mut backend, _) in [primary(), degraded()] {
            backend.save(FRAME_KEY, &[7u8; 64]).unwrap();
            let mut buf = [0u8; 64];
            backend.load_exact(FRAME_KEY, 64, &mut buf).unwrap();
            assert_eq!(buf, [7u8; 64]);

            backend.save_scalar(DRIFT_RATE_KEY, &Rate(41.234)).unwrap();
            assert_eq!(backend.load_scalar::<f32>(DRIFT_RATE_KEY), Some(41.23));
        }
    }

    #[test]
    fn test_scalar_line_format() {
        let (mut backend, card) = primary();
        backend.save_scalar(LAST_UPLOAD_KEY, &1_767_190_000u64).unwrap();
        assert_eq!(card.contents(LAST_UPLOAD_KEY).unwrap(), b"1767190000\n");
        assert_eq!(backend.load_scalar::<u64>(LAST_UPLOAD_KEY), Some(1_767_190_000));
    }

    #[test]
    fn test_append_grows_file() {
        let (mut backend, card) = primary();
        backend.append("20260101.LOG", b"one\n").unwrap();
        backend.append("20260101.LOG", b"two\n").unwrap();
        assert_eq!(card.contents("20260101.LOG").unwrap(), b"one\ntwo\n");
        assert_eq!(backend.load_to_vec("20260101.LOG").unwrap(), b"one\ntwo\n");
    }

    #[test]
    fn test_short_append_does_not_format() {
        let (mut backend, flash) = degraded();
        flash.truncate_writes_to(2);
        assert_eq!(
            backend.append("20260101.LOG", b"abcd"),
            Err(StorageError::ShortWrite {
                written: 2,
                expected: 4
            })
        );
        assert_eq!(flash.format_count(), 0);
        assert!(backend.is_degraded());
    }

    #[test]
    fn test_list_and_remove() {
        let (mut backend, card) = primary();
        backend.save(FRAME_KEY, &[1]).unwrap();
        backend.append("20260101.LOG", b"x\n").unwrap();
        assert_eq!(backend.list().unwrap(), ["20260101.LOG", FRAME_KEY]);

        backend.remove("20260101.LOG").unwrap();
        assert!(!card.contains("20260101.LOG"));
        assert_eq!(backend.exists("20260101.LOG"), Ok(false));
        assert_eq!(backend.remove("20260101.LOG"), Err(StorageError::NotFound));
    }

    #[test]
    fn test_unparsable_scalar_is_none() {
        let (mut backend, _) = primary();
        backend.save(DRIFT_RATE_KEY, b"not a number\n").unwrap();
        assert_eq!(backend.load_scalar::<f32>(DRIFT_RATE_KEY), None);
        assert_eq!(backend.load_scalar::<u64>(LAST_UPLOAD_KEY), None);
    }

    #[test]
    fn test_load_exact_fails_closed_on_size_mismatch() {
        let (mut backend, _) = primary();
        backend.save(FRAME_KEY, &[1u8; 10]).unwrap();
        let mut buf = [0u8; 12];
        assert_eq!(
            backend.load_exact(FRAME_KEY, 12, &mut buf),
            Err(StorageError::SizeMismatch {
                stored: 10,
                expected: 12
            })
        );
        assert_eq!(
            backend.load_exact("MISSING.BIN", 12, &mut buf),
            Err(StorageError::NotFound)
        );
    }

    #[test]
    fn test_short_read_is_error() {
        let (mut backend, card) = primary();
        backend.save(FRAME_KEY, &[1u8; 10]).unwrap();
        card.truncate_reads_to(4);
        let mut buf = [0u8; 10];
        assert_eq!(
            backend.load_exact(FRAME_KEY, 10, &mut buf),
            Err(StorageError::ShortRead {
                read: 4,
                expected: 10
            })
        );
    }

    #[test]
    fn test_short_write_on_degraded_formats_once() {
        let (mut backend, flash) = degraded();
        backend.save(DRIFT_RATE_KEY, b"30.00\n").unwrap();
        flash.truncate_writes_to(3);

        let err = backend.save(FRAME_KEY, &[9u8; 16]).unwrap_err();
        assert_eq!(
            err,
            StorageError::ShortWrite {
                written: 3,
                expected: 16
            }
        );
        assert_eq!(flash.format_count(), 1);
        assert!(!flash.contains(DRIFT_RATE_KEY));
        // No retry within the cycle
        assert_eq!(backend.save(FRAME_KEY, &[9u8; 16]), Err(StorageError::Unavailable));
        assert_eq!(flash.format_count(), 1);
    }

    #[test]
    fn test_short_write_on_primary_is_reported_only() {
        let (mut backend, card) = primary();
        card.truncate_writes_to(3);
        assert!(matches!(
            backend.save(FRAME_KEY, &[9u8; 16]),
            Err(StorageError::ShortWrite { .. })
        ));
        assert_eq!(card.format_count(), 0);
        assert!(backend.is_available());
    }

    #[test]
    fn test_frame_buffer_bookkeeping() {
        let (mut backend, _) = primary();
        let mut state = PersistentState::fresh();
        let mut buf = [0u8; 32];
        assert_eq!(
            backend.load_frame_buffer(&state, &mut buf),
            Err(StorageError::NoFrame)
        );

        backend.save_frame_buffer(&mut state, &[0x5A; 32]).unwrap();
        assert_eq!(state.frame_buffer_size, 32);
        backend.load_frame_buffer(&state, &mut buf).unwrap();
        assert_eq!(buf, [0x5A; 32]);

        let mut wrong = [0u8; 16];
        assert!(backend.load_frame_buffer(&state, &mut wrong).is_err());
    }
}
