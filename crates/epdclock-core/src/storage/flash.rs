//! Internal-flash fallback medium
//!
//! The region is split into one fixed slot per known key. A slot starts with
//! an 8-byte header (magic, payload length) followed by the payload. The
//! header is written last, so a slot whose payload write was interrupted
//! reads as absent.

use embedded_storage::nor_flash::NorFlash;
use log::{error, info};

use super::{CONFIG_KEY, DRIFT_RATE_KEY, FRAME_KEY, LAST_UPLOAD_KEY, StorageError, StorageMedium};

const MEDIUM_NAME: &str = "internal-flash";
const SLOT_MAGIC: u32 = 0x4C53_4445; // "EDSL"
const HEADER_LEN: u32 = 8;
const SECTOR: u32 = 4096;

/// `(key, byte offset within the region, slot capacity including header)`
const SLOTS: &[(&str, u32, u32)] = &[
    (FRAME_KEY, 0, 8 * SECTOR),
    (DRIFT_RATE_KEY, 8 * SECTOR, SECTOR),
    (LAST_UPLOAD_KEY, 9 * SECTOR, SECTOR),
    (CONFIG_KEY, 10 * SECTOR, SECTOR),
];

/// Bytes the slot table needs.
pub const FLASH_REGION_LEN: u32 = 11 * SECTOR;

const TAIL_BUF: usize = 16;

pub struct FlashMedium<F: NorFlash> {
    flash: F,
    base: u32,
}

impl<F: NorFlash> FlashMedium<F> {
    /// Use `len` bytes of `flash` starting at `base`.
    pub fn mount(flash: F, base: u32, len: u32) -> Result<Self, StorageError> {
        if len < FLASH_REGION_LEN
            || base % SECTOR != 0
            || F::ERASE_SIZE as u32 > SECTOR
            || F::WRITE_SIZE > TAIL_BUF
            || F::READ_SIZE > TAIL_BUF
        {
            error!(
                "Flash region {:#x}+{:#x} unsuitable for storage slots",
                base, len
            );
            return Err(StorageError::Medium {
                medium: MEDIUM_NAME,
                operation: "mount",
            });
        }
        info!("Flash storage region at {:#x}", base);
        Ok(Self { flash, base })
    }

    pub fn release(self) -> F {
        self.flash
    }

    fn slot(key: &str) -> Result<(u32, u32), StorageError> {
        SLOTS
            .iter()
            .find(|(name, _, _)| *name == key)
            .map(|&(_, offset, capacity)| (offset, capacity))
            .ok_or(StorageError::UnknownKey)
    }

    fn flash_error(operation: &'static str) -> StorageError {
        StorageError::Medium {
            medium: MEDIUM_NAME,
            operation,
        }
    }

    /// Read `out.len()` bytes at `addr`, honouring the device read granularity.
    fn read_at(&mut self, addr: u32, out: &mut [u8]) -> Result<(), StorageError> {
        let step = F::READ_SIZE.max(1);
        let aligned = out.len() - out.len() % step;
        if aligned > 0 {
            self.flash
                .read(addr, &mut out[..aligned])
                .map_err(|_| Self::flash_error("read"))?;
        }
        let rest = out.len() - aligned;
        if rest > 0 {
            let mut tail = [0u8; TAIL_BUF];
            self.flash
                .read(addr + aligned as u32, &mut tail[..step])
                .map_err(|_| Self::flash_error("read"))?;
            out[aligned..].copy_from_slice(&tail[..rest]);
        }
        Ok(())
    }

    fn header(&mut self, key: &str) -> Result<Option<u32>, StorageError> {
        let (offset, capacity) = Self::slot(key)?;
        let mut header = [0u8; HEADER_LEN as usize];
        self.read_at(self.base + offset, &mut header)?;
        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if magic != SLOT_MAGIC || len > capacity - HEADER_LEN {
            return Ok(None);
        }
        Ok(Some(len))
    }
}

impl<F: NorFlash> StorageMedium for FlashMedium<F> {
    fn name(&self) -> &'static str {
        MEDIUM_NAME
    }

    fn exists(&mut self, key: &str) -> Result<bool, StorageError> {
        Ok(self.header(key)?.is_some())
    }

    fn size(&mut self, key: &str) -> Result<usize, StorageError> {
        self.header(key)?
            .map(|len| len as usize)
            .ok_or(StorageError::NotFound)
    }

    fn write(&mut self, key: &str, bytes: &[u8]) -> Result<usize, StorageError> {
        let (offset, capacity) = Self::slot(key)?;
        if bytes.len() as u32 > capacity - HEADER_LEN {
            return Err(StorageError::TooLarge(bytes.len()));
        }
        let start = self.base + offset;
        self.flash
            .erase(start, start + capacity)
            .map_err(|_| Self::flash_error("erase"))?;

        let payload_at = start + HEADER_LEN;
        let step = F::WRITE_SIZE.max(1);
        let aligned = bytes.len() - bytes.len() % step;
        if aligned > 0 && self.flash.write(payload_at, &bytes[..aligned]).is_err() {
            error!("Flash write of {} failed", key);
            return Ok(0);
        }
        let rest = bytes.len() - aligned;
        if rest > 0 {
            let mut tail = [0xFFu8; TAIL_BUF];
            tail[..rest].copy_from_slice(&bytes[aligned..]);
            if self
                .flash
                .write(payload_at + aligned as u32, &tail[..step])
                .is_err()
            {
                error!("Flash write of {} stopped at {} bytes", key, aligned);
                return Ok(aligned);
            }
        }

        let mut header = [0u8; HEADER_LEN as usize];
        header[..4].copy_from_slice(&SLOT_MAGIC.to_le_bytes());
        header[4..].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
        if self.flash.write(start, &header).is_err() {
            error!("Flash header write for {} failed", key);
            return Ok(0);
        }
        Ok(bytes.len())
    }

    fn read(&mut self, key: &str, buf: &mut [u8]) -> Result<usize, StorageError> {
        let (offset, _) = Self::slot(key)?;
        let len = self.header(key)?.ok_or(StorageError::NotFound)? as usize;
        let n = len.min(buf.len());
        self.read_at(self.base + offset + HEADER_LEN, &mut buf[..n])?;
        Ok(n)
    }

    fn format(&mut self) -> Result<(), StorageError> {
        self.flash
            .erase(self.base, self.base + FLASH_REGION_LEN)
            .map_err(|_| Self::flash_error("format"))?;
        info!("Flash storage region erased");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RamFlash;

    fn medium() -> FlashMedium<RamFlash> {
        FlashMedium::mount(RamFlash::new(16 * SECTOR as usize), SECTOR, 12 * SECTOR).unwrap()
    }

    #[test]
    fn test_rejects_small_region() {
        assert!(FlashMedium::mount(RamFlash::new(4 * SECTOR as usize), 0, 4 * SECTOR).is_err());
    }

    #[test]
    fn test_write_then_read_unaligned_length() {
        let mut m = medium();
        assert!(!m.exists(DRIFT_RATE_KEY).unwrap());
        assert_eq!(m.write(DRIFT_RATE_KEY, b"41.23\n").unwrap(), 6);
        assert!(m.exists(DRIFT_RATE_KEY).unwrap());
        assert_eq!(m.size(DRIFT_RATE_KEY).unwrap(), 6);
        let mut buf = [0u8; 6];
        assert_eq!(m.read(DRIFT_RATE_KEY, &mut buf).unwrap(), 6);
        assert_eq!(&buf, b"41.23\n");
    }

    #[test]
    fn test_rewrite_replaces_contents() {
        let mut m = medium();
        m.write(LAST_UPLOAD_KEY, b"1767190000\n").unwrap();
        m.write(LAST_UPLOAD_KEY, b"1\n").unwrap();
        assert_eq!(m.size(LAST_UPLOAD_KEY).unwrap(), 2);
    }

    #[test]
    fn test_frame_sized_payload_fits() {
        let mut m = medium();
        let frame = [0xA5u8; 27_200];
        assert_eq!(m.write(FRAME_KEY, &frame).unwrap(), frame.len());
        let mut buf = [0u8; 27_200];
        m.read(FRAME_KEY, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xA5));
    }

    #[test]
    fn test_no_listing_or_removal() {
        let mut m = medium();
        assert_eq!(m.list(&mut |_: &str| {}), Err(StorageError::Unsupported));
        assert_eq!(m.remove(FRAME_KEY), Err(StorageError::Unsupported));
    }

    #[test]
    fn test_unknown_key_and_oversize() {
        let mut m = medium();
        assert_eq!(m.write("OTHER.TXT", b"x"), Err(StorageError::UnknownKey));
        let big = [0u8; SECTOR as usize];
        assert_eq!(m.write(DRIFT_RATE_KEY, &big), Err(StorageError::TooLarge(4096)));
    }

    #[test]
    fn test_interrupted_write_reads_as_absent() {
        let mut flash = RamFlash::new(16 * SECTOR as usize);
        flash.fail_writes_after(2);
        let mut m = FlashMedium::mount(flash, 0, 12 * SECTOR).unwrap();
        // Payload write succeeds, header write fails.
        assert_eq!(m.write(DRIFT_RATE_KEY, b"30.00\n").unwrap(), 0);
        assert!(!m.exists(DRIFT_RATE_KEY).unwrap());
    }

    #[test]
    fn test_format_erases_everything() {
        let mut m = medium();
        m.write(DRIFT_RATE_KEY, b"30.00\n").unwrap();
        m.write(CONFIG_KEY, b"cfg").unwrap();
        m.format().unwrap();
        assert!(!m.exists(DRIFT_RATE_KEY).unwrap());
        assert!(!m.exists(CONFIG_KEY).unwrap());
    }
}
