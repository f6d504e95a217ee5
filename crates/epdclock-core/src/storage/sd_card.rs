use core::fmt::{Debug, Write};

use embedded_sdmmc::{BlockDevice, Error, Mode, TimeSource, VolumeIdx, VolumeManager};
use log::{error, info};

use super::{StorageError, StorageMedium};

const MEDIUM_NAME: &str = "sd-card";

/// "NAME.EXT" at most.
const SHORT_NAME_LEN: usize = 12;

/// Bytes handed to the FAT layer per write call, so a failure part-way
/// through can report how much landed.
const WRITE_CHUNK: usize = 512;

fn medium_error<E: Debug>(operation: &'static str) -> impl FnOnce(Error<E>) -> StorageError {
    move |e| {
        error!("SD card {} failed: {:?}", operation, e);
        StorageError::Medium {
            medium: MEDIUM_NAME,
            operation,
        }
    }
}

/// FAT-formatted card, files in the root directory with 8.3 names.
///
/// Every operation opens the volume, the root directory and the file, then
/// closes them again, so nothing stays open across a power-down.
pub struct SdCardMedium<D, T>
where
    D: BlockDevice,
    T: TimeSource,
{
    volume_mgr: VolumeManager<D, T, 4, 4, 1>,
}

impl<D, T> SdCardMedium<D, T>
where
    D: BlockDevice,
    T: TimeSource,
{
    /// Wrap the card and check that its first volume can be opened.
    pub fn mount(block_device: D, time_source: T) -> Result<Self, StorageError> {
        let volume_mgr = VolumeManager::new(block_device, time_source);
        let volume0 = volume_mgr
            .open_volume(VolumeIdx(0))
            .map_err(medium_error("mount"))?;
        volume0.close().map_err(medium_error("mount"))?;
        Ok(Self { volume_mgr })
    }

    fn entry_size(&self, key: &str) -> Result<Option<usize>, StorageError> {
        let volume0 = self
            .volume_mgr
            .open_volume(VolumeIdx(0))
            .map_err(medium_error("open volume"))?;
        let root_dir = volume0
            .open_root_dir()
            .map_err(medium_error("open root dir"))?;

        let size = match root_dir.find_directory_entry(key) {
            Ok(entry) => Some(entry.size as usize),
            Err(Error::NotFound) => None,
            Err(e) => return Err(medium_error("lookup")(e)),
        };

        root_dir.close().map_err(medium_error("close dir"))?;
        volume0.close().map_err(medium_error("close volume"))?;
        Ok(size)
    }

    fn write_with_mode(
        &mut self,
        key: &str,
        bytes: &[u8],
        mode: Mode,
    ) -> Result<usize, StorageError> {
        let volume0 = self
            .volume_mgr
            .open_volume(VolumeIdx(0))
            .map_err(medium_error("open volume"))?;
        let root_dir = volume0
            .open_root_dir()
            .map_err(medium_error("open root dir"))?;
        let file = root_dir
            .open_file_in_dir(key, mode)
            .map_err(medium_error("open for write"))?;

        let mut written = 0;
        for chunk in bytes.chunks(WRITE_CHUNK) {
            if let Err(e) = file.write(chunk) {
                error!("SD card write of {} stopped at {} bytes: {:?}", key, written, e);
                break;
            }
            written += chunk.len();
        }

        file.close().map_err(medium_error("close file"))?;
        root_dir.close().map_err(medium_error("close dir"))?;
        volume0.close().map_err(medium_error("close volume"))?;
        Ok(written)
    }
}

impl<D, T> StorageMedium for SdCardMedium<D, T>
where
    D: BlockDevice,
    T: TimeSource,
{
    fn name(&self) -> &'static str {
        MEDIUM_NAME
    }

    fn exists(&mut self, key: &str) -> Result<bool, StorageError> {
        Ok(self.entry_size(key)?.is_some())
    }

    fn size(&mut self, key: &str) -> Result<usize, StorageError> {
        self.entry_size(key)?.ok_or(StorageError::NotFound)
    }

    fn write(&mut self, key: &str, bytes: &[u8]) -> Result<usize, StorageError> {
        self.write_with_mode(key, bytes, Mode::ReadWriteCreateOrTruncate)
    }

    fn append(&mut self, key: &str, bytes: &[u8]) -> Result<usize, StorageError> {
        self.write_with_mode(key, bytes, Mode::ReadWriteCreateOrAppend)
    }

    fn read(&mut self, key: &str, buf: &mut [u8]) -> Result<usize, StorageError> {
        let volume0 = self
            .volume_mgr
            .open_volume(VolumeIdx(0))
            .map_err(medium_error("open volume"))?;
        let root_dir = volume0
            .open_root_dir()
            .map_err(medium_error("open root dir"))?;
        let file = root_dir
            .open_file_in_dir(key, Mode::ReadOnly)
            .map_err(medium_error("open for read"))?;

        let mut filled = 0;
        while filled < buf.len() {
            let n = file
                .read(&mut buf[filled..])
                .map_err(medium_error("read"))?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        file.close().map_err(medium_error("close file"))?;
        root_dir.close().map_err(medium_error("close dir"))?;
        volume0.close().map_err(medium_error("close volume"))?;
        Ok(filled)
    }

    fn list(&mut self, visit: &mut dyn FnMut(&str)) -> Result<(), StorageError> {
        let volume0 = self
            .volume_mgr
            .open_volume(VolumeIdx(0))
            .map_err(medium_error("open volume"))?;
        let root_dir = volume0
            .open_root_dir()
            .map_err(medium_error("open root dir"))?;

        root_dir
            .iterate_dir(|entry| {
                if entry.attributes.is_directory() || entry.attributes.is_volume() {
                    return;
                }
                let mut name: heapless::String<SHORT_NAME_LEN> = heapless::String::new();
                if write!(name, "{}", entry.name).is_ok() {
                    visit(&name);
                }
            })
            .map_err(medium_error("list"))?;

        root_dir.close().map_err(medium_error("close dir"))?;
        volume0.close().map_err(medium_error("close volume"))?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        let volume0 = self
            .volume_mgr
            .open_volume(VolumeIdx(0))
            .map_err(medium_error("open volume"))?;
        let root_dir = volume0
            .open_root_dir()
            .map_err(medium_error("open root dir"))?;

        let result = match root_dir.delete_file_in_dir(key) {
            Ok(()) => {
                info!("SD card: deleted {}", key);
                Ok(())
            }
            Err(Error::NotFound) => Err(StorageError::NotFound),
            Err(e) => Err(medium_error("delete")(e)),
        };

        root_dir.close().map_err(medium_error("close dir"))?;
        volume0.close().map_err(medium_error("close volume"))?;
        result
    }

    /// FAT reformatting is not done on the device; a card is prepared on a host.
    fn format(&mut self) -> Result<(), StorageError> {
        Err(StorageError::Unsupported)
    }
}
