//! Mounting the SD card and the internal flash fallback region

use embassy_time::Delay;
use embedded_hal::spi::SpiDevice;
use embedded_sdmmc::{SdCard, TimeSource, Timestamp};
use epdclock_core::storage::StorageError;
use epdclock_core::storage::flash::{FLASH_REGION_LEN, FlashMedium};
use epdclock_core::storage::sd_card::SdCardMedium;
use esp_bootloader_esp_idf::partitions::{
    DataPartitionSubType, PARTITION_TABLE_MAX_LEN, PartitionType, read_partition_table,
};
use esp_storage::FlashStorage;
use log::{info, warn};

/// FAT timestamps for files written by the clock.
///
/// Files are keyed by name only, so a fixed date is enough.
pub struct FixedTimeSource;

impl TimeSource for FixedTimeSource {
    fn get_timestamp(&self) -> Timestamp {
        Timestamp {
            year_since_1970: 56,
            zero_indexed_month: 0,
            zero_indexed_day: 0,
            hours: 0,
            minutes: 0,
            seconds: 0,
        }
    }
}

pub type CardMedium<S> = SdCardMedium<SdCard<S, Delay>, FixedTimeSource>;
pub type InternalMedium = FlashMedium<FlashStorage<'static>>;

/// Initialize the card and open its first FAT volume.
pub fn mount_card<S: SpiDevice<u8>>(spi: S) -> Result<CardMedium<S>, StorageError> {
    let card = SdCard::new(spi, Delay);
    let bytes = card.num_bytes().map_err(|e| {
        warn!("SD card: not detected: {:?}", e);
        StorageError::Medium {
            medium: "sd-card",
            operation: "detect",
        }
    })?;
    info!("SD card: {} MiB", bytes / (1024 * 1024));
    SdCardMedium::mount(card, FixedTimeSource)
}

/// Mount the fallback region in the first writable data partition of
/// undefined subtype.
pub fn mount_internal_flash(
    mut flash: FlashStorage<'static>,
) -> Result<InternalMedium, StorageError> {
    let partition_error = |operation| StorageError::Medium {
        medium: "flash",
        operation,
    };

    let (offset, len) = {
        let mut table_buf = [0u8; PARTITION_TABLE_MAX_LEN];
        let table = read_partition_table(&mut flash, &mut table_buf).map_err(|e| {
            warn!("Flash: partition table unreadable: {:?}", e);
            partition_error("read partition table")
        })?;
        let entry = table
            .iter()
            .filter(|entry| !entry.is_read_only() && entry.len() >= FLASH_REGION_LEN)
            .find(|entry| {
                matches!(
                    entry.partition_type(),
                    PartitionType::Data(DataPartitionSubType::Undefined)
                )
            })
            .ok_or_else(|| {
                warn!("Flash: no data partition for the fallback store");
                partition_error("find partition")
            })?;
        (entry.offset(), entry.len())
    };

    info!("Flash: fallback store at {:#x} ({} bytes)", offset, len);
    FlashMedium::mount(flash, offset, len)
}
