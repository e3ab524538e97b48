//! Flash-backed configuration store.
//!
//! The configuration lives in one erase sector as a single record:
//!
//! | offset | size | field                                  |
//! |--------|------|----------------------------------------|
//! | 0      | 4    | magic `PAXC`                           |
//! | 4      | 2    | length of the encoded config (LE)      |
//! | 6      | 2    | reserved, `0xFFFF`                     |
//! | 8      | 4    | CRC-32 of the encoded config (LE)      |
//! | 12     | len  | [`config::encode`] output              |
//!
//! The record is always read and written whole, padded with `0xFF` to
//! [`RECORD_LEN`], so any flash with read/write granularity up to 16
//! bytes can hold it. An erased sector reads back as "nothing stored".

use crc::{Crc, CRC_32_ISO_HDLC};
use embedded_storage::nor_flash::{NorFlash, NorFlashError};

use crate::config::{self, Config, ConfigStore, MAX_CONFIG_LEN};
use crate::error::ConfigError;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const MAGIC: [u8; 4] = *b"PAXC";
const HEADER_LEN: usize = 12;

/// Bytes read or written per access.
pub const RECORD_LEN: usize = (HEADER_LEN + MAX_CONFIG_LEN).next_multiple_of(16);

/// Config sector on the ESP32 boards: the `nvs` partition of the default
/// partition table, which nothing else touches in this firmware.
pub const CONFIG_FLASH_OFFSET: u32 = 0x9000;

pub struct FlashStore<F> {
    flash: F,
    offset: u32,
}

impl<F: NorFlash> FlashStore<F> {
    /// `offset` must be the start of an erase sector.
    pub fn new(flash: F, offset: u32) -> Self {
        Self { flash, offset }
    }

    fn read_record(&mut self) -> Result<[u8; RECORD_LEN], ConfigError> {
        let mut record = [0u8; RECORD_LEN];
        self.flash
            .read(self.offset, &mut record)
            .map_err(|e| flash_error("read", e))?;
        Ok(record)
    }
}

impl<F: NorFlash> ConfigStore for FlashStore<F> {
    fn load(&mut self) -> Result<Config, ConfigError> {
        let record = self.read_record()?;
        if record[..4] != MAGIC {
            return Err(ConfigError::Storage);
        }
        let len = u16::from_le_bytes([record[4], record[5]]) as usize;
        if len > MAX_CONFIG_LEN {
            return Err(ConfigError::Corrupt);
        }
        let crc = u32::from_le_bytes([record[8], record[9], record[10], record[11]]);
        let data = &record[HEADER_LEN..HEADER_LEN + len];
        if CRC32.checksum(data) != crc {
            return Err(ConfigError::Corrupt);
        }
        config::decode(data)
    }

    fn save(&mut self, config: &Config) -> Result<(), ConfigError> {
        let mut record = [0xFFu8; RECORD_LEN];
        let len = config::encode(config, &mut record[HEADER_LEN..HEADER_LEN + MAX_CONFIG_LEN])?;
        let crc = CRC32.checksum(&record[HEADER_LEN..HEADER_LEN + len]);
        record[..4].copy_from_slice(&MAGIC);
        record[4..6].copy_from_slice(&(len as u16).to_le_bytes());
        record[8..12].copy_from_slice(&crc.to_le_bytes());

        // Unchanged settings cost no erase cycle
        if self.read_record().is_ok_and(|stored| stored == record) {
            return Ok(());
        }

        self.flash
            .erase(self.offset, self.offset + F::ERASE_SIZE as u32)
            .map_err(|e| flash_error("erase", e))?;
        self.flash
            .write(self.offset, &record)
            .map_err(|e| flash_error("write", e))
    }
}

fn flash_error(op: &str, e: impl NorFlashError) -> ConfigError {
    log::warn!("Config flash {} failed: {:?}", op, e.kind());
    ConfigError::Storage
}
