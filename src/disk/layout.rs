//! Image geometry and partition layout.
//!
//! One sizing formula is used for every image, USB or ISO:
//!
//! ```text
//! total = 1 MiB + esp + data + 2 * GPT_TABLE_BYTES
//! ```
//!
//! The first MiB holds the protective MBR, the primary GPT header and entry
//! array, and alignment padding. The backup entry array and header occupy
//! the last `GPT_TABLE_BYTES`. The ESP starts at LBA 2048; the data partition
//! follows immediately and runs to the last usable LBA.

use crate::config::ImageConfig;
use crate::error::ConfigError;
use anyhow::Result;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Sector size in bytes.
pub const SECTOR_SIZE: u64 = 512;

pub const MIB: u64 = 1024 * 1024;

/// First partition starts at this LBA (1 MiB).
pub const FIRST_PARTITION_LBA: u64 = 2048;

pub const GPT_ENTRY_COUNT: u32 = 128;
pub const GPT_ENTRY_SIZE: u32 = 128;

/// One GPT header sector plus the 32-sector entry array.
pub const GPT_TABLE_BYTES: u64 = 33 * SECTOR_SIZE;

/// Smallest partition that still formats as FAT32 with 512-byte clusters.
pub const MIN_PARTITION_BYTES: u64 = 36 * MIB;

pub const ESP_TYPE_GUID: Uuid = Uuid::from_u128(0xC12A7328_F81F_11D2_BA4B_00A0C93EC93B);
pub const LINUX_DATA_TYPE_GUID: Uuid = Uuid::from_u128(0x0FC63DAF_8483_4772_8E79_3D69D8477DE4);

/// Requested partition sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageGeometry {
    pub esp_bytes: u64,
    pub data_bytes: u64,
}

impl ImageGeometry {
    pub fn new(esp_bytes: u64, data_bytes: u64) -> Result<Self> {
        for (what, bytes) in [("ESP", esp_bytes), ("data partition", data_bytes)] {
            if bytes % SECTOR_SIZE != 0 {
                return Err(ConfigError::Invalid(format!(
                    "{what} size {bytes} is not a multiple of {SECTOR_SIZE}"
                ))
                .into());
            }
            if bytes < MIN_PARTITION_BYTES {
                return Err(ConfigError::Invalid(format!(
                    "{what} size {bytes} is below the FAT32 minimum of {MIN_PARTITION_BYTES}"
                ))
                .into());
            }
        }
        Ok(Self {
            esp_bytes,
            data_bytes,
        })
    }

    pub fn from_config(cfg: &ImageConfig) -> Result<Self> {
        Self::new(cfg.esp_size_mib * MIB, cfg.data_size_mib * MIB)
    }

    pub fn total_bytes(&self) -> u64 {
        MIB + self.esp_bytes + self.data_bytes + 2 * GPT_TABLE_BYTES
    }

    pub fn total_sectors(&self) -> u64 {
        self.total_bytes() / SECTOR_SIZE
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub type_guid: Uuid,
    pub unique_guid: Uuid,
    pub name: String,
    pub first_lba: u64,
    /// Inclusive.
    pub last_lba: u64,
}

impl Partition {
    pub fn offset_bytes(&self) -> u64 {
        self.first_lba * SECTOR_SIZE
    }

    pub fn size_bytes(&self) -> u64 {
        (self.last_lba - self.first_lba + 1) * SECTOR_SIZE
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionLayout {
    pub disk_guid: Uuid,
    pub total_sectors: u64,
    pub partitions: Vec<Partition>,
}

impl PartitionLayout {
    /// Two-partition layout for `geometry`. GUIDs are derived from `seed`,
    /// so equal inputs give byte-identical partition tables.
    pub fn compute(geometry: &ImageGeometry, seed: &[u8]) -> Self {
        let total_sectors = geometry.total_sectors();
        let esp_first = FIRST_PARTITION_LBA;
        let esp_last = esp_first + geometry.esp_bytes / SECTOR_SIZE - 1;
        let data_first = esp_last + 1;
        let data_last = last_usable_lba(total_sectors);

        Self {
            disk_guid: derive_guid(seed, "disk"),
            total_sectors,
            partitions: vec![
                Partition {
                    type_guid: ESP_TYPE_GUID,
                    unique_guid: derive_guid(seed, "esp"),
                    name: "ESP".to_string(),
                    first_lba: esp_first,
                    last_lba: esp_last,
                },
                Partition {
                    type_guid: LINUX_DATA_TYPE_GUID,
                    unique_guid: derive_guid(seed, "data"),
                    name: "fab-install".to_string(),
                    first_lba: data_first,
                    last_lba: data_last,
                },
            ],
        }
    }

    pub fn esp(&self) -> &Partition {
        &self.partitions[0]
    }

    pub fn data(&self) -> &Partition {
        &self.partitions[1]
    }
}

/// Sectors taken by one GPT header and its entry array.
pub fn gpt_table_sectors() -> u64 {
    GPT_TABLE_BYTES / SECTOR_SIZE
}

pub fn first_usable_lba() -> u64 {
    1 + gpt_table_sectors()
}

pub fn last_usable_lba(total_sectors: u64) -> u64 {
    total_sectors - 1 - gpt_table_sectors()
}

fn derive_guid(seed: &[u8], label: &str) -> Uuid {
    let mut hasher = Sha256::new();
    hasher.update(seed);
    hasher.update(label.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    uuid::Builder::from_random_bytes(bytes).into_uuid()
}
