//! GUID partition table writer and verifier.
//!
//! Writes a protective MBR, the primary header and entry array at LBA 1-33,
//! and the backup entry array and header at the end of the disk. [`verify`]
//! reads everything back and checks it against the intended layout.

use super::layout::*;
use crate::error::IntegrityError;
use anyhow::Result;
use crc::{Crc, CRC_32_ISO_HDLC};
use std::io::{Read, Seek, SeekFrom, Write};
use uuid::Uuid;

const GPT_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const SIGNATURE: &[u8; 8] = b"EFI PART";
const REVISION: u32 = 0x0001_0000;
const HEADER_SIZE: u32 = 92;

/// A GPT header as found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptHeader {
    pub current_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: Uuid,
    pub entries_lba: u64,
    pub entry_count: u32,
    pub entry_size: u32,
    pub entries_crc: u32,
}

impl GptHeader {
    fn encode(&self) -> [u8; SECTOR_SIZE as usize] {
        let mut buf = [0u8; SECTOR_SIZE as usize];
        buf[0..8].copy_from_slice(SIGNATURE);
        buf[8..12].copy_from_slice(&REVISION.to_le_bytes());
        buf[12..16].copy_from_slice(&HEADER_SIZE.to_le_bytes());
        // 16..20 header CRC, filled in below; 20..24 reserved.
        buf[24..32].copy_from_slice(&self.current_lba.to_le_bytes());
        buf[32..40].copy_from_slice(&self.backup_lba.to_le_bytes());
        buf[40..48].copy_from_slice(&self.first_usable_lba.to_le_bytes());
        buf[48..56].copy_from_slice(&self.last_usable_lba.to_le_bytes());
        buf[56..72].copy_from_slice(&self.disk_guid.to_bytes_le());
        buf[72..80].copy_from_slice(&self.entries_lba.to_le_bytes());
        buf[80..84].copy_from_slice(&self.entry_count.to_le_bytes());
        buf[84..88].copy_from_slice(&self.entry_size.to_le_bytes());
        buf[88..92].copy_from_slice(&self.entries_crc.to_le_bytes());
        let crc = GPT_CRC.checksum(&buf[..HEADER_SIZE as usize]);
        buf[16..20].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self, IntegrityError> {
        if &buf[0..8] != SIGNATURE {
            return Err(corrupt("missing EFI PART signature"));
        }
        let size = u32_at(buf, 12);
        if size != HEADER_SIZE {
            return Err(corrupt(format!("unexpected header size {size}")));
        }
        let stored = u32_at(buf, 16);
        let mut copy = buf[..HEADER_SIZE as usize].to_vec();
        copy[16..20].fill(0);
        let actual = GPT_CRC.checksum(&copy);
        if stored != actual {
            return Err(corrupt(format!(
                "header CRC {stored:08x} does not match {actual:08x}"
            )));
        }
        let mut guid = [0u8; 16];
        guid.copy_from_slice(&buf[56..72]);
        Ok(Self {
            current_lba: u64_at(buf, 24),
            backup_lba: u64_at(buf, 32),
            first_usable_lba: u64_at(buf, 40),
            last_usable_lba: u64_at(buf, 48),
            disk_guid: Uuid::from_bytes_le(guid),
            entries_lba: u64_at(buf, 72),
            entry_count: u32_at(buf, 80),
            entry_size: u32_at(buf, 84),
            entries_crc: u32_at(buf, 88),
        })
    }
}

/// Encode the partition entry array for `layout`.
fn encode_entries(layout: &PartitionLayout) -> Vec<u8> {
    let mut buf = vec![0u8; (GPT_ENTRY_COUNT * GPT_ENTRY_SIZE) as usize];
    for (i, p) in layout.partitions.iter().enumerate() {
        let e = &mut buf[i * GPT_ENTRY_SIZE as usize..(i + 1) * GPT_ENTRY_SIZE as usize];
        e[0..16].copy_from_slice(&p.type_guid.to_bytes_le());
        e[16..32].copy_from_slice(&p.unique_guid.to_bytes_le());
        e[32..40].copy_from_slice(&p.first_lba.to_le_bytes());
        e[40..48].copy_from_slice(&p.last_lba.to_le_bytes());
        // 48..56 attributes: none.
        for (j, unit) in p.name.encode_utf16().take(36).enumerate() {
            e[56 + 2 * j..58 + 2 * j].copy_from_slice(&unit.to_le_bytes());
        }
    }
    buf
}

fn decode_entries(buf: &[u8]) -> Vec<Partition> {
    buf.chunks_exact(GPT_ENTRY_SIZE as usize)
        .filter_map(|e| {
            let mut type_bytes = [0u8; 16];
            type_bytes.copy_from_slice(&e[0..16]);
            let type_guid = Uuid::from_bytes_le(type_bytes);
            if type_guid.is_nil() {
                return None;
            }
            let mut unique = [0u8; 16];
            unique.copy_from_slice(&e[16..32]);
            let units: Vec<u16> = e[56..128]
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .take_while(|u| *u != 0)
                .collect();
            Some(Partition {
                type_guid,
                unique_guid: Uuid::from_bytes_le(unique),
                name: String::from_utf16_lossy(&units),
                first_lba: u64_at(e, 32),
                last_lba: u64_at(e, 40),
            })
        })
        .collect()
}

fn protective_mbr(total_sectors: u64) -> [u8; SECTOR_SIZE as usize] {
    let mut mbr = [0u8; SECTOR_SIZE as usize];
    let entry = &mut mbr[446..462];
    entry[0] = 0x00;
    entry[1..4].copy_from_slice(&[0x00, 0x02, 0x00]);
    entry[4] = 0xEE;
    entry[5..8].copy_from_slice(&[0xFF, 0xFF, 0xFF]);
    entry[8..12].copy_from_slice(&1u32.to_le_bytes());
    let size = u32::try_from(total_sectors - 1).unwrap_or(u32::MAX);
    entry[12..16].copy_from_slice(&size.to_le_bytes());
    mbr[510] = 0x55;
    mbr[511] = 0xAA;
    mbr
}

/// Write the protective MBR and both GPT copies for `layout`.
pub fn write<D: Write + Seek>(disk: &mut D, layout: &PartitionLayout) -> Result<()> {
    let total = layout.total_sectors;
    let entries = encode_entries(layout);
    let entries_crc = GPT_CRC.checksum(&entries);
    let backup_lba = total - 1;
    let backup_entries_lba = backup_lba - (gpt_table_sectors() - 1);

    let primary = GptHeader {
        current_lba: 1,
        backup_lba,
        first_usable_lba: first_usable_lba(),
        last_usable_lba: last_usable_lba(total),
        disk_guid: layout.disk_guid,
        entries_lba: 2,
        entry_count: GPT_ENTRY_COUNT,
        entry_size: GPT_ENTRY_SIZE,
        entries_crc,
    };
    let backup = GptHeader {
        current_lba: backup_lba,
        backup_lba: 1,
        entries_lba: backup_entries_lba,
        ..primary.clone()
    };

    write_at(disk, 0, &protective_mbr(total))?;
    write_at(disk, 1, &primary.encode())?;
    write_at(disk, 2, &entries)?;
    write_at(disk, backup_entries_lba, &entries)?;
    write_at(disk, backup_lba, &backup.encode())?;
    disk.flush()?;
    Ok(())
}

/// Parsed partition table.
#[derive(Debug, Clone)]
pub struct GptTable {
    pub primary: GptHeader,
    pub backup: GptHeader,
    pub partitions: Vec<Partition>,
}

/// Read and check both GPT copies of a disk with `total_sectors` sectors.
pub fn read<D: Read + Seek>(disk: &mut D, total_sectors: u64) -> Result<GptTable> {
    let mbr = read_at(disk, 0, SECTOR_SIZE as usize)?;
    if mbr[510] != 0x55 || mbr[511] != 0xAA || mbr[446 + 4] != 0xEE {
        return Err(corrupt("missing protective MBR").into());
    }

    let primary = GptHeader::decode(&read_at(disk, 1, SECTOR_SIZE as usize)?)?;
    if primary.current_lba != 1 || primary.backup_lba != total_sectors - 1 {
        return Err(corrupt("primary header points to the wrong LBAs").into());
    }
    let backup = GptHeader::decode(&read_at(disk, primary.backup_lba, SECTOR_SIZE as usize)?)?;
    if backup.current_lba != primary.backup_lba || backup.backup_lba != 1 {
        return Err(corrupt("backup header points to the wrong LBAs").into());
    }
    if backup.disk_guid != primary.disk_guid || backup.entries_crc != primary.entries_crc {
        return Err(corrupt("backup header does not match primary").into());
    }

    let len = (primary.entry_count * primary.entry_size) as usize;
    let entries = read_at(disk, primary.entries_lba, len)?;
    if GPT_CRC.checksum(&entries) != primary.entries_crc {
        return Err(corrupt("primary entry array CRC mismatch").into());
    }
    let backup_entries = read_at(disk, backup.entries_lba, len)?;
    if backup_entries != entries {
        return Err(corrupt("backup entry array differs from primary").into());
    }

    Ok(GptTable {
        partitions: decode_entries(&entries),
        primary,
        backup,
    })
}

/// Read the table back and compare it to `layout`.
pub fn verify<D: Read + Seek>(disk: &mut D, layout: &PartitionLayout) -> Result<()> {
    let table = read(disk, layout.total_sectors)?;
    if table.primary.disk_guid != layout.disk_guid {
        return Err(corrupt("disk GUID mismatch").into());
    }
    if table.partitions != layout.partitions {
        return Err(corrupt(format!(
            "partition entries differ: wrote {:?}, read {:?}",
            layout.partitions, table.partitions
        ))
        .into());
    }
    for p in &table.partitions {
        if p.first_lba < table.primary.first_usable_lba
            || p.last_lba > table.primary.last_usable_lba
            || p.first_lba > p.last_lba
        {
            return Err(corrupt(format!("partition {} is outside the usable area", p.name)).into());
        }
    }
    Ok(())
}

fn corrupt(msg: impl Into<String>) -> IntegrityError {
    IntegrityError::PartitionTable(msg.into())
}

fn write_at<D: Write + Seek>(disk: &mut D, lba: u64, data: &[u8]) -> Result<()> {
    disk.seek(SeekFrom::Start(lba * SECTOR_SIZE))?;
    disk.write_all(data)?;
    Ok(())
}

fn read_at<D: Read + Seek>(disk: &mut D, lba: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    disk.seek(SeekFrom::Start(lba * SECTOR_SIZE))?;
    disk.read_exact(&mut buf)?;
    Ok(buf)
}

fn u32_at(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn u64_at(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}
