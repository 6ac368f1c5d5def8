//! FAT32 filesystems inside partitions of a raw disk image.

use super::tree::TargetFs;
use anyhow::{Context, Result};
use fatfs::{FatType, FileSystem, FormatVolumeOptions, FsOptions};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// A byte window `[start, start + len)` of an image file.
pub struct PartitionSlice {
    file: File,
    start: u64,
    len: u64,
    pos: u64,
}

impl PartitionSlice {
    pub fn new(file: File, start: u64, len: u64) -> Self {
        Self {
            file,
            start,
            len,
            pos: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    fn remaining(&self) -> u64 {
        self.len.saturating_sub(self.pos)
    }
}

impl Read for PartitionSlice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let max = (buf.len() as u64).min(self.remaining()) as usize;
        if max == 0 {
            return Ok(0);
        }
        self.file.seek(SeekFrom::Start(self.start + self.pos))?;
        let n = self.file.read(&mut buf[..max])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for PartitionSlice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let max = (buf.len() as u64).min(self.remaining()) as usize;
        if max == 0 && !buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write past the end of the partition",
            ));
        }
        self.file.seek(SeekFrom::Start(self.start + self.pos))?;
        let n = self.file.write(&buf[..max])?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for PartitionSlice {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(off) => Some(off),
            SeekFrom::End(off) => self.len.checked_add_signed(off),
            SeekFrom::Current(off) => self.pos.checked_add_signed(off),
        };
        match target {
            Some(p) => {
                self.pos = p;
                Ok(p)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before the start of the partition",
            )),
        }
    }
}

/// FAT volume label: uppercase, space padded to 11 bytes.
fn volume_label(label: &str) -> [u8; 11] {
    let mut out = [b' '; 11];
    for (dst, src) in out.iter_mut().zip(label.bytes()) {
        *dst = src.to_ascii_uppercase();
    }
    out
}

/// Cluster size that keeps the cluster count in the FAT32 range.
fn bytes_per_cluster(len: u64) -> u32 {
    if len / 4096 < 70_000 {
        512
    } else {
        4096
    }
}

/// A mounted FAT32 filesystem.
pub struct FatVolume {
    fs: FileSystem<PartitionSlice>,
}

impl FatVolume {
    /// Format `slice` as FAT32 and mount it.
    pub fn format(mut slice: PartitionSlice, label: &str, volume_id: u32) -> Result<Self> {
        let options = FormatVolumeOptions::new()
            .fat_type(FatType::Fat32)
            .bytes_per_cluster(bytes_per_cluster(slice.len()))
            .volume_id(volume_id)
            .volume_label(volume_label(label));
        fatfs::format_volume(&mut slice, options)
            .with_context(|| format!("Failed to format FAT32 volume {label}"))?;
        slice.seek(SeekFrom::Start(0))?;
        Self::open(slice).with_context(|| format!("Failed to mount fresh volume {label}"))
    }

    pub fn open(slice: PartitionSlice) -> Result<Self> {
        let fs = FileSystem::new(slice, FsOptions::new()).context("Failed to mount FAT volume")?;
        Ok(Self { fs })
    }

    /// Flush all metadata and release the image file.
    pub fn unmount(self) -> Result<()> {
        self.fs.unmount().context("Failed to unmount FAT volume")
    }

    pub fn label(&self) -> String {
        self.fs.volume_label().trim_end().to_string()
    }

    pub fn fat_type(&self) -> FatType {
        self.fs.fat_type()
    }

    #[cfg(test)]
    pub(crate) fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let mut file = self.fs.root_dir().open_file(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Names in a directory, `.` and `..` excluded, sorted.
    #[cfg(test)]
    pub(crate) fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let root = self.fs.root_dir();
        let dir = if path.is_empty() {
            root
        } else {
            root.open_dir(path)?
        };
        let mut names = Vec::new();
        for entry in dir.iter() {
            let name = entry?.file_name();
            if name != "." && name != ".." {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

impl TargetFs for FatVolume {
    fn create_dir(&mut self, path: &str) -> Result<()> {
        self.fs
            .root_dir()
            .create_dir(path)
            .with_context(|| format!("Failed to create FAT directory {path}"))?;
        Ok(())
    }

    fn create_file(&mut self, path: &str) -> Result<Box<dyn Write + '_>> {
        let mut file = self
            .fs
            .root_dir()
            .create_file(path)
            .with_context(|| format!("Failed to create FAT file {path}"))?;
        file.truncate()?;
        Ok(Box::new(file))
    }
}
