//! ISO9660 image writer with Rock Ridge names and an El Torito EFI entry.
//!
//! Files written through [`TargetFs`] are spooled into a host directory;
//! [`IsoWriter::finalize`] lays the whole volume out in one pass:
//!
//! ```text
//! 0-15   system area (zero)
//! 16     primary volume descriptor
//! 17     El Torito boot record         (only with a boot image)
//! next   volume descriptor terminator
//! next   boot catalog                  (only with a boot image)
//! next   L path table, M path table
//! next   directory extents, breadth first
//! next   file extents
//! ```
//!
//! Identifiers are ISO level 2 (uppercase d-characters, `;1` versions);
//! the real names are carried in Rock Ridge `NM` entries. All timestamps
//! are fixed so equal trees give equal images.

use super::tree::{HostDir, TargetFs};
use crate::error::{ConfigError, IntegrityError};
use anyhow::{bail, Context, Result};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::debug;

pub const BLOCK_SIZE: u64 = 2048;
const SYSTEM_AREA_BLOCKS: u32 = 16;

/// Single-extent files only.
pub const MAX_FILE_SIZE: u64 = u32::MAX as u64;

/// Longest name whose directory record still fits in 255 bytes.
const MAX_NAME_LEN: usize = 147;

/// 2024-01-01T00:00:00Z
const FIXED_TIMESTAMP: i64 = 1_704_067_200;

const RR_ID: &[u8] = b"RRIP_1991A";
const RR_DESCRIPTOR: &[u8] =
    b"THE ROCK RIDGE INTERCHANGE PROTOCOL PROVIDES SUPPORT FOR POSIX FILE SYSTEM SEMANTICS";
const RR_SOURCE: &[u8] = b"SEE PUBLISHER IDENTIFIER";

const DIR_MODE: u32 = 0o040755;
const FILE_MODE: u32 = 0o100755;

/// What to finalize the volume with.
#[derive(Debug, Clone)]
pub struct IsoOptions<'a> {
    pub volume_id: &'a str,
    /// Path (real names) of the El Torito no-emulation EFI image.
    pub boot_image: Option<&'a str>,
    /// Size of the whole image in 2048-byte blocks.
    pub volume_blocks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoSummary {
    pub used_blocks: u32,
    pub boot_catalog_lba: Option<u32>,
    pub boot_image_lba: Option<u32>,
}

/// ISO filesystem under construction.
pub struct IsoWriter {
    spool: HostDir,
}

impl IsoWriter {
    pub fn new(spool_dir: &Path) -> Result<Self> {
        Ok(Self {
            spool: HostDir::new(spool_dir)?,
        })
    }

    /// Write the volume into `out`, starting at offset 0.
    pub fn finalize<W: Write + Seek>(self, out: &mut W, options: &IsoOptions<'_>) -> Result<IsoSummary> {
        let mut tree = Tree::scan(self.spool.root())?;
        let plan = tree.layout(options)?;
        if u64::from(plan.used_blocks) > options.volume_blocks {
            return Err(ConfigError::Invalid(format!(
                "ISO content needs {} blocks but the image only has {}",
                plan.used_blocks, options.volume_blocks
            ))
            .into());
        }
        tree.write(out, options, &plan)?;
        debug!(
            "ISO volume {}: {} of {} blocks used",
            options.volume_id, plan.used_blocks, options.volume_blocks
        );
        Ok(IsoSummary {
            used_blocks: plan.used_blocks,
            boot_catalog_lba: plan.boot_catalog_lba,
            boot_image_lba: plan.boot_image.map(|n| tree.nodes[n].extent),
        })
    }
}

impl TargetFs for IsoWriter {
    fn create_dir(&mut self, path: &str) -> Result<()> {
        self.spool.create_dir(path)
    }

    fn create_file(&mut self, path: &str) -> Result<Box<dyn Write + '_>> {
        self.spool.create_file(path)
    }
}

enum Kind {
    Dir { children: Vec<usize> },
    File { src: PathBuf },
}

struct Node {
    name: String,
    ident: Vec<u8>,
    parent: usize,
    kind: Kind,
    extent: u32,
    /// File length, or directory extent length.
    size: u64,
}

impl Node {
    fn is_dir(&self) -> bool {
        matches!(self.kind, Kind::Dir { .. })
    }

    fn children(&self) -> &[usize] {
        match &self.kind {
            Kind::Dir { children } => children,
            Kind::File { .. } => &[],
        }
    }
}

struct Plan {
    /// Directories in path-table order.
    dirs: Vec<usize>,
    boot_record_lba: Option<u32>,
    terminator_lba: u32,
    boot_catalog_lba: Option<u32>,
    boot_image: Option<usize>,
    path_table_size: u32,
    path_table_l_lba: u32,
    path_table_m_lba: u32,
    used_blocks: u32,
}

struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn scan(root: &Path) -> Result<Self> {
        let mut tree = Tree {
            nodes: vec![Node {
                name: String::new(),
                ident: vec![0],
                parent: 0,
                kind: Kind::Dir {
                    children: Vec::new(),
                },
                extent: 0,
                size: 0,
            }],
        };
        tree.scan_dir(root, 0)?;
        Ok(tree)
    }

    fn scan_dir(&mut self, dir: &Path, idx: usize) -> Result<()> {
        let mut entries = fs::read_dir(dir)
            .with_context(|| format!("Failed to read {}", dir.display()))?
            .collect::<io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());

        let mut taken = BTreeSet::new();
        let mut children = Vec::new();
        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.len() > MAX_NAME_LEN {
                bail!("file name `{name}` is too long for an ISO directory record");
            }
            let path = entry.path();
            let md = fs::metadata(&path)?;
            let child = self.nodes.len();
            let ident = unique_ident(&name, md.is_dir(), &mut taken);
            if md.is_dir() {
                self.nodes.push(Node {
                    name,
                    ident,
                    parent: idx,
                    kind: Kind::Dir {
                        children: Vec::new(),
                    },
                    extent: 0,
                    size: 0,
                });
                self.scan_dir(&path, child)?;
            } else {
                if md.len() > MAX_FILE_SIZE {
                    bail!(
                        "{} is {} bytes; ISO files must be smaller than 4 GiB",
                        path.display(),
                        md.len()
                    );
                }
                self.nodes.push(Node {
                    name,
                    ident,
                    parent: idx,
                    kind: Kind::File { src: path },
                    extent: 0,
                    size: md.len(),
                });
            }
            children.push(child);
        }

        children.sort_by(|a, b| self.nodes[*a].ident.cmp(&self.nodes[*b].ident));
        if let Kind::Dir { children: slot } = &mut self.nodes[idx].kind {
            *slot = children;
        }
        Ok(())
    }

    /// Find a node by its real, `/`-separated path.
    fn lookup(&self, path: &str) -> Option<usize> {
        let mut cur = 0;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            cur = *self.nodes[cur]
                .children()
                .iter()
                .find(|c| self.nodes[**c].name == part)?;
        }
        Some(cur)
    }

    fn dir_order(&self) -> Vec<usize> {
        let mut order = vec![0];
        let mut i = 0;
        while i < order.len() {
            let n = order[i];
            order.extend(
                self.nodes[n]
                    .children()
                    .iter()
                    .copied()
                    .filter(|c| self.nodes[*c].is_dir()),
            );
            i += 1;
        }
        order
    }

    fn layout(&mut self, options: &IsoOptions<'_>) -> Result<Plan> {
        let boot_image = match options.boot_image {
            Some(path) => match self.lookup(path) {
                Some(n) if !self.nodes[n].is_dir() => Some(n),
                _ => return Err(IntegrityError::MissingBootImage(path.to_string()).into()),
            },
            None => None,
        };

        let mut next = SYSTEM_AREA_BLOCKS + 1;
        let boot_record_lba = boot_image.map(|_| {
            next += 1;
            next - 1
        });
        let terminator_lba = next;
        next += 1;
        let boot_catalog_lba = boot_image.map(|_| {
            next += 1;
            next - 1
        });

        let dirs = self.dir_order();
        let path_table_size = self.path_table(&dirs, false).len() as u32;
        let pt_blocks = blocks(u64::from(path_table_size));
        let path_table_l_lba = next;
        next += pt_blocks;
        let path_table_m_lba = next;
        next += pt_blocks;

        // Record lengths do not depend on extents, so sizes can be settled
        // before any extent is assigned.
        for &d in &dirs {
            self.nodes[d].size = pack(&self.dir_records(d)?).len() as u64;
        }
        for &d in &dirs {
            self.nodes[d].extent = next;
            next += blocks(self.nodes[d].size);
        }
        for i in 0..self.nodes.len() {
            if self.nodes[i].is_dir() {
                continue;
            }
            if self.nodes[i].size == 0 {
                continue;
            }
            self.nodes[i].extent = next;
            next += blocks(self.nodes[i].size);
        }

        Ok(Plan {
            dirs,
            boot_record_lba,
            terminator_lba,
            boot_catalog_lba,
            boot_image,
            path_table_size,
            path_table_l_lba,
            path_table_m_lba,
            used_blocks: next,
        })
    }

    fn write<W: Write + Seek>(&self, out: &mut W, options: &IsoOptions<'_>, plan: &Plan) -> Result<()> {
        write_block(out, SYSTEM_AREA_BLOCKS, &self.primary_descriptor(options, plan))?;
        if let (Some(lba), Some(catalog)) = (plan.boot_record_lba, plan.boot_catalog_lba) {
            write_block(out, lba, &boot_record(catalog))?;
        }
        write_block(out, plan.terminator_lba, &terminator())?;
        if let (Some(lba), Some(image)) = (plan.boot_catalog_lba, plan.boot_image) {
            let node = &self.nodes[image];
            write_block(out, lba, &boot_catalog(node.extent, node.size))?;
        }
        write_block(out, plan.path_table_l_lba, &self.path_table(&plan.dirs, false))?;
        write_block(out, plan.path_table_m_lba, &self.path_table(&plan.dirs, true))?;

        for &d in &plan.dirs {
            write_block(out, self.nodes[d].extent, &pack(&self.dir_records(d)?))?;
        }
        for node in &self.nodes {
            if let Kind::File { src } = &node.kind {
                if node.size == 0 {
                    continue;
                }
                out.seek(SeekFrom::Start(u64::from(node.extent) * BLOCK_SIZE))?;
                let mut input =
                    File::open(src).with_context(|| format!("Failed to open {}", src.display()))?;
                let n = io::copy(&mut input, out)?;
                if n != node.size {
                    bail!("{} changed size while writing the ISO", src.display());
                }
            }
        }
        out.flush()?;
        Ok(())
    }

    fn dir_records(&self, d: usize) -> Result<Vec<Vec<u8>>> {
        let node = &self.nodes[d];
        let parent = &self.nodes[node.parent];
        let px_dir = rr_px(DIR_MODE, 2);

        let mut dot_su = Vec::new();
        if d == 0 {
            dot_su.extend(rr_sp());
            dot_su.extend(&px_dir);
            dot_su.extend(rr_er());
        } else {
            dot_su.extend(&px_dir);
        }

        let mut records = vec![
            dir_record(&[0], node.extent, node.size, true, &dot_su)?,
            dir_record(&[1], parent.extent, parent.size, true, &px_dir)?,
        ];
        for &c in node.children() {
            let child = &self.nodes[c];
            let mut su = if child.is_dir() {
                rr_px(DIR_MODE, 2)
            } else {
                rr_px(FILE_MODE, 1)
            };
            su.extend(rr_nm(&child.name));
            records.push(dir_record(&child.ident, child.extent, child.size, child.is_dir(), &su)?);
        }
        Ok(records)
    }

    fn path_table(&self, dirs: &[usize], big_endian: bool) -> Vec<u8> {
        let mut number = vec![0u16; self.nodes.len()];
        for (i, &d) in dirs.iter().enumerate() {
            number[d] = (i + 1) as u16;
        }
        let mut buf = Vec::new();
        for &d in dirs {
            let node = &self.nodes[d];
            buf.push(node.ident.len() as u8);
            buf.push(0);
            let parent = number[node.parent];
            if big_endian {
                buf.extend(node.extent.to_be_bytes());
                buf.extend(parent.to_be_bytes());
            } else {
                buf.extend(node.extent.to_le_bytes());
                buf.extend(parent.to_le_bytes());
            }
            buf.extend(&node.ident);
            if node.ident.len() % 2 == 1 {
                buf.push(0);
            }
        }
        buf
    }

    fn primary_descriptor(&self, options: &IsoOptions<'_>, plan: &Plan) -> Vec<u8> {
        let mut d = vec![0u8; BLOCK_SIZE as usize];
        d[0] = 1;
        d[1..6].copy_from_slice(b"CD001");
        d[6] = 1;
        d[8..40].copy_from_slice(&padded(b"LINUX", 32));
        d[40..72].copy_from_slice(&padded(&d_chars(options.volume_id, 32), 32));
        let volume_blocks = u32::try_from(options.volume_blocks).unwrap_or(u32::MAX);
        d[80..88].copy_from_slice(&both32(volume_blocks));
        d[120..124].copy_from_slice(&both16(1));
        d[124..128].copy_from_slice(&both16(1));
        d[128..132].copy_from_slice(&both16(BLOCK_SIZE as u16));
        d[132..140].copy_from_slice(&both32(plan.path_table_size));
        d[140..144].copy_from_slice(&plan.path_table_l_lba.to_le_bytes());
        d[148..152].copy_from_slice(&plan.path_table_m_lba.to_be_bytes());

        let root = &self.nodes[0];
        let root_record = encode_record(&[0], root.extent, root.size, true, &[]);
        d[156..190].copy_from_slice(&root_record);

        d[190..318].copy_from_slice(&padded(b"", 128));
        d[318..446].copy_from_slice(&padded(b"", 128));
        d[446..574].copy_from_slice(&padded(b"", 128));
        d[574..702].copy_from_slice(&padded(b"FAB-INSTALLER", 128));
        d[702..813].copy_from_slice(&padded(b"", 111));
        let stamp = dec_datetime(fixed_time());
        d[813..830].copy_from_slice(&stamp);
        d[830..847].copy_from_slice(&stamp);
        d[847..864].copy_from_slice(&dec_datetime_unset());
        d[864..881].copy_from_slice(&stamp);
        d[881] = 1;
        d
    }
}

/// Level 2 identifier for `name`, unique among `taken`.
fn unique_ident(name: &str, is_dir: bool, taken: &mut BTreeSet<Vec<u8>>) -> Vec<u8> {
    let (stem, ext) = match name.rsplit_once('.') {
        Some((s, e)) if !is_dir && !s.is_empty() => (s, e),
        _ => (name, ""),
    };
    let ext = d_chars(ext, 8);
    let stem_max = if is_dir { 31 } else { 30 - 1 - ext.len() };
    let stem = d_chars(stem, stem_max);

    for n in 0u32.. {
        let stem = if n == 0 {
            stem.clone()
        } else {
            let suffix = n.to_string();
            let keep = stem.len().min(stem_max - suffix.len());
            let mut s = stem[..keep].to_vec();
            s.extend(suffix.bytes());
            s
        };
        let mut ident = stem;
        if !is_dir {
            ident.push(b'.');
            ident.extend(&ext);
            ident.extend(b";1");
        }
        if taken.insert(ident.clone()) {
            return ident;
        }
    }
    unreachable!("identifier space exhausted")
}

/// Uppercase d-characters (`A-Z0-9_`), at most `max` bytes.
fn d_chars(s: &str, max: usize) -> Vec<u8> {
    s.bytes()
        .map(|b| match b.to_ascii_uppercase() {
            c @ (b'A'..=b'Z' | b'0'..=b'9' | b'_') => c,
            _ => b'_',
        })
        .take(max)
        .collect()
}

fn dir_record(ident: &[u8], extent: u32, size: u64, is_dir: bool, su: &[u8]) -> Result<Vec<u8>> {
    let rec = encode_record(ident, extent, size, is_dir, su);
    if rec.len() > 255 {
        bail!(
            "directory record for {} is {} bytes long",
            String::from_utf8_lossy(ident),
            rec.len()
        );
    }
    Ok(rec)
}

fn encode_record(ident: &[u8], extent: u32, size: u64, is_dir: bool, su: &[u8]) -> Vec<u8> {
    let mut rec = vec![0u8; 33];
    rec[2..10].copy_from_slice(&both32(extent));
    rec[10..18].copy_from_slice(&both32(size as u32));
    rec[18..25].copy_from_slice(&record_datetime(fixed_time()));
    rec[25] = if is_dir { 0x02 } else { 0x00 };
    rec[28..32].copy_from_slice(&both16(1));
    rec[32] = ident.len() as u8;
    rec.extend(ident);
    if ident.len() % 2 == 0 {
        rec.push(0);
    }
    rec.extend(su);
    if rec.len() % 2 == 1 {
        rec.push(0);
    }
    rec[0] = rec.len().min(255) as u8;
    rec
}

/// Concatenate records into sectors; a record never crosses a sector end.
fn pack(records: &[Vec<u8>]) -> Vec<u8> {
    let block = BLOCK_SIZE as usize;
    let mut buf = Vec::new();
    for rec in records {
        let used = buf.len() % block;
        if used + rec.len() > block {
            buf.resize(buf.len() + block - used, 0);
        }
        buf.extend(rec);
    }
    let rem = buf.len() % block;
    if rem != 0 || buf.is_empty() {
        buf.resize(buf.len() + block - rem, 0);
    }
    buf
}

fn rr_sp() -> Vec<u8> {
    vec![b'S', b'P', 7, 1, 0xBE, 0xEF, 0]
}

fn rr_er() -> Vec<u8> {
    let mut e = vec![
        b'E',
        b'R',
        (8 + RR_ID.len() + RR_DESCRIPTOR.len() + RR_SOURCE.len()) as u8,
        1,
        RR_ID.len() as u8,
        RR_DESCRIPTOR.len() as u8,
        RR_SOURCE.len() as u8,
        1,
    ];
    e.extend(RR_ID);
    e.extend(RR_DESCRIPTOR);
    e.extend(RR_SOURCE);
    e
}

fn rr_px(mode: u32, links: u32) -> Vec<u8> {
    let mut e = vec![b'P', b'X', 36, 1];
    e.extend(both32(mode));
    e.extend(both32(links));
    e.extend(both32(0));
    e.extend(both32(0));
    e
}

fn rr_nm(name: &str) -> Vec<u8> {
    let mut e = vec![b'N', b'M', (5 + name.len()) as u8, 1, 0];
    e.extend(name.as_bytes());
    e
}

fn boot_record(catalog_lba: u32) -> Vec<u8> {
    let mut d = vec![0u8; BLOCK_SIZE as usize];
    d[0] = 0;
    d[1..6].copy_from_slice(b"CD001");
    d[6] = 1;
    let id = b"EL TORITO SPECIFICATION";
    d[7..7 + id.len()].copy_from_slice(id);
    d[71..75].copy_from_slice(&catalog_lba.to_le_bytes());
    d
}

fn terminator() -> Vec<u8> {
    let mut d = vec![0u8; BLOCK_SIZE as usize];
    d[0] = 255;
    d[1..6].copy_from_slice(b"CD001");
    d[6] = 1;
    d
}

/// Validation entry (EFI platform) plus a bootable no-emulation default entry.
fn boot_catalog(image_lba: u32, image_size: u64) -> Vec<u8> {
    let mut c = vec![0u8; BLOCK_SIZE as usize];
    c[0] = 0x01;
    c[1] = 0xEF;
    c[30] = 0x55;
    c[31] = 0xAA;
    let sum = c[..32]
        .chunks_exact(2)
        .fold(0u16, |acc, w| acc.wrapping_add(u16::from_le_bytes([w[0], w[1]])));
    c[28..30].copy_from_slice(&0u16.wrapping_sub(sum).to_le_bytes());

    let e = &mut c[32..64];
    e[0] = 0x88;
    e[1] = 0x00;
    let sectors = image_size.div_ceil(512).min(u64::from(u16::MAX)) as u16;
    e[6..8].copy_from_slice(&sectors.to_le_bytes());
    e[8..12].copy_from_slice(&image_lba.to_le_bytes());
    c
}

fn fixed_time() -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(FIXED_TIMESTAMP)
}

fn record_datetime(t: OffsetDateTime) -> [u8; 7] {
    [
        (t.year() - 1900) as u8,
        u8::from(t.month()),
        t.day(),
        t.hour(),
        t.minute(),
        t.second(),
        0,
    ]
}

fn dec_datetime(t: OffsetDateTime) -> [u8; 17] {
    let s = format!(
        "{:04}{:02}{:02}{:02}{:02}{:02}00",
        t.year(),
        u8::from(t.month()),
        t.day(),
        t.hour(),
        t.minute(),
        t.second()
    );
    let mut out = [0u8; 17];
    out[..16].copy_from_slice(s.as_bytes());
    out
}

fn dec_datetime_unset() -> [u8; 17] {
    let mut out = [b'0'; 17];
    out[16] = 0;
    out
}

fn padded(s: &[u8], len: usize) -> Vec<u8> {
    let mut v = s[..s.len().min(len)].to_vec();
    v.resize(len, b' ');
    v
}

fn both16(v: u16) -> [u8; 4] {
    let mut b = [0u8; 4];
    b[..2].copy_from_slice(&v.to_le_bytes());
    b[2..].copy_from_slice(&v.to_be_bytes());
    b
}

fn both32(v: u32) -> [u8; 8] {
    let mut b = [0u8; 8];
    b[..4].copy_from_slice(&v.to_le_bytes());
    b[4..].copy_from_slice(&v.to_be_bytes());
    b
}

fn blocks(bytes: u64) -> u32 {
    bytes.div_ceil(BLOCK_SIZE) as u32
}

fn write_block<W: Write + Seek>(out: &mut W, lba: u32, data: &[u8]) -> Result<()> {
    out.seek(SeekFrom::Start(u64::from(lba) * BLOCK_SIZE))?;
    out.write_all(data)?;
    Ok(())
}

/// Read-side helpers shared by the unit tests of this crate.
#[cfg(test)]
pub(crate) mod reader {
    use super::BLOCK_SIZE;
    use std::collections::BTreeMap;

    pub struct Volume<'a> {
        pub image: &'a [u8],
    }

    #[derive(Debug)]
    pub struct Record {
        pub ident: Vec<u8>,
        pub name: Option<String>,
        pub extent: u32,
        pub size: u32,
        pub is_dir: bool,
        pub system_use: Vec<u8>,
    }

    impl<'a> Volume<'a> {
        pub fn new(image: &'a [u8]) -> Self {
            Self { image }
        }

        pub fn block(&self, lba: u32) -> &'a [u8] {
            let start = lba as usize * BLOCK_SIZE as usize;
            &self.image[start..start + BLOCK_SIZE as usize]
        }

        pub fn pvd(&self) -> &'a [u8] {
            self.block(16)
        }

        pub fn volume_id(&self) -> String {
            String::from_utf8_lossy(&self.pvd()[40..72]).trim_end().to_string()
        }

        pub fn volume_blocks(&self) -> u32 {
            let p = self.pvd();
            u32::from_le_bytes([p[80], p[81], p[82], p[83]])
        }

        pub fn root(&self) -> Record {
            parse_record(&self.pvd()[156..190])
        }

        pub fn records(&self, dir: &Record) -> Vec<Record> {
            let start = dir.extent as usize * BLOCK_SIZE as usize;
            let data = &self.image[start..start + dir.size as usize];
            let mut out = Vec::new();
            let mut off = 0;
            while off < data.len() {
                let len = data[off] as usize;
                if len == 0 {
                    off = (off / BLOCK_SIZE as usize + 1) * BLOCK_SIZE as usize;
                    continue;
                }
                out.push(parse_record(&data[off..off + len]));
                off += len;
            }
            out
        }

        /// Every file by Rock Ridge path, plus the set of directories.
        pub fn walk(&self) -> (BTreeMap<String, Vec<u8>>, Vec<String>) {
            let mut files = BTreeMap::new();
            let mut dirs = Vec::new();
            let mut stack = vec![(String::new(), self.root())];
            while let Some((prefix, dir)) = stack.pop() {
                for rec in self.records(&dir).into_iter().skip(2) {
                    let name = rec.name.clone().unwrap_or_default();
                    let path = if prefix.is_empty() {
                        name
                    } else {
                        format!("{prefix}/{name}")
                    };
                    if rec.is_dir {
                        dirs.push(path.clone());
                        stack.push((path, rec));
                    } else {
                        let start = rec.extent as usize * BLOCK_SIZE as usize;
                        files.insert(path, self.image[start..start + rec.size as usize].to_vec());
                    }
                }
            }
            dirs.sort();
            (files, dirs)
        }
    }

    pub fn parse_record(r: &[u8]) -> Record {
        let ident_len = r[32] as usize;
        let ident = r[33..33 + ident_len].to_vec();
        let mut su_start = 33 + ident_len;
        if ident_len % 2 == 0 {
            su_start += 1;
        }
        let system_use = r[su_start.min(r.len())..].to_vec();
        Record {
            name: nm_name(&system_use),
            ident,
            extent: u32::from_le_bytes([r[2], r[3], r[4], r[5]]),
            size: u32::from_le_bytes([r[10], r[11], r[12], r[13]]),
            is_dir: r[25] & 0x02 != 0,
            system_use,
        }
    }

    fn nm_name(su: &[u8]) -> Option<String> {
        let mut off = 0;
        while off + 4 <= su.len() {
            let len = su[off + 2] as usize;
            if len < 4 {
                break;
            }
            if &su[off..off + 2] == b"NM" {
                return Some(String::from_utf8_lossy(&su[off + 5..off + len]).into_owned());
            }
            off += len;
        }
        None
    }
}
