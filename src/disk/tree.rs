//! Copying host directory trees into image filesystems.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Minimal write interface of a filesystem under construction.
///
/// Paths are `/`-separated and relative to the filesystem root.
pub trait TargetFs {
    /// Create a directory. Creating an existing directory is not an error;
    /// the parent must exist.
    fn create_dir(&mut self, path: &str) -> Result<()>;

    /// Create (or truncate) a file and return a writer for its content.
    fn create_file(&mut self, path: &str) -> Result<Box<dyn Write + '_>>;
}

/// A plain directory on the host.
#[derive(Debug, Clone)]
pub struct HostDir {
    root: PathBuf,
}

impl HostDir {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl TargetFs for HostDir {
    fn create_dir(&mut self, path: &str) -> Result<()> {
        let dir = self.root.join(path);
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))
    }

    fn create_file(&mut self, path: &str) -> Result<Box<dyn Write + '_>> {
        let file = self.root.join(path);
        let f = File::create(&file).with_context(|| format!("Failed to create {}", file.display()))?;
        Ok(Box::new(f))
    }
}

/// Counts of what [`copy_tree`] created.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CopyStats {
    pub dirs: usize,
    pub files: usize,
    pub bytes: u64,
}

/// Copy `src` (a file or a directory) into `dst` under `dest`.
///
/// A directory's contents land under `dest`, which is created first. A file
/// is written to `dest`; when `dest` is empty (the root), the file's own
/// name is used instead.
pub fn copy_tree(src: &Path, dst: &mut dyn TargetFs, dest: &str) -> Result<CopyStats> {
    let dest = dest.trim_matches('/');
    let mut stats = CopyStats::default();
    let md = fs::metadata(src).with_context(|| format!("Failed to stat {}", src.display()))?;

    if md.is_file() {
        let name = if dest.is_empty() {
            file_name(src)?
        } else {
            ensure_parents(dst, dest, &mut stats)?;
            dest.to_string()
        };
        stats.bytes += copy_file(src, dst, &name)?;
        stats.files += 1;
        return Ok(stats);
    }

    if !dest.is_empty() {
        ensure_parents(dst, dest, &mut stats)?;
        dst.create_dir(dest)
            .with_context(|| format!("Failed to create directory {dest}"))?;
        stats.dirs += 1;
    }

    for entry in WalkDir::new(src)
        .min_depth(1)
        .follow_links(true)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("{} escaped {}", entry.path().display(), src.display()))?;
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let target = if dest.is_empty() {
            rel
        } else {
            format!("{dest}/{rel}")
        };

        if entry.file_type().is_dir() {
            dst.create_dir(&target)
                .with_context(|| format!("Failed to create directory {target}"))?;
            stats.dirs += 1;
        } else {
            stats.bytes += copy_file(entry.path(), dst, &target)?;
            stats.files += 1;
        }
    }
    Ok(stats)
}

fn copy_file(src: &Path, dst: &mut dyn TargetFs, dest: &str) -> Result<u64> {
    let mut input = File::open(src).with_context(|| format!("Failed to open {}", src.display()))?;
    let mut out = dst
        .create_file(dest)
        .with_context(|| format!("Failed to create {dest}"))?;
    let n = io::copy(&mut input, &mut out)
        .with_context(|| format!("Failed to copy {} to {dest}", src.display()))?;
    out.flush()
        .with_context(|| format!("Failed to flush {dest}"))?;
    Ok(n)
}

/// Create every ancestor directory of `path`.
fn ensure_parents(dst: &mut dyn TargetFs, path: &str, stats: &mut CopyStats) -> Result<()> {
    let parts: Vec<&str> = path.split('/').collect();
    for i in 1..parts.len() {
        let dir = parts[..i].join("/");
        dst.create_dir(&dir)
            .with_context(|| format!("Failed to create directory {dir}"))?;
        stats.dirs += 1;
    }
    Ok(())
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("EFI/BOOT")).unwrap();
        fs::create_dir_all(root.join("empty")).unwrap();
        fs::write(root.join("EFI/BOOT/BOOTX64.EFI"), vec![7u8; 10_000]).unwrap();
        fs::write(root.join("EFI/BOOT/grub.cfg"), "menuentry").unwrap();
        fs::write(root.join("top.txt"), "top").unwrap();
    }

    #[test]
    fn copies_directory_under_prefix() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        sample_tree(&src);
        let mut dst = HostDir::new(tmp.path().join("dst")).unwrap();

        let stats = copy_tree(&src, &mut dst, "payload").unwrap();
        assert_eq!(stats.files, 3);
        assert_eq!(stats.dirs, 4);
        assert_eq!(stats.bytes, 10_000 + 9 + 3);
        let out = dst.root().join("payload");
        assert_eq!(fs::read(out.join("EFI/BOOT/BOOTX64.EFI")).unwrap(), vec![7u8; 10_000]);
        assert!(out.join("empty").is_dir());
    }

    #[test]
    fn file_at_root_keeps_its_name() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("vmlinuz");
        fs::write(&src, "kernel").unwrap();
        let mut dst = HostDir::new(tmp.path().join("dst")).unwrap();

        copy_tree(&src, &mut dst, "").unwrap();
        copy_tree(&src, &mut dst, "/").unwrap();
        copy_tree(&src, &mut dst, "boot/linux").unwrap();
        assert_eq!(fs::read_to_string(dst.root().join("vmlinuz")).unwrap(), "kernel");
        assert_eq!(fs::read_to_string(dst.root().join("boot/linux")).unwrap(), "kernel");
    }
}
