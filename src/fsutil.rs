//! Filesystem helpers shared by the cache, the assembler and the outputs.
//!
//! The central primitive is [`commit`]: build something under a temporary
//! name next to its destination, then rename it into place. Both the artifact
//! cache and every build output rely on it, so a crash never leaves a
//! half-written file or directory under its final name.

use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

/// Temporary sibling path for `dst`: `.<file name>.tmp-<pid>-<nanos>`.
pub fn tmp_sibling(dst: &Path) -> PathBuf {
    let name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "out".to_string());
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    dst.with_file_name(format!(".{name}.tmp-{}-{nanos}", std::process::id()))
}

/// Atomically move a fully written file or directory from `tmp` to `dst`.
///
/// Both paths must be on the same filesystem. An existing directory at `dst`
/// is never replaced: the rename fails and the error is returned.
pub fn commit(tmp: &Path, dst: &Path) -> Result<()> {
    if tmp.is_dir() && dst.exists() {
        bail!(
            "Refusing to replace existing {} with {}",
            dst.display(),
            tmp.display()
        );
    }
    fs::rename(tmp, dst)
        .with_context(|| format!("Failed to rename {} to {}", tmp.display(), dst.display()))
}

/// Write `contents` to `path` through a temporary sibling and [`commit`].
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = tmp_sibling(path);
    let result = (|| {
        let mut f =
            File::create(&tmp).with_context(|| format!("Failed to create {}", tmp.display()))?;
        f.write_all(contents)?;
        f.sync_all()?;
        commit(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Remove a file or directory tree if it exists.
pub fn remove_path(path: &Path) -> Result<()> {
    let md = match fs::symlink_metadata(path) {
        Ok(md) => md,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("Failed to stat {}", path.display())),
    };
    if md.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
    .with_context(|| format!("Failed to remove {}", path.display()))
}

/// Remove temporaries [`tmp_sibling`] created for `dst` that were left
/// behind by a process that died before committing. Returns how many.
pub fn remove_tmp_siblings(dst: &Path) -> Result<usize> {
    let (Some(dir), Some(name)) = (dst.parent(), dst.file_name()) else {
        return Ok(0);
    };
    let prefix = format!(".{}.tmp-", name.to_string_lossy());
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", dir.display())),
    };
    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            remove_path(&entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Copy the tree under `src` into `dst`. Symlinks are recreated, not followed.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("Failed to create {}", dst.display()))?;
    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("{} escaped {}", entry.path().display(), src.display()))?;
        let target = dst.join(rel);
        let kind = entry.file_type();
        if kind.is_symlink() {
            let link = fs::read_link(entry.path())?;
            remove_path(&target)?;
            std::os::unix::fs::symlink(&link, &target)
                .with_context(|| format!("Failed to link {}", target.display()))?;
        } else if kind.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
        } else {
            fs::copy(entry.path(), &target).with_context(|| {
                format!("Failed to copy {} to {}", entry.path().display(), target.display())
            })?;
        }
    }
    Ok(())
}

/// Set unix permission bits on `path`.
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to chmod {:o} {}", mode, path.display()))
}

/// Append `src_dir` to a tar builder in a reproducible way.
///
/// Entries are sorted by relative path, prefixed with `prefix` (if not
/// empty), and carry zero mtime/uid/gid so equal trees give equal archives.
pub fn append_dir_deterministic<W: Write>(
    builder: &mut tar::Builder<W>,
    src_dir: &Path,
    prefix: &str,
) -> Result<()> {
    let mut entries: Vec<PathBuf> = WalkDir::new(src_dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to walk {}", src_dir.display()))?
        .into_iter()
        .map(|e| e.into_path())
        .collect();
    entries.sort_by(|a, b| {
        let ra = a.strip_prefix(src_dir).unwrap_or(a).to_string_lossy();
        let rb = b.strip_prefix(src_dir).unwrap_or(b).to_string_lossy();
        ra.cmp(&rb)
    });

    for p in entries {
        let rel = p
            .strip_prefix(src_dir)
            .unwrap_or(&p)
            .to_string_lossy()
            .replace('\\', "/");
        let name = match (prefix.is_empty(), rel.is_empty()) {
            (_, true) if prefix.is_empty() => continue,
            (_, true) => prefix.to_string(),
            (true, false) => rel,
            (false, false) => format!("{prefix}/{rel}"),
        };

        let md = fs::symlink_metadata(&p)?;
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        {
            use std::os::unix::fs::PermissionsExt;
            header.set_mode(md.permissions().mode() & 0o7777);
        }

        if md.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            builder.append_data(&mut header, &name, std::io::empty())?;
        } else if md.file_type().is_symlink() {
            let target = fs::read_link(&p)?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_link_name(&target)?;
            builder.append_data(&mut header, &name, std::io::empty())?;
        } else if md.is_file() {
            let mut f = File::open(&p)?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(md.len());
            builder.append_data(&mut header, &name, &mut f)?;
        }
    }
    Ok(())
}

/// Pack `src_dir` into a deterministic `tar.zst` at `out_path`.
pub fn create_tar_zst(src_dir: &Path, out_path: &Path) -> Result<()> {
    let out = File::create(out_path)
        .with_context(|| format!("Failed to create {}", out_path.display()))?;
    let encoder = zstd::stream::Encoder::new(out, 3)?;
    let mut builder = tar::Builder::new(encoder);
    append_dir_deterministic(&mut builder, src_dir, "")?;
    let encoder = builder
        .into_inner()
        .with_context(|| "Failed to finalize tar builder")?;
    let out = encoder.finish()?;
    out.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn copies_tree_and_keeps_symlinks() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("config");
        let dst = temp.path().join("staged/fabric-config");

        fs::create_dir_all(src.join("charts")).unwrap();
        fs::write(src.join("defaults.yaml"), "a: 1\n").unwrap();
        fs::write(src.join("charts/fabric.tgz"), "chart").unwrap();
        std::os::unix::fs::symlink("defaults.yaml", src.join("current.yaml")).unwrap();

        copy_dir_recursive(&src, &dst).unwrap();
        // A second copy over an existing tree replaces links instead of failing.
        copy_dir_recursive(&src, &dst).unwrap();

        assert_eq!(fs::read_to_string(dst.join("charts/fabric.tgz")).unwrap(), "chart");
        assert!(dst.join("current.yaml").is_symlink());
        assert_eq!(
            fs::read_link(dst.join("current.yaml")).unwrap(),
            Path::new("defaults.yaml")
        );
    }

    #[test]
    fn stale_temporaries_are_swept() {
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("control--a--install-usb.img");
        fs::write(temp.path().join(".control--a--install-usb.img.tmp-4242-1"), "old").unwrap();
        fs::create_dir_all(tmp_sibling(&image)).unwrap();
        let other = temp.path().join(".control--a--install-usb.iso.tmp-4242-1");
        fs::write(&other, "other output").unwrap();
        fs::write(&image, "final").unwrap();

        assert_eq!(remove_tmp_siblings(&image).unwrap(), 2);
        assert!(image.exists());
        assert!(other.exists());
        assert_eq!(remove_tmp_siblings(&temp.path().join("missing/x")).unwrap(), 0);
    }

    #[test]
    fn commit_moves_directory_into_place() {
        let temp = TempDir::new().unwrap();
        let dst = temp.path().join("entry");
        let tmp = tmp_sibling(&dst);
        fs::create_dir_all(&tmp).unwrap();
        fs::write(tmp.join("f"), "x").unwrap();

        commit(&tmp, &dst).unwrap();
        assert!(!tmp.exists());
        assert_eq!(fs::read_to_string(dst.join("f")).unwrap(), "x");
    }

    #[test]
    fn commit_never_replaces_a_directory() {
        let temp = TempDir::new().unwrap();
        let dst = temp.path().join("entry");
        fs::create_dir_all(&dst).unwrap();
        let tmp = tmp_sibling(&dst);
        fs::create_dir_all(&tmp).unwrap();

        assert!(commit(&tmp, &dst).is_err());
        assert!(tmp.exists());
    }

    #[test]
    fn write_atomic_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("digest");
        write_atomic(&path, b"abc").unwrap();
        write_atomic(&path, b"def").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"def");
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[test]
    fn tar_zst_is_reproducible() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("b")).unwrap();
        fs::write(src.join("a.txt"), "a").unwrap();
        fs::write(src.join("b/c.txt"), "c").unwrap();

        let one = temp.path().join("one.tar.zst");
        let two = temp.path().join("two.tar.zst");
        create_tar_zst(&src, &one).unwrap();
        create_tar_zst(&src, &two).unwrap();
        assert_eq!(fs::read(&one).unwrap(), fs::read(&two).unwrap());

        let decoder = zstd::stream::Decoder::new(File::open(&one).unwrap()).unwrap();
        let mut archive = tar::Archive::new(decoder);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| {
                e.unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .trim_end_matches('/')
                    .to_string()
            })
            .collect();
        assert_eq!(names, vec!["a.txt", "b", "b/c.txt"]);
    }

    #[test]
    fn remove_path_handles_missing_files_and_dirs() {
        let temp = TempDir::new().unwrap();
        remove_path(&temp.path().join("nope")).unwrap();
        let d = temp.path().join("d");
        fs::create_dir_all(d.join("x")).unwrap();
        remove_path(&d).unwrap();
        assert!(!d.exists());
    }
}
