//! Archive output for `manual` builds.

use crate::fsutil;
use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::path::Path;
use tracing::info;

/// Pack `staging` into a gzip-compressed tar at `dest`.
///
/// Entries are rooted at the staging directory's own name, so unpacking
/// recreates `<kind>--<name>--install/`. The archive is written under a
/// temporary name and renamed into place when complete.
pub fn write_archive(staging: &Path, dest: &Path) -> Result<()> {
    let prefix = staging
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = fsutil::tmp_sibling(dest);

    let result = (|| -> Result<()> {
        let out =
            File::create(&tmp).with_context(|| format!("Failed to create {}", tmp.display()))?;
        // Rebuilds are frequent; favour speed over ratio.
        let encoder = GzEncoder::new(out, Compression::fast());
        let mut builder = tar::Builder::new(encoder);
        fsutil::append_dir_deterministic(&mut builder, staging, &prefix)?;
        let encoder = builder
            .into_inner()
            .context("Failed to finalize tar stream")?;
        let out = encoder.finish().context("Failed to finish gzip stream")?;
        out.sync_all()?;
        fsutil::commit(&tmp, dest)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result?;

    let size = fs::metadata(dest).map(|m| m.len()).unwrap_or(0);
    info!("Wrote {} ({} bytes)", dest.display(), size);
    Ok(())
}
