//! Payload assembler.
//!
//! A build target's staging tree is described as a flat list of [`StageOp`]s
//! (what to put where) and materialized by [`execute`]. Planning never
//! touches the disk or the network, so plans can be inspected and tested on
//! their own.
//!
//! Staged layout:
//!
//! ```text
//! <kind>--<name>--install/
//!   install.yaml        kind, name, mode, tool version
//!   fab-installer       installer binary (0755)
//!   fab.yaml            cluster + node configuration
//!   wiring.yaml         topology documents
//!   k3s, helm, ...      per-kind dependencies
//!   airgap/*.tar.zst    airgap bundles, airgapped clusters only
//! ```

use crate::cache::{ArtifactCache, ArtifactRef, Cancel, FileSelector};
use crate::config::*;
use crate::error::ConfigError;
use crate::fsutil;
use crate::gate::TOOL_VERSION;
use crate::target::{BuildTarget, NodeKind};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path};
use tracing::{debug, info};

pub const INSTALL_RECORD: &str = "install.yaml";
pub const INSTALLER_BINARY: &str = "fab-installer";
pub const FAB_CONFIG_FILE: &str = "fab.yaml";
pub const WIRING_FILE: &str = "wiring.yaml";
pub const AIRGAP_DIR: &str = "airgap";

/// Upper bound on airgap bundles per build.
pub const MAX_AIRGAP_BUNDLES: usize = 64;

/// Self-describing record consumed by the installer on the target machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRecord {
    pub kind: NodeKind,
    pub name: String,
    pub mode: crate::target::BuildMode,
    pub version: String,
}

/// One staging operation. Paths are relative to the staging directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOp {
    /// Write a text file (0644).
    WriteFile { path: String, content: String },

    /// Write raw bytes with a specific mode.
    WriteBytes {
        path: String,
        content: Vec<u8>,
        mode: u32,
    },

    /// Copy selected files of a cached artifact into `dest`.
    CopyArtifact {
        artifact: ArtifactRef,
        dest: String,
        selectors: Vec<FileSelector>,
    },

    /// Pack a whole artifact as `airgap/<name>@<version>.tar.zst`.
    AirgapBundle { artifact: ArtifactRef },
}

impl StageOp {
    fn describe(&self) -> String {
        match self {
            StageOp::WriteFile { path, .. } | StageOp::WriteBytes { path, .. } => {
                format!("write {path}")
            }
            StageOp::CopyArtifact { artifact, .. } => format!("copy {artifact}"),
            StageOp::AirgapBundle { artifact } => format!("bundle {artifact}"),
        }
    }
}

/// Inputs of one assembly.
pub struct AssembleInputs<'a> {
    pub target: &'a BuildTarget,
    pub fab: &'a FabConfig,
    pub wiring: &'a Wiring,
    pub versions: &'a Versions,
    /// Bytes of the installer binary to embed.
    pub installer: &'a [u8],
}

/// Compute the staging plan for a target.
pub fn plan(inputs: &AssembleInputs<'_>) -> Result<Vec<StageOp>> {
    let target = inputs.target;
    // The node must exist before anything is staged for it.
    inputs.fab.node(target.kind, &target.name)?;

    let record = InstallRecord {
        kind: target.kind,
        name: target.name.clone(),
        mode: target.mode,
        version: TOOL_VERSION.to_string(),
    };

    let mut ops = vec![
        StageOp::WriteFile {
            path: INSTALL_RECORD.to_string(),
            content: serde_yaml::to_string(&record)?,
        },
        StageOp::WriteBytes {
            path: INSTALLER_BINARY.to_string(),
            content: inputs.installer.to_vec(),
            mode: 0o755,
        },
        StageOp::WriteFile {
            path: FAB_CONFIG_FILE.to_string(),
            content: inputs.fab.to_yaml()?,
        },
        StageOp::WriteFile {
            path: WIRING_FILE.to_string(),
            content: inputs.wiring.to_yaml()?,
        },
    ];

    for (name, selectors) in dependencies(target.kind) {
        ops.push(StageOp::CopyArtifact {
            artifact: inputs.versions.artifact(name)?,
            dest: String::new(),
            selectors,
        });
    }

    let airgap = inputs.fab.airgap_artifacts(inputs.versions)?;
    if airgap.len() > MAX_AIRGAP_BUNDLES {
        return Err(ConfigError::Invalid(format!(
            "{} airgap bundles requested, at most {MAX_AIRGAP_BUNDLES} are supported",
            airgap.len()
        ))
        .into());
    }
    ops.extend(
        airgap
            .into_iter()
            .map(|artifact| StageOp::AirgapBundle { artifact }),
    );

    Ok(ops)
}

/// Artifacts copied into the staging tree for each node kind.
fn dependencies(kind: NodeKind) -> Vec<(&'static str, Vec<FileSelector>)> {
    match kind {
        NodeKind::Control => vec![
            (
                ART_K3S,
                vec![
                    FileSelector::exec("k3s"),
                    FileSelector::exec("k3s-install.sh"),
                    FileSelector::file("k3s-airgap-images-amd64.tar.gz"),
                ],
            ),
            (
                ART_ZOT,
                vec![
                    FileSelector::file("zot-airgap-images-amd64.tar.gz"),
                    FileSelector::file("zot-chart.tgz"),
                ],
            ),
            (ART_HELM, vec![FileSelector::exec("helm")]),
            (ART_K9S, vec![FileSelector::exec("k9s")]),
            (
                ART_CERT_MANAGER,
                vec![
                    FileSelector::file("cert-manager-airgap-images-amd64.tar.gz"),
                    FileSelector::file("cert-manager-chart.tgz"),
                ],
            ),
            (
                ART_FABRIC_CONFIG,
                vec![FileSelector::file("config").to("fabric-config")],
            ),
            (ART_KUBECTL_FABRIC, vec![FileSelector::exec("kubectl-fabric")]),
        ],
        NodeKind::Node => vec![
            (
                ART_K3S,
                vec![
                    FileSelector::exec("k3s"),
                    FileSelector::exec("k3s-install.sh"),
                ],
            ),
            (ART_NODE_AGENT, vec![FileSelector::exec("node-agent")]),
        ],
    }
}

/// Create a fresh `staging` directory and run `ops` into it, in order.
///
/// Stops at the first failing op; the partial tree is left for the gate to
/// remove on the next build.
pub fn execute(
    ops: &[StageOp],
    staging: &Path,
    cache: &ArtifactCache,
    cancel: &Cancel,
) -> Result<()> {
    fsutil::remove_path(staging)?;
    fs::create_dir_all(staging)
        .with_context(|| format!("Failed to create {}", staging.display()))?;

    for op in ops {
        cancel.check()?;
        debug!("Staging: {}", op.describe());
        run_op(op, staging, cache, cancel).with_context(|| op.describe())?;
    }
    info!("Staged {} operations into {}", ops.len(), staging.display());
    Ok(())
}

fn run_op(op: &StageOp, staging: &Path, cache: &ArtifactCache, cancel: &Cancel) -> Result<()> {
    match op {
        StageOp::WriteFile { path, content } => {
            let dst = staged_path(staging, path)?;
            ensure_parent(&dst)?;
            fs::write(&dst, content)?;
            fsutil::set_mode(&dst, 0o644)
        }
        StageOp::WriteBytes {
            path,
            content,
            mode,
        } => {
            let dst = staged_path(staging, path)?;
            ensure_parent(&dst)?;
            fs::write(&dst, content)?;
            fsutil::set_mode(&dst, *mode)
        }
        StageOp::CopyArtifact {
            artifact,
            dest,
            selectors,
        } => {
            let dst = staged_path(staging, dest)?;
            cache.copy_into(&dst, artifact, selectors, cancel)
        }
        StageOp::AirgapBundle { artifact } => {
            let entry = cache.fetch(artifact, cancel)?;
            let dir = staging.join(AIRGAP_DIR);
            fs::create_dir_all(&dir)?;
            let out = dir.join(format!("{}.tar.zst", artifact.path_segment()));
            let tmp = fsutil::tmp_sibling(&out);
            let result =
                fsutil::create_tar_zst(&entry, &tmp).and_then(|()| fsutil::commit(&tmp, &out));
            if result.is_err() {
                let _ = fs::remove_file(&tmp);
            }
            result
        }
    }
}

/// Join a relative op path onto the staging dir, rejecting escapes.
fn staged_path(staging: &Path, rel: &str) -> Result<std::path::PathBuf> {
    let rel_path = Path::new(rel);
    if rel_path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        bail!("staging path `{rel}` must be relative and stay inside the staging dir");
    }
    Ok(staging.join(rel_path))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(())
}
