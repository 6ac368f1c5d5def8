//! Build targets and the file names derived from them.
//!
//! Every generated file of a build lives in one output directory and is
//! prefixed with `<kind>--<name>--install`, so builds for different nodes
//! never collide.

use crate::error::ConfigError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Role of the node being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Control,
    Node,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Control => "control",
            NodeKind::Node => "node",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "control" => Ok(NodeKind::Control),
            "node" => Ok(NodeKind::Node),
            other => Err(ConfigError::UnknownKind(other.to_string())),
        }
    }
}

/// Output flavour of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    /// Compressed archive plus a standalone boot-config.
    Manual,
    /// Raw GPT disk image with two FAT32 partitions.
    Usb,
    /// ISO9660 image with an El Torito EFI entry.
    Iso,
}

impl BuildMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildMode::Manual => "manual",
            BuildMode::Usb => "usb",
            BuildMode::Iso => "iso",
        }
    }
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(BuildMode::Manual),
            "usb" => Ok(BuildMode::Usb),
            "iso" => Ok(BuildMode::Iso),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

/// One installable unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildTarget {
    pub kind: NodeKind,
    pub name: String,
    pub mode: BuildMode,
}

impl BuildTarget {
    pub fn new(kind: NodeKind, name: impl Into<String>, mode: BuildMode) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self { kind, name, mode })
    }

    /// `<kind>--<name>--install`
    pub fn stem(&self) -> String {
        format!("{}--{}--install", self.kind, self.name)
    }

    pub fn layout(&self, output_dir: &Path) -> OutputLayout {
        OutputLayout {
            dir: output_dir.to_path_buf(),
            stem: self.stem(),
        }
    }
}

impl fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.kind, self.name, self.mode)
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !name.starts_with('.');
    if !valid {
        return Err(ConfigError::Invalid(format!(
            "node name `{name}` must be a non-empty [A-Za-z0-9._-] segment"
        ))
        .into());
    }
    Ok(())
}

/// Paths of every file a build of one target may produce.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    dir: PathBuf,
    stem: String,
}

impl OutputLayout {
    pub fn output_dir(&self) -> &Path {
        &self.dir
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    /// Staging directory.
    pub fn staging_dir(&self) -> PathBuf {
        self.dir.join(&self.stem)
    }

    /// Scratch directory used while building disk images.
    pub fn work_dir(&self) -> PathBuf {
        self.with_suffix("-work")
    }

    pub fn archive(&self) -> PathBuf {
        self.with_suffix(".tgz")
    }

    pub fn boot_config(&self) -> PathBuf {
        self.with_suffix(".ign")
    }

    pub fn usb_image(&self) -> PathBuf {
        self.with_suffix("-usb.img")
    }

    pub fn iso_image(&self) -> PathBuf {
        self.with_suffix("-usb.iso")
    }

    pub fn fingerprint(&self) -> PathBuf {
        self.with_suffix(".inhash")
    }

    /// Outputs that must all exist for a build in `mode` to count as complete.
    pub fn expected_outputs(&self, mode: BuildMode) -> Vec<PathBuf> {
        match mode {
            BuildMode::Manual => vec![self.staging_dir(), self.archive(), self.boot_config()],
            BuildMode::Usb => vec![self.usb_image()],
            BuildMode::Iso => vec![self.iso_image()],
        }
    }

    /// Every output any mode could have left behind, plus the work directory.
    pub fn all_outputs(&self) -> Vec<PathBuf> {
        vec![
            self.staging_dir(),
            self.archive(),
            self.boot_config(),
            self.usb_image(),
            self.iso_image(),
            self.work_dir(),
        ]
    }

    fn with_suffix(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}{}", self.stem, suffix))
    }
}
