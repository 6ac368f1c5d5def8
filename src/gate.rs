//! Build hash gate.
//!
//! A build is skipped when the digest persisted next to the outputs equals
//! the digest of the current inputs and every output of the mode is on
//! disk. Anything else means: remove everything, rebuild, then persist.
//!
//! The digest is written last and removed first, so an interrupted build can
//! never be mistaken for a complete one.

use crate::config::{FabConfig, ImageConfig, NodeConfig, Versions, Wiring};
use crate::fsutil;
use crate::target::{BuildMode, OutputLayout};
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use tracing::{debug, warn};

/// Version string mixed into every fingerprint.
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything that decides what a build produces.
#[derive(Debug, Clone)]
pub struct FingerprintInputs<'a> {
    pub tool_version: &'a str,
    /// The whole fab document; every payload stages a copy of it.
    pub fab: &'a FabConfig,
    pub node: &'a NodeConfig,
    pub wiring: &'a Wiring,
    pub versions: &'a Versions,
    /// Partition sizes; only image modes depend on them.
    pub image: &'a ImageConfig,
    pub mode: BuildMode,
}

/// Hex-encoded SHA-256 build digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw digest bytes, used to seed reproducible identifiers.
    pub fn bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        if let Ok(raw) = hex::decode(&self.0) {
            let n = raw.len().min(32);
            out[..n].copy_from_slice(&raw[..n]);
        }
        out
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash the inputs in a fixed order. Each field is length-prefixed so
/// adjacent fields can never run into each other.
pub fn fingerprint(inputs: &FingerprintInputs<'_>) -> Result<Fingerprint> {
    let mut hasher = Sha256::new();
    let mut field = |bytes: &[u8]| {
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    };

    field(inputs.tool_version.as_bytes());
    field(&inputs.fab.canonical().context("Failed to encode fab config")?);
    field(&inputs.node.canonical().context("Failed to encode node config")?);
    field(&inputs.wiring.canonical().context("Failed to encode wiring")?);
    field(&serde_json::to_vec(inputs.versions).context("Failed to encode versions")?);
    match inputs.mode {
        BuildMode::Manual => field(&[]),
        BuildMode::Usb | BuildMode::Iso => {
            field(&serde_json::to_vec(inputs.image).context("Failed to encode image config")?)
        }
    }
    field(inputs.mode.as_str().as_bytes());

    Ok(Fingerprint(hex::encode(hasher.finalize())))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    UpToDate,
    Rebuild,
}

/// Gate for the outputs of one build target.
pub struct BuildGate<'a> {
    layout: &'a OutputLayout,
    mode: BuildMode,
}

impl<'a> BuildGate<'a> {
    pub fn new(layout: &'a OutputLayout, mode: BuildMode) -> Self {
        Self { layout, mode }
    }

    pub fn check(&self, current: &Fingerprint) -> GateDecision {
        let digest_path = self.layout.fingerprint();
        let stored = match fs::read_to_string(&digest_path) {
            Ok(s) => s,
            Err(_) => {
                debug!("No stored digest at {}", digest_path.display());
                return GateDecision::Rebuild;
            }
        };
        if stored.trim() != current.as_str() {
            debug!("Digest changed for {}", self.layout.stem());
            return GateDecision::Rebuild;
        }
        for output in self.layout.expected_outputs(self.mode) {
            if !output.exists() {
                debug!("Missing output {}", output.display());
                return GateDecision::Rebuild;
            }
        }
        GateDecision::UpToDate
    }

    /// Remove the digest, then every output of every mode, the work dir,
    /// and temporaries an interrupted build left next to any of them.
    pub fn clean(&self) -> Result<()> {
        let digest = self.layout.fingerprint();
        fsutil::remove_path(&digest)?;
        let mut stale = fsutil::remove_tmp_siblings(&digest)?;
        for output in self.layout.all_outputs() {
            fsutil::remove_path(&output)?;
            stale += fsutil::remove_tmp_siblings(&output)?;
        }
        if stale > 0 {
            debug!("Removed {stale} stale temporaries of {}", self.layout.stem());
        }
        Ok(())
    }

    pub fn persist(&self, current: &Fingerprint) -> Result<()> {
        for output in self.layout.expected_outputs(self.mode) {
            if !output.exists() {
                warn!("Not persisting digest: {} is missing", output.display());
                anyhow::bail!("output {} was not produced", output.display());
            }
        }
        fsutil::write_atomic(&self.layout.fingerprint(), current.as_str().as_bytes())
    }
}
