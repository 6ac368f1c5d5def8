//! Top-level build pipeline.
//!
//! One [`Builder`] owns the configuration and the shared artifact cache and
//! builds any number of targets, one at a time:
//!
//! ```text
//! fingerprint -> gate-check -> clean -> assemble -> archive + boot-config (manual)
//!                    |                           -> image (usb, iso)
//!                    +-> up to date                 -> persist-fingerprint
//! ```

use crate::assemble::{self, AssembleInputs};
use crate::bootcfg::{BootConfigGenerator, BootConfigRequest, IgnitionGenerator};
use crate::cache::{ArtifactCache, Cancel};
use crate::config::{BuilderConfig, FabConfig, NodeConfig, Versions, Wiring};
use crate::disk::{self, layout::ImageGeometry, ImageRequest};
use crate::fsutil;
use crate::gate::{self, BuildGate, Fingerprint, FingerprintInputs, GateDecision, TOOL_VERSION};
use crate::output;
use crate::target::{BuildMode, BuildTarget, NodeKind, OutputLayout};
use anyhow::{Context, Result};
use std::fs;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of a successful [`Builder::build`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    /// Outputs were (re)generated.
    Built,
    /// Stored digest matched and every output was present.
    UpToDate,
}

pub struct Builder {
    config: BuilderConfig,
    fab: FabConfig,
    wiring: Wiring,
    versions: Versions,
    cache: Arc<ArtifactCache>,
    boot_config: Box<dyn BootConfigGenerator>,
    installer: Option<Vec<u8>>,
    cancel: Cancel,
}

impl Builder {
    pub fn new(
        config: BuilderConfig,
        fab: FabConfig,
        wiring: Wiring,
        cache: Arc<ArtifactCache>,
    ) -> Self {
        let versions = config.versions();
        Self {
            config,
            fab,
            wiring,
            versions,
            cache,
            boot_config: Box::new(IgnitionGenerator),
            installer: None,
            cancel: Cancel::new(),
        }
    }

    /// Embed these bytes as the installer instead of the running executable.
    pub fn with_installer(mut self, installer: Vec<u8>) -> Self {
        self.installer = Some(installer);
        self
    }

    pub fn with_boot_config(mut self, generator: Box<dyn BootConfigGenerator>) -> Self {
        self.boot_config = generator;
        self
    }

    /// Handle that aborts the running build at the next step or transfer.
    pub fn cancel_handle(&self) -> Cancel {
        self.cancel.clone()
    }

    /// Every target described in the fab config, control nodes first.
    pub fn targets(&self, mode: BuildMode) -> Result<Vec<BuildTarget>> {
        let control = self.fab.control.iter().map(|n| (NodeKind::Control, n));
        let nodes = self.fab.nodes.iter().map(|n| (NodeKind::Node, n));
        control
            .chain(nodes)
            .map(|(kind, node)| BuildTarget::new(kind, node.name.clone(), mode))
            .collect()
    }

    pub fn build(&self, target: &BuildTarget) -> Result<BuildOutcome> {
        let layout = target.layout(&self.config.output_dir);
        let gate = BuildGate::new(&layout, target.mode);

        let (node, current) = self.step(target, "fingerprint", || {
            let node = self.fab.node(target.kind, &target.name)?;
            let fp = gate::fingerprint(&FingerprintInputs {
                tool_version: TOOL_VERSION,
                fab: &self.fab,
                node,
                wiring: &self.wiring,
                versions: &self.versions,
                image: &self.config.image,
                mode: target.mode,
            })?;
            debug!("[{target}] fingerprint {fp}");
            Ok((node, fp))
        })?;

        let decision = self.step(target, "gate-check", || Ok(gate.check(&current)))?;
        if decision == GateDecision::UpToDate {
            info!("[{target}] up to date, skipping");
            return Ok(BuildOutcome::UpToDate);
        }

        self.step(target, "clean", || {
            gate.clean()?;
            fs::create_dir_all(layout.output_dir()).with_context(|| {
                format!("Failed to create {}", layout.output_dir().display())
            })
        })?;

        self.step(target, "assemble", || self.assemble(target, &layout))?;

        match target.mode {
            BuildMode::Manual => {
                self.step(target, "archive", || {
                    output::write_archive(&layout.staging_dir(), &layout.archive())
                })?;
                self.step(target, "boot-config", || {
                    let blob = self.boot_config.generate(&BootConfigRequest {
                        cluster: &self.fab.cluster,
                        node,
                        auto_install: None,
                    })?;
                    fsutil::write_atomic(&layout.boot_config(), &blob)
                })?;
            }
            BuildMode::Usb | BuildMode::Iso => {
                self.step(target, "image", || self.image(target, &layout, node, &current))?;
            }
        }

        self.step(target, "persist-fingerprint", || gate.persist(&current))?;
        info!("[{target}] built into {}", layout.output_dir().display());
        Ok(BuildOutcome::Built)
    }

    fn step<T>(&self, target: &BuildTarget, name: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        debug!("[{target}] step {name}");
        self.cancel
            .check()
            .map_err(anyhow::Error::from)
            .and_then(|()| f())
            .with_context(|| format!("step `{name}` failed for {target}"))
    }

    fn assemble(&self, target: &BuildTarget, layout: &OutputLayout) -> Result<()> {
        let current_exe;
        let installer = match &self.installer {
            Some(bytes) => bytes.as_slice(),
            None => {
                let exe = std::env::current_exe().context("Failed to locate installer binary")?;
                current_exe = fs::read(&exe)
                    .with_context(|| format!("Failed to read {}", exe.display()))?;
                current_exe.as_slice()
            }
        };
        let ops = assemble::plan(&AssembleInputs {
            target,
            fab: &self.fab,
            wiring: &self.wiring,
            versions: &self.versions,
            installer,
        })?;
        assemble::execute(&ops, &layout.staging_dir(), &self.cache, &self.cancel)
    }

    fn image(
        &self,
        target: &BuildTarget,
        layout: &OutputLayout,
        node: &NodeConfig,
        fingerprint: &Fingerprint,
    ) -> Result<()> {
        disk::build_image(ImageRequest {
            target,
            layout,
            cluster: &self.fab.cluster,
            node,
            versions: &self.versions,
            geometry: ImageGeometry::from_config(&self.config.image)?,
            fingerprint,
            cache: &self.cache,
            boot_config: &*self.boot_config,
            cancel: &self.cancel,
        })?;
        Ok(())
    }
}
