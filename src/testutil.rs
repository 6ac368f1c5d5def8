//! Shared fixtures for unit tests.

use crate::cache::{ArtifactRef, Cancel, Registry};
use crate::config::*;
use anyhow::{bail, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const FAB_YAML: &str = r#"
cluster:
  name: lab
  users:
    - name: core
      ssh_keys: ["ssh-ed25519 AAAAC3Nza test@lab"]
control:
  - name: node-a
    disk: /dev/disk/by-path/pci-0000:00:05.0
    management: { ip: 172.30.0.5/21, interface: enp2s1 }
    external: { ip: 10.0.0.5/24, interface: enp2s0, gateway: 10.0.0.1 }
    dns: [1.1.1.1]
nodes:
  - name: worker-1
    disk: /dev/sda
    management: { ip: 172.30.0.6/21, interface: enp2s1 }
    external: { ip: 10.0.0.6/24, interface: enp2s0, gateway: 10.0.0.1 }
"#;

pub const WIRING_YAML: &str = r#"
apiVersion: wiring.githedgehog.com/v1beta1
kind: Switch
metadata:
  name: leaf-01
spec:
  role: server-leaf
---
apiVersion: wiring.githedgehog.com/v1beta1
kind: Server
metadata:
  name: server-01
"#;

/// In-memory registry: artifact name to a list of `(relative path, bytes)`.
///
/// Every version of an artifact name has the same content.
#[derive(Default)]
pub struct FakeRegistry {
    files: BTreeMap<String, Vec<(String, Vec<u8>)>>,
    pulls: AtomicUsize,
    fail_mid_download: bool,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, artifact: &str, path: &str, content: &[u8]) -> Self {
        self.files
            .entry(artifact.to_string())
            .or_default()
            .push((path.to_string(), content.to_vec()));
        self
    }

    /// Write the first file of each pull, then fail.
    pub fn failing_mid_download(mut self) -> Self {
        self.fail_mid_download = true;
        self
    }

    /// Number of pulls that reached the registry.
    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    /// Everything a control and a worker build needs.
    pub fn complete() -> Self {
        Self::new()
            .with_file(ART_K3S, "k3s", b"k3s binary")
            .with_file(ART_K3S, "k3s-install.sh", b"#!/bin/sh\necho k3s\n")
            .with_file(ART_K3S, "k3s-airgap-images-amd64.tar.gz", b"k3s images")
            .with_file(ART_ZOT, "zot-airgap-images-amd64.tar.gz", b"zot images")
            .with_file(ART_ZOT, "zot-chart.tgz", b"zot chart")
            .with_file(ART_HELM, "helm", b"helm binary")
            .with_file(ART_K9S, "k9s", b"k9s binary")
            .with_file(ART_CERT_MANAGER, "cert-manager-airgap-images-amd64.tar.gz", b"cm images")
            .with_file(ART_CERT_MANAGER, "cert-manager-chart.tgz", b"cm chart")
            .with_file(ART_FABRIC_CONFIG, "config/defaults.yaml", b"defaults: {}\n")
            .with_file(ART_KUBECTL_FABRIC, "kubectl-fabric", b"kubectl plugin")
            .with_file(ART_NODE_AGENT, "node-agent", b"node agent")
            .with_file(ART_OS_BOOT, "EFI/BOOT/BOOTX64.EFI", b"shim")
            .with_file(ART_OS_BOOT, "EFI/BOOT/grub.cfg", b"set timeout=1\n")
            .with_file(ART_OS_BOOT, "images/efiboot.img", &[0xEB; 4096])
            .with_file(ART_OS_BOOT, "vmlinuz", b"kernel")
            .with_file(ART_OS_BOOT, "initrd.img", b"initrd")
            .with_file(ART_OS_IMAGE, "os-image.bin.gz", b"base os image")
            .with_file(ART_FABRIC_IMAGES, "images.tar", b"fabric images")
            .with_file(ART_FABRIC_CHARTS, "charts.tar", b"fabric charts")
            .with_file(ART_GATEWAY, "gateway.tar", b"gateway images")
            .with_file(ART_ALLOY, "alloy.tar", b"alloy images")
            .with_file(ART_NTP, "ntp.tar", b"ntp images")
    }
}

impl Registry for FakeRegistry {
    fn pull(&self, artifact: &ArtifactRef, dest: &Path, cancel: &Cancel) -> Result<()> {
        cancel.check()?;
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let Some(files) = self.files.get(&artifact.name) else {
            bail!("manifest unknown: {artifact}");
        };
        for (i, (path, content)) in files.iter().enumerate() {
            if self.fail_mid_download && i == 1 {
                bail!("connection reset while downloading {path}");
            }
            let target = dest.join(path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, content)?;
        }
        Ok(())
    }
}
