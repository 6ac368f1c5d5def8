//! Boot-config generation.
//!
//! The installed OS is configured on first boot by an Ignition document.
//! Callers only see [`BootConfigGenerator`], which turns a node description
//! into opaque bytes.

use crate::config::{ClusterConfig, Interface, NodeConfig};
use anyhow::Result;
use base64::Engine;
use serde_json::{json, Value};

/// Volume label of the install media (USB data partition and ISO volume).
pub const INSTALL_MEDIA_LABEL: &str = "FABINSTALL";

/// Where the install media is mounted on first boot.
pub const INSTALL_MOUNT: &str = "/mnt/fab-install";

pub const IGNITION_VERSION: &str = "3.3.0";

/// Inputs of one boot-config.
#[derive(Debug, Clone)]
pub struct BootConfigRequest<'a> {
    pub cluster: &'a ClusterConfig,
    pub node: &'a NodeConfig,
    /// Absolute path of the staged installer tree on the booted system.
    /// When set, first boot runs the installer from there unattended.
    pub auto_install: Option<String>,
}

pub trait BootConfigGenerator {
    fn generate(&self, request: &BootConfigRequest<'_>) -> Result<Vec<u8>>;
}

/// Renders Ignition v3.3 JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnitionGenerator;

impl BootConfigGenerator for IgnitionGenerator {
    fn generate(&self, request: &BootConfigRequest<'_>) -> Result<Vec<u8>> {
        let node = request.node;

        let mut files = vec![file("/etc/hostname", 0o644, node.name.as_bytes())];
        for (name, iface) in [("10-management", &node.management), ("20-external", &node.external)] {
            if let Some(unit) = network_unit(iface, &node.dns) {
                files.push(file(
                    &format!("/etc/systemd/network/{name}.network"),
                    0o644,
                    unit.as_bytes(),
                ));
            }
        }

        let users: Vec<Value> = request
            .cluster
            .users
            .iter()
            .map(|u| {
                let mut user = json!({
                    "name": u.name,
                    "sshAuthorizedKeys": u.ssh_keys,
                });
                if let Some(hash) = &u.password_hash {
                    user["passwordHash"] = json!(hash);
                }
                user
            })
            .collect();

        let mut units = Vec::new();
        if let Some(path) = &request.auto_install {
            units.push(json!({
                "name": mount_unit_name(INSTALL_MOUNT),
                "enabled": true,
                "contents": mount_unit(),
            }));
            units.push(json!({
                "name": "fab-install.service",
                "enabled": true,
                "contents": install_unit(path),
            }));
        }

        let doc = json!({
            "ignition": { "version": IGNITION_VERSION },
            "passwd": { "users": users },
            "storage": { "files": files },
            "systemd": { "units": units },
        });
        Ok(serde_json::to_vec_pretty(&doc)?)
    }
}

fn file(path: &str, mode: u32, content: &[u8]) -> Value {
    let encoded = base64::engine::general_purpose::STANDARD.encode(content);
    json!({
        "path": path,
        "mode": mode,
        "overwrite": true,
        "contents": { "source": format!("data:;base64,{encoded}") },
    })
}

/// systemd-networkd unit for a statically addressed interface.
fn network_unit(iface: &Interface, dns: &[String]) -> Option<String> {
    let name = iface.interface.as_deref()?;
    let ip = iface.ip.as_deref()?;
    let mut unit = format!("[Match]\nName={name}\n\n[Network]\nAddress={ip}\n");
    if let Some(gw) = &iface.gateway {
        unit.push_str(&format!("Gateway={gw}\n"));
    }
    for server in dns {
        unit.push_str(&format!("DNS={server}\n"));
    }
    Some(unit)
}

/// systemd unit name for a mount point: `/mnt/fab-install` is
/// `mnt-fab\x2dinstall.mount`.
fn mount_unit_name(path: &str) -> String {
    let escaped: Vec<String> = path
        .trim_matches('/')
        .split('/')
        .map(|part| {
            part.chars()
                .map(|c| match c {
                    'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '.' => c.to_string(),
                    other => format!("\\x{:02x}", other as u32),
                })
                .collect()
        })
        .collect();
    format!("{}.mount", escaped.join("-"))
}

fn mount_unit() -> String {
    format!(
        "[Unit]\nDescription=Fabric install media\n\n[Mount]\nWhat=/dev/disk/by-label/{INSTALL_MEDIA_LABEL}\nWhere={INSTALL_MOUNT}\nOptions=ro\n\n[Install]\nWantedBy=multi-user.target\n"
    )
}

fn install_unit(path: &str) -> String {
    let mount = mount_unit_name(INSTALL_MOUNT);
    format!(
        "[Unit]\nDescription=Fabric installer\nRequires={mount}\nAfter={mount} network-online.target\nWants=network-online.target\n\n[Service]\nType=oneshot\nRemainAfterExit=yes\nExecStart={path}/fab-installer install --path {path}\n\n[Install]\nWantedBy=multi-user.target\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FabConfig;
    use crate::testutil::FAB_YAML;

    fn decode(source: &str) -> String {
        let data = source.strip_prefix("data:;base64,").unwrap();
        String::from_utf8(
            base64::engine::general_purpose::STANDARD
                .decode(data)
                .unwrap(),
        )
        .unwrap()
    }

    fn render(auto_install: Option<String>) -> Value {
        let fab = FabConfig::from_yaml(FAB_YAML).unwrap();
        let bytes = IgnitionGenerator
            .generate(&BootConfigRequest {
                cluster: &fab.cluster,
                node: &fab.control[0],
                auto_install,
            })
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn renders_identity_and_network() {
        let doc = render(None);
        assert_eq!(doc["ignition"]["version"], "3.3.0");
        assert_eq!(doc["passwd"]["users"][0]["name"], "core");
        assert_eq!(
            doc["passwd"]["users"][0]["sshAuthorizedKeys"][0],
            "ssh-ed25519 AAAAC3Nza test@lab"
        );

        let files = doc["storage"]["files"].as_array().unwrap();
        assert_eq!(files[0]["path"], "/etc/hostname");
        assert_eq!(decode(files[0]["contents"]["source"].as_str().unwrap()), "node-a");

        let external = files
            .iter()
            .find(|f| f["path"] == "/etc/systemd/network/20-external.network")
            .unwrap();
        let unit = decode(external["contents"]["source"].as_str().unwrap());
        assert!(unit.contains("Name=enp2s0"));
        assert!(unit.contains("Address=10.0.0.5/24"));
        assert!(unit.contains("Gateway=10.0.0.1"));
        assert!(unit.contains("DNS=1.1.1.1"));

        assert!(doc["systemd"]["units"].as_array().unwrap().is_empty());
    }

    #[test]
    fn auto_install_adds_mount_and_service() {
        let doc = render(Some("/mnt/fab-install/control--node-a--install".to_string()));
        let units = doc["systemd"]["units"].as_array().unwrap();
        assert_eq!(units[0]["name"], "mnt-fab\\x2dinstall.mount");
        assert!(units[0]["contents"]
            .as_str()
            .unwrap()
            .contains("What=/dev/disk/by-label/FABINSTALL"));
        assert!(units[1]["contents"].as_str().unwrap().contains(
            "ExecStart=/mnt/fab-install/control--node-a--install/fab-installer install --path /mnt/fab-install/control--node-a--install"
        ));
    }

    #[test]
    fn dns_does_not_depend_on_a_gateway() {
        let doc = render(None);
        let management = doc["storage"]["files"]
            .as_array()
            .unwrap()
            .iter()
            .find(|f| f["path"] == "/etc/systemd/network/10-management.network")
            .unwrap();
        let unit = decode(management["contents"]["source"].as_str().unwrap());
        assert!(unit.contains("Address=172.30.0.5/21"), "{unit}");
        assert!(!unit.contains("Gateway="), "{unit}");
        assert!(unit.contains("DNS=1.1.1.1"), "{unit}");
    }

    #[test]
    fn output_is_deterministic() {
        assert_eq!(render(None), render(None));
    }
}
