//! Configuration inputs.
//!
//! - [`BuilderConfig`]: where to cache, where to write, which registry, which
//!   artifact versions (`builder.toml`).
//! - [`FabConfig`]: the declarative cluster and node description (`fab.yaml`).
//! - [`Wiring`]: the topology document (`wiring.yaml`), opaque to this crate.
//!
//! Everything that feeds the build fingerprint has a canonical byte form that
//! does not depend on key order, comments or formatting of the source files.

use crate::cache::ArtifactRef;
use crate::error::ConfigError;
use crate::target::NodeKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Default builder config file name.
pub const BUILDER_CONFIG_FILE: &str = "builder.toml";

// Artifact names, resolved under the registry prefix.
pub const ART_K3S: &str = "fabricator/k3s-airgap";
pub const ART_ZOT: &str = "fabricator/zot-airgap";
pub const ART_HELM: &str = "fabricator/helm";
pub const ART_K9S: &str = "fabricator/k9s";
pub const ART_CERT_MANAGER: &str = "fabricator/cert-manager-airgap";
pub const ART_FABRIC_CONFIG: &str = "fabricator/fabric-config";
pub const ART_KUBECTL_FABRIC: &str = "fabricator/kubectl-fabric";
pub const ART_NODE_AGENT: &str = "fabricator/node-agent";
pub const ART_OS_BOOT: &str = "fabricator/os-boot";
pub const ART_OS_IMAGE: &str = "fabricator/os-image";
pub const ART_FABRIC_IMAGES: &str = "fabricator/fabric-images-airgap";
pub const ART_FABRIC_CHARTS: &str = "fabricator/fabric-charts-airgap";
pub const ART_ALLOY: &str = "fabricator/alloy-airgap";
pub const ART_GATEWAY: &str = "fabricator/gateway-airgap";
pub const ART_NTP: &str = "fabricator/ntp-airgap";

const DEFAULT_VERSIONS: &[(&str, &str)] = &[
    (ART_K3S, "v1.31.1-k3s1"),
    (ART_ZOT, "v2.1.1"),
    (ART_HELM, "v3.16.1"),
    (ART_K9S, "v0.32.5"),
    (ART_CERT_MANAGER, "v1.15.3"),
    (ART_FABRIC_CONFIG, "v0.50.0"),
    (ART_KUBECTL_FABRIC, "v0.50.0"),
    (ART_NODE_AGENT, "v0.50.0"),
    (ART_OS_BOOT, "3975.2.1"),
    (ART_OS_IMAGE, "3975.2.1"),
    (ART_FABRIC_IMAGES, "v0.50.0"),
    (ART_FABRIC_CHARTS, "v0.50.0"),
    (ART_ALLOY, "v1.4.2"),
    (ART_GATEWAY, "v0.50.0"),
    (ART_NTP, "v0.0.2"),
];

/// Airgap bundles every disconnected deployment needs.
pub const CORE_AIRGAP: &[&str] = &[ART_FABRIC_IMAGES, ART_FABRIC_CHARTS];

/// Optional subsystems and the airgap bundles each of them declares.
pub const SUBSYSTEMS: &[(&str, &[&str])] = &[
    ("observability", &[ART_ALLOY]),
    ("gateway", &[ART_GATEWAY]),
    ("ntp", &[ART_NTP]),
];

/// Settings of the builder itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuilderConfig {
    pub cache_dir: PathBuf,
    pub output_dir: PathBuf,
    pub registry: RegistryConfig,
    /// Version overrides, keyed by artifact name.
    pub versions: BTreeMap<String, String>,
    pub image: ImageConfig,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            cache_dir: dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("fab-installer"),
            output_dir: PathBuf::from("result"),
            registry: RegistryConfig::default(),
            versions: BTreeMap::new(),
            image: ImageConfig::default(),
        }
    }
}

impl BuilderConfig {
    /// Load `path`, or the defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let cfg: Self = toml::from_str(&content)
            .map_err(|e| ConfigError::Invalid(format!("{}: {e}", path.display())))?;
        Ok(cfg)
    }

    /// Effective version table: compiled-in defaults overlaid with overrides.
    pub fn versions(&self) -> Versions {
        let mut table: BTreeMap<String, String> = DEFAULT_VERSIONS
            .iter()
            .map(|(name, version)| (name.to_string(), version.to_string()))
            .collect();
        table.extend(self.versions.clone());
        Versions(table)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Registry host, optionally with a port.
    pub url: String,
    /// Repository prefix artifact names are resolved under.
    pub prefix: String,
    /// Talk plain HTTP instead of HTTPS.
    pub insecure: bool,
    /// Whole-request timeout in seconds, body transfer included.
    pub timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: "ghcr.io".to_string(),
            prefix: "githedgehog".to_string(),
            insecure: false,
            timeout_secs: 1800,
        }
    }
}

/// Partition sizes of generated disk images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImageConfig {
    pub esp_size_mib: u64,
    pub data_size_mib: u64,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            esp_size_mib: 500,
            data_size_mib: 6 * 1024,
        }
    }
}

/// Resolved artifact versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Versions(BTreeMap<String, String>);

impl Versions {
    pub fn artifact(&self, name: &str) -> Result<ArtifactRef> {
        let version = self.0.get(name).ok_or_else(|| {
            ConfigError::Invalid(format!("no version configured for artifact {name}"))
        })?;
        Ok(ArtifactRef::new(name, version.clone()))
    }
}

/// Declarative description of the cluster and all of its nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FabConfig {
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub control: Vec<NodeConfig>,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub name: String,
    /// Ship every container image and chart with the installer.
    #[serde(default)]
    pub airgap: bool,
    #[serde(default)]
    pub users: Vec<UserConfig>,
    /// Enabled optional subsystems.
    #[serde(default)]
    pub subsystems: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserConfig {
    pub name: String,
    #[serde(default)]
    pub ssh_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub name: String,
    /// Target install disk, e.g. `/dev/disk/by-path/pci-0000:00:05.0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<String>,
    #[serde(default)]
    pub management: Interface,
    #[serde(default)]
    pub external: Interface,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Interface {
    /// Address in CIDR notation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

impl FabConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Invalid {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(content)
            .map_err(|e| ConfigError::Invalid(format!("fab config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for node in self.control.iter().chain(self.nodes.iter()) {
            if !seen.insert(node.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "node name `{}` is used more than once",
                    node.name
                ))
                .into());
            }
        }
        for name in &self.cluster.subsystems {
            if !SUBSYSTEMS.iter().any(|(known, _)| known == name) {
                return Err(ConfigError::Invalid(format!("unknown subsystem `{name}`")).into());
            }
        }
        Ok(())
    }

    pub fn node(&self, kind: NodeKind, name: &str) -> Result<&NodeConfig> {
        let list = match kind {
            NodeKind::Control => &self.control,
            NodeKind::Node => &self.nodes,
        };
        list.iter().find(|n| n.name == name).ok_or_else(|| {
            ConfigError::Invalid(format!("no {kind} node named `{name}` in fab config")).into()
        })
    }

    /// Airgap bundles for the cluster: core bundles plus those declared by
    /// enabled subsystems, deduplicated, in a stable order.
    pub fn airgap_artifacts(&self, versions: &Versions) -> Result<Vec<ArtifactRef>> {
        if !self.cluster.airgap {
            return Ok(Vec::new());
        }
        let mut refs = BTreeSet::new();
        for name in CORE_AIRGAP {
            refs.insert(versions.artifact(name)?);
        }
        for (subsystem, artifacts) in SUBSYSTEMS {
            if !self.cluster.subsystems.contains(*subsystem) {
                continue;
            }
            for name in *artifacts {
                refs.insert(versions.artifact(name)?);
            }
        }
        Ok(refs.into_iter().collect())
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Canonical bytes of the whole document, as staged into every payload.
    pub fn canonical(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl NodeConfig {
    pub fn canonical(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Topology document, kept as a list of generic YAML documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Wiring {
    docs: Vec<serde_json::Value>,
}

impl Wiring {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Invalid {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let mut docs = Vec::new();
        for doc in serde_yaml::Deserializer::from_str(content) {
            let value = serde_yaml::Value::deserialize(doc)
                .map_err(|e| ConfigError::Invalid(format!("wiring: {e}")))?;
            if value.is_null() {
                continue;
            }
            // serde_json maps are ordered by key, which makes the form canonical.
            let value = serde_json::to_value(value)
                .map_err(|e| ConfigError::Invalid(format!("wiring: {e}")))?;
            docs.push(value);
        }
        Ok(Self { docs })
    }

    pub fn to_yaml(&self) -> Result<String> {
        let mut out = String::new();
        for doc in &self.docs {
            out.push_str("---\n");
            out.push_str(&serde_yaml::to_string(doc)?);
        }
        Ok(out)
    }

    pub fn canonical(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.docs)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const FAB_YAML: &str = r#"
cluster:
  name: lab
  users:
    - name: core
      ssh_keys: ["ssh-ed25519 AAAA test"]
control:
  - name: node-a
    disk: /dev/sda
    management: { ip: 172.30.0.5/21, interface: enp2s1 }
    external: { ip: 10.0.0.5/24, interface: enp2s0, gateway: 10.0.0.1 }
nodes:
  - name: worker-1
"#;

    #[test]
    fn builder_config_defaults_when_missing() {
        let tmp = TempDir::new().unwrap();
        let cfg = BuilderConfig::load(&tmp.path().join("missing.toml")).unwrap();
        assert_eq!(cfg.registry.url, "ghcr.io");
        assert_eq!(cfg.image.esp_size_mib, 500);
    }

    #[test]
    fn builder_config_overrides_versions() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("builder.toml");
        fs::write(
            &path,
            "cache_dir = \"/var/cache/fab\"\n[registry]\nurl = \"localhost:5000\"\ninsecure = true\n[versions]\n\"fabricator/k9s\" = \"v0.40.0\"\n",
        )
        .unwrap();
        let cfg = BuilderConfig::load(&path).unwrap();
        assert_eq!(cfg.cache_dir, PathBuf::from("/var/cache/fab"));
        assert!(cfg.registry.insecure);
        assert_eq!(cfg.registry.prefix, "githedgehog");
        let versions = cfg.versions();
        assert_eq!(versions.artifact(ART_K9S).unwrap().version, "v0.40.0");
        assert_eq!(versions.artifact(ART_HELM).unwrap().version, "v3.16.1");
    }

    #[test]
    fn builder_config_rejects_unknown_keys() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("builder.toml");
        fs::write(&path, "cache_directory = \"/x\"\n").unwrap();
        let err = BuilderConfig::load(&path).unwrap_err();
        assert_eq!(
            crate::error::classify(&err),
            crate::error::FailureKind::Configuration
        );
    }

    #[test]
    fn fab_config_lookup() {
        let cfg = FabConfig::from_yaml(FAB_YAML).unwrap();
        let node = cfg.node(NodeKind::Control, "node-a").unwrap();
        assert_eq!(node.disk.as_deref(), Some("/dev/sda"));
        assert!(cfg.node(NodeKind::Node, "node-a").is_err());
        assert!(cfg.node(NodeKind::Node, "worker-1").is_ok());
    }

    #[test]
    fn fab_config_rejects_duplicate_names() {
        let yaml = "cluster: { name: x }\ncontrol: [{ name: a }]\nnodes: [{ name: a }]\n";
        assert!(FabConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn airgap_artifacts_follow_subsystems() {
        let mut cfg = FabConfig::from_yaml(FAB_YAML).unwrap();
        let versions = BuilderConfig::default().versions();
        assert!(cfg.airgap_artifacts(&versions).unwrap().is_empty());

        cfg.cluster.airgap = true;
        cfg.cluster.subsystems.insert("gateway".to_string());
        let names: Vec<String> = cfg
            .airgap_artifacts(&versions)
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec![ART_FABRIC_CHARTS, ART_FABRIC_IMAGES, ART_GATEWAY]);
    }

    #[test]
    fn wiring_canonical_ignores_order_and_comments() {
        let a = Wiring::from_yaml("# switches\nkind: Switch\nmetadata: { name: s1 }\n").unwrap();
        let b = Wiring::from_yaml("metadata:\n  name: s1   # leaf\nkind: Switch\n").unwrap();
        assert_eq!(a.canonical().unwrap(), b.canonical().unwrap());

        let c = Wiring::from_yaml("kind: Switch\nmetadata: { name: s2 }\n").unwrap();
        assert_ne!(a.canonical().unwrap(), c.canonical().unwrap());
    }

    #[test]
    fn wiring_multi_document_roundtrip() {
        let w = Wiring::from_yaml("kind: A\n---\nkind: B\n").unwrap();
        let again = Wiring::from_yaml(&w.to_yaml().unwrap()).unwrap();
        assert_eq!(w, again);
    }
}
