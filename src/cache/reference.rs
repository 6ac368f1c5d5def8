//! Artifact references (`name:version`).

use crate::error::ConfigError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A named, versioned, immutable artifact in the registry.
///
/// The name may contain `/` (e.g. `fabricator/k3s-airgap`); it is resolved
/// relative to the registry prefix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArtifactRef {
    pub name: String,
    pub version: String,
}

impl ArtifactRef {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Single path segment used for cache entries and airgap bundles:
    /// `<name>@<version>` with slashes replaced by underscores.
    pub fn path_segment(&self) -> String {
        format!("{}@{}", self.name, self.version).replace(['/', '\\'], "_")
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

impl FromStr for ArtifactRef {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidReference(s.to_string());
        let (name, version) = s.rsplit_once(':').ok_or_else(invalid)?;
        if name.is_empty()
            || version.is_empty()
            || version.contains('/')
            || name.split('/').any(|part| part.is_empty() || part == "..")
        {
            return Err(invalid());
        }
        Ok(Self::new(name, version))
    }
}

impl Serialize for ArtifactRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ArtifactRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
