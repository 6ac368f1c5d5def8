//! Registry credentials.
//!
//! Credentials come from an external store and are opaque to the rest of the
//! crate; the registry client only forwards them to the token endpoint.

use std::fmt;

pub const ENV_USERNAME: &str = "FAB_REGISTRY_USERNAME";
pub const ENV_PASSWORD: &str = "FAB_REGISTRY_PASSWORD";

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Source of credentials for a registry host.
pub trait CredentialStore: Send + Sync {
    fn credentials(&self, registry: &str) -> Option<Credentials>;
}

/// Anonymous access.
#[derive(Debug, Default, Clone, Copy)]
pub struct Anonymous;

impl CredentialStore for Anonymous {
    fn credentials(&self, _registry: &str) -> Option<Credentials> {
        None
    }
}

/// Same username/password for every registry.
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub Credentials);

impl CredentialStore for StaticCredentials {
    fn credentials(&self, _registry: &str) -> Option<Credentials> {
        Some(self.0.clone())
    }
}

/// Credentials from `FAB_REGISTRY_USERNAME` / `FAB_REGISTRY_PASSWORD`,
/// read once. Anonymous when no username is set.
pub fn from_env() -> Box<dyn CredentialStore> {
    resolve(
        std::env::var(ENV_USERNAME).ok(),
        std::env::var(ENV_PASSWORD).ok(),
    )
}

fn resolve(username: Option<String>, password: Option<String>) -> Box<dyn CredentialStore> {
    match username.filter(|u| !u.is_empty()) {
        Some(username) => Box::new(StaticCredentials(Credentials {
            username,
            password: password.unwrap_or_default(),
        })),
        None => Box::new(Anonymous),
    }
}
