//! Vault handle: resolves the secrets a `TRIGGER`'s
//! `credentials_vault_path` or an `LLM_CALL` executor's credentials
//! point at. The storage medium is a deployment concern; this crate
//! depends only on the trait.

use std::collections::BTreeMap;
use std::sync::RwLock;

use thiserror::Error;

/// Errors resolving a vault path.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VaultError {
    /// No secret is stored under this path.
    #[error("no secret at vault path {0}")]
    NotFound(String),
}

/// Resolves a vault path to its secret value.
pub trait VaultHandle: Send + Sync {
    /// Fetch the secret at `path`.
    fn resolve(&self, path: &str) -> Result<String, VaultError>;
}

/// An in-memory vault, for tests and single-node deployments that source
/// secrets from process environment at startup rather than a real vault
/// service.
#[derive(Default)]
pub struct InMemoryVault {
    secrets: RwLock<BTreeMap<String, String>>,
}

impl InMemoryVault {
    /// An empty vault.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a secret at `path`.
    pub fn put(&self, path: &str, value: impl Into<String>) {
        self.secrets.write().expect("vault lock poisoned").insert(path.to_string(), value.into());
    }
}

impl VaultHandle for InMemoryVault {
    fn resolve(&self, path: &str) -> Result<String, VaultError> {
        self.secrets
            .read()
            .expect("vault lock poisoned")
            .get(path)
            .cloned()
            .ok_or_else(|| VaultError::NotFound(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_a_seeded_secret() {
        let vault = InMemoryVault::new();
        vault.put("llm/openai", "sk-test");
        assert_eq!(vault.resolve("llm/openai").unwrap(), "sk-test");
    }

    #[test]
    fn unknown_path_is_not_found() {
        let vault = InMemoryVault::new();
        assert_eq!(vault.resolve("missing").unwrap_err(), VaultError::NotFound("missing".to_string()));
    }
}
