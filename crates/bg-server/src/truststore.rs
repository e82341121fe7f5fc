//! Trust store for certificates presented by agents
//!
//! Agents running their own broker send its certificate in the greeting.
//! The server keeps it under the agent's effective IP address so that
//! connections to that broker can be verified later.

use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;

const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_END: &str = "-----END CERTIFICATE-----";

/// Trust store errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TrustStoreError {
    /// The text is not a PEM encoded certificate
    #[error("Certificate for {0} is not PEM encoded")]
    NotPem(String),
}

/// Storage for agent certificates, keyed by alias
pub trait TrustStore: Send + Sync {
    /// Add a certificate, replacing any previous one with the same alias
    fn add_or_replace(&self, alias: &str, pem: &str) -> Result<(), TrustStoreError>;

    /// Certificate stored under `alias`
    fn get(&self, alias: &str) -> Option<String>;

    /// Remove the certificate stored under `alias`
    fn remove(&self, alias: &str) -> bool;

    /// Stored aliases
    fn aliases(&self) -> Vec<String>;
}

/// In-memory [`TrustStore`]
#[derive(Debug, Default)]
pub struct MemoryTrustStore {
    certificates: RwLock<HashMap<String, String>>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.certificates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.read().is_empty()
    }
}

impl TrustStore for MemoryTrustStore {
    fn add_or_replace(&self, alias: &str, pem: &str) -> Result<(), TrustStoreError> {
        let pem = pem.trim();
        if !pem.starts_with(PEM_BEGIN) || !pem.ends_with(PEM_END) {
            return Err(TrustStoreError::NotPem(alias.to_string()));
        }

        let previous = self
            .certificates
            .write()
            .insert(alias.to_string(), pem.to_string());
        if previous.is_some() {
            tracing::debug!("Replaced certificate for {}", alias);
        } else {
            tracing::debug!("Added certificate for {}", alias);
        }
        Ok(())
    }

    fn get(&self, alias: &str) -> Option<String> {
        self.certificates.read().get(alias).cloned()
    }

    fn remove(&self, alias: &str) -> bool {
        self.certificates.write().remove(alias).is_some()
    }

    fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self.certificates.read().keys().cloned().collect();
        aliases.sort();
        aliases
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CERT: &str = "-----BEGIN CERTIFICATE-----\r\nMIIB\n-----END CERTIFICATE-----";

    #[test]
    fn test_add_and_replace() {
        let store = MemoryTrustStore::new();
        store.add_or_replace("10.0.0.1", CERT).unwrap();
        store
            .add_or_replace("10.0.0.1", &CERT.replace("MIIB", "MIIC"))
            .unwrap();

        assert_eq!(store.len(), 1);
        assert!(store.get("10.0.0.1").unwrap().contains("MIIC"));
    }

    #[test]
    fn test_rejects_non_pem() {
        let store = MemoryTrustStore::new();
        assert_eq!(
            store.add_or_replace("10.0.0.1", "garbage"),
            Err(TrustStoreError::NotPem("10.0.0.1".into()))
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_remove() {
        let store = MemoryTrustStore::new();
        store.add_or_replace("a", CERT).unwrap();
        assert!(store.remove("a"));
        assert!(!store.remove("a"));
        assert!(store.aliases().is_empty());
    }
}
