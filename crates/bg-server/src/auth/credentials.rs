//! Username/password credential store

use std::collections::HashMap;

use parking_lot::RwLock;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};

const PASSWORD_MIN_LEN: usize = 32;
const PASSWORD_MAX_LEN: usize = 64;

/// Number of hex digits shown when a secret is logged
const MASK_LEN: usize = 12;

/// Username → password map checked on SSH password authentication
#[derive(Default)]
pub struct Credentials {
    entries: RwLock<HashMap<String, String>>,
}

impl Credentials {
    /// Create an empty credential store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding the given pairs
    pub fn from_map(entries: HashMap<String, String>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Check a login attempt
    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        self.entries
            .read()
            .get(username)
            .is_some_and(|expected| expected == password)
    }

    /// Add or replace a pair. Returns the previous password, if any.
    pub fn add(&self, username: impl Into<String>, password: impl Into<String>) -> Option<String> {
        self.entries.write().insert(username.into(), password.into())
    }

    pub fn remove(&self, username: &str) -> Option<String> {
        self.entries.write().remove(username)
    }

    pub fn password(&self, username: &str) -> Option<String> {
        self.entries.read().get(username).cloned()
    }

    /// Known usernames, sorted
    pub fn usernames(&self) -> Vec<String> {
        let mut names: Vec<_> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Generate a random pair, add it and return it
    pub fn bootstrap(&self) -> (String, String) {
        let (username, password) = generate_credentials();
        self.add(username.clone(), password.clone());
        tracing::info!(
            "Generated agent credentials: username={}, password={}",
            username,
            mask_secret(&password)
        );
        (username, password)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("usernames", &self.usernames())
            .finish()
    }
}

/// A fresh `user-<uuid>` username and a 32 to 64 character alphanumeric password
pub fn generate_credentials() -> (String, String) {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(PASSWORD_MIN_LEN..=PASSWORD_MAX_LEN);
    let password: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect();
    (format!("user-{}", uuid::Uuid::new_v4()), password)
}

/// Loggable stand-in for a secret: a SHA-256 prefix
pub fn mask_secret(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("sha256:{}", &hex[..MASK_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authenticate() {
        let credentials = Credentials::from_map(HashMap::from([("agent".to_string(), "s3cret".to_string())]));
        assert!(credentials.authenticate("agent", "s3cret"));
        assert!(!credentials.authenticate("agent", "wrong"));
        assert!(!credentials.authenticate("other", "s3cret"));

        credentials.remove("agent");
        assert!(!credentials.authenticate("agent", "s3cret"));
        assert!(credentials.is_empty());
    }

    #[test]
    fn test_generated_credentials_shape() {
        for _ in 0..20 {
            let (username, password) = generate_credentials();
            assert!(username.starts_with("user-"));
            assert!(uuid::Uuid::parse_str(&username["user-".len()..]).is_ok());
            assert!((PASSWORD_MIN_LEN..=PASSWORD_MAX_LEN).contains(&password.len()));
            assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn test_bootstrap_adds_pair() {
        let credentials = Credentials::new();
        let (username, password) = credentials.bootstrap();
        assert_eq!(credentials.len(), 1);
        assert!(credentials.authenticate(&username, &password));
    }

    #[test]
    fn test_mask_secret() {
        let masked = mask_secret("password");
        assert_eq!(masked, "sha256:5e884898da28");
        assert!(!masked.contains("password"));
        assert_ne!(mask_secret("a"), mask_secret("b"));
    }
}
