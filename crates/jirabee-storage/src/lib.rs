//! Credential storage for the Jira API token.
//!
//! The token can be kept in the operating system's keychain instead of the
//! environment:
//!
//! - **macOS**: Keychain Services
//! - **Windows**: Credential Manager
//! - **Linux**: Secret Service (GNOME Keyring / KWallet)
//!
//! # Example
//!
//! ```ignore
//! use jirabee_storage::{KeychainStore, Login};
//!
//! let login = Login::new(KeychainStore::new());
//! login.save("api-token", Some("me@example.com"))?;
//!
//! // An explicit value (from JIRA_TOKEN) always wins over the keychain.
//! let token = login.credential(std::env::var("JIRA_TOKEN").ok())?;
//! ```

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use jirabee_core::{Error, Result};
use keyring::Entry;
use tracing::{debug, warn};

/// Service name used in the OS keychain.
const SERVICE_NAME: &str = "jirabee";

/// Keychain key of the Jira API token.
pub const TOKEN_KEY: &str = "jira/token";

/// Keychain key of the Jira username.
pub const USERNAME_KEY: &str = "jira/username";

/// Secret storage backend.
pub trait CredentialStore: Send + Sync {
    /// Store a secret under `key`, replacing any previous value.
    fn store(&self, key: &str, value: &str) -> Result<()>;

    /// `Ok(None)` if nothing is stored under `key`.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Remove `key`. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    fn exists(&self, key: &str) -> bool {
        matches!(self.get(key), Ok(Some(_)))
    }
}

// =============================================================================
// KeychainStore
// =============================================================================

/// Credential store backed by the OS keychain.
#[derive(Debug)]
pub struct KeychainStore {
    service_name: String,
}

impl KeychainStore {
    pub fn new() -> Self {
        Self::with_service_name(SERVICE_NAME)
    }

    /// Keychain store under a different service, e.g. to keep tests away from real secrets.
    pub fn with_service_name(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service_name, key).map_err(|e| {
            Error::Storage(format!("Cannot open keychain entry '{}': {}", key, e))
        })
    }
}

impl Default for KeychainStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeychainStore {
    fn store(&self, key: &str, value: &str) -> Result<()> {
        debug!(key, "Saving secret to keychain");
        self.entry(key)?
            .set_password(value)
            .map_err(|e| Error::Storage(format!("Cannot save '{}' to keychain: {}", key, e)))
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => {
                debug!(key, "No secret in keychain");
                Ok(None)
            }
            Err(e) => {
                warn!(key, error = %e, "Keychain lookup failed");
                Err(Error::Storage(format!(
                    "Cannot read '{}' from keychain: {}",
                    key, e
                )))
            }
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(Error::Storage(format!(
                "Cannot remove '{}' from keychain: {}",
                key, e
            ))),
        }
    }
}

// =============================================================================
// MemoryStore
// =============================================================================

/// In-memory credential store, for tests and `--no-keychain` runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    secrets: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            secrets: RwLock::new(credentials.into_iter().collect()),
        }
    }
}

impl CredentialStore for MemoryStore {
    fn store(&self, key: &str, value: &str) -> Result<()> {
        self.secrets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .secrets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.secrets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

// =============================================================================
// Login
// =============================================================================

/// The stored Jira login: API token plus optional username.
pub struct Login<S> {
    store: S,
}

impl<S: CredentialStore> Login<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Save the token, and the username when given.
    pub fn save(&self, token: &str, username: Option<&str>) -> Result<()> {
        if token.trim().is_empty() {
            return Err(Error::missing("credential"));
        }
        self.store.store(TOKEN_KEY, token)?;
        if let Some(username) = username {
            self.store.store(USERNAME_KEY, username)?;
        }
        Ok(())
    }

    /// Forget the stored login.
    pub fn clear(&self) -> Result<()> {
        self.store.delete(TOKEN_KEY)?;
        self.store.delete(USERNAME_KEY)
    }

    /// Resolve the credential: `explicit` if set and non-blank, else the stored token.
    pub fn credential(&self, explicit: Option<String>) -> Result<Option<String>> {
        match explicit.filter(|v| !v.trim().is_empty()) {
            Some(value) => Ok(Some(value)),
            None => self.store.get(TOKEN_KEY),
        }
    }

    pub fn username(&self) -> Result<Option<String>> {
        self.store.get(USERNAME_KEY)
    }

    pub fn is_logged_in(&self) -> bool {
        self.store.exists(TOKEN_KEY)
    }
}
