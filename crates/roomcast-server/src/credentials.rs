//! Username/password accounts.
//!
//! Passwords are stored as Argon2id PHC strings. Hashing is CPU-bound, so
//! callers on the async runtime should run these methods on a blocking
//! thread.

use argon2::{
    password_hash::{PasswordHasher, SaltString},
    Argon2, PasswordHash, PasswordVerifier,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use roomcast_core::Identity;
use thiserror::Error;
use tracing::{debug, info};

/// Account errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    /// Username or password is empty.
    #[error("Username and password are required")]
    MissingFields,

    /// The username is already registered.
    #[error("Username already taken: {0}")]
    UsernameTaken(String),

    /// Unknown user or wrong password.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Hashing failed.
    #[error("Password hashing failed: {0}")]
    Hash(String),
}

/// In-memory account store.
#[derive(Debug, Default)]
pub struct CredentialStore {
    users: DashMap<String, String>,
}

impl CredentialStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an account.
    ///
    /// # Errors
    ///
    /// `MissingFields` for an empty username or password, `UsernameTaken`
    /// if the account exists.
    pub fn register(&self, username: &str, password: &str) -> Result<Identity, CredentialError> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(CredentialError::MissingFields);
        }
        if self.users.contains_key(username) {
            return Err(CredentialError::UsernameTaken(username.to_string()));
        }

        let hash = hash_password(password)?;

        match self.users.entry(username.to_string()) {
            Entry::Occupied(_) => Err(CredentialError::UsernameTaken(username.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(hash);
                info!(user = %username, "Account registered");
                Ok(Identity::new(username))
            }
        }
    }

    /// Check a username and password.
    ///
    /// # Errors
    ///
    /// `InvalidCredentials` for an unknown user or a wrong password.
    pub fn login(&self, username: &str, password: &str) -> Result<Identity, CredentialError> {
        let username = username.trim();
        let hash = self
            .users
            .get(username)
            .map(|entry| entry.value().clone())
            .ok_or(CredentialError::InvalidCredentials)?;

        verify_password(password, &hash)?;
        debug!(user = %username, "Login succeeded");
        Ok(Identity::new(username))
    }
}

fn hash_password(password: &str) -> Result<String, CredentialError> {
    let salt = SaltString::generate(rand::thread_rng());
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| CredentialError::Hash(e.to_string()))
}

fn verify_password(password: &str, hash: &str) -> Result<(), CredentialError> {
    let parsed = PasswordHash::new(hash).map_err(|e| CredentialError::Hash(e.to_string()))?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|_| CredentialError::InvalidCredentials)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_then_login() {
        let store = CredentialStore::new();
        let identity = store.register("alice", "hunter2").unwrap();
        assert_eq!(identity.as_str(), "alice");
        assert_eq!(store.login("alice", "hunter2").unwrap(), identity);
    }

    #[test]
    fn test_wrong_password_and_unknown_user() {
        let store = CredentialStore::new();
        store.register("alice", "hunter2").unwrap();
        assert_eq!(
            store.login("alice", "hunter3"),
            Err(CredentialError::InvalidCredentials)
        );
        assert_eq!(
            store.login("bob", "hunter2"),
            Err(CredentialError::InvalidCredentials)
        );
    }

    #[test]
    fn test_duplicate_and_empty_registration() {
        let store = CredentialStore::new();
        store.register("alice", "pw").unwrap();
        assert_eq!(
            store.register("alice", "other"),
            Err(CredentialError::UsernameTaken("alice".into()))
        );
        assert_eq!(store.register("", "pw"), Err(CredentialError::MissingFields));
        assert_eq!(store.register("bob", ""), Err(CredentialError::MissingFields));
        assert_eq!(store.users.len(), 1);
    }

    #[test]
    fn test_password_is_not_stored_in_clear() {
        let store = CredentialStore::new();
        store.register("alice", "hunter2").unwrap();
        let stored = store.users.get("alice").unwrap().clone();
        assert!(stored.starts_with("$argon2id$"));
        assert!(!stored.contains("hunter2"));
    }
}
