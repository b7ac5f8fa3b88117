//! Username to hashed-password store (C2).
//!
//! Many concurrent reads (authenticate), exclusive writes (register):
//! guarded by a single [`std::sync::RwLock`] over a `HashMap`, the same
//! shape the time-series store (C3) uses for its own data.
use std::collections::HashMap;
use std::sync::RwLock;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::error::AuthError;

/// A registered user. `password_hash` is SHA-256 of the UTF-8 password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub username: String,
    pub password_hash: Vec<u8>,
}

pub fn hash_password(password: &str) -> Vec<u8> {
    Sha256::digest(password.as_bytes()).to_vec()
}

pub struct AuthStore {
    users: RwLock<HashMap<String, Vec<u8>>>,
}

impl AuthStore {
    pub fn new() -> Self {
        AuthStore { users: RwLock::new(HashMap::new()) }
    }

    fn validate(username: &str, password: &str) -> Result<(String, &str), AuthError> {
        let trimmed = username.trim();
        if trimmed.is_empty() {
            return Err(AuthError::EmptyUsername);
        }
        if password.is_empty() {
            return Err(AuthError::EmptyPassword);
        }
        Ok((trimmed.to_string(), password))
    }

    /// Registers a new user with a plaintext password, hashing it here.
    pub fn register(&self, username: &str, password: &str) -> Result<(), AuthError> {
        let (username, password) = Self::validate(username, password)?;
        let hash = hash_password(password);
        let mut users = self.users.write().unwrap();
        if users.contains_key(&username) {
            return Err(AuthError::AlreadyExists(username));
        }
        users.insert(username.clone(), hash);
        debug!(%username, "registered user");
        Ok(())
    }

    /// Registers a user whose password hash is already computed. Used
    /// when replaying `users.dat` on startup (C5 recovery protocol).
    pub fn register_prehashed(&self, username: &str, password_hash: Vec<u8>) {
        let mut users = self.users.write().unwrap();
        users.insert(username.to_string(), password_hash);
    }

    /// Constant-time check against the stored hash bytes.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<(), AuthError> {
        let trimmed = username.trim();
        let users = self.users.read().unwrap();
        let stored = users.get(trimmed).ok_or(AuthError::Failed)?;
        let candidate = hash_password(password);
        if bool::from(stored.as_slice().ct_eq(candidate.as_slice())) {
            Ok(())
        } else {
            warn!(username = %trimmed, "authentication failed");
            Err(AuthError::Failed)
        }
    }

    pub fn exists(&self, username: &str) -> bool {
        self.users.read().unwrap().contains_key(username.trim())
    }

    /// Snapshot of all users, for persistence (C5 save).
    pub fn all_users(&self) -> Vec<User> {
        self.users
            .read()
            .unwrap()
            .iter()
            .map(|(username, hash)| User { username: username.clone(), password_hash: hash.clone() })
            .collect()
    }
}

impl Default for AuthStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_authenticate() {
        let store = AuthStore::new();
        store.register("alice", "secret").unwrap();
        store.authenticate("alice", "secret").unwrap();
        assert!(matches!(store.authenticate("alice", "wrong"), Err(AuthError::Failed)));
    }

    #[test]
    fn duplicate_registration_fails() {
        let store = AuthStore::new();
        store.register("alice", "secret").unwrap();
        assert!(matches!(store.register("alice", "other"), Err(AuthError::AlreadyExists(_))));
    }

    #[test]
    fn empty_username_or_password_rejected() {
        let store = AuthStore::new();
        assert!(matches!(store.register("  ", "secret"), Err(AuthError::EmptyUsername)));
        assert!(matches!(store.register("bob", ""), Err(AuthError::EmptyPassword)));
    }

    #[test]
    fn username_is_trimmed() {
        let store = AuthStore::new();
        store.register("  bob  ", "secret").unwrap();
        assert!(store.exists("bob"));
        store.authenticate("bob", "secret").unwrap();
    }

    #[test]
    fn prehashed_registration_roundtrips_through_authenticate() {
        let store = AuthStore::new();
        let hash = hash_password("secret");
        store.register_prehashed("carol", hash);
        store.authenticate("carol", "secret").unwrap();
    }
}
