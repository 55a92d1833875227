//! Identity → secret mapping supplied by provisioning.
//!
//! Secrets are stored as argon2id PHC strings in a TOML file:
//!
//! ```toml
//! [identities]
//! chat01 = "$argon2id$v=19$m=19456,t=2,p=1$..."
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::OnceLock;

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use chat_log::Identity;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::GateError;

/// Hash a secret with Argon2id and a random salt.
pub fn hash_secret(secret: &str) -> Result<String, GateError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map_err(|e| GateError::StoreUnavailable(format!("failed to hash secret: {e}")))?;
    Ok(hash.to_string())
}

fn verify_secret(secret: &str, phc: &str) -> bool {
    match PasswordHash::new(phc) {
        Ok(parsed) => Argon2::default()
            .verify_password(secret.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Hash checked for unknown identities so they cost as much as known ones.
fn dummy_hash() -> &'static str {
    static DUMMY: OnceLock<String> = OnceLock::new();
    DUMMY.get_or_init(|| hash_secret("not-a-chat-secret").unwrap_or_default())
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    #[serde(default)]
    identities: BTreeMap<String, String>,
}

#[derive(Debug, Default, Clone)]
pub struct CredentialStore {
    hashes: HashMap<Identity, String>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self, GateError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            GateError::StoreUnavailable(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&contents)
    }

    /// Parse a credential file. Entries with an invalid identity or hash are
    /// skipped with a warning rather than failing the whole store.
    pub fn from_toml(contents: &str) -> Result<Self, GateError> {
        let file: CredentialFile = toml::from_str(contents)
            .map_err(|e| GateError::StoreUnavailable(format!("invalid credential file: {e}")))?;

        let mut store = Self::new();
        for (name, phc) in file.identities {
            let Ok(identity) = Identity::parse(&name) else {
                warn!("Skipping credential entry with invalid identity {:?}", name);
                continue;
            };
            if let Err(e) = store.insert(identity, phc) {
                warn!("Skipping credential entry for {}: {}", name, e);
            }
        }
        Ok(store)
    }

    pub fn to_toml(&self) -> Result<String, GateError> {
        let file = CredentialFile {
            identities: self
                .hashes
                .iter()
                .map(|(identity, phc)| (identity.to_string(), phc.clone()))
                .collect(),
        };
        toml::to_string(&file).map_err(|e| GateError::StoreUnavailable(e.to_string()))
    }

    /// Register an identity with an already-hashed secret.
    pub fn insert(&mut self, identity: Identity, phc: String) -> Result<(), GateError> {
        PasswordHash::new(&phc)
            .map_err(|e| GateError::StoreUnavailable(format!("invalid hash: {e}")))?;
        self.hashes.insert(identity, phc);
        Ok(())
    }

    /// Register an identity with a plaintext secret, hashing it first.
    pub fn insert_secret(&mut self, identity: Identity, secret: &str) -> Result<(), GateError> {
        let phc = hash_secret(secret)?;
        self.insert(identity, phc)
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.hashes.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn verify(&self, identity: &Identity, secret: &str) -> bool {
        match self.hashes.get(identity) {
            Some(phc) => verify_secret(secret, phc),
            None => {
                let _ = verify_secret(secret, dummy_hash());
                false
            }
        }
    }
}
