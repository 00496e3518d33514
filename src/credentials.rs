//! Password hashing and verification (Argon2id, PHC strings).
//!
//! Hashes are self-describing: algorithm, version, cost parameters and salt
//! are encoded in the stored string, so verification needs nothing else.
//! Both directions run on the blocking pool.

use anyhow::{Context, Result, anyhow};
use argon2::{
    Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version,
    password_hash::{self, SaltString},
};
use rand::rngs::OsRng;
use std::sync::Arc;

const DUMMY_PASSWORD: &str = "gatehouse-dummy-password";

/// Argon2id cost settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HashCost {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for HashCost {
    fn default() -> Self {
        Self {
            memory_kib: Params::DEFAULT_M_COST,
            iterations: Params::DEFAULT_T_COST,
            parallelism: Params::DEFAULT_P_COST,
        }
    }
}

impl HashCost {
    fn params(self) -> Result<Params> {
        Params::new(self.memory_kib, self.iterations, self.parallelism, None)
            .map_err(|err| anyhow!("invalid argon2 parameters: {err}"))
    }
}

#[derive(Clone)]
pub struct CredentialManager {
    inner: Arc<Inner>,
}

struct Inner {
    argon2: Argon2<'static>,
    dummy_hash: String,
}

impl std::fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialManager").finish_non_exhaustive()
    }
}

impl CredentialManager {
    /// Build a manager and precompute the dummy hash used for timing parity.
    ///
    /// # Errors
    /// Returns an error if the cost parameters are rejected by Argon2.
    pub fn new(cost: HashCost) -> Result<Self> {
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, cost.params()?);
        let dummy_hash = hash_with(&argon2, DUMMY_PASSWORD)?;
        Ok(Self {
            inner: Arc::new(Inner { argon2, dummy_hash }),
        })
    }

    /// Derive a salted hash for `password`.
    ///
    /// # Errors
    /// Returns an error if hashing fails or the blocking task panics.
    pub async fn hash(&self, password: &str) -> Result<String> {
        let inner = self.inner.clone();
        let password = password.to_owned();
        tokio::task::spawn_blocking(move || hash_with(&inner.argon2, &password))
            .await
            .context("password hashing task failed")?
    }

    /// Check `password` against a stored hash.
    ///
    /// Returns `Ok(false)` on mismatch.
    ///
    /// # Errors
    /// Returns an error only when `hash` is not a valid PHC string.
    pub async fn verify(&self, password: &str, hash: &str) -> Result<bool> {
        let inner = self.inner.clone();
        let password = password.to_owned();
        let hash = hash.to_owned();
        tokio::task::spawn_blocking(move || verify_with(&inner.argon2, &password, &hash))
            .await
            .context("password verification task failed")?
    }

    /// Spend one verification on a fixed hash so unknown identifiers cost the
    /// same as wrong passwords.
    pub async fn verify_dummy(&self, password: &str) {
        let dummy = self.inner.dummy_hash.clone();
        let _ = self.verify(password, &dummy).await;
    }
}

fn hash_with(argon2: &Argon2<'_>, password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow!("failed to hash password: {err}"))?;
    Ok(hash.to_string())
}

fn verify_with(argon2: &Argon2<'_>, password: &str, hash: &str) -> Result<bool> {
    let parsed = PasswordHash::new(hash).map_err(|err| anyhow!("malformed password hash: {err}"))?;
    match argon2.verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(password_hash::Error::Password) => Ok(false),
        Err(err) => Err(anyhow!("password verification failed: {err}")),
    }
}

#[cfg(test)]
pub(crate) fn test_manager() -> CredentialManager {
    // Minimal cost keeps unit tests fast; production uses `HashCost::default()`.
    let cost = HashCost {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    };
    match CredentialManager::new(cost) {
        Ok(manager) => manager,
        Err(err) => panic!("test credential manager: {err}"),
    }
}
