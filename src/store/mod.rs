//! Account persistence.
//!
//! The store is the single writer of record. Each method is one atomic
//! update that touches only the fields of its own transition, so a write
//! never replays a stale copy of the record. The `consume_*` methods are
//! compare-and-clear: a challenge token is redeemed at most once. The
//! whole-record [`AccountStore::save`] is guarded by `updated_at` and refuses
//! a copy that was read before another write landed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::{account::Account, error::Error};

pub mod memory;
pub mod postgres;

pub use memory::MemoryAccountStore;
pub use postgres::PgAccountStore;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique column (`username` or `email`) is already taken.
    #[error("{0} already in use")]
    Conflict(&'static str),
    /// The record changed after the copy being saved was read.
    #[error("account changed since it was read")]
    Stale,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(field) => Self::Conflict(field),
            StoreError::Stale => Self::Internal(anyhow::anyhow!(StoreError::Stale)),
            StoreError::Backend(err) => Self::Internal(err),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One page of accounts, newest first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

impl<T> Page<T> {
    #[must_use]
    pub fn pages(&self) -> u64 {
        if self.limit == 0 {
            return 0;
        }
        self.total.div_ceil(u64::from(self.limit))
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            limit: self.limit,
        }
    }
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Insert a new account.
    ///
    /// # Errors
    /// [`StoreError::Conflict`] when the username or email is taken.
    async fn create(&self, account: Account) -> StoreResult<Account>;

    /// Match either unique identifier; used by registration to detect
    /// duplicates and by login, which accepts both.
    async fn find_by_email_or_username(
        &self,
        email: &str,
        username: &str,
    ) -> StoreResult<Option<Account>>;

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<Account>>;

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Account>>;

    async fn find_by_confirmation_token(&self, token: &str) -> StoreResult<Option<Account>>;

    /// Reset token lookup that ignores expired challenges.
    async fn find_by_active_reset_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Account>>;

    /// Replace the confirmation challenge of an account that is still
    /// unconfirmed. `None` when the account is gone or already confirmed.
    async fn set_confirmation_challenge(
        &self,
        id: Uuid,
        token: &str,
        expires: DateTime<Utc>,
    ) -> StoreResult<Option<Account>>;

    /// Replace the reset challenge. `None` when the account is gone.
    async fn set_reset_challenge(
        &self,
        id: Uuid,
        token: &str,
        expires: DateTime<Utc>,
    ) -> StoreResult<Option<Account>>;

    /// Write a new password hash and nothing else. `None` when the account
    /// is gone.
    async fn update_password_hash(
        &self,
        id: Uuid,
        password_hash: &str,
    ) -> StoreResult<Option<Account>>;

    /// Change whichever of `username` and `profile_picture` is given.
    /// `None` when the account is gone.
    ///
    /// # Errors
    /// [`StoreError::Conflict`] when the new username is taken.
    async fn update_profile(
        &self,
        id: Uuid,
        username: Option<&str>,
        profile_picture: Option<&str>,
    ) -> StoreResult<Option<Account>>;

    /// Persist every mutable field of `account` in one write, provided the
    /// stored record still carries the `updated_at` it was read with.
    /// Returns the saved record with a fresh `updated_at`, or `None` when the
    /// account is gone.
    ///
    /// # Errors
    /// [`StoreError::Stale`] when another write landed after the read, and
    /// [`StoreError::Conflict`] when the username or email is taken.
    async fn save(&self, account: &Account) -> StoreResult<Option<Account>>;

    /// Returns whether a record was removed.
    async fn delete(&self, id: Uuid) -> StoreResult<bool>;

    /// `page` is 1-based.
    async fn list_paginated(&self, page: u32, limit: u32) -> StoreResult<Page<Account>>;

    /// Mark the email confirmed and clear the challenge if `token` matches an
    /// unexpired confirmation challenge. `None` when nothing matched.
    async fn consume_confirmation(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Account>>;

    /// Replace the password hash and clear the reset challenge if `token`
    /// matches an unexpired reset challenge. `None` when nothing matched.
    async fn consume_reset(
        &self,
        token: &str,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Account>>;
}
