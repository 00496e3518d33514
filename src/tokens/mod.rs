//! Token issuance and verification.
//!
//! Two kinds of credential live here:
//! - opaque challenges (email confirmation, password reset) stored on the
//!   account and redeemed once through the store's compare-and-clear,
//! - stateless bearer sessions signed with the process secret.

use anyhow::Context;
use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tracing::debug;
use uuid::Uuid;

use crate::{account::Account, error::Error, store::AccountStore};

pub mod opaque;
pub mod session;

pub use session::{SessionError, SessionSigner};

/// 24 hours.
pub const DEFAULT_CONFIRMATION_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// 10 minutes.
pub const DEFAULT_RESET_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Clone)]
pub struct TokenService {
    store: Arc<dyn AccountStore>,
    sessions: SessionSigner,
    confirmation_ttl: chrono::Duration,
    reset_ttl: chrono::Duration,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("sessions", &self.sessions)
            .field("confirmation_ttl", &self.confirmation_ttl)
            .field("reset_ttl", &self.reset_ttl)
            .finish_non_exhaustive()
    }
}

impl TokenService {
    /// # Errors
    /// Returns an error if a TTL does not fit a calendar duration.
    pub fn new(
        store: Arc<dyn AccountStore>,
        sessions: SessionSigner,
        confirmation_ttl: Duration,
        reset_ttl: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            store,
            sessions,
            confirmation_ttl: chrono::Duration::from_std(confirmation_ttl)
                .context("confirmation token TTL out of range")?,
            reset_ttl: chrono::Duration::from_std(reset_ttl)
                .context("reset token TTL out of range")?,
        })
    }

    #[must_use]
    pub fn generate_opaque() -> String {
        opaque::generate()
    }

    /// Put a fresh confirmation challenge on `account` without persisting it.
    /// Registration uses this so the challenge lands in the same insert.
    pub fn stamp_confirmation(&self, account: &mut Account, now: DateTime<Utc>) -> String {
        let token = opaque::generate();
        account.email_confirmation_token = Some(token.clone());
        account.email_confirmation_expires = Some(now + self.confirmation_ttl);
        token
    }

    /// Replace any outstanding confirmation challenge and persist it.
    /// `None` when the account is gone or was confirmed meanwhile.
    ///
    /// # Errors
    /// Store failures only.
    pub async fn issue_confirmation(
        &self,
        account_id: Uuid,
    ) -> Result<Option<(Account, String)>, Error> {
        let token = opaque::generate();
        let expires = Utc::now() + self.confirmation_ttl;
        let Some(account) = self
            .store
            .set_confirmation_challenge(account_id, &token, expires)
            .await?
        else {
            return Ok(None);
        };
        debug!(account_id = %account.id, "confirmation challenge issued");
        Ok(Some((account, token)))
    }

    /// Redeem a confirmation challenge.
    ///
    /// # Errors
    /// [`Error::TokenInvalid`] when the token is unknown, already used or expired.
    pub async fn consume_confirmation(&self, token: &str) -> Result<Account, Error> {
        self.store
            .consume_confirmation(token, Utc::now())
            .await?
            .ok_or(Error::TokenInvalid)
    }

    /// Replace any outstanding reset challenge and persist it. `None` when
    /// the account is gone.
    ///
    /// # Errors
    /// Store failures only.
    pub async fn issue_reset(&self, account_id: Uuid) -> Result<Option<(Account, String)>, Error> {
        let token = opaque::generate();
        let expires = Utc::now() + self.reset_ttl;
        let Some(account) = self
            .store
            .set_reset_challenge(account_id, &token, expires)
            .await?
        else {
            return Ok(None);
        };
        debug!(account_id = %account.id, "reset challenge issued");
        Ok(Some((account, token)))
    }

    /// Look up the account an unexpired reset token belongs to, without
    /// consuming it.
    ///
    /// # Errors
    /// [`Error::TokenInvalid`] when no active challenge matches.
    pub async fn find_active_reset(&self, token: &str) -> Result<Account, Error> {
        self.store
            .find_by_active_reset_token(token, Utc::now())
            .await?
            .ok_or(Error::TokenInvalid)
    }

    /// Redeem a reset challenge, writing `password_hash` in the same update.
    ///
    /// # Errors
    /// [`Error::TokenInvalid`] when the token is unknown, already used or
    /// expired. The cases are not distinguished.
    pub async fn consume_reset(&self, token: &str, password_hash: &str) -> Result<Account, Error> {
        self.store
            .consume_reset(token, password_hash, Utc::now())
            .await?
            .ok_or(Error::TokenInvalid)
    }

    /// # Errors
    /// Returns an internal error if the token cannot be encoded.
    pub fn issue_session(&self, account_id: Uuid) -> Result<String, Error> {
        self.sessions
            .issue(account_id, Utc::now().timestamp())
            .context("Failed to sign session token")
            .map_err(Error::Internal)
    }

    /// # Errors
    /// [`SessionError::Expired`] past `exp`; other variants for anything
    /// that was not signed here.
    pub fn verify_session(&self, token: &str) -> Result<Uuid, SessionError> {
        self.sessions.verify(token, Utc::now().timestamp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryAccountStore;
    use anyhow::{anyhow, Result};
    use secrecy::SecretString;

    fn service(store: Arc<MemoryAccountStore>, session_ttl: Duration) -> Result<TokenService> {
        let signer = SessionSigner::new(
            SecretString::from("0123456789abcdef0123456789abcdef"),
            "gatehouse",
            session_ttl,
        )?;
        TokenService::new(store, signer, DEFAULT_CONFIRMATION_TTL, DEFAULT_RESET_TTL)
    }

    async fn alice(store: &MemoryAccountStore) -> Result<Account> {
        let account = Account::new(
            "alice".to_string(),
            "alice@x.com",
            "$argon2id$stub".to_string(),
            Utc::now(),
        );
        Ok(store.create(account).await?)
    }

    #[tokio::test]
    async fn reissuing_confirmation_replaces_the_previous_token() -> Result<()> {
        let store = Arc::new(MemoryAccountStore::new());
        let tokens = service(store.clone(), Duration::from_secs(60))?;
        let account = alice(&store).await?;

        let (account, first) = tokens
            .issue_confirmation(account.id)
            .await?
            .ok_or_else(|| anyhow!("no first challenge"))?;
        let (_, second) = tokens
            .issue_confirmation(account.id)
            .await?
            .ok_or_else(|| anyhow!("no second challenge"))?;
        assert_ne!(first, second);

        assert!(matches!(
            tokens.consume_confirmation(&first).await,
            Err(Error::TokenInvalid)
        ));
        let confirmed = tokens.consume_confirmation(&second).await?;
        assert!(confirmed.is_email_confirmed);
        assert!(confirmed.email_confirmation_token.is_none());
        assert!(confirmed.email_confirmation_expires.is_none());

        assert!(matches!(
            tokens.consume_confirmation(&second).await,
            Err(Error::TokenInvalid)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn stamped_confirmation_expires_after_ttl() -> Result<()> {
        let store = Arc::new(MemoryAccountStore::new());
        let tokens = service(store.clone(), Duration::from_secs(60))?;
        let mut account = Account::new(
            "bob".to_string(),
            "bob@x.com",
            "$argon2id$stub".to_string(),
            Utc::now(),
        );
        let token = tokens.stamp_confirmation(&mut account, Utc::now() - chrono::Duration::hours(25));
        store.create(account).await?;

        assert!(matches!(
            tokens.consume_confirmation(&token).await,
            Err(Error::TokenInvalid)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn reset_token_is_single_use() -> Result<()> {
        let store = Arc::new(MemoryAccountStore::new());
        let tokens = service(store.clone(), Duration::from_secs(60))?;
        let account = alice(&store).await?;

        let (_, token) = tokens
            .issue_reset(account.id)
            .await?
            .ok_or_else(|| anyhow!("no reset challenge"))?;
        assert_eq!(tokens.find_active_reset(&token).await?.id, account.id);

        let updated = tokens.consume_reset(&token, "$argon2id$new").await?;
        assert_eq!(updated.password_hash, "$argon2id$new");
        assert!(matches!(
            tokens.consume_reset(&token, "$argon2id$again").await,
            Err(Error::TokenInvalid)
        ));
        assert!(matches!(
            tokens.find_active_reset(&token).await,
            Err(Error::TokenInvalid)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn issue_on_deleted_account_is_none() -> Result<()> {
        let store = Arc::new(MemoryAccountStore::new());
        let tokens = service(store.clone(), Duration::from_secs(60))?;
        let account = alice(&store).await?;
        store.delete(account.id).await?;

        assert!(tokens.issue_reset(account.id).await?.is_none());
        assert!(tokens.issue_confirmation(account.id).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn confirmation_is_not_reissued_after_confirming() -> Result<()> {
        let store = Arc::new(MemoryAccountStore::new());
        let tokens = service(store.clone(), Duration::from_secs(60))?;
        let account = alice(&store).await?;

        let (_, token) = tokens
            .issue_confirmation(account.id)
            .await?
            .ok_or_else(|| anyhow!("no challenge"))?;
        tokens.consume_confirmation(&token).await?;

        assert!(tokens.issue_confirmation(account.id).await?.is_none());
        let current = store
            .find_by_id(account.id)
            .await?
            .ok_or_else(|| anyhow!("account vanished"))?;
        assert!(current.is_email_confirmed);
        Ok(())
    }

    #[test]
    fn session_round_trip() -> Result<()> {
        let tokens = service(Arc::new(MemoryAccountStore::new()), Duration::from_secs(60))?;
        let id = Uuid::new_v4();
        let token = tokens.issue_session(id)?;
        assert_eq!(tokens.verify_session(&token)?, id);
        Ok(())
    }

    #[test]
    fn zero_ttl_session_is_already_expired() -> Result<()> {
        let tokens = service(Arc::new(MemoryAccountStore::new()), Duration::ZERO)?;
        let token = tokens.issue_session(Uuid::new_v4())?;
        assert!(matches!(
            tokens.verify_session(&token),
            Err(SessionError::Expired)
        ));
        Ok(())
    }

    #[test]
    fn opaque_tokens_are_unique_hex() {
        let first = TokenService::generate_opaque();
        let second = TokenService::generate_opaque();
        assert_ne!(first, second);
        assert_eq!(first.len(), 64);
        assert!(opaque::is_well_formed(&first));
    }
}
