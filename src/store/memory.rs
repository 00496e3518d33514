use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{AccountStore, Page, StoreError, StoreResult};
use crate::account::{Account, normalize_email};

/// Process-local store for development and tests. Contents are lost on exit.
#[derive(Debug, Default)]
pub struct MemoryAccountStore {
    accounts: RwLock<HashMap<Uuid, Account>>,
}

impl MemoryAccountStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.accounts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.accounts.read().await.is_empty()
    }
}

fn conflicting_field(
    accounts: &HashMap<Uuid, Account>,
    candidate: &Account,
) -> Option<&'static str> {
    accounts
        .values()
        .filter(|other| other.id != candidate.id)
        .find_map(|other| {
            if other.email == candidate.email {
                Some("email")
            } else if other.username == candidate.username {
                Some("username")
            } else {
                None
            }
        })
}

/// Next `updated_at`, strictly after `previous` so a guarded save always
/// sees the change.
fn touched(previous: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(previous + chrono::Duration::microseconds(1))
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn create(&self, mut account: Account) -> StoreResult<Account> {
        account.email = normalize_email(&account.email);
        let mut accounts = self.accounts.write().await;
        if let Some(field) = conflicting_field(&accounts, &account) {
            return Err(StoreError::Conflict(field));
        }
        if accounts.contains_key(&account.id) {
            return Err(StoreError::Conflict("id"));
        }
        accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn find_by_email_or_username(
        &self,
        email: &str,
        username: &str,
    ) -> StoreResult<Option<Account>> {
        let email = normalize_email(email);
        let accounts = self.accounts.read().await;
        Ok(accounts
            .values()
            .find(|account| account.email == email || account.username == username)
            .cloned())
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<Account>> {
        let email = normalize_email(email);
        let accounts = self.accounts.read().await;
        Ok(accounts
            .values()
            .find(|account| account.email == email)
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Account>> {
        Ok(self.accounts.read().await.get(&id).cloned())
    }

    async fn find_by_confirmation_token(&self, token: &str) -> StoreResult<Option<Account>> {
        let accounts = self.accounts.read().await;
        Ok(accounts
            .values()
            .find(|account| account.email_confirmation_token.as_deref() == Some(token))
            .cloned())
    }

    async fn find_by_active_reset_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Account>> {
        let accounts = self.accounts.read().await;
        Ok(accounts
            .values()
            .find(|account| account.reset_matches(token, now))
            .cloned())
    }

    async fn set_confirmation_challenge(
        &self,
        id: Uuid,
        token: &str,
        expires: DateTime<Utc>,
    ) -> StoreResult<Option<Account>> {
        let mut accounts = self.accounts.write().await;
        let Some(account) = accounts
            .get_mut(&id)
            .filter(|account| !account.is_email_confirmed)
        else {
            return Ok(None);
        };
        account.email_confirmation_token = Some(token.to_string());
        account.email_confirmation_expires = Some(expires);
        account.updated_at = touched(account.updated_at);
        Ok(Some(account.clone()))
    }

    async fn set_reset_challenge(
        &self,
        id: Uuid,
        token: &str,
        expires: DateTime<Utc>,
    ) -> StoreResult<Option<Account>> {
        let mut accounts = self.accounts.write().await;
        let Some(account) = accounts.get_mut(&id) else {
            return Ok(None);
        };
        account.password_reset_token = Some(token.to_string());
        account.password_reset_expires = Some(expires);
        account.updated_at = touched(account.updated_at);
        Ok(Some(account.clone()))
    }

    async fn update_password_hash(
        &self,
        id: Uuid,
        password_hash: &str,
    ) -> StoreResult<Option<Account>> {
        let mut accounts = self.accounts.write().await;
        let Some(account) = accounts.get_mut(&id) else {
            return Ok(None);
        };
        account.password_hash = password_hash.to_string();
        account.updated_at = touched(account.updated_at);
        Ok(Some(account.clone()))
    }

    async fn update_profile(
        &self,
        id: Uuid,
        username: Option<&str>,
        profile_picture: Option<&str>,
    ) -> StoreResult<Option<Account>> {
        let mut accounts = self.accounts.write().await;
        if let Some(username) = username {
            let taken = accounts
                .values()
                .any(|other| other.id != id && other.username == username);
            if taken {
                return Err(StoreError::Conflict("username"));
            }
        }
        let Some(account) = accounts.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(username) = username {
            account.username = username.to_string();
        }
        if let Some(picture) = profile_picture {
            account.profile_picture = Some(picture.to_string());
        }
        account.updated_at = touched(account.updated_at);
        Ok(Some(account.clone()))
    }

    async fn save(&self, account: &Account) -> StoreResult<Option<Account>> {
        let mut candidate = account.clone();
        candidate.email = normalize_email(&candidate.email);
        let mut accounts = self.accounts.write().await;
        let Some(stored) = accounts.get(&candidate.id) else {
            return Ok(None);
        };
        if stored.updated_at != candidate.updated_at {
            return Err(StoreError::Stale);
        }
        candidate.created_at = stored.created_at;
        candidate.updated_at = touched(stored.updated_at);
        if let Some(field) = conflicting_field(&accounts, &candidate) {
            return Err(StoreError::Conflict(field));
        }
        accounts.insert(candidate.id, candidate.clone());
        Ok(Some(candidate))
    }

    async fn delete(&self, id: Uuid) -> StoreResult<bool> {
        Ok(self.accounts.write().await.remove(&id).is_some())
    }

    async fn list_paginated(&self, page: u32, limit: u32) -> StoreResult<Page<Account>> {
        let accounts = self.accounts.read().await;
        let mut all: Vec<&Account> = accounts.values().collect();
        all.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let skip = usize::try_from(page.saturating_sub(1))
            .unwrap_or(usize::MAX)
            .saturating_mul(usize::try_from(limit).unwrap_or(usize::MAX));
        let items = all
            .into_iter()
            .skip(skip)
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .cloned()
            .collect();

        Ok(Page {
            items,
            total: accounts.len() as u64,
            page,
            limit,
        })
    }

    async fn consume_confirmation(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Account>> {
        let mut accounts = self.accounts.write().await;
        let Some(account) = accounts
            .values_mut()
            .find(|account| account.confirmation_matches(token, now))
        else {
            return Ok(None);
        };
        account.is_email_confirmed = true;
        account.email_confirmation_token = None;
        account.email_confirmation_expires = None;
        account.updated_at = now.max(touched(account.updated_at));
        Ok(Some(account.clone()))
    }

    async fn consume_reset(
        &self,
        token: &str,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Account>> {
        let mut accounts = self.accounts.write().await;
        let Some(account) = accounts
            .values_mut()
            .find(|account| account.reset_matches(token, now))
        else {
            return Ok(None);
        };
        account.password_hash = password_hash.to_string();
        account.password_reset_token = None;
        account.password_reset_expires = None;
        account.updated_at = now.max(touched(account.updated_at));
        Ok(Some(account.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Result, anyhow};
    use chrono::Duration;
    use std::sync::Arc;

    use crate::account::Role;

    fn account(username: &str, email: &str) -> Account {
        Account::new(
            username.to_string(),
            email,
            "$argon2id$stub".to_string(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn create_rejects_duplicate_email_case_insensitively() -> Result<()> {
        let store = MemoryAccountStore::new();
        store.create(account("alice", "alice@x.com")).await?;

        let err = store.create(account("alice2", "ALICE@x.com")).await.err();
        assert!(matches!(err, Some(StoreError::Conflict("email"))));

        let err = store.create(account("alice", "other@x.com")).await.err();
        assert!(matches!(err, Some(StoreError::Conflict("username"))));
        assert_eq!(store.len().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn find_by_email_or_username_matches_either() -> Result<()> {
        let store = MemoryAccountStore::new();
        let created = store.create(account("alice", "alice@x.com")).await?;

        let by_email = store.find_by_email_or_username("Alice@X.com", "nobody").await?;
        let by_name = store.find_by_email_or_username("nobody@x.com", "alice").await?;
        assert_eq!(by_email.map(|a| a.id), Some(created.id));
        assert_eq!(by_name.map(|a| a.id), Some(created.id));
        assert!(store.find_by_email_or_username("n@x.com", "n").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn update_profile_detects_username_collision() -> Result<()> {
        let store = MemoryAccountStore::new();
        store.create(account("alice", "alice@x.com")).await?;
        let bob = store.create(account("bob", "bob@x.com")).await?;

        let err = store.update_profile(bob.id, Some("alice"), None).await.err();
        assert!(matches!(err, Some(StoreError::Conflict("username"))));

        let updated = store
            .update_profile(bob.id, Some("bob"), Some("https://cdn.x.com/b.png"))
            .await?
            .ok_or_else(|| anyhow!("account vanished"))?;
        assert_eq!(updated.username, "bob");
        assert_eq!(updated.profile_picture.as_deref(), Some("https://cdn.x.com/b.png"));
        Ok(())
    }

    #[tokio::test]
    async fn narrow_updates_refresh_updated_at_and_ignore_missing() -> Result<()> {
        let store = MemoryAccountStore::new();
        let mut alice = account("alice", "alice@x.com");
        alice.updated_at = Utc::now() - Duration::days(1);
        let alice = store.create(alice).await?;

        let updated = store
            .update_password_hash(alice.id, "$argon2id$new")
            .await?
            .ok_or_else(|| anyhow!("account vanished"))?;
        assert!(updated.updated_at > alice.updated_at);
        assert_eq!(updated.password_hash, "$argon2id$new");

        let ghost = Uuid::new_v4();
        let expires = Utc::now() + Duration::minutes(10);
        assert!(store.update_password_hash(ghost, "x").await?.is_none());
        assert!(store.update_profile(ghost, Some("ghost"), None).await?.is_none());
        assert!(store.set_reset_challenge(ghost, "t", expires).await?.is_none());
        assert!(store
            .set_confirmation_challenge(ghost, "t", expires)
            .await?
            .is_none());
        Ok(())
    }

    #[tokio::test]
    async fn confirmation_challenge_not_set_once_confirmed() -> Result<()> {
        let store = MemoryAccountStore::new();
        let now = Utc::now();
        let alice = store.create(account("alice", "alice@x.com")).await?;
        let token = "cc".repeat(32);

        store
            .set_confirmation_challenge(alice.id, &token, now + Duration::hours(24))
            .await?
            .ok_or_else(|| anyhow!("challenge not set"))?;
        store
            .consume_confirmation(&token, now)
            .await?
            .ok_or_else(|| anyhow!("not confirmed"))?;

        let again = store
            .set_confirmation_challenge(alice.id, &"dd".repeat(32), now + Duration::hours(24))
            .await?;
        assert!(again.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn writes_after_a_stale_read_keep_consumed_challenges() -> Result<()> {
        let store = MemoryAccountStore::new();
        let now = Utc::now();
        let confirm = "ee".repeat(32);
        let reset = "ff".repeat(32);
        let mut alice = account("alice", "alice@x.com");
        alice.password_hash = "$h0".to_string();
        alice.email_confirmation_token = Some(confirm.clone());
        alice.email_confirmation_expires = Some(now + Duration::hours(24));
        alice.password_reset_token = Some(reset.clone());
        alice.password_reset_expires = Some(now + Duration::minutes(10));
        let snapshot = store.create(alice).await?;

        store
            .consume_confirmation(&confirm, now)
            .await?
            .ok_or_else(|| anyhow!("confirmation not consumed"))?;
        store
            .consume_reset(&reset, "$h1", now)
            .await?
            .ok_or_else(|| anyhow!("reset not consumed"))?;

        // Every write a handler can make while holding `snapshot`.
        store
            .update_profile(snapshot.id, Some("alice2"), Some("https://cdn.x.com/a.png"))
            .await?;
        store
            .set_reset_challenge(snapshot.id, &"12".repeat(32), now + Duration::minutes(10))
            .await?;
        assert!(store
            .set_confirmation_challenge(snapshot.id, &"34".repeat(32), now + Duration::hours(24))
            .await?
            .is_none());

        let current = store
            .find_by_id(snapshot.id)
            .await?
            .ok_or_else(|| anyhow!("account vanished"))?;
        assert!(current.is_email_confirmed);
        assert!(current.email_confirmation_token.is_none());
        assert_eq!(current.password_hash, "$h1");
        assert_eq!(current.username, "alice2");
        assert!(store.consume_reset(&reset, "$h2", now).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn save_refuses_a_copy_read_before_a_consume() -> Result<()> {
        let store = MemoryAccountStore::new();
        let now = Utc::now();
        let reset = "ab".repeat(32);
        let mut alice = account("alice", "alice@x.com");
        alice.password_reset_token = Some(reset.clone());
        alice.password_reset_expires = Some(now + Duration::minutes(10));
        let mut snapshot = store.create(alice).await?;

        store
            .consume_reset(&reset, "$new", now)
            .await?
            .ok_or_else(|| anyhow!("reset not consumed"))?;

        snapshot.profile_picture = Some("https://cdn.x.com/a.png".to_string());
        let err = store.save(&snapshot).await.err();
        assert!(matches!(err, Some(StoreError::Stale)));

        let current = store
            .find_by_id(snapshot.id)
            .await?
            .ok_or_else(|| anyhow!("account vanished"))?;
        assert!(current.password_reset_token.is_none());
        assert_eq!(current.password_hash, "$new");
        assert!(current.profile_picture.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn save_persists_a_fresh_copy() -> Result<()> {
        let store = MemoryAccountStore::new();
        store.create(account("bob", "bob@x.com")).await?;
        let mut alice = store.create(account("alice", "alice@x.com")).await?;

        alice.role = Role::Admin;
        alice.email = "Alice.New@X.com".to_string();
        let saved = store
            .save(&alice)
            .await?
            .ok_or_else(|| anyhow!("account vanished"))?;
        assert_eq!(saved.role, Role::Admin);
        assert_eq!(saved.email, "alice.new@x.com");
        assert!(saved.updated_at > alice.updated_at);

        // The returned copy is current; the one it came from is not.
        let err = store.save(&alice).await.err();
        assert!(matches!(err, Some(StoreError::Stale)));

        let mut taken = saved.clone();
        taken.username = "bob".to_string();
        let err = store.save(&taken).await.err();
        assert!(matches!(err, Some(StoreError::Conflict("username"))));

        store.delete(saved.id).await?;
        assert!(store.save(&saved).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn consume_reset_is_single_use_and_respects_expiry() -> Result<()> {
        let store = MemoryAccountStore::new();
        let now = Utc::now();
        let mut alice = account("alice", "alice@x.com");
        alice.password_reset_token = Some("aa".repeat(32));
        alice.password_reset_expires = Some(now + Duration::minutes(10));
        store.create(alice).await?;

        let late = now + Duration::minutes(11);
        assert!(store.consume_reset(&"aa".repeat(32), "new", late).await?.is_none());

        let consumed = store
            .consume_reset(&"aa".repeat(32), "new", now)
            .await?
            .ok_or_else(|| anyhow!("reset not consumed"))?;
        assert_eq!(consumed.password_hash, "new");
        assert!(consumed.password_reset_token.is_none());
        assert!(consumed.password_reset_expires.is_none());

        assert!(store.consume_reset(&"aa".repeat(32), "again", now).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_confirmation_succeeds_once() -> Result<()> {
        let store = Arc::new(MemoryAccountStore::new());
        let now = Utc::now();
        let token = "bb".repeat(32);
        let mut alice = account("alice", "alice@x.com");
        alice.email_confirmation_token = Some(token.clone());
        alice.email_confirmation_expires = Some(now + Duration::hours(24));
        store.create(alice).await?;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                store.consume_confirmation(&token, now).await
            }));
        }
        let mut successes = 0;
        for handle in handles {
            if handle.await??.is_some() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_reset_succeeds_once() -> Result<()> {
        let store = Arc::new(MemoryAccountStore::new());
        let now = Utc::now();
        let token = "ab".repeat(32);
        let mut alice = account("alice", "alice@x.com");
        alice.password_reset_token = Some(token.clone());
        alice.password_reset_expires = Some(now + Duration::minutes(10));
        let alice = store.create(alice).await?;

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                store.consume_reset(&token, &format!("$h{i}"), now).await
            }));
        }
        let mut winners = Vec::new();
        for handle in handles {
            if let Some(account) = handle.await?? {
                winners.push(account.password_hash);
            }
        }
        assert_eq!(winners.len(), 1);

        let current = store
            .find_by_id(alice.id)
            .await?
            .ok_or_else(|| anyhow!("account vanished"))?;
        assert_eq!(Some(&current.password_hash), winners.first());
        Ok(())
    }

    #[tokio::test]
    async fn list_paginated_orders_newest_first() -> Result<()> {
        let store = MemoryAccountStore::new();
        let base = Utc::now();
        for i in 0..5 {
            let mut record = account(&format!("user{i}"), &format!("user{i}@x.com"));
            record.created_at = base + Duration::seconds(i);
            store.create(record).await?;
        }

        let page = store.list_paginated(2, 2).await?;
        assert_eq!(page.total, 5);
        let names: Vec<_> = page.items.iter().map(|a| a.username.as_str()).collect();
        assert_eq!(names, vec!["user2", "user1"]);

        let beyond = store.list_paginated(9, 2).await?;
        assert!(beyond.items.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn delete_reports_presence() -> Result<()> {
        let store = MemoryAccountStore::new();
        let alice = store.create(account("alice", "alice@x.com")).await?;
        assert!(store.delete(alice.id).await?);
        assert!(!store.delete(alice.id).await?);
        assert!(store.is_empty().await);
        Ok(())
    }
}
