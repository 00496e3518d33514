//! Account records and the views derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Standard,
    Admin,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "standard" => Ok(Self::Standard),
            "admin" => Ok(Self::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Persisted account state.
///
/// Challenge fields travel in pairs: a token is only meaningful together with
/// its expiry, and both are set or cleared in the same write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub id: Uuid,
    pub username: String,
    /// Always stored trimmed and lowercased.
    pub email: String,
    pub password_hash: String,
    pub is_email_confirmed: bool,
    pub email_confirmation_token: Option<String>,
    pub email_confirmation_expires: Option<DateTime<Utc>>,
    pub password_reset_token: Option<String>,
    pub password_reset_expires: Option<DateTime<Utc>>,
    pub role: Role,
    pub profile_picture: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Build a fresh, unconfirmed standard account.
    #[must_use]
    pub fn new(username: String, email: &str, password_hash: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            username,
            email: normalize_email(email),
            password_hash,
            is_email_confirmed: false,
            email_confirmation_token: None,
            email_confirmation_expires: None,
            password_reset_token: None,
            password_reset_expires: None,
            role: Role::Standard,
            profile_picture: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn view(&self) -> AccountView {
        AccountView::from(self)
    }

    #[must_use]
    pub fn principal(&self) -> Principal {
        Principal {
            id: self.id,
            username: self.username.clone(),
            email: self.email.clone(),
            role: self.role,
        }
    }

    /// True when `token` matches the stored confirmation challenge and it has not expired.
    #[must_use]
    pub fn confirmation_matches(&self, token: &str, now: DateTime<Utc>) -> bool {
        challenge_matches(
            self.email_confirmation_token.as_deref(),
            self.email_confirmation_expires,
            token,
            now,
        )
    }

    /// True when `token` matches the stored reset challenge and it has not expired.
    #[must_use]
    pub fn reset_matches(&self, token: &str, now: DateTime<Utc>) -> bool {
        challenge_matches(
            self.password_reset_token.as_deref(),
            self.password_reset_expires,
            token,
            now,
        )
    }
}

fn challenge_matches(
    stored: Option<&str>,
    expires: Option<DateTime<Utc>>,
    token: &str,
    now: DateTime<Utc>,
) -> bool {
    match (stored, expires) {
        (Some(stored), Some(expires)) => stored == token && expires > now,
        _ => false,
    }
}

/// Lowercase and trim an email for storage and lookups.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Account representation safe to return to callers: no hash, no challenges.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccountView {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub is_email_confirmed: bool,
    pub role: Role,
    pub profile_picture: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Account> for AccountView {
    fn from(account: &Account) -> Self {
        Self {
            id: account.id,
            username: account.username.clone(),
            email: account.email.clone(),
            is_email_confirmed: account.is_email_confirmed,
            role: account.role,
            profile_picture: account.profile_picture.clone(),
            created_at: account.created_at,
            updated_at: account.updated_at,
        }
    }
}

/// Authenticated identity attached to a request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
pub struct Principal {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub role: Role,
}
