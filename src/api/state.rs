//! Auth configuration and the shared state handed to handlers.

use anyhow::{Context, Result};
use secrecy::SecretString;
use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use crate::{
    api::{
        notify::{NotificationDispatcher, Notifier},
        rate_limit::RateLimits,
    },
    credentials::{CredentialManager, HashCost},
    store::AccountStore,
    tokens::{
        session::DEFAULT_SESSION_TTL, SessionSigner, TokenService, DEFAULT_CONFIRMATION_TTL,
        DEFAULT_RESET_TTL,
    },
};

const DEFAULT_FRONTEND_BASE_URL: &str = "http://localhost:3000";
const SESSION_ISSUER: &str = env!("CARGO_PKG_NAME");

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Environment {
    #[default]
    Production,
    Development,
}

impl Environment {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Development => "development",
        }
    }

    #[must_use]
    pub const fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" => Ok(Self::Development),
            other => Err(format!("unknown environment: {other}")),
        }
    }
}

#[derive(Clone)]
pub struct AuthConfig {
    frontend_base_url: String,
    session_secret: SecretString,
    session_ttl_seconds: u64,
    confirmation_ttl_seconds: u64,
    reset_ttl_seconds: u64,
    hash_cost: HashCost,
    rate_limits: RateLimits,
    environment: Environment,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("frontend_base_url", &self.frontend_base_url)
            .field("session_ttl_seconds", &self.session_ttl_seconds)
            .field("confirmation_ttl_seconds", &self.confirmation_ttl_seconds)
            .field("reset_ttl_seconds", &self.reset_ttl_seconds)
            .field("hash_cost", &self.hash_cost)
            .field("rate_limits", &self.rate_limits)
            .field("environment", &self.environment)
            .finish_non_exhaustive()
    }
}

impl AuthConfig {
    #[must_use]
    pub fn new(session_secret: SecretString) -> Self {
        Self {
            frontend_base_url: DEFAULT_FRONTEND_BASE_URL.to_string(),
            session_secret,
            session_ttl_seconds: DEFAULT_SESSION_TTL.as_secs(),
            confirmation_ttl_seconds: DEFAULT_CONFIRMATION_TTL.as_secs(),
            reset_ttl_seconds: DEFAULT_RESET_TTL.as_secs(),
            hash_cost: HashCost::default(),
            rate_limits: RateLimits::default(),
            environment: Environment::default(),
        }
    }

    #[must_use]
    pub fn with_frontend_base_url(mut self, url: String) -> Self {
        // Links are built as `{base}/path`.
        self.frontend_base_url = url.trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn with_session_ttl_seconds(mut self, seconds: u64) -> Self {
        self.session_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_confirmation_ttl_seconds(mut self, seconds: u64) -> Self {
        self.confirmation_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_reset_ttl_seconds(mut self, seconds: u64) -> Self {
        self.reset_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_hash_cost(mut self, cost: HashCost) -> Self {
        self.hash_cost = cost;
        self
    }

    #[must_use]
    pub fn with_rate_limits(mut self, limits: RateLimits) -> Self {
        self.rate_limits = limits;
        self
    }

    #[must_use]
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    #[must_use]
    pub fn frontend_base_url(&self) -> &str {
        &self.frontend_base_url
    }

    #[must_use]
    pub fn session_ttl_seconds(&self) -> u64 {
        self.session_ttl_seconds
    }

    #[must_use]
    pub fn confirmation_ttl_seconds(&self) -> u64 {
        self.confirmation_ttl_seconds
    }

    #[must_use]
    pub fn reset_ttl_seconds(&self) -> u64 {
        self.reset_ttl_seconds
    }

    #[must_use]
    pub fn hash_cost(&self) -> HashCost {
        self.hash_cost
    }

    #[must_use]
    pub fn rate_limits(&self) -> RateLimits {
        self.rate_limits
    }

    #[must_use]
    pub fn environment(&self) -> Environment {
        self.environment
    }
}

/// Everything a handler needs, shared behind an `Arc` extension.
pub struct AuthState {
    config: AuthConfig,
    store: Arc<dyn AccountStore>,
    credentials: CredentialManager,
    tokens: TokenService,
    notifications: NotificationDispatcher,
}

impl fmt::Debug for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthState")
            .field("config", &self.config)
            .field("tokens", &self.tokens)
            .finish_non_exhaustive()
    }
}

impl AuthState {
    /// Wire the core services from `config`.
    ///
    /// # Errors
    /// Returns an error if the session secret is too short, a TTL is out of
    /// range or the hash cost is rejected.
    pub fn new(
        config: AuthConfig,
        store: Arc<dyn AccountStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let signer = SessionSigner::new(
            config.session_secret.clone(),
            SESSION_ISSUER,
            Duration::from_secs(config.session_ttl_seconds),
        )
        .context("Invalid session secret")?;
        let tokens = TokenService::new(
            store.clone(),
            signer,
            Duration::from_secs(config.confirmation_ttl_seconds),
            Duration::from_secs(config.reset_ttl_seconds),
        )?;
        let credentials =
            CredentialManager::new(config.hash_cost).context("Invalid password hash cost")?;
        let notifications = NotificationDispatcher::new(notifier, config.frontend_base_url.clone());

        Ok(Self {
            config,
            store,
            credentials,
            tokens,
            notifications,
        })
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &dyn AccountStore {
        self.store.as_ref()
    }

    #[must_use]
    pub fn credentials(&self) -> &CredentialManager {
        &self.credentials
    }

    #[must_use]
    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    #[must_use]
    pub fn notifications(&self) -> &NotificationDispatcher {
        &self.notifications
    }
}
