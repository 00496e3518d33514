//! Fixed-window admission control keyed by client and route class.
//!
//! Counters live in process memory. Separate instances do not share them.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension,
};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Error;

pub const HEADER_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
pub const HEADER_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
pub const HEADER_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");

const UNKNOWN_CLIENT: &str = "unknown";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RateClass {
    Generic,
    /// register, login, reset submission
    AuthSensitive,
    /// resend confirmation, reset request
    EmailTriggering,
    ProfileUpdate,
    /// change password, delete account
    AccountSensitive,
}

impl RateClass {
    pub const ALL: [Self; 5] = [
        Self::Generic,
        Self::AuthSensitive,
        Self::EmailTriggering,
        Self::ProfileUpdate,
        Self::AccountSensitive,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::AuthSensitive => "auth-sensitive",
            Self::EmailTriggering => "email-triggering",
            Self::ProfileUpdate => "profile-update",
            Self::AccountSensitive => "account-sensitive",
        }
    }

    /// Body message returned when the class quota is exhausted.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::Generic => "Too many requests, please try again later",
            Self::AuthSensitive => "Too many authentication attempts, please try again later",
            Self::EmailTriggering => "Too many email requests, please try again later",
            Self::ProfileUpdate => "Too many profile updates, please try again later",
            Self::AccountSensitive => "Too many sensitive operations, please try again later",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Quota {
    pub window: Duration,
    pub max: u32,
}

impl Quota {
    #[must_use]
    pub const fn new(window: Duration, max: u32) -> Self {
        Self { window, max }
    }

    const fn minutes(minutes: u64, max: u32) -> Self {
        Self::new(Duration::from_secs(minutes * 60), max)
    }
}

/// Quota per route class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimits {
    pub generic: Quota,
    pub auth_sensitive: Quota,
    pub email_triggering: Quota,
    pub profile_update: Quota,
    pub account_sensitive: Quota,
    /// Key on `X-Forwarded-For` / `X-Real-IP` instead of the peer address.
    /// Only safe when a proxy in front overwrites those headers.
    pub trust_proxy: bool,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            generic: Quota::minutes(15, 100),
            auth_sensitive: Quota::minutes(15, 5),
            email_triggering: Quota::minutes(60, 3),
            profile_update: Quota::minutes(60, 10),
            account_sensitive: Quota::minutes(15, 3),
            trust_proxy: false,
        }
    }
}

impl RateLimits {
    #[must_use]
    pub const fn quota(&self, class: RateClass) -> Quota {
        match class {
            RateClass::Generic => self.generic,
            RateClass::AuthSensitive => self.auth_sensitive,
            RateClass::EmailTriggering => self.email_triggering,
            RateClass::ProfileUpdate => self.profile_update,
            RateClass::AccountSensitive => self.account_sensitive,
        }
    }

    #[must_use]
    pub fn with(mut self, class: RateClass, quota: Quota) -> Self {
        match class {
            RateClass::Generic => self.generic = quota,
            RateClass::AuthSensitive => self.auth_sensitive = quota,
            RateClass::EmailTriggering => self.email_triggering = quota,
            RateClass::ProfileUpdate => self.profile_update = quota,
            RateClass::AccountSensitive => self.account_sensitive = quota,
        }
        self
    }

    #[must_use]
    pub fn with_trust_proxy(mut self, trust_proxy: bool) -> Self {
        self.trust_proxy = trust_proxy;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed {
        limit: u32,
        remaining: u32,
        reset_after: Duration,
    },
    Limited {
        limit: u32,
        retry_after: Duration,
    },
}

pub trait RateLimiter: Send + Sync {
    fn check(&self, key: &str, class: RateClass) -> RateLimitDecision;

    /// Whether client identity may come from forwarding headers.
    fn trusts_proxy(&self) -> bool {
        false
    }
}

#[derive(Clone, Copy, Debug)]
struct Window {
    started: Instant,
    count: u32,
}

/// In-memory fixed-window limiter.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    limits: RateLimits,
    windows: Mutex<HashMap<(String, RateClass), Window>>,
}

impl FixedWindowLimiter {
    #[must_use]
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            windows: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn limits(&self) -> &RateLimits {
        &self.limits
    }

    fn windows(&self) -> MutexGuard<'_, HashMap<(String, RateClass), Window>> {
        // A panic while holding the lock cannot leave a window half-updated.
        self.windows
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Count one request for `(key, class)` at `now`.
    pub fn check_at(&self, key: &str, class: RateClass, now: Instant) -> RateLimitDecision {
        let quota = self.limits.quota(class);
        let mut windows = self.windows();
        let window = windows
            .entry((key.to_string(), class))
            .or_insert(Window {
                started: now,
                count: 0,
            });

        let elapsed = now.saturating_duration_since(window.started);
        if elapsed >= quota.window {
            *window = Window {
                started: now,
                count: 0,
            };
        }
        let reset_after = quota
            .window
            .saturating_sub(now.saturating_duration_since(window.started));

        if window.count >= quota.max {
            return RateLimitDecision::Limited {
                limit: quota.max,
                retry_after: reset_after,
            };
        }
        window.count += 1;
        RateLimitDecision::Allowed {
            limit: quota.max,
            remaining: quota.max - window.count,
            reset_after,
        }
    }

    /// Drop windows that have fully elapsed at `now`. Returns how many were removed.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut windows = self.windows();
        let before = windows.len();
        windows.retain(|(_, class), window| {
            now.saturating_duration_since(window.started) < self.limits.quota(*class).window
        });
        before - windows.len()
    }

    /// Prune elapsed windows every `every` until the runtime shuts down.
    #[must_use]
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = limiter.sweep_at(Instant::now());
                if removed > 0 {
                    debug!(removed, "pruned rate limit windows");
                }
            }
        })
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn check(&self, key: &str, class: RateClass) -> RateLimitDecision {
        self.check_at(key, class, Instant::now())
    }

    fn trusts_proxy(&self) -> bool {
        self.limits.trust_proxy
    }
}

/// Extract a client IP for rate limiting from common proxy headers.
pub(crate) fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Rate limit key for `request`. Forwarding headers are client controlled,
/// so they only count when `trust_proxy` is set.
pub(crate) fn client_key(request: &Request, trust_proxy: bool) -> String {
    let forwarded = if trust_proxy {
        extract_client_ip(request.headers())
    } else {
        None
    };
    forwarded
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// Seconds for header values, rounded up so clients never retry early.
pub(crate) fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// Per-route admission middleware.
///
/// Mounted with `middleware::from_fn_with_state(RateClass::X, enforce_rate_limit)`;
/// the limiter itself comes from the shared `Extension`.
pub async fn enforce_rate_limit(
    State(class): State<RateClass>,
    Extension(limiter): Extension<Arc<dyn RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let key = client_key(&request, limiter.trusts_proxy());
    match limiter.check(&key, class) {
        RateLimitDecision::Allowed {
            limit,
            remaining,
            reset_after,
        } => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert(HEADER_LIMIT, HeaderValue::from(limit));
            headers.insert(HEADER_REMAINING, HeaderValue::from(remaining));
            headers.insert(HEADER_RESET, HeaderValue::from(ceil_secs(reset_after)));
            response
        }
        RateLimitDecision::Limited { limit, retry_after } => {
            warn!(client = %key, class = class.as_str(), "rate limit exceeded");
            Error::RateLimited {
                class,
                limit,
                retry_after,
            }
            .into_response()
        }
    }
}
