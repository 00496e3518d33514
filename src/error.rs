//! Failure taxonomy shared by the core and the HTTP surface.
//!
//! Every failure a request can end in is one variant here. The HTTP mapping
//! lives in `api::response`; nothing branches on error strings.

use serde::Serialize;
use std::{fmt, time::Duration};
use utoipa::ToSchema;

use crate::api::rate_limit::RateClass;

/// Why a request could not be tied to a confirmed account.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthFailure {
    /// Missing `Authorization` header or a scheme other than `Bearer`.
    NoToken,
    /// Signature, algorithm or structure of the session token is wrong.
    InvalidToken,
    ExpiredToken,
    /// Token verified but its subject no longer exists.
    StaleToken,
    EmailNotConfirmed,
    /// Unknown identifier or wrong password; never distinguished.
    BadCredentials,
}

impl AuthFailure {
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NoToken => "Access denied. No token provided.",
            Self::InvalidToken => "Invalid token",
            Self::ExpiredToken => "Token expired",
            Self::StaleToken => "Token is no longer valid",
            Self::EmailNotConfirmed => "Please confirm your email before continuing",
            Self::BadCredentials => "Invalid credentials",
        }
    }
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// A single rejected request field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation failed on {} field(s)", .0.len())]
    Validation(Vec<FieldError>),
    #[error("{0} already in use")]
    Conflict(&'static str),
    #[error("unauthenticated: {0}")]
    Unauthenticated(AuthFailure),
    #[error("forbidden")]
    Forbidden,
    #[error("invalid or expired token")]
    TokenInvalid,
    #[error("not found")]
    NotFound,
    #[error("rate limited on {class:?}, retry in {}s", retry_after.as_secs())]
    RateLimited {
        class: RateClass,
        limit: u32,
        retry_after: Duration,
    },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Shorthand for a validation failure on one field.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation(vec![FieldError::new(field, message)])
    }
}

impl From<AuthFailure> for Error {
    fn from(failure: AuthFailure) -> Self {
        Self::Unauthenticated(failure)
    }
}
