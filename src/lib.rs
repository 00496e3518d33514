//! # Gatehouse (Account Credentials & Sessions)
//!
//! `gatehouse` registers accounts, confirms email ownership, authenticates
//! logins and issues bearer session tokens. Sensitive routes sit behind an
//! authorization chain and per-route rate limits.
//!
//! ## Account Lifecycle
//!
//! - **Registration** creates an unconfirmed account and issues a confirmation
//!   challenge (an opaque hex token delivered by email).
//! - **Confirmation** consumes the challenge and flips `is_email_confirmed`
//!   exactly once. Only confirmed accounts can log in or use a session.
//! - **Password reset** issues a short-lived challenge (10 minutes by default);
//!   consuming it replaces the password and clears the challenge atomically.
//!
//! ## Sessions
//!
//! Sessions are stateless HS256 tokens carrying the account id and an expiry.
//! Any holder of the process secret can verify them without a store lookup.
//! They are not individually revocable.
//!
//! ## Rate Limiting
//!
//! Fixed windows keyed by client address and route class, held in process
//! memory. Multiple instances do not share counters.

pub mod account;
pub mod api;
pub mod cli;
pub mod credentials;
pub mod error;
pub mod store;
pub mod tokens;

pub use error::{AuthFailure, Error, FieldError};

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(
            GIT_COMMIT_HASH.len() >= 7,
            "GIT_COMMIT_HASH should be at least 7 characters long, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
