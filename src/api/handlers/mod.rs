pub mod auth;
pub mod health;
pub mod types;
pub mod users;

pub use self::health::health;

// common validation for the handlers
use axum::extract::rejection::{JsonRejection, QueryRejection};
use regex::Regex;
use tracing::debug;
use url::Url;

use crate::{
    account::normalize_email,
    error::{Error, FieldError},
    tokens::opaque,
};

pub const MSG_USERNAME_LENGTH: &str = "Username must be between 3 and 30 characters";
pub const MSG_USERNAME_CHARS: &str = "Username can only contain letters, numbers, and underscores";
pub const MSG_EMAIL: &str = "Please provide a valid email address";
pub const MSG_PASSWORD_LENGTH: &str = "Password must be at least 6 characters long";
pub const MSG_PASSWORD_MIX: &str =
    "Password must contain at least one lowercase letter, one uppercase letter, and one number";

const PASSWORD_MIN_LEN: usize = 6;

#[must_use]
pub fn valid_email(email: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|re| re.is_match(email))
}

#[must_use]
pub fn valid_username_chars(username: &str) -> bool {
    Regex::new(r"^[A-Za-z0-9_]+$").is_ok_and(|re| re.is_match(username))
}

/// Accumulates field errors so a request reports every problem at once.
#[derive(Debug, Default)]
pub(crate) struct Validator {
    errors: Vec<FieldError>,
}

impl Validator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, field: &str, message: &str) {
        self.errors.push(FieldError::new(field, message));
    }

    /// Trimmed username, or a recorded error.
    pub(crate) fn username(&mut self, field: &str, raw: &str) -> Option<String> {
        let username = raw.trim();
        let len = username.chars().count();
        if !(3..=30).contains(&len) {
            self.push(field, MSG_USERNAME_LENGTH);
            return None;
        }
        if !valid_username_chars(username) {
            self.push(field, MSG_USERNAME_CHARS);
            return None;
        }
        Some(username.to_string())
    }

    /// Normalized email, or a recorded error.
    pub(crate) fn email(&mut self, field: &str, raw: &str) -> Option<String> {
        let email = normalize_email(raw);
        if valid_email(&email) {
            Some(email)
        } else {
            self.push(field, MSG_EMAIL);
            None
        }
    }

    /// Length and character-class policy for a new password.
    pub(crate) fn new_password(&mut self, field: &str, password: &str, label: &str) -> bool {
        if password.chars().count() < PASSWORD_MIN_LEN {
            self.push(field, &format!("{label} must be at least 6 characters long"));
            return false;
        }
        let lower = password.chars().any(|c| c.is_ascii_lowercase());
        let upper = password.chars().any(|c| c.is_ascii_uppercase());
        let digit = password.chars().any(|c| c.is_ascii_digit());
        if !(lower && upper && digit) {
            self.push(
                field,
                &format!(
                    "{label} must contain at least one lowercase letter, one uppercase letter, and one number"
                ),
            );
            return false;
        }
        true
    }

    pub(crate) fn required(&mut self, field: &str, value: &str, message: &str) -> bool {
        if value.trim().is_empty() {
            self.push(field, message);
            return false;
        }
        true
    }

    /// Absolute http(s) URL.
    pub(crate) fn url(&mut self, field: &str, raw: &str, message: &str) -> Option<String> {
        match Url::parse(raw.trim()) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.host_str().is_some() => {
                Some(raw.trim().to_string())
            }
            _ => {
                self.push(field, message);
                None
            }
        }
    }

    /// # Errors
    /// [`Error::Validation`] with every recorded problem.
    pub(crate) fn finish(self) -> Result<(), Error> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(self.errors))
        }
    }
}

/// Reject path tokens that cannot have been issued here.
pub(crate) fn check_token(token: &str) -> Result<(), Error> {
    if opaque::is_well_formed(token) {
        Ok(())
    } else {
        Err(Error::invalid("token", "Invalid token format"))
    }
}

pub(crate) fn body_rejected(rejection: &JsonRejection) -> Error {
    debug!("Rejected request body: {rejection}");
    Error::invalid("body", "Request body must be valid JSON with the expected fields")
}

pub(crate) fn query_rejected(rejection: &QueryRejection) -> Error {
    debug!("Rejected query string: {rejection}");
    Error::invalid("query", "Invalid query string")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn errors(validator: Validator) -> Vec<FieldError> {
        match validator.finish() {
            Err(Error::Validation(errors)) => errors,
            _ => Vec::new(),
        }
    }

    #[test]
    fn valid_email_shapes() {
        assert!(valid_email("alice@x.com"));
        assert!(!valid_email("alice@x"));
        assert!(!valid_email("alice x@x.com"));
        assert!(!valid_email("@x.com"));
    }

    #[test]
    fn username_rules() {
        let mut v = Validator::new();
        assert_eq!(v.username("username", "  alice_1 "), Some("alice_1".to_string()));
        assert_eq!(v.username("username", "al"), None);
        assert_eq!(v.username("username", "alice!"), None);
        assert_eq!(v.username("username", &"a".repeat(31)), None);
        let errors = errors(v);
        assert_eq!(errors.len(), 3);
        assert_eq!(errors[0].message, MSG_USERNAME_LENGTH);
        assert_eq!(errors[1].message, MSG_USERNAME_CHARS);
    }

    #[test]
    fn password_policy() {
        let mut v = Validator::new();
        assert!(v.new_password("password", "Passw0rd", "Password"));
        assert!(!v.new_password("password", "Pa1", "Password"));
        assert!(!v.new_password("password", "password1", "Password"));
        assert!(!v.new_password("password", "PASSWORD1", "Password"));
        assert!(!v.new_password("password", "Password", "Password"));
        let errors = errors(v);
        assert_eq!(errors.len(), 4);
        assert_eq!(errors[0].message, MSG_PASSWORD_LENGTH);
        assert_eq!(errors[1].message, MSG_PASSWORD_MIX);
    }

    #[test]
    fn email_is_normalized() {
        let mut v = Validator::new();
        assert_eq!(v.email("email", " Alice@X.COM "), Some("alice@x.com".to_string()));
        assert!(v.finish().is_ok());
    }

    #[test]
    fn url_requires_http_scheme() {
        let mut v = Validator::new();
        assert!(v.url("profilePicture", "https://cdn.x.com/a.png", "bad").is_some());
        assert!(v.url("profilePicture", "ftp://cdn.x.com/a.png", "bad").is_none());
        assert!(v.url("profilePicture", "not a url", "bad").is_none());
        assert_eq!(errors(v).len(), 2);
    }

    #[test]
    fn token_shape() {
        assert!(check_token(&"ab".repeat(32)).is_ok());
        assert!(check_token("xyz").is_err());
    }
}
