//! Bearer session tokens: compact JWS signed with HMAC-SHA256.
//!
//! Format is `base64url(header).base64url(claims).base64url(mac)` with no
//! padding. Verification needs only the process secret.

use base64ct::{Base64UrlUnpadded, Encoding};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::error::AuthFailure;

type HmacSha256 = Hmac<Sha256>;

pub const ALG: &str = "HS256";

/// Seven days.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Shortest accepted signing secret, in bytes.
pub const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionHeader {
    pub alg: String,
    pub typ: String,
}

impl SessionHeader {
    fn hs256() -> Self {
        Self {
            alg: ALG.to_string(),
            typ: "JWT".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionClaims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid issuer")]
    InvalidIssuer,
    #[error("invalid subject")]
    InvalidSubject,
    #[error("token expired")]
    Expired,
    #[error("signing secret must be at least {MIN_SECRET_LEN} bytes")]
    WeakSecret,
}

impl From<SessionError> for AuthFailure {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Expired => Self::ExpiredToken,
            _ => Self::InvalidToken,
        }
    }
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, SessionError> {
    let json = serde_json::to_vec(value)?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T, SessionError> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| SessionError::Base64)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Issues and verifies session tokens with one shared secret.
#[derive(Clone)]
pub struct SessionSigner {
    secret: SecretString,
    issuer: String,
    ttl: Duration,
}

impl std::fmt::Debug for SessionSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSigner")
            .field("issuer", &self.issuer)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl SessionSigner {
    /// # Errors
    /// Returns [`SessionError::WeakSecret`] if the secret is shorter than
    /// [`MIN_SECRET_LEN`] bytes.
    pub fn new(
        secret: SecretString,
        issuer: impl Into<String>,
        ttl: Duration,
    ) -> Result<Self, SessionError> {
        if secret.expose_secret().len() < MIN_SECRET_LEN {
            return Err(SessionError::WeakSecret);
        }
        Ok(Self {
            secret,
            issuer: issuer.into(),
            ttl,
        })
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn mac(&self) -> Result<HmacSha256, SessionError> {
        HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|_| SessionError::WeakSecret)
    }

    /// Sign a session for `account_id` issued at `now_unix_seconds`.
    ///
    /// # Errors
    /// Returns an error if the header or claims cannot be encoded.
    pub fn issue(&self, account_id: Uuid, now_unix_seconds: i64) -> Result<String, SessionError> {
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = SessionClaims {
            sub: account_id.to_string(),
            iat: now_unix_seconds,
            exp: now_unix_seconds.saturating_add(ttl),
            iss: self.issuer.clone(),
        };
        let header_b64 = b64e_json(&SessionHeader::hs256())?;
        let claims_b64 = b64e_json(&claims)?;
        let signing_input = format!("{header_b64}.{claims_b64}");

        let mut mac = self.mac()?;
        mac.update(signing_input.as_bytes());
        let signature_b64 = Base64UrlUnpadded::encode_string(&mac.finalize().into_bytes());

        Ok(format!("{signing_input}.{signature_b64}"))
    }

    /// Verify a session token and return the account id it was issued for.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - the token is malformed or contains invalid base64/json,
    /// - the algorithm is not HS256 or the signature does not match,
    /// - the issuer differs or the subject is not a UUID,
    /// - `exp <= now_unix_seconds` ([`SessionError::Expired`]).
    pub fn verify(&self, token: &str, now_unix_seconds: i64) -> Result<Uuid, SessionError> {
        let mut parts = token.split('.');
        let header_b64 = parts.next().ok_or(SessionError::TokenFormat)?;
        let claims_b64 = parts.next().ok_or(SessionError::TokenFormat)?;
        let sig_b64 = parts.next().ok_or(SessionError::TokenFormat)?;
        if parts.next().is_some() {
            return Err(SessionError::TokenFormat);
        }

        let header: SessionHeader = b64d_json(header_b64)?;
        if header.alg != ALG {
            return Err(SessionError::UnsupportedAlg(header.alg));
        }

        let signature =
            Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| SessionError::Base64)?;
        let mut mac = self.mac()?;
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(claims_b64.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| SessionError::InvalidSignature)?;

        let claims: SessionClaims = b64d_json(claims_b64)?;
        if claims.iss != self.issuer {
            return Err(SessionError::InvalidIssuer);
        }
        if claims.exp <= now_unix_seconds {
            return Err(SessionError::Expired);
        }

        Uuid::parse_str(&claims.sub).map_err(|_| SessionError::InvalidSubject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";
    const NOW: i64 = 1_700_000_000;

    fn signer() -> Result<SessionSigner> {
        Ok(SessionSigner::new(
            SecretString::from(SECRET),
            "gatehouse",
            Duration::from_secs(60),
        )?)
    }

    #[test]
    fn issue_then_verify_returns_subject() -> Result<()> {
        let signer = signer()?;
        let id = Uuid::new_v4();
        let token = signer.issue(id, NOW)?;

        assert_eq!(token.split('.').count(), 3);
        assert_eq!(signer.verify(&token, NOW + 59)?, id);
        Ok(())
    }

    #[test]
    fn expires_at_exp() -> Result<()> {
        let signer = signer()?;
        let token = signer.issue(Uuid::new_v4(), NOW)?;
        let err = signer.verify(&token, NOW + 60).err();
        assert!(matches!(err, Some(SessionError::Expired)));
        Ok(())
    }

    #[test]
    fn rejects_other_secret() -> Result<()> {
        let token = signer()?.issue(Uuid::new_v4(), NOW)?;
        let other = SessionSigner::new(
            SecretString::from("fedcba9876543210fedcba9876543210"),
            "gatehouse",
            Duration::from_secs(60),
        )?;
        assert!(matches!(
            other.verify(&token, NOW),
            Err(SessionError::InvalidSignature)
        ));
        Ok(())
    }

    #[test]
    fn rejects_tampered_claims() -> Result<()> {
        let signer = signer()?;
        let token = signer.issue(Uuid::new_v4(), NOW)?;
        let parts: Vec<&str> = token.split('.').collect();

        let forged = SessionClaims {
            sub: Uuid::new_v4().to_string(),
            iat: NOW,
            exp: NOW + 3600,
            iss: "gatehouse".to_string(),
        };
        let forged_b64 = b64e_json(&forged)?;
        let tampered = format!("{}.{forged_b64}.{}", parts[0], parts[2]);
        assert!(matches!(
            signer.verify(&tampered, NOW),
            Err(SessionError::InvalidSignature)
        ));
        Ok(())
    }

    #[test]
    fn rejects_alg_none() -> Result<()> {
        let signer = signer()?;
        let header = b64e_json(&SessionHeader {
            alg: "none".to_string(),
            typ: "JWT".to_string(),
        })?;
        let claims = b64e_json(&SessionClaims {
            sub: Uuid::new_v4().to_string(),
            iat: NOW,
            exp: NOW + 60,
            iss: "gatehouse".to_string(),
        })?;
        let token = format!("{header}.{claims}.");
        assert!(matches!(
            signer.verify(&token, NOW),
            Err(SessionError::UnsupportedAlg(_))
        ));
        Ok(())
    }

    #[test]
    fn rejects_malformed_structure() -> Result<()> {
        let signer = signer()?;
        assert!(matches!(signer.verify("abc", NOW), Err(SessionError::TokenFormat)));
        assert!(matches!(
            signer.verify("a.b.c.d", NOW),
            Err(SessionError::TokenFormat)
        ));
        assert!(signer.verify("!!.??.==", NOW).is_err());
        Ok(())
    }

    #[test]
    fn rejects_foreign_issuer() -> Result<()> {
        let token = SessionSigner::new(
            SecretString::from(SECRET),
            "elsewhere",
            Duration::from_secs(60),
        )?
        .issue(Uuid::new_v4(), NOW)?;
        assert!(matches!(
            signer()?.verify(&token, NOW),
            Err(SessionError::InvalidIssuer)
        ));
        Ok(())
    }

    #[test]
    fn short_secret_is_refused() {
        let result = SessionSigner::new(SecretString::from("short"), "gatehouse", DEFAULT_SESSION_TTL);
        assert!(matches!(result, Err(SessionError::WeakSecret)));
    }

    #[test]
    fn only_expiry_maps_to_expired_failure() {
        assert_eq!(AuthFailure::from(SessionError::Expired), AuthFailure::ExpiredToken);
        assert_eq!(
            AuthFailure::from(SessionError::InvalidSignature),
            AuthFailure::InvalidToken
        );
    }
}
