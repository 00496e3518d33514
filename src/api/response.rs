//! JSON envelopes and the error → HTTP mapping.

use axum::{
    extract::Request,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;
use utoipa::ToSchema;

use crate::{
    api::rate_limit::{ceil_secs, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET},
    error::{Error, FieldError},
};

pub const MSG_VALIDATION: &str = "Validation errors";
pub const MSG_CONFLICT: &str = "User already exists with this email or username";
pub const MSG_FORBIDDEN: &str = "Access denied";
pub const MSG_TOKEN_INVALID: &str = "Invalid or expired token";
pub const MSG_NOT_FOUND: &str = "User not found";
pub const MSG_ROUTE_NOT_FOUND: &str = "Route not found";
pub const MSG_INTERNAL: &str = "Internal server error";

/// Success envelope: `{ success: true, message?, data? }`.
#[derive(Debug, Serialize, ToSchema)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    #[must_use]
    pub fn data(data: T) -> Self {
        Self {
            success: true,
            message: None,
            data: Some(data),
        }
    }

    #[must_use]
    pub fn with_message(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            data: Some(data),
        }
    }
}

impl Envelope<()> {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            data: None,
        }
    }
}

impl<T: Serialize> IntoResponse for Envelope<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// Error envelope: `{ success: false, message, errors? }`.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<FieldError>>,
    /// Internal failure detail; only present in development mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ErrorBody {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            errors: None,
            error: None,
        }
    }
}

/// Full text of an internal failure, attached to the response so the
/// development-mode layer can surface it.
#[derive(Clone, Debug)]
pub struct InternalErrorDetail(pub String);

impl Error {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::TokenInvalid => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to the caller; never includes internal detail.
    #[must_use]
    pub const fn public_message(&self) -> &'static str {
        match self {
            Self::Validation(_) => MSG_VALIDATION,
            Self::Conflict(_) => MSG_CONFLICT,
            Self::Unauthenticated(failure) => failure.message(),
            Self::Forbidden => MSG_FORBIDDEN,
            Self::TokenInvalid => MSG_TOKEN_INVALID,
            Self::NotFound => MSG_NOT_FOUND,
            Self::RateLimited { class, .. } => class.message(),
            Self::Internal(_) => MSG_INTERNAL,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = ErrorBody::new(self.public_message());

        match self {
            Self::Validation(errors) => {
                body.errors = Some(errors);
                (status, Json(body)).into_response()
            }
            Self::RateLimited {
                limit, retry_after, ..
            } => {
                let secs = ceil_secs(retry_after).max(1);
                let mut response = (status, Json(body)).into_response();
                let headers = response.headers_mut();
                headers.insert(RETRY_AFTER, HeaderValue::from(secs));
                headers.insert(HEADER_LIMIT, HeaderValue::from(limit));
                headers.insert(HEADER_REMAINING, HeaderValue::from(0_u32));
                headers.insert(HEADER_RESET, HeaderValue::from(secs));
                response
            }
            Self::Internal(err) => {
                error!("Internal error: {err:#}");
                let mut response = (status, Json(body)).into_response();
                response
                    .extensions_mut()
                    .insert(InternalErrorDetail(format!("{err:#}")));
                response
            }
            _ => (status, Json(body)).into_response(),
        }
    }
}

/// Re-render internal errors with their detail. Only mounted in development.
pub async fn expose_internal_errors(request: Request, next: Next) -> Response {
    let response = next.run(request).await;
    let Some(InternalErrorDetail(detail)) = response.extensions().get::<InternalErrorDetail>().cloned()
    else {
        return response;
    };
    let mut body = ErrorBody::new(MSG_INTERNAL);
    body.error = Some(detail);
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

/// Fallback for unmatched routes.
pub async fn route_not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(ErrorBody::new(MSG_ROUTE_NOT_FOUND))).into_response()
}
