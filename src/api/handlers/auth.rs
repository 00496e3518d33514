//! Registration, login, email confirmation and password reset.

use axum::{
    extract::{rejection::JsonRejection, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::{
    body_rejected, check_token,
    types::{
        EmailRequest, LoginRequest, MessageResponse, RegisterRequest, ResetPasswordRequest,
        SessionData, UserData,
    },
    Validator, MSG_EMAIL,
};
use crate::{
    account::{normalize_email, Account},
    api::{
        notify::Notification,
        response::{Envelope, ErrorBody},
        state::AuthState,
    },
    error::{AuthFailure, Error},
};

pub const MSG_REGISTERED: &str =
    "User registered successfully. Please check your email to confirm your account.";
pub const MSG_LOGGED_IN: &str = "Login successful";
pub const MSG_CONFIRMED: &str = "Email confirmed successfully";
pub const MSG_CONFIRMATION_SENT: &str =
    "If an account with that email exists and is not yet confirmed, a confirmation email has been sent.";
pub const MSG_RESET_SENT: &str =
    "If an account with that email exists, a password reset link has been sent.";
pub const MSG_PASSWORD_RESET: &str = "Password reset successfully";

#[utoipa::path(
    post,
    path = "/api/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created; confirmation email sent", body = Envelope<UserData>),
        (status = 400, description = "Validation errors", body = ErrorBody),
        (status = 409, description = "Email or username already taken", body = ErrorBody),
        (status = 429, description = "Too many authentication attempts", body = ErrorBody),
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn register(
    Extension(state): Extension<Arc<AuthState>>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Response, Error> {
    let Json(request) = payload.map_err(|rejection| body_rejected(&rejection))?;

    let mut validator = Validator::new();
    let username = validator.username("username", &request.username);
    let email = validator.email("email", &request.email);
    validator.new_password("password", &request.password, "Password");
    validator.finish()?;
    let (Some(username), Some(email)) = (username, email) else {
        return Err(Error::invalid("body", "Invalid registration request"));
    };

    if let Some(existing) = state
        .store()
        .find_by_email_or_username(&email, &username)
        .await?
    {
        let field = if existing.email == email { "email" } else { "username" };
        debug!(field, "Registration conflict");
        return Err(Error::Conflict(field));
    }

    let password_hash = state.credentials().hash(&request.password).await?;
    let now = Utc::now();
    let mut account = Account::new(username, &email, password_hash, now);
    let token = state.tokens().stamp_confirmation(&mut account, now);

    let account = state.store().create(account).await?;
    info!(account_id = %account.id, "Account registered");

    state
        .notifications()
        .dispatch(&account.email, Notification::Confirmation { token })
        .await;

    Ok((
        StatusCode::CREATED,
        Envelope::with_message(MSG_REGISTERED, UserData { user: account.view() }),
    )
        .into_response())
}

#[utoipa::path(
    post,
    path = "/api/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Session issued", body = Envelope<SessionData>),
        (status = 400, description = "Validation errors", body = ErrorBody),
        (status = 401, description = "Invalid credentials or email not confirmed", body = ErrorBody),
        (status = 429, description = "Too many authentication attempts", body = ErrorBody),
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn login(
    Extension(state): Extension<Arc<AuthState>>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Response, Error> {
    let Json(request) = payload.map_err(|rejection| body_rejected(&rejection))?;

    let mut validator = Validator::new();
    validator.required("identifier", &request.identifier, "Email or username is required");
    validator.required("password", &request.password, "Password is required");
    validator.finish()?;

    let identifier = request.identifier.trim();
    let Some(account) = state
        .store()
        .find_by_email_or_username(&normalize_email(identifier), identifier)
        .await?
    else {
        // Same cost as a wrong password.
        state.credentials().verify_dummy(&request.password).await;
        return Err(AuthFailure::BadCredentials.into());
    };

    if !state
        .credentials()
        .verify(&request.password, &account.password_hash)
        .await?
    {
        debug!(account_id = %account.id, "Wrong password");
        return Err(AuthFailure::BadCredentials.into());
    }
    if !account.is_email_confirmed {
        return Err(AuthFailure::EmailNotConfirmed.into());
    }

    let token = state.tokens().issue_session(account.id)?;
    info!(account_id = %account.id, "Session issued");

    Ok(Envelope::with_message(
        MSG_LOGGED_IN,
        SessionData {
            user: account.view(),
            token,
        },
    )
    .into_response())
}

#[utoipa::path(
    get,
    path = "/api/auth/confirm-email/{token}",
    params(("token" = String, Path, description = "Confirmation token from the email link")),
    responses(
        (status = 200, description = "Email confirmed", body = MessageResponse),
        (status = 400, description = "Invalid or expired token", body = ErrorBody),
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn confirm_email(
    Extension(state): Extension<Arc<AuthState>>,
    Path(token): Path<String>,
) -> Result<Response, Error> {
    check_token(&token)?;
    let account = state.tokens().consume_confirmation(&token).await?;
    info!(account_id = %account.id, "Email confirmed");

    state
        .notifications()
        .dispatch(
            &account.email,
            Notification::Welcome {
                username: account.username.clone(),
            },
        )
        .await;

    Ok(Envelope::message(MSG_CONFIRMED).into_response())
}

#[utoipa::path(
    post,
    path = "/api/auth/resend-confirmation",
    request_body = EmailRequest,
    responses(
        (status = 200, description = "Sent if the account exists and is unconfirmed", body = MessageResponse),
        (status = 400, description = "Validation errors", body = ErrorBody),
        (status = 429, description = "Too many email requests", body = ErrorBody),
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn resend_confirmation(
    Extension(state): Extension<Arc<AuthState>>,
    payload: Result<Json<EmailRequest>, JsonRejection>,
) -> Result<Response, Error> {
    let Json(request) = payload.map_err(|rejection| body_rejected(&rejection))?;
    let mut validator = Validator::new();
    let email = validator.email("email", &request.email);
    validator.finish()?;

    let Some(email) = email else {
        return Err(Error::invalid("email", MSG_EMAIL));
    };

    if let Some(account) = state.store().find_by_email(&email).await? {
        if account.is_email_confirmed {
            debug!(account_id = %account.id, "Resend skipped: already confirmed");
        } else if let Some((account, token)) =
            state.tokens().issue_confirmation(account.id).await?
        {
            state
                .notifications()
                .dispatch(&account.email, Notification::Confirmation { token })
                .await;
        } else {
            debug!(account_id = %account.id, "Resend skipped: confirmed or removed meanwhile");
        }
    }

    Ok(Envelope::message(MSG_CONFIRMATION_SENT).into_response())
}

#[utoipa::path(
    post,
    path = "/api/auth/request-password-reset",
    request_body = EmailRequest,
    responses(
        (status = 200, description = "Sent if the account exists", body = MessageResponse),
        (status = 400, description = "Validation errors", body = ErrorBody),
        (status = 429, description = "Too many email requests", body = ErrorBody),
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn request_password_reset(
    Extension(state): Extension<Arc<AuthState>>,
    payload: Result<Json<EmailRequest>, JsonRejection>,
) -> Result<Response, Error> {
    let Json(request) = payload.map_err(|rejection| body_rejected(&rejection))?;
    let mut validator = Validator::new();
    let email = validator.email("email", &request.email);
    validator.finish()?;

    let Some(email) = email else {
        return Err(Error::invalid("email", MSG_EMAIL));
    };

    let issued = match state.store().find_by_email(&email).await? {
        Some(account) => state.tokens().issue_reset(account.id).await?,
        None => None,
    };
    if let Some((account, token)) = issued {
        state
            .notifications()
            .dispatch(&account.email, Notification::PasswordReset { token })
            .await;
    } else {
        debug!("Reset requested for unknown email");
    }

    Ok(Envelope::message(MSG_RESET_SENT).into_response())
}

#[utoipa::path(
    post,
    path = "/api/auth/reset-password/{token}",
    params(("token" = String, Path, description = "Reset token from the email link")),
    request_body = ResetPasswordRequest,
    responses(
        (status = 200, description = "Password replaced", body = MessageResponse),
        (status = 400, description = "Validation errors or invalid/expired token", body = ErrorBody),
        (status = 429, description = "Too many authentication attempts", body = ErrorBody),
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn reset_password(
    Extension(state): Extension<Arc<AuthState>>,
    Path(token): Path<String>,
    payload: Result<Json<ResetPasswordRequest>, JsonRejection>,
) -> Result<Response, Error> {
    check_token(&token)?;
    let Json(request) = payload.map_err(|rejection| body_rejected(&rejection))?;
    let mut validator = Validator::new();
    validator.new_password("password", &request.password, "Password");
    validator.finish()?;

    // Cheap lookup first so a dead token never costs a hash.
    state.tokens().find_active_reset(&token).await?;
    let password_hash = state.credentials().hash(&request.password).await?;
    let account = state.tokens().consume_reset(&token, &password_hash).await?;
    info!(account_id = %account.id, "Password reset");

    Ok(Envelope::message(MSG_PASSWORD_RESET).into_response())
}
