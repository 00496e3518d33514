//! Profile management for the signed-in account, plus admin lookups.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query,
    },
    response::{IntoResponse, Response},
    Extension, Json,
};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use super::{
    body_rejected, query_rejected,
    types::{
        ChangePasswordRequest, DeleteAccountRequest, MessageResponse, PageQuery, Pagination,
        UpdateProfileRequest, UserData, UserList,
    },
    Validator,
};
use crate::{
    account::{Account, Principal},
    api::{
        response::{Envelope, ErrorBody},
        state::AuthState,
    },
    error::{AuthFailure, Error},
};

pub const MSG_PROFILE_UPDATED: &str = "Profile updated successfully";
pub const MSG_PASSWORD_CHANGED: &str = "Password changed successfully";
pub const MSG_ACCOUNT_DELETED: &str = "Account deleted successfully";

const DEFAULT_PAGE: u32 = 1;
const DEFAULT_LIMIT: u32 = 10;
const MAX_LIMIT: u32 = 100;

async fn load(state: &AuthState, principal: &Principal) -> Result<Account, Error> {
    state
        .store()
        .find_by_id(principal.id)
        .await?
        .ok_or(Error::NotFound)
}

#[utoipa::path(
    get,
    path = "/api/users/profile",
    responses(
        (status = 200, description = "Own account", body = Envelope<UserData>),
        (status = 401, description = "Missing or invalid session", body = ErrorBody),
    ),
    security(("bearer" = [])),
    tag = "users"
)]
#[instrument(skip_all, fields(account_id = %principal.id))]
pub async fn get_profile(
    Extension(state): Extension<Arc<AuthState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Response, Error> {
    let account = load(&state, &principal).await?;
    Ok(Envelope::data(UserData {
        user: account.view(),
    })
    .into_response())
}

#[utoipa::path(
    put,
    path = "/api/users/profile",
    request_body = UpdateProfileRequest,
    responses(
        (status = 200, description = "Profile updated", body = Envelope<UserData>),
        (status = 400, description = "Validation errors", body = ErrorBody),
        (status = 401, description = "Missing or invalid session", body = ErrorBody),
        (status = 409, description = "Username already taken", body = ErrorBody),
        (status = 429, description = "Too many profile updates", body = ErrorBody),
    ),
    security(("bearer" = [])),
    tag = "users"
)]
#[instrument(skip_all, fields(account_id = %principal.id))]
pub async fn update_profile(
    Extension(state): Extension<Arc<AuthState>>,
    Extension(principal): Extension<Principal>,
    payload: Result<Json<UpdateProfileRequest>, JsonRejection>,
) -> Result<Response, Error> {
    let Json(request) = payload.map_err(|rejection| body_rejected(&rejection))?;

    let mut validator = Validator::new();
    if request.username.is_none() && request.profile_picture.is_none() {
        validator.push("body", "Provide a username or profilePicture to update");
    }
    let username = request
        .username
        .as_deref()
        .and_then(|raw| validator.username("username", raw));
    let picture = request.profile_picture.as_deref().and_then(|raw| {
        validator.url("profilePicture", raw, "Profile picture must be a valid URL")
    });
    validator.finish()?;

    let account = state
        .store()
        .update_profile(principal.id, username.as_deref(), picture.as_deref())
        .await?
        .ok_or(Error::NotFound)?;
    info!("Profile updated");

    Ok(Envelope::with_message(
        MSG_PROFILE_UPDATED,
        UserData {
            user: account.view(),
        },
    )
    .into_response())
}

#[utoipa::path(
    post,
    path = "/api/users/change-password",
    request_body = ChangePasswordRequest,
    responses(
        (status = 200, description = "Password changed", body = MessageResponse),
        (status = 400, description = "Validation errors", body = ErrorBody),
        (status = 401, description = "Wrong current password or invalid session", body = ErrorBody),
        (status = 429, description = "Too many sensitive operations", body = ErrorBody),
    ),
    security(("bearer" = [])),
    tag = "users"
)]
#[instrument(skip_all, fields(account_id = %principal.id))]
pub async fn change_password(
    Extension(state): Extension<Arc<AuthState>>,
    Extension(principal): Extension<Principal>,
    payload: Result<Json<ChangePasswordRequest>, JsonRejection>,
) -> Result<Response, Error> {
    let Json(request) = payload.map_err(|rejection| body_rejected(&rejection))?;

    let mut validator = Validator::new();
    validator.required(
        "currentPassword",
        &request.current_password,
        "Current password is required",
    );
    if validator.new_password("newPassword", &request.new_password, "New password")
        && request.new_password == request.current_password
    {
        validator.push(
            "newPassword",
            "New password must be different from current password",
        );
    }
    validator.finish()?;

    let account = load(&state, &principal).await?;
    if !state
        .credentials()
        .verify(&request.current_password, &account.password_hash)
        .await?
    {
        return Err(AuthFailure::BadCredentials.into());
    }

    let password_hash = state.credentials().hash(&request.new_password).await?;
    state
        .store()
        .update_password_hash(account.id, &password_hash)
        .await?
        .ok_or(Error::NotFound)?;
    info!("Password changed");

    Ok(Envelope::message(MSG_PASSWORD_CHANGED).into_response())
}

#[utoipa::path(
    delete,
    path = "/api/users/account",
    request_body = DeleteAccountRequest,
    responses(
        (status = 200, description = "Account deleted", body = MessageResponse),
        (status = 400, description = "Validation errors", body = ErrorBody),
        (status = 401, description = "Wrong password or invalid session", body = ErrorBody),
        (status = 429, description = "Too many sensitive operations", body = ErrorBody),
    ),
    security(("bearer" = [])),
    tag = "users"
)]
#[instrument(skip_all, fields(account_id = %principal.id))]
pub async fn delete_account(
    Extension(state): Extension<Arc<AuthState>>,
    Extension(principal): Extension<Principal>,
    payload: Result<Json<DeleteAccountRequest>, JsonRejection>,
) -> Result<Response, Error> {
    let Json(request) = payload.map_err(|rejection| body_rejected(&rejection))?;

    let mut validator = Validator::new();
    validator.required(
        "password",
        &request.password,
        "Password is required to delete account",
    );
    validator.finish()?;

    let account = load(&state, &principal).await?;
    if !state
        .credentials()
        .verify(&request.password, &account.password_hash)
        .await?
    {
        return Err(AuthFailure::BadCredentials.into());
    }

    if !state.store().delete(account.id).await? {
        return Err(Error::NotFound);
    }
    info!("Account deleted");

    Ok(Envelope::message(MSG_ACCOUNT_DELETED).into_response())
}

fn parse_bound(
    validator: &mut Validator,
    field: &str,
    raw: Option<&str>,
    default: u32,
    max: u32,
    message: &str,
) -> u32 {
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse::<u32>() {
        Ok(value) if (1..=max).contains(&value) => value,
        _ => {
            validator.push(field, message);
            default
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/users",
    params(PageQuery),
    responses(
        (status = 200, description = "Accounts, newest first", body = Envelope<UserList>),
        (status = 400, description = "Validation errors", body = ErrorBody),
        (status = 401, description = "Missing or invalid session", body = ErrorBody),
        (status = 403, description = "Admin role required", body = ErrorBody),
    ),
    security(("bearer" = [])),
    tag = "users"
)]
#[instrument(skip_all)]
pub async fn list_users(
    Extension(state): Extension<Arc<AuthState>>,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> Result<Response, Error> {
    let Query(query) = query.map_err(|rejection| query_rejected(&rejection))?;

    let mut validator = Validator::new();
    let page = parse_bound(
        &mut validator,
        "page",
        query.page.as_deref(),
        DEFAULT_PAGE,
        u32::MAX,
        "Page must be a positive integer",
    );
    let limit = parse_bound(
        &mut validator,
        "limit",
        query.limit.as_deref(),
        DEFAULT_LIMIT,
        MAX_LIMIT,
        "Limit must be between 1 and 100",
    );
    validator.finish()?;

    let page = state.store().list_paginated(page, limit).await?;
    let pagination = Pagination {
        page: page.page,
        limit: page.limit,
        total: page.total,
        pages: page.pages(),
    };
    let users = page.map(|account| account.view()).items;

    Ok(Envelope::data(UserList { users, pagination }).into_response())
}

#[utoipa::path(
    get,
    path = "/api/users/{id}",
    params(("id" = String, Path, description = "Account id (UUID)")),
    responses(
        (status = 200, description = "One account", body = Envelope<UserData>),
        (status = 400, description = "Invalid id", body = ErrorBody),
        (status = 401, description = "Missing or invalid session", body = ErrorBody),
        (status = 403, description = "Admin role required", body = ErrorBody),
        (status = 404, description = "No such account", body = ErrorBody),
    ),
    security(("bearer" = [])),
    tag = "users"
)]
#[instrument(skip_all)]
pub async fn get_user(
    Extension(state): Extension<Arc<AuthState>>,
    Path(id): Path<String>,
) -> Result<Response, Error> {
    let id = Uuid::parse_str(id.trim()).map_err(|_| Error::invalid("id", "Invalid ID format"))?;
    let account = state
        .store()
        .find_by_id(id)
        .await?
        .ok_or(Error::NotFound)?;
    Ok(Envelope::data(UserData {
        user: account.view(),
    })
    .into_response())
}
