//! Authorization chain: authenticate, then role or ownership checks.
//!
//! Each step is an axum middleware. Authentication attaches a [`Principal`]
//! extension; later steps read it and fail closed when it is missing.

use axum::{
    extract::{RawPathParams, Request, State},
    http::{HeaderMap, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
    Extension,
};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    account::{Principal, Role},
    api::state::AuthState,
    error::{AuthFailure, Error},
};

/// Pull the token out of `Authorization: Bearer <token>`.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Resolve the request's bearer token to a confirmed account.
///
/// # Errors
/// [`Error::Unauthenticated`] for every token or account problem, or an
/// internal error if the store fails.
pub async fn resolve_principal(state: &AuthState, headers: &HeaderMap) -> Result<Principal, Error> {
    let token = bearer_token(headers).ok_or(AuthFailure::NoToken)?;
    let account_id = state
        .tokens()
        .verify_session(token)
        .map_err(|err| {
            debug!("Session rejected: {err}");
            AuthFailure::from(err)
        })?;
    let account = state
        .store()
        .find_by_id(account_id)
        .await?
        .ok_or(AuthFailure::StaleToken)?;
    if !account.is_email_confirmed {
        return Err(AuthFailure::EmailNotConfirmed.into());
    }
    Ok(account.principal())
}

/// Require a valid session; attaches the [`Principal`].
///
/// # Errors
/// Rejects with 401 when no confirmed account can be resolved.
pub async fn authenticate(
    Extension(state): Extension<Arc<AuthState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, Error> {
    let principal = resolve_principal(&state, request.headers()).await?;
    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

/// Attach a [`Principal`] when possible; never rejects.
pub async fn optional_authenticate(
    Extension(state): Extension<Arc<AuthState>>,
    mut request: Request,
    next: Next,
) -> Response {
    match resolve_principal(&state, request.headers()).await {
        Ok(principal) => {
            request.extensions_mut().insert(principal);
        }
        Err(Error::Internal(err)) => {
            warn!("Optional authentication skipped: {err:#}");
        }
        Err(_) => {}
    }
    next.run(request).await
}

/// Require the authenticated principal to hold `role`.
///
/// # Errors
/// [`Error::Forbidden`] when the role differs or no principal is attached.
pub async fn require_role(
    State(role): State<Role>,
    request: Request,
    next: Next,
) -> Result<Response, Error> {
    let allowed = request
        .extensions()
        .get::<Principal>()
        .is_some_and(|principal| principal.role == role);
    if !allowed {
        return Err(Error::Forbidden);
    }
    Ok(next.run(request).await)
}

/// Owner of the resource named by a path parameter, or a privileged role.
/// State for [`require_ownership_or_role`].
#[derive(Clone, Copy, Debug)]
pub struct OwnershipRule {
    pub param: &'static str,
    pub role: Role,
}

impl OwnershipRule {
    #[must_use]
    pub const fn new(param: &'static str, role: Role) -> Self {
        Self { param, role }
    }

    #[must_use]
    pub fn allows(&self, principal: &Principal, owner: Option<&str>) -> bool {
        if principal.role == self.role {
            return true;
        }
        owner.is_some_and(|owner| owner == principal.id.to_string())
    }
}

/// Allow when the principal's id equals the `rule.param` path parameter or
/// the principal holds `rule.role`.
///
/// Mount it inside [`authenticate`]; the later `route_layer` runs first:
///
/// ```ignore
/// get(handler)
///     .route_layer(from_fn_with_state(
///         OwnershipRule::new("id", Role::Admin),
///         require_ownership_or_role,
///     ))
///     .route_layer(from_fn(authenticate))
/// ```
///
/// # Errors
/// [`Error::Forbidden`] otherwise, including when no principal is attached.
pub async fn require_ownership_or_role(
    State(rule): State<OwnershipRule>,
    params: RawPathParams,
    request: Request,
    next: Next,
) -> Result<Response, Error> {
    let owner = params
        .iter()
        .find(|(name, _)| *name == rule.param)
        .map(|(_, value)| value);
    let allowed = request
        .extensions()
        .get::<Principal>()
        .is_some_and(|principal| rule.allows(principal, owner));
    if !allowed {
        return Err(Error::Forbidden);
    }
    Ok(next.run(request).await)
}
