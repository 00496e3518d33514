use anyhow::{anyhow, Context, Result};
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, MatchedPath},
    http::{
        header::{
            AUTHORIZATION, CONTENT_TYPE, REFERRER_POLICY, RETRY_AFTER, X_CONTENT_TYPE_OPTIONS,
            X_FRAME_OPTIONS,
        },
        HeaderName, HeaderValue, Method, Request,
    },
    middleware,
    routing::{delete, get, post, put, MethodRouter},
    Extension, Router,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::{SetRequestHeaderLayer, SetResponseHeaderLayer},
    trace::TraceLayer,
};
use tracing::{error, info, info_span, Span};
use ulid::Ulid;
use url::Url;
use utoipa_swagger_ui::SwaggerUi;

use crate::account::Role;

pub mod guard;
pub mod handlers;
pub mod notify;
pub mod openapi;
pub mod rate_limit;
pub mod response;
pub mod state;

pub use openapi::openapi;

use self::{
    guard::{authenticate, require_role},
    handlers::{auth, users},
    rate_limit::{
        enforce_rate_limit, FixedWindowLimiter, RateClass, RateLimiter, HEADER_LIMIT,
        HEADER_REMAINING, HEADER_RESET,
    },
    response::{expose_internal_errors, route_not_found},
    state::AuthState,
};

const REQUEST_ID: &str = "x-request-id";
const BODY_LIMIT: usize = 10 * 1024 * 1024;
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn limited(route: MethodRouter, class: RateClass) -> MethodRouter {
    route.route_layer(middleware::from_fn_with_state(class, enforce_rate_limit))
}

// Layers added later run first: rate limit, then authentication, then role.
fn signed_in(route: MethodRouter, class: RateClass) -> MethodRouter {
    limited(route.route_layer(middleware::from_fn(authenticate)), class)
}

fn admin(route: MethodRouter, class: RateClass) -> MethodRouter {
    signed_in(
        route.route_layer(middleware::from_fn_with_state(Role::Admin, require_role)),
        class,
    )
}

/// Build the full application router.
///
/// # Errors
/// Fails when the configured frontend base URL cannot be turned into a CORS origin.
pub fn router(state: Arc<AuthState>, limiter: Arc<dyn RateLimiter>) -> Result<Router> {
    let cors = CorsLayer::new()
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_origin(AllowOrigin::exact(frontend_origin(
            state.config().frontend_base_url(),
        )?))
        .expose_headers([HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET, RETRY_AFTER])
        .allow_credentials(true);

    let mut app = Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/api/auth/register",
            limited(post(auth::register), RateClass::AuthSensitive),
        )
        .route(
            "/api/auth/login",
            limited(post(auth::login), RateClass::AuthSensitive),
        )
        .route("/api/auth/confirm-email/:token", get(auth::confirm_email))
        .route(
            "/api/auth/resend-confirmation",
            limited(post(auth::resend_confirmation), RateClass::EmailTriggering),
        )
        .route(
            "/api/auth/request-password-reset",
            limited(post(auth::request_password_reset), RateClass::EmailTriggering),
        )
        .route(
            "/api/auth/reset-password/:token",
            limited(post(auth::reset_password), RateClass::AuthSensitive),
        )
        .route(
            "/api/users/profile",
            signed_in(get(users::get_profile), RateClass::Generic).merge(signed_in(
                put(users::update_profile),
                RateClass::ProfileUpdate,
            )),
        )
        .route(
            "/api/users/change-password",
            signed_in(post(users::change_password), RateClass::AccountSensitive),
        )
        .route(
            "/api/users/account",
            signed_in(delete(users::delete_account), RateClass::AccountSensitive),
        )
        .route("/api/users", admin(get(users::list_users), RateClass::Generic))
        .route("/api/users/:id", admin(get(users::get_user), RateClass::Generic))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", openapi()))
        .fallback(route_not_found)
        .layer(DefaultBodyLimit::max(BODY_LIMIT));

    if state.config().environment().is_development() {
        app = app.layer(middleware::from_fn(expose_internal_errors));
    }

    Ok(app.layer(
        ServiceBuilder::new()
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static(REQUEST_ID),
                |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                REQUEST_ID,
            )))
            .layer(TraceLayer::new_for_http().make_span_with(make_span))
            .layer(cors)
            .layer(SetResponseHeaderLayer::if_not_present(
                X_CONTENT_TYPE_OPTIONS,
                HeaderValue::from_static("nosniff"),
            ))
            .layer(SetResponseHeaderLayer::if_not_present(
                X_FRAME_OPTIONS,
                HeaderValue::from_static("DENY"),
            ))
            .layer(SetResponseHeaderLayer::if_not_present(
                REFERRER_POLICY,
                HeaderValue::from_static("no-referrer"),
            ))
            .layer(Extension(state))
            .layer(Extension(limiter)),
    ))
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(port: u16, state: Arc<AuthState>) -> Result<()> {
    let limiter = Arc::new(FixedWindowLimiter::new(state.config().rate_limits()));
    let sweeper = limiter.spawn_sweeper(SWEEP_INTERVAL);

    let app = router(state, limiter)?;

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sweeper.abort();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {err}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("Failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Gracefully shutdown");
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get(REQUEST_ID)
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");

    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

fn frontend_origin(frontend_base_url: &str) -> Result<HeaderValue> {
    let parsed = Url::parse(frontend_base_url)
        .with_context(|| format!("Invalid frontend base URL: {frontend_base_url}"))?;
    let host = parsed.host_str().ok_or_else(|| {
        anyhow!("Frontend base URL must include a valid host: {frontend_base_url}")
    })?;
    let port = parsed
        .port()
        .map_or_else(String::new, |port| format!(":{port}"));
    let origin = format!("{}://{}{}", parsed.scheme(), host, port);
    HeaderValue::from_str(&origin).context("Failed to build frontend origin header")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontend_origin_strips_path() -> Result<()> {
        let origin = frontend_origin("https://app.example.com/welcome/")?;
        assert_eq!(origin, HeaderValue::from_static("https://app.example.com"));
        let origin = frontend_origin("http://localhost:3000")?;
        assert_eq!(origin, HeaderValue::from_static("http://localhost:3000"));
        assert!(frontend_origin("not a url").is_err());
        Ok(())
    }
}
