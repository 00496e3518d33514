//! Maps validated CLI arguments to the action to run.

use crate::cli::actions::{server::Args, Action};
use crate::cli::commands::{auth, limits, ARG_DSN, ARG_PORT};
use anyhow::Result;
use secrecy::SecretString;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>(ARG_DSN)
        .filter(|value| !value.trim().is_empty())
        .map(|value| SecretString::from(value.clone()));

    let auth_opts = auth::Options::parse(matches)?;
    let rate_limits = limits::parse(matches);

    Ok(Action::Server(Args {
        port,
        dsn,
        session_secret: auth_opts.session_secret,
        session_ttl_seconds: auth_opts.session_ttl_seconds,
        confirmation_ttl_seconds: auth_opts.confirmation_ttl_seconds,
        reset_ttl_seconds: auth_opts.reset_ttl_seconds,
        frontend_base_url: auth_opts.frontend_base_url,
        environment: auth_opts.environment,
        hash_cost: auth_opts.hash_cost,
        rate_limits,
    }))
}
