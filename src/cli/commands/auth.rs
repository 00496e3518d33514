use anyhow::{bail, Result};
use clap::{Arg, ArgMatches, Command};
use secrecy::{ExposeSecret, SecretString};

use crate::{
    api::state::Environment,
    credentials::HashCost,
    tokens::session::MIN_SECRET_LEN,
};

pub const ARG_SESSION_SECRET: &str = "session-secret";
pub const ARG_SESSION_TTL_SECONDS: &str = "session-ttl-seconds";
pub const ARG_CONFIRMATION_TTL_SECONDS: &str = "confirmation-token-ttl-seconds";
pub const ARG_RESET_TTL_SECONDS: &str = "reset-token-ttl-seconds";
pub const ARG_FRONTEND_BASE_URL: &str = "frontend-base-url";
pub const ARG_ENVIRONMENT: &str = "environment";
pub const ARG_ARGON2_MEMORY_KIB: &str = "argon2-memory-kib";
pub const ARG_ARGON2_ITERATIONS: &str = "argon2-iterations";
pub const ARG_ARGON2_PARALLELISM: &str = "argon2-parallelism";

#[derive(Debug, Clone)]
pub struct Options {
    pub session_secret: SecretString,
    pub session_ttl_seconds: u64,
    pub confirmation_ttl_seconds: u64,
    pub reset_ttl_seconds: u64,
    pub frontend_base_url: String,
    pub environment: Environment,
    pub hash_cost: HashCost,
}

impl Options {
    /// Parse auth arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the session secret is missing or too short.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let secret = matches
            .get_one::<String>(ARG_SESSION_SECRET)
            .map(|value| SecretString::from(value.clone()));
        let Some(session_secret) = secret else {
            bail!("missing required argument: --{ARG_SESSION_SECRET}");
        };
        if session_secret.expose_secret().len() < MIN_SECRET_LEN {
            bail!("--{ARG_SESSION_SECRET} must be at least {MIN_SECRET_LEN} bytes");
        }

        let seconds = |id: &str, default: u64| matches.get_one::<u64>(id).copied().unwrap_or(default);
        let defaults = HashCost::default();
        let cost = |id: &str, default: u32| matches.get_one::<u32>(id).copied().unwrap_or(default);

        Ok(Self {
            session_secret,
            session_ttl_seconds: seconds(ARG_SESSION_TTL_SECONDS, 604_800),
            confirmation_ttl_seconds: seconds(ARG_CONFIRMATION_TTL_SECONDS, 86_400),
            reset_ttl_seconds: seconds(ARG_RESET_TTL_SECONDS, 600),
            frontend_base_url: matches
                .get_one::<String>(ARG_FRONTEND_BASE_URL)
                .cloned()
                .unwrap_or_else(|| "http://localhost:3000".to_string()),
            environment: matches
                .get_one::<Environment>(ARG_ENVIRONMENT)
                .copied()
                .unwrap_or_default(),
            hash_cost: HashCost {
                memory_kib: cost(ARG_ARGON2_MEMORY_KIB, defaults.memory_kib),
                iterations: cost(ARG_ARGON2_ITERATIONS, defaults.iterations),
                parallelism: cost(ARG_ARGON2_PARALLELISM, defaults.parallelism),
            },
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_session_args(command);
    let command = with_challenge_args(command);
    with_argon2_args(command)
}

fn with_session_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SESSION_SECRET)
                .long(ARG_SESSION_SECRET)
                .help("Secret used to sign session tokens (at least 32 bytes)")
                .env("GATEHOUSE_SESSION_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_SESSION_TTL_SECONDS)
                .long(ARG_SESSION_TTL_SECONDS)
                .help("Session token TTL in seconds")
                .env("GATEHOUSE_SESSION_TTL_SECONDS")
                .default_value("604800")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_ENVIRONMENT)
                .long(ARG_ENVIRONMENT)
                .help("Runtime environment: production or development (development exposes internal error details)")
                .env("GATEHOUSE_ENVIRONMENT")
                .default_value("production")
                .value_parser(|value: &str| value.parse::<Environment>()),
        )
}

fn with_challenge_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_FRONTEND_BASE_URL)
                .long(ARG_FRONTEND_BASE_URL)
                .help("Frontend base URL used for email links and as the CORS origin")
                .env("GATEHOUSE_FRONTEND_BASE_URL")
                .default_value("http://localhost:3000"),
        )
        .arg(
            Arg::new(ARG_CONFIRMATION_TTL_SECONDS)
                .long(ARG_CONFIRMATION_TTL_SECONDS)
                .help("Email confirmation token TTL in seconds")
                .env("GATEHOUSE_CONFIRMATION_TOKEN_TTL_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_RESET_TTL_SECONDS)
                .long(ARG_RESET_TTL_SECONDS)
                .help("Password reset token TTL in seconds")
                .env("GATEHOUSE_RESET_TOKEN_TTL_SECONDS")
                .default_value("600")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}

// Unset values fall back to `HashCost::default()`.
fn with_argon2_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ARGON2_MEMORY_KIB)
                .long(ARG_ARGON2_MEMORY_KIB)
                .help("Argon2id memory cost in KiB")
                .env("GATEHOUSE_ARGON2_MEMORY_KIB")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_ARGON2_ITERATIONS)
                .long(ARG_ARGON2_ITERATIONS)
                .help("Argon2id iterations")
                .env("GATEHOUSE_ARGON2_ITERATIONS")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_ARGON2_PARALLELISM)
                .long(ARG_ARGON2_PARALLELISM)
                .help("Argon2id lanes")
                .env("GATEHOUSE_ARGON2_PARALLELISM")
                .value_parser(clap::value_parser!(u32)),
        )
}
