use clap::{builder::BoolishValueParser, Arg, ArgAction, ArgMatches, Command};
use std::time::Duration;

use crate::api::rate_limit::{Quota, RateClass, RateLimits};

pub const ARG_TRUST_PROXY: &str = "trust-proxy";

struct ClassArgs {
    class: RateClass,
    max: &'static str,
    max_env: &'static str,
    max_default: &'static str,
    window: &'static str,
    window_env: &'static str,
    window_default: &'static str,
}

const CLASS_ARGS: [ClassArgs; 5] = [
    ClassArgs {
        class: RateClass::Generic,
        max: "rate-generic-max",
        max_env: "GATEHOUSE_RATE_GENERIC_MAX",
        max_default: "100",
        window: "rate-generic-window-seconds",
        window_env: "GATEHOUSE_RATE_GENERIC_WINDOW_SECONDS",
        window_default: "900",
    },
    ClassArgs {
        class: RateClass::AuthSensitive,
        max: "rate-auth-max",
        max_env: "GATEHOUSE_RATE_AUTH_MAX",
        max_default: "5",
        window: "rate-auth-window-seconds",
        window_env: "GATEHOUSE_RATE_AUTH_WINDOW_SECONDS",
        window_default: "900",
    },
    ClassArgs {
        class: RateClass::EmailTriggering,
        max: "rate-email-max",
        max_env: "GATEHOUSE_RATE_EMAIL_MAX",
        max_default: "3",
        window: "rate-email-window-seconds",
        window_env: "GATEHOUSE_RATE_EMAIL_WINDOW_SECONDS",
        window_default: "3600",
    },
    ClassArgs {
        class: RateClass::ProfileUpdate,
        max: "rate-profile-max",
        max_env: "GATEHOUSE_RATE_PROFILE_MAX",
        max_default: "10",
        window: "rate-profile-window-seconds",
        window_env: "GATEHOUSE_RATE_PROFILE_WINDOW_SECONDS",
        window_default: "3600",
    },
    ClassArgs {
        class: RateClass::AccountSensitive,
        max: "rate-account-max",
        max_env: "GATEHOUSE_RATE_ACCOUNT_MAX",
        max_default: "3",
        window: "rate-account-window-seconds",
        window_env: "GATEHOUSE_RATE_ACCOUNT_WINDOW_SECONDS",
        window_default: "900",
    },
];

/// Per-class quotas, starting from [`RateLimits::default`].
#[must_use]
pub fn parse(matches: &ArgMatches) -> RateLimits {
    CLASS_ARGS.iter().fold(RateLimits::default(), |limits, args| {
        let current = limits.quota(args.class);
        let max = matches.get_one::<u32>(args.max).copied().unwrap_or(current.max);
        let window = matches
            .get_one::<u64>(args.window)
            .map_or(current.window, |secs| Duration::from_secs(*secs));
        limits.with(args.class, Quota::new(window, max))
    })
    .with_trust_proxy(matches.get_flag(ARG_TRUST_PROXY))
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = command.arg(
        Arg::new(ARG_TRUST_PROXY)
            .long(ARG_TRUST_PROXY)
            .help("Take the client address from X-Forwarded-For / X-Real-IP (only behind a proxy that sets them)")
            .env("GATEHOUSE_TRUST_PROXY")
            .action(ArgAction::SetTrue)
            .value_parser(BoolishValueParser::new()),
    );
    CLASS_ARGS.iter().fold(command, |command, args| {
        command
            .arg(
                Arg::new(args.max)
                    .long(args.max)
                    .help(format!("Requests admitted per window ({})", args.class.as_str()))
                    .env(args.max_env)
                    .default_value(args.max_default)
                    .value_parser(clap::value_parser!(u32).range(1..)),
            )
            .arg(
                Arg::new(args.window)
                    .long(args.window)
                    .help(format!("Window length in seconds ({})", args.class.as_str()))
                    .env(args.window_env)
                    .default_value(args.window_default)
                    .value_parser(clap::value_parser!(u64).range(1..)),
            )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> Command {
        with_args(Command::new("test"))
    }

    #[test]
    fn defaults_match_builtin_limits() -> anyhow::Result<()> {
        let matches = temp_env::with_vars(
            CLASS_ARGS
                .iter()
                .flat_map(|args| [(args.max_env, None::<&str>), (args.window_env, None)])
                .chain([("GATEHOUSE_TRUST_PROXY", None)])
                .collect::<Vec<_>>(),
            || command().try_get_matches_from(["test"]),
        )?;
        assert_eq!(parse(&matches), RateLimits::default());
        Ok(())
    }

    #[test]
    fn env_overrides_one_class() -> anyhow::Result<()> {
        let matches = temp_env::with_vars(
            [
                ("GATEHOUSE_RATE_AUTH_MAX", Some("20")),
                ("GATEHOUSE_RATE_AUTH_WINDOW_SECONDS", Some("60")),
            ],
            || command().try_get_matches_from(["test"]),
        )?;
        let limits = parse(&matches);
        assert_eq!(
            limits.quota(RateClass::AuthSensitive),
            Quota::new(Duration::from_secs(60), 20)
        );
        assert_eq!(
            limits.quota(RateClass::Generic),
            RateLimits::default().quota(RateClass::Generic)
        );
        Ok(())
    }

    #[test]
    fn trust_proxy_is_opt_in() -> anyhow::Result<()> {
        let matches = temp_env::with_var_unset("GATEHOUSE_TRUST_PROXY", || {
            command().try_get_matches_from(["test"])
        })?;
        assert!(!parse(&matches).trust_proxy);

        let matches = temp_env::with_var_unset("GATEHOUSE_TRUST_PROXY", || {
            command().try_get_matches_from(["test", "--trust-proxy"])
        })?;
        assert!(parse(&matches).trust_proxy);

        let matches = temp_env::with_var("GATEHOUSE_TRUST_PROXY", Some("yes"), || {
            command().try_get_matches_from(["test"])
        })?;
        assert!(parse(&matches).trust_proxy);
        Ok(())
    }

    #[test]
    fn zero_max_rejected() {
        let result = command().try_get_matches_from(["test", "--rate-email-max", "0"]);
        assert!(result.is_err());
    }
}
