use clap::{Arg, ArgMatches, Command};

use crate::session::MAX_SESSION_TTL;

pub const ARG_PUBLIC_URL: &str = "public-url";
pub const ARG_LOGIN_MAX_FAILURES: &str = "login-max-failures";
pub const ARG_LOGIN_WINDOW_SECONDS: &str = "login-window-seconds";
pub const ARG_LOGIN_LOCKOUT_SECONDS: &str = "login-lockout-seconds";
pub const ARG_SESSION_TTL_SECONDS: &str = "session-ttl-seconds";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub public_url: Option<String>,
    pub login_max_failures: u32,
    pub login_window_seconds: u64,
    pub login_lockout_seconds: u64,
    pub session_ttl_seconds: u64,
}

impl Options {
    /// Parse login throttling and session arguments from matches.
    ///
    /// # Errors
    /// Returns an error if a defaulted argument is unexpectedly missing.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let read_u64 = |id: &str| -> anyhow::Result<u64> {
            matches
                .get_one::<u64>(id)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("missing required argument: --{id}"))
        };

        Ok(Self {
            public_url: matches
                .get_one::<String>(ARG_PUBLIC_URL)
                .map(|url| url.trim().to_string())
                .filter(|url| !url.is_empty()),
            login_max_failures: matches
                .get_one::<u32>(ARG_LOGIN_MAX_FAILURES)
                .copied()
                .ok_or_else(|| {
                    anyhow::anyhow!("missing required argument: --{ARG_LOGIN_MAX_FAILURES}")
                })?,
            login_window_seconds: read_u64(ARG_LOGIN_WINDOW_SECONDS)?,
            login_lockout_seconds: read_u64(ARG_LOGIN_LOCKOUT_SECONDS)?,
            session_ttl_seconds: read_u64(ARG_SESSION_TTL_SECONDS)?,
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_PUBLIC_URL)
                .long(ARG_PUBLIC_URL)
                .help("Public base URL of the console; https enables Secure cookies")
                .env("WIKIGATE_PUBLIC_URL"),
        )
        .arg(
            Arg::new(ARG_LOGIN_MAX_FAILURES)
                .long(ARG_LOGIN_MAX_FAILURES)
                .help("Failed logins from one IP before it is locked out")
                .env("WIKIGATE_LOGIN_MAX_FAILURES")
                .default_value("5")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_LOGIN_WINDOW_SECONDS)
                .long(ARG_LOGIN_WINDOW_SECONDS)
                .help("Sliding window in seconds over which failures are counted")
                .env("WIKIGATE_LOGIN_WINDOW_SECONDS")
                .default_value("600")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_LOGIN_LOCKOUT_SECONDS)
                .long(ARG_LOGIN_LOCKOUT_SECONDS)
                .help("Lockout duration in seconds")
                .env("WIKIGATE_LOGIN_LOCKOUT_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_SESSION_TTL_SECONDS)
                .long(ARG_SESSION_TTL_SECONDS)
                .help("Session lifetime in seconds, at most ten years")
                .env("WIKIGATE_SESSION_TTL_SECONDS")
                .default_value("2592000")
                .value_parser(clap::value_parser!(u64).range(1..=MAX_SESSION_TTL.as_secs())),
        )
}
