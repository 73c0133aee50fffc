use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_ADMIN_ACCOUNT: &str = "admin-account";
pub const ARG_ADMIN_PASSWORD: &str = "admin-password";

pub struct Options {
    pub account: Option<String>,
    pub password: Option<SecretString>,
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("account", &self.account)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl Options {
    #[must_use]
    pub fn parse(matches: &ArgMatches) -> Self {
        Self {
            account: matches.get_one::<String>(ARG_ADMIN_ACCOUNT).cloned(),
            password: matches
                .get_one::<String>(ARG_ADMIN_PASSWORD)
                .map(|password| SecretString::from(password.clone())),
        }
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ADMIN_ACCOUNT)
                .long(ARG_ADMIN_ACCOUNT)
                .help("Bootstrap admin account, created at startup if missing")
                .env("WIKIGATE_ADMIN_ACCOUNT")
                .requires(ARG_ADMIN_PASSWORD),
        )
        .arg(
            Arg::new(ARG_ADMIN_PASSWORD)
                .long(ARG_ADMIN_PASSWORD)
                .help("Password for the bootstrap admin account")
                .env("WIKIGATE_ADMIN_PASSWORD")
                .hide_env_values(true)
                .requires(ARG_ADMIN_ACCOUNT),
        )
}
