use clap::{Arg, ArgMatches, Command};

pub const ARG_SSL_DIR: &str = "ssl-dir";
pub const ARG_TLS_COMMON_NAME: &str = "tls-common-name";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub ssl_dir: Option<String>,
    pub common_name: String,
}

impl Options {
    /// Parse TLS arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the common name is empty.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let common_name = matches
            .get_one::<String>(ARG_TLS_COMMON_NAME)
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| anyhow::anyhow!("missing required argument: --{ARG_TLS_COMMON_NAME}"))?;

        Ok(Self {
            ssl_dir: matches.get_one::<String>(ARG_SSL_DIR).cloned(),
            common_name,
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SSL_DIR)
                .long(ARG_SSL_DIR)
                .help("Directory holding the proxy certificate and key")
                .long_help(
                    "Directory holding the proxy certificate and key. Defaults to /app/etc/nginx/ssl when writable, otherwise ./ssl. A self-signed pair is generated when missing.",
                )
                .env("WIKIGATE_SSL_DIR"),
        )
        .arg(
            Arg::new(ARG_TLS_COMMON_NAME)
                .long(ARG_TLS_COMMON_NAME)
                .help("Common name for the generated self-signed certificate")
                .env("WIKIGATE_TLS_COMMON_NAME")
                .default_value("localhost"),
        )
}
