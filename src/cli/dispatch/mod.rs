//! Map validated CLI arguments to the action to run.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::{admin, auth, tls};
use anyhow::{Context, Result};

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>("dsn")
        .cloned()
        .context("missing required argument: --dsn")?;

    let auth_opts = auth::Options::parse(matches)?;
    let tls_opts = tls::Options::parse(matches)?;
    let admin_opts = admin::Options::parse(matches);

    Ok(Action::Server(Args {
        port,
        dsn,
        public_url: auth_opts.public_url,
        login_max_failures: auth_opts.login_max_failures,
        login_window_seconds: auth_opts.login_window_seconds,
        login_lockout_seconds: auth_opts.login_lockout_seconds,
        session_ttl_seconds: auth_opts.session_ttl_seconds,
        ssl_dir: tls_opts.ssl_dir,
        tls_common_name: tls_opts.common_name,
        admin_account: admin_opts.account,
        admin_password: admin_opts.password,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn server_args_from_env() {
        temp_env::with_vars(
            [
                ("WIKIGATE_DSN", Some("postgres://localhost:5432/wikigate")),
                ("WIKIGATE_PUBLIC_URL", Some("https://wiki.example.com")),
                ("WIKIGATE_LOGIN_WINDOW_SECONDS", Some("300")),
                ("WIKIGATE_SSL_DIR", Some("/tmp/wikigate-ssl")),
                ("WIKIGATE_ADMIN_ACCOUNT", Some("admin")),
                ("WIKIGATE_ADMIN_PASSWORD", Some("s3cret")),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["wikigate"]);
                let result = handler(&matches);
                assert!(result.is_ok());
                if let Ok(Action::Server(args)) = result {
                    assert_eq!(args.dsn, "postgres://localhost:5432/wikigate");
                    assert_eq!(args.public_url.as_deref(), Some("https://wiki.example.com"));
                    assert_eq!(args.login_window_seconds, 300);
                    assert_eq!(args.ssl_dir.as_deref(), Some("/tmp/wikigate-ssl"));
                    assert_eq!(args.tls_common_name, "localhost");
                    assert_eq!(args.admin_account.as_deref(), Some("admin"));
                    assert_eq!(
                        args.admin_password.as_ref().map(|p| p.expose_secret().to_string()),
                        Some("s3cret".to_string())
                    );
                }
            },
        );
    }

    #[test]
    fn blank_public_url_is_ignored() {
        temp_env::with_vars(
            [
                ("WIKIGATE_DSN", Some("postgres://localhost:5432/wikigate")),
                ("WIKIGATE_PUBLIC_URL", Some("  ")),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["wikigate"]);
                let result = handler(&matches);
                assert!(matches!(result, Ok(Action::Server(Args { public_url: None, .. }))));
            },
        );
    }

    #[test]
    fn session_ttl_beyond_ten_years_is_rejected() {
        temp_env::with_vars(
            [
                ("WIKIGATE_DSN", Some("postgres://localhost:5432/wikigate")),
                ("WIKIGATE_SESSION_TTL_SECONDS", Some("18446744073709551615")),
            ],
            || {
                let result = crate::cli::commands::new().try_get_matches_from(vec!["wikigate"]);
                assert!(matches!(
                    result.map_err(|err| err.kind()),
                    Err(clap::error::ErrorKind::ValueValidation)
                ));
            },
        );
        temp_env::with_vars(
            [
                ("WIKIGATE_DSN", Some("postgres://localhost:5432/wikigate")),
                ("WIKIGATE_SESSION_TTL_SECONDS", Some("315360000")),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["wikigate"]);
                let result = handler(&matches);
                assert!(matches!(
                    result,
                    Ok(Action::Server(Args { session_ttl_seconds: 315_360_000, .. }))
                ));
            },
        );
    }
}
