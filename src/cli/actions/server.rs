use crate::{
    api,
    cli::globals::GlobalArgs,
    ratelimit::RateLimitConfig,
    session::SessionConfig,
    tls::{self, TlsPaths},
};
use anyhow::{Context, Result};
use secrecy::SecretString;
use std::time::Duration;
use tracing::debug;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub public_url: Option<String>,
    pub login_max_failures: u32,
    pub login_window_seconds: u64,
    pub login_lockout_seconds: u64,
    pub session_ttl_seconds: u64,
    pub ssl_dir: Option<String>,
    pub tls_common_name: String,
    pub admin_account: Option<String>,
    pub admin_password: Option<SecretString>,
}

impl Args {
    #[must_use]
    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig::new()
            .with_max_failures(self.login_max_failures)
            .with_window(Duration::from_secs(self.login_window_seconds))
            .with_lockout(Duration::from_secs(self.login_lockout_seconds))
    }

    #[must_use]
    pub fn session_config(&self, globals: &GlobalArgs) -> SessionConfig {
        SessionConfig::new()
            .with_ttl(Duration::from_secs(self.session_ttl_seconds))
            .with_secure_cookie(globals.secure_cookies())
    }
}

/// Execute the server action.
/// # Errors
/// Returns an error if TLS material cannot be prepared or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let tls_paths = TlsPaths::resolve(args.ssl_dir.as_deref());
    tls::ensure_self_signed(&tls_paths, &args.tls_common_name)
        .context("Failed to prepare TLS material")?;

    let mut globals = GlobalArgs::new(args.public_url.clone());
    if let (Some(account), Some(password)) = (&args.admin_account, &args.admin_password) {
        globals.set_admin(account.clone(), password.clone());
    }

    debug!("Global args: {:?}", globals);

    let rate_limit = args.rate_limit_config();
    let session = args.session_config(&globals);

    api::new(args.port, args.dsn, &globals, rate_limit, session).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> Args {
        Args {
            port: 8080,
            dsn: "postgres://localhost/wikigate".to_string(),
            public_url: Some("https://wiki.example.com".to_string()),
            login_max_failures: 3,
            login_window_seconds: 60,
            login_lockout_seconds: 120,
            session_ttl_seconds: 3600,
            ssl_dir: None,
            tls_common_name: "localhost".to_string(),
            admin_account: None,
            admin_password: None,
        }
    }

    #[test]
    fn component_configs_follow_args() {
        let args = args();
        let rate_limit = args.rate_limit_config();
        assert_eq!(rate_limit.max_failures(), 3);
        assert_eq!(rate_limit.window(), Duration::from_secs(60));
        assert_eq!(rate_limit.lockout(), Duration::from_secs(120));

        let session = args.session_config(&GlobalArgs::new(args.public_url.clone()));
        assert_eq!(session.ttl(), Duration::from_secs(3600));
        assert!(session.secure_cookie());
    }
}
