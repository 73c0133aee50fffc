use secrecy::SecretString;

/// Process-wide settings that are not owned by a single component.
#[derive(Clone, Default)]
pub struct GlobalArgs {
    pub public_url: Option<String>,
    pub admin_account: Option<String>,
    pub admin_password: Option<SecretString>,
}

impl GlobalArgs {
    #[must_use]
    pub fn new(public_url: Option<String>) -> Self {
        Self {
            public_url,
            ..Self::default()
        }
    }

    pub fn set_admin(&mut self, account: String, password: SecretString) {
        self.admin_account = Some(account);
        self.admin_password = Some(password);
    }

    /// Cookies get `Secure` when the console is served over https.
    #[must_use]
    pub fn secure_cookies(&self) -> bool {
        self.public_url
            .as_deref()
            .is_some_and(|url| url.trim().to_ascii_lowercase().starts_with("https://"))
    }
}

impl std::fmt::Debug for GlobalArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalArgs")
            .field("public_url", &self.public_url)
            .field("admin_account", &self.admin_account)
            .field("admin_password", &self.admin_password.as_ref().map(|_| "***"))
            .finish()
    }
}
