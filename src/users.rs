//! Console user accounts.

use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row, postgres::PgRow};
use std::{collections::HashMap, fmt, str::FromStr, sync::OnceLock};
use tokio::sync::RwLock;
use tracing::{Instrument, info, info_span, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

pub const MIN_PASSWORD_LEN: usize = 8;

static UNKNOWN_ACCOUNT_HASH: OnceLock<String> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
    Guest,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
            Self::Guest => "guest",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = UserError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "user" => Ok(Self::User),
            "guest" => Ok(Self::Guest),
            other => Err(UserError::UnknownRole(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub account: String,
    pub role: Role,
    pub password_hash: String,
    pub last_access: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum UserError {
    #[error("account {0} already exists")]
    AccountTaken(String),
    #[error("unknown role {0}")]
    UnknownRole(String),
    #[error("account must not be empty")]
    EmptyAccount,
    #[error("password must be at least {MIN_PASSWORD_LEN} characters")]
    WeakPassword,
    #[error("password hashing failed: {0}")]
    Hash(argon2::password_hash::Error),
    #[error("user query failed: {0}")]
    Database(#[from] sqlx::Error),
}

/// Argon2id PHC string for `password`.
///
/// # Errors
/// Returns an error if hashing fails.
pub fn hash_password(password: &str) -> Result<String, UserError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(UserError::Hash)
}

/// Reject passwords shorter than [`MIN_PASSWORD_LEN`] characters.
///
/// # Errors
/// Returns [`UserError::WeakPassword`] for a short password.
pub fn check_password_strength(password: &str) -> Result<(), UserError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(UserError::WeakPassword);
    }
    Ok(())
}

/// Constant-time check of `password` against a stored PHC string. A malformed
/// hash never verifies.
#[must_use]
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    PasswordHash::new(stored_hash).is_ok_and(|parsed| {
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    })
}

/// Run one argon2 verification for a login naming an unknown account, so the
/// response takes as long as a wrong password would. Always `false`.
#[must_use]
pub fn verify_unknown_account(password: &str) -> bool {
    let hash = UNKNOWN_ACCOUNT_HASH
        .get_or_init(|| hash_password("wikigate-unknown-account").unwrap_or_default());
    let _ = verify_password(password, hash);
    false
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<User>, UserError>;

    async fn get_by_account(&self, account: &str) -> Result<Option<User>, UserError>;

    /// All users ordered by creation time.
    async fn list(&self) -> Result<Vec<User>, UserError>;

    async fn insert(&self, user: User) -> Result<(), UserError>;

    async fn touch_last_access(&self, id: &str) -> Result<(), UserError>;

    /// Replace the stored hash. Returns `false` for an unknown user.
    async fn update_password(&self, id: &str, password_hash: &str) -> Result<bool, UserError>;

    /// Returns `false` for an unknown user.
    async fn delete(&self, id: &str) -> Result<bool, UserError>;
}

#[derive(Debug, Default)]
pub struct MemoryUserRepository {
    users: RwLock<HashMap<String, User>>,
}

impl MemoryUserRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    async fn get(&self, id: &str) -> Result<Option<User>, UserError> {
        Ok(self.users.read().await.get(id).cloned())
    }

    async fn get_by_account(&self, account: &str) -> Result<Option<User>, UserError> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|user| user.account == account)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<User>, UserError> {
        let mut users: Vec<User> = self.users.read().await.values().cloned().collect();
        users.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(users)
    }

    async fn insert(&self, user: User) -> Result<(), UserError> {
        let mut users = self.users.write().await;
        if users.values().any(|existing| existing.account == user.account) {
            return Err(UserError::AccountTaken(user.account));
        }
        users.insert(user.id.clone(), user);
        Ok(())
    }

    async fn touch_last_access(&self, id: &str) -> Result<(), UserError> {
        if let Some(user) = self.users.write().await.get_mut(id) {
            user.last_access = Some(Utc::now());
        }
        Ok(())
    }

    async fn update_password(&self, id: &str, password_hash: &str) -> Result<bool, UserError> {
        let mut users = self.users.write().await;
        let Some(user) = users.get_mut(id) else {
            return Ok(false);
        };
        user.password_hash = password_hash.to_string();
        Ok(true)
    }

    async fn delete(&self, id: &str) -> Result<bool, UserError> {
        Ok(self.users.write().await.remove(id).is_some())
    }
}

#[derive(Debug, Clone)]
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const USER_COLUMNS: &str = "id, account, role, password_hash, last_access, created_at";

fn user_from_row(row: &PgRow) -> Result<User, UserError> {
    let role: String = row.try_get("role")?;
    Ok(User {
        id: row.try_get("id")?,
        account: row.try_get("account")?,
        role: role.parse()?,
        password_hash: row.try_get("password_hash")?,
        last_access: row.try_get("last_access")?,
        created_at: row.try_get("created_at")?,
    })
}

async fn fetch_one_user(
    pool: &PgPool,
    query: &str,
    value: &str,
) -> Result<Option<User>, UserError> {
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(value)
        .fetch_optional(pool)
        .instrument(span)
        .await?
        .as_ref()
        .map(user_from_row)
        .transpose()
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn get(&self, id: &str) -> Result<Option<User>, UserError> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        fetch_one_user(&self.pool, &query, id).await
    }

    async fn get_by_account(&self, account: &str) -> Result<Option<User>, UserError> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE account = $1");
        fetch_one_user(&self.pool, &query, account).await
    }

    async fn list(&self) -> Result<Vec<User>, UserError> {
        let query = format!("SELECT {USER_COLUMNS} FROM users ORDER BY created_at, id");
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = %query
        );
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .instrument(span)
            .await?;
        rows.iter().map(user_from_row).collect()
    }

    async fn insert(&self, user: User) -> Result<(), UserError> {
        let query = r"
            INSERT INTO users (id, account, role, password_hash, last_access, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (account) DO NOTHING
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(&user.id)
            .bind(&user.account)
            .bind(user.role.as_str())
            .bind(&user.password_hash)
            .bind(user.last_access)
            .bind(user.created_at)
            .execute(&self.pool)
            .instrument(span)
            .await?;
        if result.rows_affected() == 0 {
            return Err(UserError::AccountTaken(user.account));
        }
        Ok(())
    }

    async fn touch_last_access(&self, id: &str) -> Result<(), UserError> {
        let query = "UPDATE users SET last_access = NOW() WHERE id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(span)
            .await?;
        Ok(())
    }

    async fn update_password(&self, id: &str, password_hash: &str) -> Result<bool, UserError> {
        let query = "UPDATE users SET password_hash = $2 WHERE id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(id)
            .bind(password_hash)
            .execute(&self.pool)
            .instrument(span)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: &str) -> Result<bool, UserError> {
        let query = "DELETE FROM users WHERE id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(span)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Build a new user record with a freshly hashed password.
///
/// # Errors
/// Returns an error if hashing fails.
pub fn new_user(account: &str, password: &str, role: Role) -> Result<User, UserError> {
    Ok(User {
        id: Uuid::now_v7().to_string(),
        account: account.to_string(),
        role,
        password_hash: hash_password(password)?,
        last_access: None,
        created_at: Utc::now(),
    })
}

/// Create the bootstrap admin account unless the account already exists.
/// Returns `true` when a user was created.
///
/// # Errors
/// Returns an error if the lookup, hashing or insert fails.
#[instrument(skip(repo, password))]
pub async fn ensure_admin(
    repo: &dyn UserRepository,
    account: &str,
    password: &str,
) -> Result<bool, UserError> {
    if repo.get_by_account(account).await?.is_some() {
        return Ok(false);
    }
    match repo.insert(new_user(account, password, Role::Admin)?).await {
        Ok(()) => {
            info!("Created admin account");
            Ok(true)
        }
        // Another replica won the race.
        Err(UserError::AccountTaken(_)) => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn unknown_account_check_does_real_work() {
        assert!(!verify_unknown_account("wikigate-unknown-account"));
        assert!(!verify_unknown_account("admin-password"));
        let hash = UNKNOWN_ACCOUNT_HASH.get().unwrap();
        assert!(PasswordHash::new(hash).is_ok());
        assert!(hash.starts_with("$argon2id$"));
    }

    #[test]
    fn password_hash_round_trip() {
        let hash = hash_password("correct horse").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("battery staple", &hash));
        assert!(!verify_password("correct horse", "not-a-phc-string"));
    }

    #[test]
    fn role_parsing() {
        assert_eq!("admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!(Role::Guest.to_string(), "guest");
        assert!("root".parse::<Role>().is_err());
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
    }

    #[tokio::test]
    async fn accounts_are_unique() {
        let repo = MemoryUserRepository::new();
        repo.insert(new_user("alice", "pw", Role::User).unwrap())
            .await
            .unwrap();
        let err = repo
            .insert(new_user("alice", "pw2", Role::Guest).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, UserError::AccountTaken(_)));
    }

    #[tokio::test]
    async fn ensure_admin_is_idempotent() {
        let repo = MemoryUserRepository::new();
        assert!(ensure_admin(&repo, "admin", "secret").await.unwrap());
        assert!(!ensure_admin(&repo, "admin", "other").await.unwrap());

        let admin = repo.get_by_account("admin").await.unwrap().unwrap();
        assert_eq!(admin.role, Role::Admin);
        assert!(verify_password("secret", &admin.password_hash));
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn touch_updates_last_access() {
        let repo = MemoryUserRepository::new();
        let user = new_user("bob", "pw", Role::User).unwrap();
        let id = user.id.clone();
        repo.insert(user).await.unwrap();
        assert!(repo.get(&id).await.unwrap().unwrap().last_access.is_none());
        repo.touch_last_access(&id).await.unwrap();
        assert!(repo.get(&id).await.unwrap().unwrap().last_access.is_some());
        repo.touch_last_access("missing").await.unwrap();
    }

    #[tokio::test]
    async fn password_update_and_delete() {
        let repo = MemoryUserRepository::new();
        let user = new_user("carol", "old-password", Role::Guest).unwrap();
        let id = user.id.clone();
        repo.insert(user).await.unwrap();

        let hash = hash_password("new-password").unwrap();
        assert!(repo.update_password(&id, &hash).await.unwrap());
        let stored = repo.get(&id).await.unwrap().unwrap();
        assert!(verify_password("new-password", &stored.password_hash));
        assert!(!repo.update_password("missing", &hash).await.unwrap());

        assert!(repo.delete(&id).await.unwrap());
        assert!(!repo.delete(&id).await.unwrap());
        assert!(repo.get_by_account("carol").await.unwrap().is_none());
    }

    #[test]
    fn short_passwords_are_rejected() {
        assert!(matches!(
            check_password_strength("short"),
            Err(UserError::WeakPassword)
        ));
        assert!(check_password_strength("long enough").is_ok());
    }
}
