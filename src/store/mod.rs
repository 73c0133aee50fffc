//! Shared keyed store used for login counters, lockouts and OAuth state.
//!
//! Every mutation is a single store-level primitive (increment-with-expiry,
//! set-if-absent, delete-on-read). Callers never read a value, modify it and
//! write it back, so concurrent requests for the same key cannot lose updates
//! or redeem a single-use entry twice.
//!
//! Two backends are provided:
//!
//! - [`MemoryStore`]: process-local, used by tests and single-node setups.
//! - [`PgStore`]: the `kv_entries` table, shared by every replica.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store query failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store entry {key} holds a non-numeric value")]
    NotANumber { key: String },
}

/// Atomic key-value primitives with per-entry expiry.
///
/// Expired entries behave exactly like missing ones for every operation.
#[async_trait]
pub trait KeyedStore: Send + Sync {
    /// Increment the counter at `key` and reset its expiry to `ttl` from now.
    ///
    /// A missing or expired entry starts again at `1`. Returns the new count.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64, StoreError>;

    /// Store `value` only when no live entry exists. Returns `true` when written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, StoreError>;

    /// Store `value`, replacing any existing entry.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Remove the entry and return its value if it was still live.
    ///
    /// Of several concurrent callers at most one observes `Some`.
    async fn take(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}
