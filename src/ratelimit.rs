//! Per-IP login throttling.
//!
//! Flow Overview:
//! 1) Every failed login increments `login:failures:{ip}` with a sliding TTL
//!    equal to the counting window.
//! 2) Once the count reaches the threshold, `login:lock:{ip}` is written with
//!    the lock expiry (unix millis) and a TTL equal to the lockout duration.
//! 3) A successful login clears both keys through [`ResetDispatcher`].
//!
//! Lock checks fail open: a store outage must not turn into a full
//! authentication denial.

use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tracing::{debug, error, instrument, warn};

use crate::store::{KeyedStore, StoreError};

const DEFAULT_MAX_FAILURES: u32 = 5;
const DEFAULT_WINDOW: Duration = Duration::from_secs(10 * 60);
const DEFAULT_LOCKOUT: Duration = Duration::from_secs(15 * 60);

fn failures_key(ip: &str) -> String {
    format!("login:failures:{ip}")
}

fn lock_key(ip: &str) -> String {
    format!("login:lock:{ip}")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitConfig {
    max_failures: u32,
    window: Duration,
    lockout: Duration,
}

impl RateLimitConfig {
    /// Default config: lock after 5 failures within 10 minutes, for 15 minutes.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_failures: DEFAULT_MAX_FAILURES,
            window: DEFAULT_WINDOW,
            lockout: DEFAULT_LOCKOUT,
        }
    }

    #[must_use]
    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures.max(1);
        self
    }

    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    #[must_use]
    pub fn with_lockout(mut self, lockout: Duration) -> Self {
        self.lockout = lockout;
        self
    }

    #[must_use]
    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    #[must_use]
    pub fn lockout(&self) -> Duration {
        self.lockout
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of a lock check. `remaining` is zero when not locked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockStatus {
    pub locked: bool,
    pub remaining: Duration,
}

impl LockStatus {
    const OPEN: Self = Self {
        locked: false,
        remaining: Duration::ZERO,
    };
}

pub struct LoginRateLimiter {
    store: Arc<dyn KeyedStore>,
    config: RateLimitConfig,
}

impl std::fmt::Debug for LoginRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LoginRateLimiter {
    #[must_use]
    pub fn new(store: Arc<dyn KeyedStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Report whether `ip` is currently locked out and for how long.
    ///
    /// Store errors and unreadable lock values are logged and reported as
    /// not locked.
    #[instrument(skip(self))]
    pub async fn check_ip_locked(&self, ip: &str) -> LockStatus {
        let value = match self.store.get(&lock_key(ip)).await {
            Ok(Some(value)) => value,
            Ok(None) => return LockStatus::OPEN,
            Err(err) => {
                warn!("login lock check failed, allowing attempt: {err}");
                return LockStatus::OPEN;
            }
        };

        let Ok(expires_at_ms) = value.parse::<i64>() else {
            warn!(value = %value, "unreadable login lock value, allowing attempt");
            return LockStatus::OPEN;
        };

        let remaining_ms = expires_at_ms.saturating_sub(Utc::now().timestamp_millis());
        match u64::try_from(remaining_ms) {
            Ok(ms) if ms > 0 => LockStatus {
                locked: true,
                remaining: Duration::from_millis(ms),
            },
            _ => LockStatus::OPEN,
        }
    }

    /// Record a failed login for `ip` and lock it once the threshold is reached.
    ///
    /// Returns the failure count within the current window.
    ///
    /// # Errors
    /// Returns an error if the store rejects the increment or the lock write.
    #[instrument(skip(self))]
    pub async fn lock_attempt(&self, ip: &str) -> Result<i64, StoreError> {
        let failures = self
            .store
            .incr_with_expiry(&failures_key(ip), self.config.window)
            .await?;

        if failures >= i64::from(self.config.max_failures) {
            let lockout_ms = i64::try_from(self.config.lockout.as_millis()).unwrap_or(i64::MAX);
            let expires_at_ms = Utc::now().timestamp_millis().saturating_add(lockout_ms);
            self.store
                .set(
                    &lock_key(ip),
                    &expires_at_ms.to_string(),
                    self.config.lockout,
                )
                .await?;
            warn!(failures, "login locked for source ip");
        } else {
            debug!(failures, "login failure recorded");
        }

        Ok(failures)
    }

    /// Clear the failure counter and any lock for `ip`.
    ///
    /// # Errors
    /// Returns an error if either delete fails.
    #[instrument(skip(self))]
    pub async fn reset_login_attempts(&self, ip: &str) -> Result<(), StoreError> {
        self.store.delete(&failures_key(ip)).await?;
        self.store.delete(&lock_key(ip)).await?;
        Ok(())
    }
}

/// Hands post-login resets to a single background worker over a bounded queue.
///
/// Dispatch never waits: when the queue is full or the worker is gone the
/// reset is dropped and logged. The worker exits once every handle is dropped.
#[derive(Clone, Debug)]
pub struct ResetDispatcher {
    tx: mpsc::Sender<String>,
}

impl ResetDispatcher {
    /// Start the worker task.
    #[must_use]
    pub fn spawn(limiter: Arc<LoginRateLimiter>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<String>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(ip) = rx.recv().await {
                if let Err(err) = limiter.reset_login_attempts(&ip).await {
                    error!(ip = %ip, "failed to reset login attempts: {err}");
                }
            }
            debug!("login reset worker stopped");
        });
        (Self { tx }, handle)
    }

    /// Queue a reset for `ip`. Returns `false` when the reset was dropped.
    pub fn dispatch(&self, ip: &str) -> bool {
        match self.tx.try_send(ip.to_string()) {
            Ok(()) => true,
            Err(TrySendError::Full(ip)) => {
                warn!(ip = %ip, "login reset queue full, dropping reset");
                false
            }
            Err(TrySendError::Closed(ip)) => {
                error!(ip = %ip, "login reset worker is not running, dropping reset");
                false
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    struct BrokenStore;

    #[async_trait]
    impl KeyedStore for BrokenStore {
        async fn incr_with_expiry(&self, key: &str, _ttl: Duration) -> Result<i64, StoreError> {
            Err(StoreError::NotANumber {
                key: key.to_string(),
            })
        }

        async fn set_if_absent(
            &self,
            key: &str,
            _value: &str,
            _ttl: Duration,
        ) -> Result<bool, StoreError> {
            Err(StoreError::NotANumber {
                key: key.to_string(),
            })
        }

        async fn set(&self, key: &str, _value: &str, _ttl: Duration) -> Result<(), StoreError> {
            Err(StoreError::NotANumber {
                key: key.to_string(),
            })
        }

        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::NotANumber {
                key: key.to_string(),
            })
        }

        async fn take(&self, key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::NotANumber {
                key: key.to_string(),
            })
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            Err(StoreError::NotANumber {
                key: key.to_string(),
            })
        }
    }

    fn limiter(config: RateLimitConfig) -> (Arc<MemoryStore>, LoginRateLimiter) {
        let store = Arc::new(MemoryStore::new());
        let limiter = LoginRateLimiter::new(store.clone(), config);
        (store, limiter)
    }

    #[test]
    fn config_defaults() {
        let config = RateLimitConfig::default();
        assert_eq!(config.max_failures(), 5);
        assert_eq!(config.window(), Duration::from_secs(600));
        assert_eq!(config.lockout(), Duration::from_secs(900));
        assert_eq!(
            RateLimitConfig::new().with_max_failures(0).max_failures(),
            1
        );
    }

    #[tokio::test]
    async fn unknown_ip_is_open() {
        let (_, limiter) = limiter(RateLimitConfig::new());
        let status = limiter.check_ip_locked("10.0.0.1").await;
        assert!(!status.locked);
        assert_eq!(status.remaining, Duration::ZERO);
    }

    #[tokio::test]
    async fn locks_after_threshold_and_unlocks_after_expiry() {
        let config = RateLimitConfig::new()
            .with_max_failures(5)
            .with_lockout(Duration::from_millis(300));
        let (_, limiter) = limiter(config);

        for attempt in 1..=4 {
            assert_eq!(limiter.lock_attempt("10.0.0.1").await.unwrap(), attempt);
            assert!(!limiter.check_ip_locked("10.0.0.1").await.locked);
        }
        assert_eq!(limiter.lock_attempt("10.0.0.1").await.unwrap(), 5);

        let status = limiter.check_ip_locked("10.0.0.1").await;
        assert!(status.locked);
        assert!(status.remaining > Duration::from_millis(150));
        assert!(status.remaining <= Duration::from_millis(300));

        tokio::time::sleep(Duration::from_millis(400)).await;
        let status = limiter.check_ip_locked("10.0.0.1").await;
        assert!(!status.locked);
        assert_eq!(status.remaining, Duration::ZERO);
    }

    #[tokio::test]
    async fn lock_is_per_ip() {
        let (_, limiter) = limiter(RateLimitConfig::new().with_max_failures(2));
        limiter.lock_attempt("10.0.0.1").await.unwrap();
        limiter.lock_attempt("10.0.0.1").await.unwrap();
        assert!(limiter.check_ip_locked("10.0.0.1").await.locked);
        assert!(!limiter.check_ip_locked("10.0.0.2").await.locked);
    }

    #[tokio::test]
    async fn reset_clears_counter_and_lock() {
        let (store, limiter) = limiter(RateLimitConfig::new().with_max_failures(2));
        limiter.lock_attempt("10.0.0.1").await.unwrap();
        limiter.lock_attempt("10.0.0.1").await.unwrap();
        limiter.reset_login_attempts("10.0.0.1").await.unwrap();

        assert!(!limiter.check_ip_locked("10.0.0.1").await.locked);
        assert_eq!(store.get(&failures_key("10.0.0.1")).await.unwrap(), None);
        assert_eq!(limiter.lock_attempt("10.0.0.1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_failures_reach_threshold_exactly() {
        let (_, limiter) = limiter(RateLimitConfig::new().with_max_failures(10));
        let limiter = Arc::new(limiter);
        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.lock_attempt("10.0.0.9").await.unwrap()
            }));
        }
        let mut counts = Vec::new();
        for handle in handles {
            counts.push(handle.await.unwrap());
        }
        counts.sort_unstable();
        assert_eq!(counts, (1..=10).collect::<Vec<i64>>());
        assert!(limiter.check_ip_locked("10.0.0.9").await.locked);
    }

    #[tokio::test]
    async fn check_fails_open_on_store_error() {
        let limiter = LoginRateLimiter::new(Arc::new(BrokenStore), RateLimitConfig::new());
        let status = limiter.check_ip_locked("10.0.0.1").await;
        assert!(!status.locked);
        assert!(limiter.lock_attempt("10.0.0.1").await.is_err());
        assert!(limiter.reset_login_attempts("10.0.0.1").await.is_err());
    }

    #[tokio::test]
    async fn unreadable_lock_value_is_open() {
        let (store, limiter) = limiter(RateLimitConfig::new());
        store
            .set(&lock_key("10.0.0.1"), "soon", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!limiter.check_ip_locked("10.0.0.1").await.locked);
    }

    #[tokio::test]
    async fn dispatcher_resets_in_background() {
        let (_, limiter) = limiter(RateLimitConfig::new().with_max_failures(1));
        let limiter = Arc::new(limiter);
        limiter.lock_attempt("10.0.0.1").await.unwrap();
        assert!(limiter.check_ip_locked("10.0.0.1").await.locked);

        let (dispatcher, handle) = ResetDispatcher::spawn(limiter.clone(), 8);
        assert!(dispatcher.dispatch("10.0.0.1"));
        drop(dispatcher);
        handle.await.unwrap();

        assert!(!limiter.check_ip_locked("10.0.0.1").await.locked);
    }

    #[tokio::test]
    async fn dispatch_reports_stopped_worker() {
        let (_, limiter) = limiter(RateLimitConfig::new());
        let (dispatcher, handle) = ResetDispatcher::spawn(Arc::new(limiter), 8);
        handle.abort();
        assert!(handle.await.is_err());
        assert!(!dispatcher.dispatch("10.0.0.1"));
    }
}
