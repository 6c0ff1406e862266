//! Advisory locks built on option rows.
//!
//! A lock named `sync` is the row `_lock:sync` in the options table. Taking
//! the lock is an insert that does nothing when the key exists, so two
//! callers racing for the same name can never both win. The row is visible
//! to every connection; the manager only remembers which names it created
//! so they can be released when the database is closed.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::dialect::DialectKind;
use crate::error::Result;
use crate::executor::Executor;
use crate::options::{delete_raw, insert_raw_if_absent};
use crate::params;

const LOCK_PREFIX: &str = "_lock:";

/// Lock polling configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Give up after this long. Zero waits forever.
    pub timeout: Duration,
    /// Pause between attempts.
    pub interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(30_000),
            interval: Duration::from_millis(25),
        }
    }
}

impl LockOptions {
    /// Creates options from millisecond values.
    #[must_use]
    pub fn from_millis(timeout: u64, interval: u64) -> Self {
        Self {
            timeout: Duration::from_millis(timeout),
            interval: Duration::from_millis(interval),
        }
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the polling interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// A held lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockInfo {
    /// Lock name, without the `_lock:` prefix.
    pub name: String,
    /// When the lock was taken, if the stored timestamp parses.
    pub acquired_at: Option<DateTime<Utc>>,
}

/// Takes and releases advisory locks, remembering the ones it took.
#[derive(Debug, Default)]
pub struct LockManager {
    owned: Mutex<BTreeSet<String>>,
}

impl LockManager {
    /// Creates a manager that owns no locks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock `name`, polling until it is free.
    ///
    /// Returns `false` if the timeout elapsed first. The edge binding cannot
    /// keep time across its stateless requests reliably, so there the
    /// timeout is ignored and polling continues until the lock is free.
    pub async fn lock(&self, exec: &dyn Executor, name: &str, options: LockOptions) -> Result<bool> {
        let key = lock_key(name);
        let mut deadline = (!options.timeout.is_zero()).then(|| Instant::now() + options.timeout);
        if deadline.is_some() && exec.dialect().kind() == DialectKind::D1 {
            warn!(lock = %name, "Lock timeouts are not supported by the D1 binding, waiting without deadline");
            deadline = None;
        }

        loop {
            let acquired_at = serde_json::to_string(&Utc::now())?;
            if insert_raw_if_absent(exec, &key, &acquired_at).await? {
                self.owned.lock().await.insert(name.to_string());
                debug!(lock = %name, "Acquired lock");
                return Ok(true);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    warn!(lock = %name, timeout_ms = options.timeout.as_millis() as u64, "Timed out waiting for lock");
                    return Ok(false);
                }
            }
            tokio::time::sleep(options.interval).await;
        }
    }

    /// Returns whether anyone holds the lock `name`.
    pub async fn is_locked(&self, exec: &dyn Executor, name: &str) -> Result<bool> {
        let rows = exec
            .query(
                r#"SELECT 1 AS held FROM "Options" WHERE "key" = $key"#,
                &params! { "key" => lock_key(name) },
            )
            .await?;
        Ok(!rows.is_empty())
    }

    /// Lists every held lock, by anyone.
    pub async fn list(&self, exec: &dyn Executor) -> Result<Vec<LockInfo>> {
        let rows = exec
            .query(
                r#"SELECT "key", "value" FROM "Options" WHERE "key" LIKE '\_lock:%' ESCAPE '\' ORDER BY "key""#,
                &params! {},
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let name = row.get_str("key")?.strip_prefix(LOCK_PREFIX)?.to_string();
                let acquired_at = row
                    .get_str("value")
                    .and_then(|v| serde_json::from_str::<DateTime<Utc>>(v).ok());
                Some(LockInfo { name, acquired_at })
            })
            .collect())
    }

    /// Releases the lock `name`, whoever holds it. Returns whether it was held.
    pub async fn unlock(&self, exec: &dyn Executor, name: &str) -> Result<bool> {
        let released = delete_raw(exec, &lock_key(name)).await?;
        self.owned.lock().await.remove(name);
        if released {
            debug!(lock = %name, "Released lock");
        }
        Ok(released)
    }

    /// Releases every lock, including ones held by other instances.
    pub async fn unlock_all(&self, exec: &dyn Executor) -> Result<u64> {
        let released = exec
            .execute(
                r#"DELETE FROM "Options" WHERE "key" LIKE '\_lock:%' ESCAPE '\'"#,
                &params! {},
            )
            .await?;
        self.owned.lock().await.clear();
        Ok(released)
    }

    /// Releases the locks this manager took and still holds.
    pub async fn release_owned(&self, exec: &dyn Executor) -> Result<()> {
        let owned: Vec<String> = std::mem::take(&mut *self.owned.lock().await).into_iter().collect();
        for name in owned {
            delete_raw(exec, &lock_key(&name)).await?;
            debug!(lock = %name, "Released owned lock");
        }
        Ok(())
    }

    /// Names of the locks this manager holds.
    pub async fn owned(&self) -> Vec<String> {
        self.owned.lock().await.iter().cloned().collect()
    }
}

fn lock_key(name: &str) -> String {
    format!("{LOCK_PREFIX}{name}")
}

#[cfg(test)]
mod tests {
    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;
    use crate::backend::SqliteBackend;
    use crate::options::ensure_table;

    async fn backend() -> SqliteBackend {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await
            .unwrap();
        let backend = SqliteBackend::new(pool);
        ensure_table(&backend).await.unwrap();
        backend
    }

    #[tokio::test]
    async fn test_lock_unlock() {
        let db = backend().await;
        let locks = LockManager::new();

        assert!(!locks.is_locked(&db, "sync").await.unwrap());
        assert!(locks.lock(&db, "sync", LockOptions::default()).await.unwrap());
        assert!(locks.is_locked(&db, "sync").await.unwrap());
        assert_eq!(locks.owned().await, vec!["sync".to_string()]);

        let listed = locks.list(&db).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "sync");
        assert!(listed[0].acquired_at.is_some());

        assert!(locks.unlock(&db, "sync").await.unwrap());
        assert!(!locks.is_locked(&db, "sync").await.unwrap());
        assert!(locks.owned().await.is_empty());
    }

    #[tokio::test]
    async fn test_lock_value_is_json_timestamp() {
        let db = backend().await;
        let locks = LockManager::new();
        let before = Utc::now();
        assert!(locks.lock(&db, "sync", LockOptions::default()).await.unwrap());

        let rows = db
            .query(
                r#"SELECT "value" FROM "Options" WHERE "key" = '_lock:sync'"#,
                &params! {},
            )
            .await
            .unwrap();
        let stored = rows[0].get_str("value").unwrap();
        assert!(stored.starts_with('"') && stored.ends_with('"'));
        let decoded: DateTime<Utc> = serde_json::from_str(stored).unwrap();
        assert!(decoded >= before);
        assert_eq!(locks.list(&db).await.unwrap()[0].acquired_at, Some(decoded));
    }

    #[tokio::test]
    async fn test_second_lock_times_out() {
        let db = backend().await;
        let first = LockManager::new();
        let second = LockManager::new();

        assert!(first.lock(&db, "sync", LockOptions::default()).await.unwrap());
        let started = std::time::Instant::now();
        let acquired = second
            .lock(&db, "sync", LockOptions::from_millis(200, 25))
            .await
            .unwrap();
        assert!(!acquired);
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert!(second.owned().await.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_acquires_after_release() {
        let db = backend().await;
        let first = LockManager::new();
        let second = LockManager::new();
        assert!(first.lock(&db, "job", LockOptions::default()).await.unwrap());

        let (acquired, released) = tokio::join!(
            second.lock(&db, "job", LockOptions::from_millis(2_000, 10)),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                first.unlock(&db, "job").await
            }
        );
        assert!(released.unwrap());
        assert!(acquired.unwrap());
        assert_eq!(second.owned().await, vec!["job".to_string()]);
    }

    #[tokio::test]
    async fn test_release_owned_keeps_foreign_locks() {
        let db = backend().await;
        let mine = LockManager::new();
        let theirs = LockManager::new();
        assert!(mine.lock(&db, "a", LockOptions::default()).await.unwrap());
        assert!(theirs.lock(&db, "b", LockOptions::default()).await.unwrap());

        mine.release_owned(&db).await.unwrap();
        assert!(!mine.is_locked(&db, "a").await.unwrap());
        assert!(mine.is_locked(&db, "b").await.unwrap());

        assert_eq!(mine.unlock_all(&db).await.unwrap(), 1);
        assert!(mine.list(&db).await.unwrap().is_empty());
    }
}
