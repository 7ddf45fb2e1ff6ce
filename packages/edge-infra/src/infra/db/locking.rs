// Standard library imports
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

// External crate imports
use async_trait::async_trait;
use migration::{MigrationError, MigrationJob};
use rand::Rng;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, Postgres};
use tracing::{debug, trace, warn};
use xxhash_rust::xxh3::xxh3_64;

// Internal crate imports
use crate::error::InfraError;
use crate::infra::db::handle::{DatabaseHandle, Driver};

pub fn pg_lock_id(key: &str) -> i64 {
    xxh3_64(key.as_bytes()) as i64
}

/// Lock file guarding migrations of the sqlite database at `db_path`.
pub fn sqlite_lock_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push(".migrate.lock");
    PathBuf::from(name)
}

fn lock_err(e: impl std::fmt::Display) -> InfraError {
    MigrationError::store(format!("migration lock: {e}")).into()
}

/// A held migration lock.
pub enum LockGuard {
    Noop,
    File { file: File, path: PathBuf },
    Advisory { conn: PoolConnection<Postgres>, key: i64 },
}

impl LockGuard {
    /// Release the lock. Failures are reported but the OS/session drops the lock anyway.
    pub async fn release(self) -> Result<(), InfraError> {
        match self {
            LockGuard::Noop => Ok(()),
            LockGuard::File { file, path } => {
                use fs4::fs_std::FileExt;

                if let Err(e) = FileExt::unlock(&file) {
                    // File is dropped right after, which releases the OS lock regardless.
                    debug!(error = %e, lock_path = %path.display(), "sqlite lock unlock returned error");
                }
                debug!(lock_path = %path.display(), "sqlite migration lock released");
                Ok(())
            }
            LockGuard::Advisory { mut conn, key } => {
                let unlocked: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
                    .bind(key)
                    .fetch_one(&mut *conn)
                    .await
                    .map_err(lock_err)?;
                if !unlocked {
                    warn!(code = "PG_UNLOCK_FALSE", lock_key = key, "advisory unlock returned false");
                }
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockGuard::Noop => f.write_str("LockGuard::Noop"),
            LockGuard::File { path, .. } => f.debug_struct("LockGuard::File").field("path", path).finish(),
            LockGuard::Advisory { key, .. } => f.debug_struct("LockGuard::Advisory").field("key", key).finish(),
        }
    }
}

/// Non-blocking migration lock; [`acquire`] adds backoff and a deadline.
#[async_trait]
pub trait MigrationLock: Send {
    /// `Some` when acquired, `None` when another process holds it.
    async fn try_acquire(&mut self) -> Result<Option<LockGuard>, InfraError>;
}

/// OS-level exclusive lock on `<db>.migrate.lock`.
pub struct SqliteFileLock {
    lock_path: PathBuf,
}

impl SqliteFileLock {
    pub fn new(lock_path: impl Into<PathBuf>) -> Self {
        Self {
            lock_path: lock_path.into(),
        }
    }
}

#[async_trait]
impl MigrationLock for SqliteFileLock {
    async fn try_acquire(&mut self) -> Result<Option<LockGuard>, InfraError> {
        use fs4::fs_std::FileExt;

        if let Some(parent) = self.lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(lock_err)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(lock_err)?;

        // Ok(true) = acquired, Ok(false) = held elsewhere.
        match file.try_lock_exclusive() {
            Ok(true) => {
                debug!(lock_path = %self.lock_path.display(), "sqlite migration lock acquired");
                Ok(Some(LockGuard::File {
                    file,
                    path: self.lock_path.clone(),
                }))
            }
            Ok(false) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(lock_err(e)),
        }
    }
}

/// Session-level advisory lock held on one pinned pool connection.
pub struct PgAdvisoryLock {
    pool: PgPool,
    lock_key: i64,
}

impl PgAdvisoryLock {
    pub fn new(pool: PgPool, key: &str) -> Self {
        Self {
            pool,
            lock_key: pg_lock_id(key),
        }
    }
}

#[async_trait]
impl MigrationLock for PgAdvisoryLock {
    async fn try_acquire(&mut self) -> Result<Option<LockGuard>, InfraError> {
        let mut conn = self.pool.acquire().await.map_err(lock_err)?;
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(self.lock_key)
            .fetch_one(&mut *conn)
            .await
            .map_err(lock_err)?;

        if locked {
            Ok(Some(LockGuard::Advisory {
                conn,
                key: self.lock_key,
            }))
        } else {
            Ok(None)
        }
    }
}

/// For targets with no shared on-disk or session state to guard
/// (in-memory sqlite, or hosted services that serialise writes themselves).
pub struct NoopLock;

#[async_trait]
impl MigrationLock for NoopLock {
    async fn try_acquire(&mut self) -> Result<Option<LockGuard>, InfraError> {
        Ok(Some(LockGuard::Noop))
    }
}

/// Lock appropriate for the handle's driver.
pub fn lock_for(handle: &DatabaseHandle, job: &MigrationJob) -> Box<dyn MigrationLock> {
    match &handle.driver {
        Driver::Sqlite {
            path: Some(path), ..
        } => Box::new(SqliteFileLock::new(sqlite_lock_path(path))),
        Driver::Postgres { pool, .. } => {
            let key = format!("migrate:{}:{}", handle.target(), job.migrations_table);
            Box::new(PgAdvisoryLock::new(pool.clone(), &key))
        }
        Driver::Sqlite { path: None, .. } | Driver::Libsql { .. } | Driver::D1(_) => Box::new(NoopLock),
    }
}

/// Retry `lock` with capped exponential backoff plus jitter until `timeout`.
pub async fn acquire(
    lock: &mut dyn MigrationLock,
    timeout: Duration,
) -> Result<LockGuard, InfraError> {
    let start = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        if let Some(guard) = lock.try_acquire().await? {
            trace!(
                lock = "won",
                attempts = attempts,
                elapsed_ms = start.elapsed().as_millis()
            );
            return Ok(guard);
        }

        if start.elapsed() >= timeout {
            return Err(MigrationError::LockTimeout {
                waited_ms: start.elapsed().as_millis(),
            }
            .into());
        }

        let base_delay_ms = (5u64 << attempts.saturating_sub(1).min(16)).min(80);
        let jitter_ms = rand::rng().random::<u64>() % 4;
        let delay_ms = base_delay_ms + jitter_ms;
        trace!(
            lock = "backoff",
            attempts = attempts,
            delay_ms = delay_ms,
            elapsed_ms = start.elapsed().as_millis()
        );
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_path_appends_suffix() {
        assert_eq!(
            sqlite_lock_path(Path::new("data/app.db")),
            PathBuf::from("data/app.db.migrate.lock")
        );
    }

    #[test]
    fn lock_ids_are_stable() {
        assert_eq!(pg_lock_id("migrate:a"), pg_lock_id("migrate:a"));
        assert_ne!(pg_lock_id("migrate:a"), pg_lock_id("migrate:b"));
    }

    #[tokio::test]
    async fn file_lock_is_exclusive_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db.migrate.lock");

        let mut first = SqliteFileLock::new(&path);
        let mut second = SqliteFileLock::new(&path);

        let guard = first.try_acquire().await.unwrap().expect("first acquire");
        assert!(second.try_acquire().await.unwrap().is_none());

        let err = acquire(&mut second, Duration::from_millis(30)).await.unwrap_err();
        assert!(matches!(
            err,
            InfraError::Migration(MigrationError::LockTimeout { .. })
        ));

        guard.release().await.unwrap();
        let guard = acquire(&mut second, Duration::from_millis(200)).await.unwrap();
        guard.release().await.unwrap();
    }
}
