pub mod d1;
pub mod handle;
pub mod locking;
pub mod migrate;

pub use d1::{D1Binding, D1Error, D1Row, D1Statement};
pub use handle::{build_handle, build_handle_until_cancelled, DatabaseHandle, Row};
pub use locking::{acquire, lock_for, LockGuard, MigrationLock, NoopLock, PgAdvisoryLock, SqliteFileLock};
pub use migrate::{executor_for, migration_status, run_command, run_migrations};
