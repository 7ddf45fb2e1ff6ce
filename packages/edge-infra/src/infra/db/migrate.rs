//! Migration strategies, one per database kind.
//!
//! Every strategy implements [`MigrationExecutor`]; ordering, drift detection
//! and reporting live in the `migration` crate. Each file is applied together
//! with its tracking row in one transaction (D1: one atomic batch).

// External crate imports
use async_trait::async_trait;
use migration::{
    migrate, AppliedMigration, MigrationCommand, MigrationError, MigrationExecutor,
    MigrationFile, MigrationJob, MigrationReport,
};
use sea_orm::{ConnectionTrait, DatabaseConnection, Statement, TransactionTrait, Value};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

// Internal crate imports
use crate::config::db::{DatabaseKind, Dialect};
use crate::error::InfraError;
use crate::infra::db::d1::{D1Binding, D1Statement};
use crate::infra::db::handle::{DatabaseHandle, Driver};
use crate::infra::db::locking::{acquire, lock_for};

fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

fn store_err(e: impl std::fmt::Display) -> MigrationError {
    MigrationError::store(e.to_string())
}

fn create_table_sql(dialect: Dialect, table: &str) -> String {
    match dialect {
        Dialect::Sqlite => format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
             id INTEGER PRIMARY KEY AUTOINCREMENT, \
             name TEXT NOT NULL UNIQUE, \
             hash TEXT NOT NULL, \
             applied_at INTEGER NOT NULL)"
        ),
        Dialect::Postgres => format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
             id SERIAL PRIMARY KEY, \
             name TEXT NOT NULL UNIQUE, \
             hash TEXT NOT NULL, \
             applied_at BIGINT NOT NULL)"
        ),
    }
}

fn table_exists_sql(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Sqlite => "SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table' AND name = ?",
        Dialect::Postgres => {
            "SELECT COUNT(*) AS n FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name = $1"
        }
    }
}

fn select_applied_sql(table: &str) -> String {
    format!("SELECT name, hash FROM {table} ORDER BY name")
}

fn insert_row_sql(dialect: Dialect, table: &str) -> String {
    match dialect {
        Dialect::Sqlite => format!("INSERT INTO {table} (name, hash, applied_at) VALUES (?, ?, ?)"),
        Dialect::Postgres => {
            format!("INSERT INTO {table} (name, hash, applied_at) VALUES ($1, $2, $3)")
        }
    }
}

/// sqlite, postgres and neon: sea-orm over sqlx.
pub struct SeaOrmExecutor<'a> {
    conn: &'a DatabaseConnection,
    dialect: Dialect,
    strategy: &'static str,
}

#[async_trait]
impl<'a> MigrationExecutor for SeaOrmExecutor<'a> {
    fn strategy(&self) -> &'static str {
        self.strategy
    }

    async fn ensure_table(&self, table: &str) -> Result<(), MigrationError> {
        self.conn
            .execute_unprepared(&create_table_sql(self.dialect, table))
            .await
            .map(|_| ())
            .map_err(store_err)
    }

    async fn has_table(&self, table: &str) -> Result<bool, MigrationError> {
        let backend = self.conn.get_database_backend();
        let row = self
            .conn
            .query_one(Statement::from_sql_and_values(
                backend,
                table_exists_sql(self.dialect),
                [Value::from(table)],
            ))
            .await
            .map_err(store_err)?;
        match row {
            Some(row) => Ok(row.try_get::<i64>("", "n").map_err(store_err)? > 0),
            None => Ok(false),
        }
    }

    async fn applied(&self, table: &str) -> Result<Vec<AppliedMigration>, MigrationError> {
        let backend = self.conn.get_database_backend();
        let rows = self
            .conn
            .query_all(Statement::from_string(backend, select_applied_sql(table)))
            .await
            .map_err(store_err)?;

        rows.iter()
            .map(|row| {
                Ok(AppliedMigration {
                    name: row.try_get::<String>("", "name").map_err(store_err)?,
                    hash: row.try_get::<String>("", "hash").map_err(store_err)?,
                })
            })
            .collect()
    }

    async fn apply(&self, table: &str, file: &MigrationFile) -> Result<(), MigrationError> {
        let txn = self.conn.begin().await.map_err(store_err)?;

        for (idx, sql) in file.statements().into_iter().enumerate() {
            debug!(file = %file.name, statement = idx, "executing statement");
            txn.execute_unprepared(sql).await.map_err(store_err)?;
        }

        let backend = txn.get_database_backend();
        txn.execute(Statement::from_sql_and_values(
            backend,
            insert_row_sql(self.dialect, table),
            [
                Value::from(file.name.clone()),
                Value::from(file.hash.clone()),
                Value::from(now_millis()),
            ],
        ))
        .await
        .map_err(store_err)?;

        // Uncommitted transactions roll back on drop.
        txn.commit().await.map_err(store_err)
    }
}

/// turso: libsql remote connection.
pub struct LibsqlExecutor<'a> {
    conn: &'a libsql::Connection,
}

#[async_trait]
impl<'a> MigrationExecutor for LibsqlExecutor<'a> {
    fn strategy(&self) -> &'static str {
        "turso"
    }

    async fn ensure_table(&self, table: &str) -> Result<(), MigrationError> {
        self.conn
            .execute(&create_table_sql(Dialect::Sqlite, table), ())
            .await
            .map(|_| ())
            .map_err(store_err)
    }

    async fn has_table(&self, table: &str) -> Result<bool, MigrationError> {
        let mut rows = self
            .conn
            .query(table_exists_sql(Dialect::Sqlite), libsql::params![table])
            .await
            .map_err(store_err)?;
        match rows.next().await.map_err(store_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(store_err)? > 0),
            None => Ok(false),
        }
    }

    async fn applied(&self, table: &str) -> Result<Vec<AppliedMigration>, MigrationError> {
        let mut rows = self
            .conn
            .query(&select_applied_sql(table), ())
            .await
            .map_err(store_err)?;

        let mut applied = Vec::new();
        while let Some(row) = rows.next().await.map_err(store_err)? {
            applied.push(AppliedMigration {
                name: row.get::<String>(0).map_err(store_err)?,
                hash: row.get::<String>(1).map_err(store_err)?,
            });
        }
        Ok(applied)
    }

    async fn apply(&self, table: &str, file: &MigrationFile) -> Result<(), MigrationError> {
        let tx = self.conn.transaction().await.map_err(store_err)?;

        for sql in file.statements() {
            tx.execute_batch(sql).await.map_err(store_err)?;
        }

        tx.execute(
            &insert_row_sql(Dialect::Sqlite, table),
            libsql::params![file.name.as_str(), file.hash.as_str(), now_millis()],
        )
        .await
        .map_err(store_err)?;

        tx.commit().await.map_err(store_err)
    }
}

/// d1: the injected binding. Each file goes out as one batch.
pub struct D1Executor<'a> {
    binding: &'a dyn D1Binding,
}

#[async_trait]
impl<'a> MigrationExecutor for D1Executor<'a> {
    fn strategy(&self) -> &'static str {
        "d1"
    }

    async fn ensure_table(&self, table: &str) -> Result<(), MigrationError> {
        self.binding
            .exec(&create_table_sql(Dialect::Sqlite, table))
            .await
            .map(|_| ())
            .map_err(store_err)
    }

    async fn has_table(&self, table: &str) -> Result<bool, MigrationError> {
        let rows = self
            .binding
            .query(D1Statement::new(table_exists_sql(Dialect::Sqlite)).bind(table))
            .await
            .map_err(store_err)?;
        Ok(rows
            .first()
            .and_then(|row| row.get("n"))
            .and_then(|n| n.as_i64())
            .is_some_and(|n| n > 0))
    }

    async fn applied(&self, table: &str) -> Result<Vec<AppliedMigration>, MigrationError> {
        let rows = self
            .binding
            .query(D1Statement::new(select_applied_sql(table)))
            .await
            .map_err(store_err)?;

        rows.into_iter()
            .map(|row| {
                let field = |key: &str| {
                    row.get(key)
                        .and_then(|v| v.as_str())
                        .map(str::to_owned)
                        .ok_or_else(|| MigrationError::store(format!("d1 row missing text column '{key}'")))
                };
                Ok(AppliedMigration {
                    name: field("name")?,
                    hash: field("hash")?,
                })
            })
            .collect()
    }

    async fn apply(&self, table: &str, file: &MigrationFile) -> Result<(), MigrationError> {
        let mut batch: Vec<D1Statement> =
            file.statements().into_iter().map(D1Statement::new).collect();
        batch.push(
            D1Statement::new(insert_row_sql(Dialect::Sqlite, table))
                .bind(file.name.as_str())
                .bind(file.hash.as_str())
                .bind(now_millis()),
        );
        self.binding.batch(batch).await.map_err(store_err)
    }
}

/// Pick the strategy for `kind`. `kind` must use the handle's driver
/// (postgres and neon are interchangeable).
pub fn executor_for(
    handle: &DatabaseHandle,
    kind: DatabaseKind,
) -> Result<Box<dyn MigrationExecutor + '_>, InfraError> {
    if !kind.same_driver(handle.kind()) {
        return Err(InfraError::Configuration {
            kind: Some(kind),
            field: None,
            message: format!(
                "cannot run {kind} migrations on a {} connection",
                handle.kind()
            ),
        });
    }

    let executor: Box<dyn MigrationExecutor + '_> = match &handle.driver {
        Driver::Sqlite { conn, .. } => Box::new(SeaOrmExecutor {
            conn,
            dialect: Dialect::Sqlite,
            strategy: "sqlite",
        }),
        Driver::Postgres { conn, .. } => Box::new(SeaOrmExecutor {
            conn,
            dialect: Dialect::Postgres,
            strategy: if kind == DatabaseKind::Neon { "neon" } else { "postgres" },
        }),
        Driver::Libsql { conn, .. } => Box::new(LibsqlExecutor { conn }),
        Driver::D1(binding) => Box::new(D1Executor {
            binding: binding.as_ref(),
        }),
    };
    Ok(executor)
}

/// Run `command` for `kind` against `handle`.
///
/// `Up` holds the migration lock for the whole run. `Status` takes no lock and
/// never creates the tracking table.
pub async fn run_command(
    handle: &DatabaseHandle,
    job: &MigrationJob,
    kind: DatabaseKind,
    command: MigrationCommand,
) -> Result<MigrationReport, InfraError> {
    if command == MigrationCommand::Rollback {
        warn!(kind = %kind, "rollback requested; not supported");
        return Err(MigrationError::RollbackUnsupported.into());
    }

    job.validate()?;
    let executor = executor_for(handle, kind)?;

    if command == MigrationCommand::Status {
        return Ok(migrate(executor.as_ref(), job, command).await?);
    }

    let mut lock = lock_for(handle, job);
    let guard = acquire(lock.as_mut(), job.lock_timeout).await?;
    info!(kind = %kind, target = %handle.target(), "migration lock held");

    let result = migrate(executor.as_ref(), job, command).await;
    let released = guard.release().await;

    let report = result?;
    released?;
    Ok(report)
}

/// Apply every pending migration in `job` using the `kind` strategy.
pub async fn run_migrations(
    handle: &DatabaseHandle,
    job: &MigrationJob,
    kind: DatabaseKind,
) -> Result<MigrationReport, InfraError> {
    run_command(handle, job, kind, MigrationCommand::Up).await
}

/// Applied and pending migration names, without applying anything.
pub async fn migration_status(
    handle: &DatabaseHandle,
    job: &MigrationJob,
    kind: DatabaseKind,
) -> Result<MigrationReport, InfraError> {
    run_command(handle, job, kind, MigrationCommand::Status).await
}
