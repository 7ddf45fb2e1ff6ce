// Standard library imports
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

// External crate imports
use sea_orm::{
    ConnectionTrait, DatabaseConnection, FromQueryResult, JsonValue, SqlxPostgresConnector,
    SqlxSqliteConnector, Statement,
};
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// Internal crate imports
use crate::config::db::{sanitize_db_url, validate, DatabaseConfig, DatabaseKind, Dialect};
use crate::error::InfraError;
use crate::infra::db::d1::{D1Binding, D1Statement};
use crate::runtime::RuntimeKind;

pub type Row = Map<String, Value>;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const SQLITE_FILE_MAX_CONNECTIONS: u32 = 4;
const POSTGRES_MAX_CONNECTIONS_CAP: u32 = 16;

/// Live connection for exactly one [`DatabaseKind`].
///
/// Callers see only SQL-level operations; which driver sits underneath is
/// private to this module and the migration strategies.
pub struct DatabaseHandle {
    kind: DatabaseKind,
    target: String,
    pub(crate) driver: Driver,
}

pub(crate) enum Driver {
    Sqlite {
        conn: DatabaseConnection,
        path: Option<PathBuf>,
    },
    Postgres {
        conn: DatabaseConnection,
        pool: PgPool,
    },
    Libsql {
        _db: libsql::Database,
        conn: libsql::Connection,
    },
    D1(Arc<dyn D1Binding>),
}

impl DatabaseHandle {
    pub(crate) fn kind(&self) -> DatabaseKind {
        self.kind
    }

    pub fn dialect(&self) -> Dialect {
        self.kind.dialect()
    }

    /// Connection target with credentials masked.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Run a SQL script (one or more statements, no parameters).
    pub async fn execute(&self, sql: &str) -> Result<(), InfraError> {
        let kind = self.kind;
        match &self.driver {
            Driver::Sqlite { conn, .. } | Driver::Postgres { conn, .. } => conn
                .execute_unprepared(sql)
                .await
                .map(|_| ())
                .map_err(|e| InfraError::connection(kind, e)),
            Driver::Libsql { conn, .. } => conn
                .execute_batch(sql)
                .await
                .map(|_| ())
                .map_err(|e| InfraError::connection(kind, e)),
            Driver::D1(binding) => binding
                .exec(sql)
                .await
                .map(|_| ())
                .map_err(|e| InfraError::connection(kind, e)),
        }
    }

    /// Run one query and return its rows as JSON objects keyed by column name.
    pub async fn query(&self, sql: &str) -> Result<Vec<Row>, InfraError> {
        let kind = self.kind;
        match &self.driver {
            Driver::Sqlite { conn, .. } | Driver::Postgres { conn, .. } => {
                let stmt = Statement::from_string(conn.get_database_backend(), sql.to_owned());
                let rows = JsonValue::find_by_statement(stmt)
                    .all(conn)
                    .await
                    .map_err(|e| InfraError::connection(kind, e))?;
                Ok(rows.into_iter().map(into_row).collect())
            }
            Driver::Libsql { conn, .. } => {
                let mut rows = conn
                    .query(sql, ())
                    .await
                    .map_err(|e| InfraError::connection(kind, e))?;
                let mut out = Vec::new();
                while let Some(row) = rows.next().await.map_err(|e| InfraError::connection(kind, e))? {
                    out.push(libsql_row(&row).map_err(|e| InfraError::connection(kind, e))?);
                }
                Ok(out)
            }
            Driver::D1(binding) => binding
                .query(D1Statement::new(sql))
                .await
                .map_err(|e| InfraError::connection(kind, e)),
        }
    }

    /// Round-trip a trivial query.
    pub async fn ping(&self) -> Result<(), InfraError> {
        self.query("SELECT 1 AS ok").await.map(|_| ())
    }
}

impl std::fmt::Debug for DatabaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseHandle")
            .field("kind", &self.kind)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

fn into_row(value: JsonValue) -> Row {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

fn libsql_row(row: &libsql::Row) -> Result<Row, libsql::Error> {
    let mut map = Map::new();
    for idx in 0..row.column_count() {
        let name = row.column_name(idx).unwrap_or_default().to_string();
        let value = match row.get_value(idx)? {
            libsql::Value::Null => Value::Null,
            libsql::Value::Integer(i) => Value::from(i),
            libsql::Value::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
            libsql::Value::Text(s) => Value::String(s),
            libsql::Value::Blob(b) => Value::from(b),
        };
        map.insert(name, value);
    }
    Ok(map)
}

/// Where a sqlite config points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SqliteTarget {
    Memory,
    File(PathBuf),
}

impl SqliteTarget {
    pub(crate) fn from_url(url: Option<&str>) -> Self {
        let Some(url) = url else {
            return SqliteTarget::Memory;
        };
        let path = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .or_else(|| url.strip_prefix("file:"))
            .unwrap_or(url);
        let path = path.split('?').next().unwrap_or(path);
        match path {
            "" | ":memory:" => SqliteTarget::Memory,
            p => SqliteTarget::File(PathBuf::from(p)),
        }
    }
}

/// Build the handle for `config` in `runtime`.
///
/// Configuration is validated first (no I/O). Then the driver connects; there is
/// no retry and no timeout beyond the pool's acquire timeout, so callers that
/// need one should use [`build_handle_until_cancelled`] or wrap this call.
pub async fn build_handle(
    config: &DatabaseConfig,
    runtime: RuntimeKind,
) -> Result<DatabaseHandle, InfraError> {
    validate(config, runtime)?;

    let kind = config.kind;
    let start = Instant::now();
    info!("db_connect=start kind={} runtime={}", kind, runtime);

    let handle = match kind {
        DatabaseKind::Sqlite => connect_sqlite(SqliteTarget::from_url(config.url.as_deref())).await?,
        DatabaseKind::Turso => {
            let url = required(&config.url, kind, "url")?;
            let token = required(&config.auth_token, kind, "auth_token")?;
            connect_turso(url, token).await?
        }
        DatabaseKind::D1 => {
            let binding = config
                .binding
                .clone()
                .ok_or_else(|| InfraError::missing_field(kind, "binding", "no binding injected"))?;
            DatabaseHandle {
                kind,
                target: "d1 binding".to_string(),
                driver: Driver::D1(binding),
            }
        }
        DatabaseKind::Postgres | DatabaseKind::Neon => {
            let url = required(&config.url, kind, "url")?;
            connect_postgres(kind, url).await?
        }
    };

    info!(
        kind = %kind,
        target = %handle.target,
        elapsed_ms = start.elapsed().as_millis(),
        "db_connect=done"
    );
    Ok(handle)
}

/// [`build_handle`], abandoned when `token` is cancelled.
///
/// Configuration errors still win over cancellation; a cancelled connect is
/// reported as a connection error.
pub async fn build_handle_until_cancelled(
    config: &DatabaseConfig,
    runtime: RuntimeKind,
    token: &CancellationToken,
) -> Result<DatabaseHandle, InfraError> {
    validate(config, runtime)?;
    tokio::select! {
        result = build_handle(config, runtime) => result,
        _ = token.cancelled() => Err(InfraError::Connection {
            kind: config.kind,
            message: "connection attempt cancelled".to_string(),
        }),
    }
}

fn required<'a>(
    value: &'a Option<String>,
    kind: DatabaseKind,
    field: &'static str,
) -> Result<&'a str, InfraError> {
    value
        .as_deref()
        .ok_or_else(|| InfraError::missing_field(kind, field, "required for this database type"))
}

async fn connect_sqlite(target: SqliteTarget) -> Result<DatabaseHandle, InfraError> {
    let kind = DatabaseKind::Sqlite;
    let (options, pool_options, path) = match target {
        SqliteTarget::Memory => {
            // Every in-memory connection is its own database: pin exactly one.
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| InfraError::connection(kind, e))?;
            let pool_options = SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
            (options, pool_options, None)
        }
        SqliteTarget::File(path) => {
            ensure_parent_dir(&path).map_err(|e| InfraError::connection(kind, e))?;
            let options = SqliteConnectOptions::new()
                .filename(&path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal);
            let pool_options = SqlitePoolOptions::new().max_connections(SQLITE_FILE_MAX_CONNECTIONS);
            (options, pool_options, Some(path))
        }
    };

    let options = options
        .foreign_keys(true)
        .busy_timeout(SQLITE_BUSY_TIMEOUT);
    let pool = pool_options
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_with(options)
        .await
        .map_err(|e| InfraError::connection(kind, e))?;

    let target = match &path {
        Some(p) => p.display().to_string(),
        None => ":memory:".to_string(),
    };
    debug!(target = %target, "sqlite pool ready");

    Ok(DatabaseHandle {
        kind,
        target,
        driver: Driver::Sqlite {
            conn: SqlxSqliteConnector::from_sqlx_sqlite_pool(pool),
            path,
        },
    })
}

fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

async fn connect_turso(url: &str, token: &str) -> Result<DatabaseHandle, InfraError> {
    let kind = DatabaseKind::Turso;
    let db = libsql::Builder::new_remote(url.to_string(), token.to_string())
        .build()
        .await
        .map_err(|e| InfraError::connection(kind, e))?;
    let conn = db.connect().map_err(|e| InfraError::connection(kind, e))?;

    Ok(DatabaseHandle {
        kind,
        target: sanitize_db_url(url),
        driver: Driver::Libsql { _db: db, conn },
    })
}

/// Pool size for postgres: two per core, capped.
fn postgres_max_connections() -> u32 {
    let per_cpu = u32::try_from(num_cpus::get().saturating_mul(2)).unwrap_or(u32::MAX);
    per_cpu.clamp(2, POSTGRES_MAX_CONNECTIONS_CAP)
}

async fn connect_postgres(kind: DatabaseKind, url: &str) -> Result<DatabaseHandle, InfraError> {
    let pool = PgPoolOptions::new()
        .max_connections(postgres_max_connections())
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(url)
        .await
        .map_err(|e| InfraError::connection(kind, e))?;

    Ok(DatabaseHandle {
        kind,
        target: sanitize_db_url(url),
        driver: Driver::Postgres {
            conn: SqlxPostgresConnector::from_sqlx_postgres_pool(pool.clone()),
            pool,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_targets() {
        assert_eq!(SqliteTarget::from_url(None), SqliteTarget::Memory);
        assert_eq!(SqliteTarget::from_url(Some(":memory:")), SqliteTarget::Memory);
        assert_eq!(SqliteTarget::from_url(Some("sqlite::memory:")), SqliteTarget::Memory);
        assert_eq!(
            SqliteTarget::from_url(Some("./server/db/local.db")),
            SqliteTarget::File(PathBuf::from("./server/db/local.db"))
        );
        assert_eq!(
            SqliteTarget::from_url(Some("file:local.db")),
            SqliteTarget::File(PathBuf::from("local.db"))
        );
        assert_eq!(
            SqliteTarget::from_url(Some("sqlite://data/app.db?mode=rwc")),
            SqliteTarget::File(PathBuf::from("data/app.db"))
        );
    }

    #[test]
    fn postgres_pool_size_is_bounded() {
        let n = postgres_max_connections();
        assert!((2..=POSTGRES_MAX_CONNECTIONS_CAP).contains(&n));
    }

    #[tokio::test]
    async fn memory_sqlite_keeps_state_across_calls() {
        let handle = connect_sqlite(SqliteTarget::Memory).await.unwrap();
        handle
            .execute("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT); INSERT INTO notes (body) VALUES ('hi');")
            .await
            .unwrap();
        let rows = handle.query("SELECT body FROM notes").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("body"), Some(&Value::from("hi")));
        assert_eq!(handle.target(), ":memory:");
    }
}
