//! Driver-independent SQL migration engine.
//! Used by the per-driver strategies in edge-infra and by the migration CLI.

mod error;
mod files;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;

pub use error::MigrationError;
pub use files::{content_hash, discover, MigrationFile, STATEMENT_BREAKPOINT};

pub const DEFAULT_MIGRATIONS_TABLE: &str = "migrations";
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// What to migrate and where to record it. Consumed once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationJob {
    pub migrations_folder: PathBuf,
    pub migrations_table: String,
    pub lock_timeout: Duration,
}

impl MigrationJob {
    pub fn new(migrations_folder: impl Into<PathBuf>) -> Self {
        Self {
            migrations_folder: migrations_folder.into(),
            migrations_table: DEFAULT_MIGRATIONS_TABLE.to_string(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.migrations_table = table.into();
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// The table name is interpolated into SQL, so only plain identifiers pass.
    pub fn validate(&self) -> Result<(), MigrationError> {
        if is_identifier(&self.migrations_table) {
            Ok(())
        } else {
            Err(MigrationError::InvalidTable {
                table: self.migrations_table.clone(),
            })
        }
    }

    pub fn files(&self) -> Result<Vec<MigrationFile>, MigrationError> {
        discover(&self.migrations_folder)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A row of the tracking table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub name: String,
    pub hash: String,
}

/// Per-driver storage of migration state.
///
/// `apply` must run the file's statements and insert its tracking row in one
/// transaction (or the driver's equivalent atomic batch).
#[async_trait]
pub trait MigrationExecutor: Send + Sync {
    /// Strategy name, for logs.
    fn strategy(&self) -> &'static str;

    async fn ensure_table(&self, table: &str) -> Result<(), MigrationError>;

    /// Whether the tracking table exists. Status uses this instead of creating it.
    async fn has_table(&self, table: &str) -> Result<bool, MigrationError>;

    async fn applied(&self, table: &str) -> Result<Vec<AppliedMigration>, MigrationError>;

    async fn apply(&self, table: &str, file: &MigrationFile) -> Result<(), MigrationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationCommand {
    Up,
    Status,
    Rollback,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub applied_now: Vec<String>,
    pub already_applied: Vec<String>,
    pub pending: Vec<String>,
}

impl MigrationReport {
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Run `command` against `executor` for the files in `job`.
pub async fn migrate(
    executor: &dyn MigrationExecutor,
    job: &MigrationJob,
    command: MigrationCommand,
) -> Result<MigrationReport, MigrationError> {
    if matches!(command, MigrationCommand::Rollback) {
        tracing::warn!("rollback requested; not supported");
        return Err(MigrationError::RollbackUnsupported);
    }

    job.validate()?;
    let files = job.files()?;
    let table = job.migrations_table.as_str();

    tracing::info!(
        "migrate=start cmd={:?} strategy={} folder={} table={} defined={}",
        command,
        executor.strategy(),
        job.migrations_folder.display(),
        table,
        files.len()
    );

    // Status never writes: a missing tracking table means nothing is applied.
    let recorded = if matches!(command, MigrationCommand::Status) {
        if executor.has_table(table).await? {
            executor.applied(table).await?
        } else {
            Vec::new()
        }
    } else {
        executor.ensure_table(table).await?;
        executor.applied(table).await?
    };
    let applied: HashMap<String, String> =
        recorded.into_iter().map(|m| (m.name, m.hash)).collect();

    let mut report = MigrationReport::default();
    let mut pending = Vec::new();
    for file in &files {
        match applied.get(&file.name) {
            Some(hash) => {
                if *hash != file.hash {
                    tracing::warn!(
                        file = %file.name,
                        recorded_hash = %hash,
                        current_hash = %file.hash,
                        "applied migration changed on disk; not re-applying"
                    );
                }
                report.already_applied.push(file.name.clone());
            }
            None => pending.push(file),
        }
    }

    if matches!(command, MigrationCommand::Status) {
        report.pending = pending.iter().map(|f| f.name.clone()).collect();
        tracing::info!(
            "migrate=status applied={} pending={}",
            report.already_applied.len(),
            report.pending.len()
        );
        return Ok(report);
    }

    for file in pending {
        let start = Instant::now();
        if let Err(e) = executor.apply(table, file).await {
            let message = match e {
                MigrationError::Store { message } => message,
                other => other.to_string(),
            };
            tracing::error!(file = %file.name, error = %message, "migration failed");
            return Err(MigrationError::Failed {
                file: file.name.clone(),
                message,
            });
        }
        tracing::info!(
            file = %file.name,
            elapsed_ms = start.elapsed().as_millis(),
            "migration applied"
        );
        report.applied_now.push(file.name.clone());
    }

    tracing::info!(
        "migrate=done applied_now={} already_applied={}",
        report.applied_now.len(),
        report.already_applied.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_rules() {
        assert!(is_identifier("migrations"));
        assert!(is_identifier("_drizzle_migrations2"));
        assert!(!is_identifier("2migrations"));
        assert!(!is_identifier("mig-rations"));
        assert!(!is_identifier("x; DROP TABLE y"));
        assert!(!is_identifier(""));
    }

    #[test]
    fn job_defaults() {
        let job = MigrationJob::new("./migrations");
        assert_eq!(job.migrations_table, "migrations");
        assert_eq!(job.lock_timeout, DEFAULT_LOCK_TIMEOUT);
        assert!(job.validate().is_ok());
        assert!(matches!(
            job.with_table("bad name").validate(),
            Err(MigrationError::InvalidTable { .. })
        ));
    }
}
