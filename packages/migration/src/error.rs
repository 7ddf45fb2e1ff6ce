use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("invalid migrations table name '{table}': expected [A-Za-z_][A-Za-z0-9_]*")]
    InvalidTable { table: String },

    #[error("failed to read migrations from {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("migration file name is not valid UTF-8: {}", path.display())]
    InvalidFileName { path: PathBuf },

    /// A single migration file failed; every file before it stays applied.
    #[error("migration {file} failed: {message}")]
    Failed { file: String, message: String },

    #[error("migration store error: {message}")]
    Store { message: String },

    #[error("migration lock acquisition timed out after {waited_ms}ms")]
    LockTimeout { waited_ms: u128 },

    #[error("rollback is not supported: revert the schema change and regenerate the migration")]
    RollbackUnsupported,
}

impl MigrationError {
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Name of the migration file that failed, when the error is file-specific.
    pub fn failed_file(&self) -> Option<&str> {
        match self {
            Self::Failed { file, .. } => Some(file),
            _ => None,
        }
    }
}
