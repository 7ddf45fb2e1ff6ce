use migration::MigrationError;
use thiserror::Error;

use crate::config::db::DatabaseKind;
use crate::runtime::RuntimeKind;

/// Failures of the runtime and database resolvers.
///
/// Configuration and runtime-mismatch errors are raised before any I/O;
/// `Connection` only ever wraps a driver failure, so callers can tell
/// "configured wrong" apart from "database unreachable".
#[derive(Debug, Error)]
pub enum InfraError {
    #[error("{}", configuration_message(.kind, .field, .message))]
    Configuration {
        kind: Option<DatabaseKind>,
        field: Option<&'static str>,
        message: String,
    },

    #[error("{kind} database cannot run in the {runtime} runtime (requires {required})")]
    RuntimeMismatch {
        kind: DatabaseKind,
        runtime: RuntimeKind,
        required: RuntimeKind,
    },

    #[error("{kind} connection error: {message}")]
    Connection { kind: DatabaseKind, message: String },

    #[error(transparent)]
    Migration(#[from] MigrationError),
}

fn configuration_message(
    kind: &Option<DatabaseKind>,
    field: &Option<&'static str>,
    message: &str,
) -> String {
    match (kind, field) {
        (Some(kind), Some(field)) => {
            format!("configuration error ({kind}): missing {field}: {message}")
        }
        (Some(kind), None) => format!("configuration error ({kind}): {message}"),
        (None, Some(field)) => format!("configuration error: {field}: {message}"),
        (None, None) => format!("configuration error: {message}"),
    }
}

impl InfraError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            kind: None,
            field: None,
            message: message.into(),
        }
    }

    pub fn missing_field(kind: DatabaseKind, field: &'static str, message: impl Into<String>) -> Self {
        Self::Configuration {
            kind: Some(kind),
            field: Some(field),
            message: message.into(),
        }
    }

    pub fn connection(kind: DatabaseKind, err: impl std::fmt::Display) -> Self {
        Self::Connection {
            kind,
            message: err.to_string(),
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    pub fn is_runtime_mismatch(&self) -> bool {
        matches!(self, Self::RuntimeMismatch { .. })
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// Field named by a configuration error, if any.
    pub fn missing(&self) -> Option<&'static str> {
        match self {
            Self::Configuration { field, .. } => *field,
            _ => None,
        }
    }
}
