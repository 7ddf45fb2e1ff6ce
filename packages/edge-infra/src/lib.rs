//! Runtime and database adapter resolution for edge-deployable services.
//!
//! [`runtime`] decides which host the process runs in and exposes its
//! capabilities (env access, background work). [`config::db`] turns env vars
//! into a [`DatabaseConfig`], and [`build_handle`] connects it. Migrations for
//! every supported database go through [`run_migrations`].

pub mod config;
pub mod error;
pub mod infra;
pub mod runtime;

pub use config::db::{parse_config, validate, DatabaseConfig, DatabaseKind, Dialect};
pub use config::env::{EnvMap, EnvSource, ProcessEnv};
pub use error::InfraError;
pub use infra::db::{
    build_handle, build_handle_until_cancelled, migration_status, run_command, run_migrations,
    D1Binding, DatabaseHandle,
};
pub use runtime::{capabilities_for, detect, detect_current, RuntimeCapabilities, RuntimeKind};

pub use migration::{MigrationCommand, MigrationError, MigrationJob, MigrationReport};
