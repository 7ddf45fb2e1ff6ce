//! Shape of the platform-injected D1 database binding.
//!
//! The worker entry point wraps the host's binding object in a type implementing
//! [`D1Binding`] and passes it in through [`EnvMap::with_binding`](crate::config::env::EnvMap::with_binding).
//! Nothing in this crate constructs a real binding.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub type D1Row = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub struct D1Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl D1Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct D1Error {
    pub message: String,
}

impl D1Error {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait D1Binding: Send + Sync {
    /// Run a raw multi-statement script; returns the number of statements executed.
    async fn exec(&self, sql: &str) -> Result<u64, D1Error>;

    async fn query(&self, statement: D1Statement) -> Result<Vec<D1Row>, D1Error>;

    /// Run statements as one implicit transaction: all commit or none do.
    async fn batch(&self, statements: Vec<D1Statement>) -> Result<(), D1Error>;
}
