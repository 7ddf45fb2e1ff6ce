use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use crate::infra::db::d1::D1Binding;

/// Name of the platform-injected database binding.
pub const D1_BINDING_NAME: &str = "DB";

/// Source of configuration values: the process environment or a platform-provided map.
///
/// Empty values are treated as unset, so `DATABASE_URL=` behaves like no `DATABASE_URL`.
pub trait EnvSource: Send + Sync {
    fn var(&self, key: &str) -> Option<String>;

    /// Non-string objects injected by the host (database bindings).
    fn binding(&self, _name: &str) -> Option<Arc<dyn D1Binding>> {
        None
    }

    /// First non-empty value among `keys`.
    fn first_of(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|k| self.var(k))
    }
}

/// Reads `std::env`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        env::var(key).ok().filter(|v| !v.is_empty())
    }
}

/// Explicit snapshot of variables plus injected bindings.
///
/// This is what a worker entry point builds from the platform's `env` object,
/// and what tests use instead of touching the process environment.
#[derive(Clone, Default)]
pub struct EnvMap {
    vars: HashMap<String, String>,
    bindings: HashMap<String, Arc<dyn D1Binding>>,
}

impl EnvMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn with_binding(mut self, name: impl Into<String>, binding: Arc<dyn D1Binding>) -> Self {
        self.bindings.insert(name.into(), binding);
        self
    }

    /// Snapshot of the current process environment (no bindings).
    pub fn from_process() -> Self {
        Self {
            vars: env::vars().collect(),
            bindings: HashMap::new(),
        }
    }
}

impl<K, V> FromIterator<(K, V)> for EnvMap
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            bindings: HashMap::new(),
        }
    }
}

impl std::fmt::Debug for EnvMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.vars.keys().collect();
        keys.sort();
        let mut bindings: Vec<_> = self.bindings.keys().collect();
        bindings.sort();
        f.debug_struct("EnvMap")
            .field("vars", &keys)
            .field("bindings", &bindings)
            .finish()
    }
}

impl EnvSource for EnvMap {
    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).filter(|v| !v.is_empty()).cloned()
    }

    fn binding(&self, name: &str) -> Option<Arc<dyn D1Binding>> {
        self.bindings.get(name).cloned()
    }
}

impl<T: EnvSource + ?Sized> EnvSource for Arc<T> {
    fn var(&self, key: &str) -> Option<String> {
        (**self).var(key)
    }

    fn binding(&self, name: &str) -> Option<Arc<dyn D1Binding>> {
        (**self).binding(name)
    }
}

/// `ENVIRONMENT=development` turns on development behaviour; anything else is production.
pub fn is_development(env: &dyn EnvSource) -> bool {
    env.var("ENVIRONMENT").as_deref() == Some("development")
}
