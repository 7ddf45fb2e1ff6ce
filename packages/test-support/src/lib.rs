//! Shared helpers for the workspace's tests.
//!
//! - [`logging::init`] installs one tracing subscriber for the whole test binary.
//! - [`unique_str`] produces collision-free names for temp tables and files.

pub mod logging;

use ulid::Ulid;

/// Generate a unique string with the given prefix
///
/// # Examples
/// ```
/// use test_support::unique_str;
///
/// let id1 = unique_str("migrations");
/// let id2 = unique_str("migrations");
/// assert_ne!(id1, id2);
/// assert!(id1.starts_with("migrations_"));
/// ```
pub fn unique_str(prefix: &str) -> String {
    // Underscore separator keeps the result a valid SQL identifier.
    format!("{}_{}", prefix, Ulid::new().to_string().to_lowercase())
}
