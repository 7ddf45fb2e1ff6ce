use std::fs;
use std::path::Path;

use xxhash_rust::xxh3::xxh3_64;

use crate::error::MigrationError;

/// Marker drizzle-kit writes between statements of one migration file.
pub const STATEMENT_BREAKPOINT: &str = "--> statement-breakpoint";

/// One `.sql` file from the migrations folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    pub name: String,
    pub sql: String,
    pub hash: String,
}

impl MigrationFile {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        let sql = sql.into();
        let hash = content_hash(&sql);
        Self {
            name: name.into(),
            sql,
            hash,
        }
    }

    /// Statements to execute, in file order.
    ///
    /// Files without breakpoint markers come back as a single script, so
    /// drivers that accept multi-statement scripts run them unchanged.
    pub fn statements(&self) -> Vec<&str> {
        self.sql
            .split(STATEMENT_BREAKPOINT)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.statements().is_empty()
    }
}

pub fn content_hash(sql: &str) -> String {
    format!("{:016x}", xxh3_64(sql.as_bytes()))
}

/// Load every `.sql` file (any case) in `folder`, sorted by file name (ascending, bytewise).
pub fn discover(folder: &Path) -> Result<Vec<MigrationFile>, MigrationError> {
    let io_err = |source| MigrationError::Io {
        path: folder.to_path_buf(),
        source,
    };

    let mut files = Vec::new();
    for entry in fs::read_dir(folder).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let path = entry.path();
        let is_sql = path
            .extension()
            .is_some_and(|ext| ext.to_string_lossy().eq_ignore_ascii_case("sql"));
        if !path.is_file() || !is_sql {
            continue;
        }
        // Names are recorded in the tracking table, so they must be UTF-8.
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| MigrationError::InvalidFileName { path: path.clone() })?;
        let sql = fs::read_to_string(&path).map_err(|source| MigrationError::Io {
            path: path.clone(),
            source,
        })?;
        files.push(MigrationFile::new(name, sql));
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statements_split_on_breakpoints() {
        let file = MigrationFile::new(
            "0000_init.sql",
            "CREATE TABLE a (id INTEGER);\n--> statement-breakpoint\nCREATE TABLE b (id INTEGER);\n",
        );
        assert_eq!(
            file.statements(),
            vec!["CREATE TABLE a (id INTEGER);", "CREATE TABLE b (id INTEGER);"]
        );
    }

    #[test]
    fn file_without_breakpoints_is_one_script() {
        let file = MigrationFile::new("001.sql", "CREATE TABLE a (id INTEGER);\nCREATE TABLE b (id INTEGER);");
        assert_eq!(file.statements().len(), 1);
    }

    #[test]
    fn whitespace_only_file_is_empty() {
        assert!(MigrationFile::new("002.sql", "  \n--> statement-breakpoint\n").is_empty());
    }

    #[test]
    fn hash_tracks_content() {
        let a = MigrationFile::new("x.sql", "SELECT 1;");
        let b = MigrationFile::new("y.sql", "SELECT 1;");
        let c = MigrationFile::new("x.sql", "SELECT 2;");
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.hash, c.hash);
        assert_eq!(a.hash.len(), 16);
    }

    #[test]
    fn discover_sorts_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("002_add_users.sql"), "SELECT 2;").unwrap();
        std::fs::write(dir.path().join("001_init.sql"), "SELECT 1;").unwrap();
        std::fs::write(dir.path().join("README.md"), "notes").unwrap();
        std::fs::create_dir(dir.path().join("meta")).unwrap();

        let files = discover(dir.path()).unwrap();
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["001_init.sql", "002_add_users.sql"]);
    }

    #[test]
    fn discover_accepts_uppercase_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("001_init.sql"), "SELECT 1;").unwrap();
        std::fs::write(dir.path().join("002_users.SQL"), "SELECT 2;").unwrap();

        let names: Vec<_> = discover(dir.path())
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["001_init.sql", "002_users.SQL"]);
    }

    #[cfg(unix)]
    #[test]
    fn discover_rejects_non_utf8_names() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("001_init.sql"), "SELECT 1;").unwrap();
        std::fs::write(dir.path().join(OsStr::from_bytes(b"002_\xff.sql")), "SELECT 2;").unwrap();

        let err = discover(dir.path()).unwrap_err();
        assert!(matches!(err, MigrationError::InvalidFileName { .. }), "got {err:?}");
    }

    #[test]
    fn discover_missing_folder_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = discover(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, MigrationError::Io { .. }));
    }
}
