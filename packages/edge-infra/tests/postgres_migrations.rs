//! postgres and neon migrations against a live server.
//!
//! Runs only when `EDGE_TEST_POSTGRES_URL` points at a scratch database;
//! otherwise every test prints a skip line and returns. Table names are
//! unique per test so runs can share one database.
//!
//! Tests prove:
//! - A failing file rolls back its own statements and stays pending
//! - A rerun resumes at the failed file
//! - Status before the first run does not create the tracking table
//! - The neon strategy runs on the same pool as postgres
//! - A held advisory lock makes a second runner time out

use std::fs;
use std::path::Path;
use std::time::Duration;

use edge_infra::infra::db::locking::{acquire, lock_for};
use edge_infra::{
    build_handle, migration_status, run_migrations, DatabaseConfig, DatabaseHandle, DatabaseKind,
    InfraError, MigrationError, MigrationJob, RuntimeKind,
};
use tempfile::TempDir;

const URL_VAR: &str = "EDGE_TEST_POSTGRES_URL";

fn postgres_url(test_name: &str) -> Option<String> {
    match std::env::var(URL_VAR) {
        Ok(url) if !url.trim().is_empty() => Some(url),
        _ => {
            println!("Skipping {test_name}: {URL_VAR} is not set");
            None
        }
    }
}

async fn connect(url: &str, kind: DatabaseKind) -> DatabaseHandle {
    let config = DatabaseConfig::new(kind).with_url(url);
    build_handle(&config, RuntimeKind::Node)
        .await
        .expect("Should connect to postgres")
}

fn write(dir: &Path, name: &str, sql: &str) {
    fs::write(dir.join(name), sql).expect("Should write migration file");
}

async fn table_exists(handle: &DatabaseHandle, name: &str) -> bool {
    !handle
        .query(&format!(
            "SELECT table_name::text AS name FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name = '{name}'"
        ))
        .await
        .expect("Should query information_schema")
        .is_empty()
}

async fn recorded(handle: &DatabaseHandle, table: &str) -> Vec<String> {
    handle
        .query(&format!("SELECT name FROM {table} ORDER BY name"))
        .await
        .expect("Should read tracking table")
        .into_iter()
        .filter_map(|row| row.get("name").and_then(|v| v.as_str()).map(str::to_owned))
        .collect()
}

async fn drop_tables(handle: &DatabaseHandle, tables: &[&str]) {
    for table in tables {
        handle
            .execute(&format!("DROP TABLE IF EXISTS {table}"))
            .await
            .expect("Should drop test table");
    }
}

#[tokio::test]
async fn failed_file_rolls_back_and_rerun_resumes() {
    let Some(url) = postgres_url("failed_file_rolls_back_and_rerun_resumes") else {
        return;
    };
    test_support::logging::init();

    let handle = connect(&url, DatabaseKind::Postgres).await;
    let tracking = test_support::unique_str("migrations");
    let users = test_support::unique_str("users");
    let tags = test_support::unique_str("tags");
    let posts = test_support::unique_str("posts");

    let dir = TempDir::new().expect("Should create temp dir");
    write(
        dir.path(),
        "0001_users.sql",
        &format!("CREATE TABLE {users} (id SERIAL PRIMARY KEY, email TEXT NOT NULL);"),
    );
    write(
        dir.path(),
        "0002_posts.sql",
        &format!(
            "CREATE TABLE {tags} (id SERIAL PRIMARY KEY);\n--> statement-breakpoint\nCREATE TABLE {posts} (id SERIAL PRIMARY KEY,, title TEXT);"
        ),
    );

    let job = MigrationJob::new(dir.path()).with_table(&tracking);

    let status = migration_status(&handle, &job, DatabaseKind::Postgres)
        .await
        .expect("Status should succeed before any run");
    assert_eq!(status.pending, vec!["0001_users.sql", "0002_posts.sql"]);
    assert!(
        !table_exists(&handle, &tracking).await,
        "status must not create the tracking table"
    );

    let err = run_migrations(&handle, &job, DatabaseKind::Postgres)
        .await
        .expect_err("0002 is malformed");
    match &err {
        InfraError::Migration(inner) => assert_eq!(inner.failed_file(), Some("0002_posts.sql")),
        other => panic!("expected a migration error, got {other:?}"),
    }
    assert_eq!(recorded(&handle, &tracking).await, vec!["0001_users.sql"]);
    assert!(table_exists(&handle, &users).await);
    assert!(
        !table_exists(&handle, &tags).await,
        "statements before the failure in 0002 must roll back"
    );

    write(
        dir.path(),
        "0002_posts.sql",
        &format!(
            "CREATE TABLE {tags} (id SERIAL PRIMARY KEY);\n--> statement-breakpoint\nCREATE TABLE {posts} (id SERIAL PRIMARY KEY, title TEXT);"
        ),
    );
    let report = run_migrations(&handle, &job, DatabaseKind::Postgres)
        .await
        .expect("Should apply the fixed file");
    assert_eq!(report.already_applied, vec!["0001_users.sql"]);
    assert_eq!(report.applied_now, vec!["0002_posts.sql"]);
    assert!(table_exists(&handle, &posts).await);

    drop_tables(&handle, &[&posts, &tags, &users, &tracking]).await;
}

#[tokio::test]
async fn neon_strategy_shares_the_postgres_driver() {
    let Some(url) = postgres_url("neon_strategy_shares_the_postgres_driver") else {
        return;
    };
    test_support::logging::init();

    let handle = connect(&url, DatabaseKind::Neon).await;
    let tracking = test_support::unique_str("migrations");
    let items = test_support::unique_str("items");

    let dir = TempDir::new().expect("Should create temp dir");
    write(
        dir.path(),
        "0001_items.sql",
        &format!("CREATE TABLE {items} (id SERIAL PRIMARY KEY);"),
    );
    let job = MigrationJob::new(dir.path()).with_table(&tracking);

    let report = run_migrations(&handle, &job, DatabaseKind::Neon)
        .await
        .expect("Should migrate through the neon strategy");
    assert_eq!(report.applied_now, vec!["0001_items.sql"]);

    let status = migration_status(&handle, &job, DatabaseKind::Postgres)
        .await
        .expect("postgres strategy reads the same tracking table");
    assert!(status.pending.is_empty());
    assert_eq!(status.already_applied, vec!["0001_items.sql"]);

    drop_tables(&handle, &[&items, &tracking]).await;
}

#[tokio::test]
async fn held_advisory_lock_times_out_second_runner() {
    let Some(url) = postgres_url("held_advisory_lock_times_out_second_runner") else {
        return;
    };
    test_support::logging::init();

    let handle = connect(&url, DatabaseKind::Postgres).await;
    let tracking = test_support::unique_str("migrations");
    let things = test_support::unique_str("things");

    let dir = TempDir::new().expect("Should create temp dir");
    write(
        dir.path(),
        "0001_things.sql",
        &format!("CREATE TABLE {things} (id SERIAL PRIMARY KEY);"),
    );
    let job = MigrationJob::new(dir.path())
        .with_table(&tracking)
        .with_lock_timeout(Duration::from_millis(100));

    let mut holder = lock_for(&handle, &job);
    let guard = acquire(holder.as_mut(), Duration::from_secs(5))
        .await
        .expect("Should take the advisory lock");

    let err = run_migrations(&handle, &job, DatabaseKind::Postgres)
        .await
        .expect_err("lock is held by another session");
    assert!(matches!(
        err,
        InfraError::Migration(MigrationError::LockTimeout { .. })
    ));
    assert!(!table_exists(&handle, &things).await);

    guard.release().await.expect("Should release advisory lock");
    let report = run_migrations(&handle, &job, DatabaseKind::Postgres)
        .await
        .expect("Should migrate once the lock is free");
    assert_eq!(report.applied_now, vec!["0001_things.sql"]);

    drop_tables(&handle, &[&things, &tracking]).await;
}
