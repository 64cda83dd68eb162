//! Integration tests for the shared connection cache
//!
//! Concurrent callers share one pool. Failures are memoized until close but
//! never count as connected, and close forgets the pool so the next caller
//! reconnects.

use assert_matches::assert_matches;
use futures::future::join_all;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use joinery::config::DatabaseConfig;
use joinery::{ConnectionCache, Database, OrmError};

async fn has_table(db: &Database, name: &str) -> bool {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' AND name = ?")
            .bind(name)
            .fetch_optional(db.pool())
            .await
            .unwrap();
    row.is_some()
}

fn file_config(dir: &TempDir, file: &str) -> DatabaseConfig {
    DatabaseConfig {
        url: format!("sqlite://{}", dir.path().join(file).display()),
        ..DatabaseConfig::default()
    }
}

#[tokio::test]
async fn test_concurrent_callers_share_one_pool() {
    let cache = ConnectionCache::new(DatabaseConfig::default());
    assert!(!cache.is_connected());

    let databases: Vec<Database> = join_all((0..8).map(|_| cache.get()))
        .await
        .into_iter()
        .collect::<joinery::Result<_>>()
        .unwrap();
    assert!(cache.is_connected());

    databases[0]
        .execute("CREATE TABLE shared (id INTEGER PRIMARY KEY)", &[])
        .await
        .unwrap();
    for db in &databases {
        assert!(has_table(db, "shared").await);
    }
}

#[tokio::test]
async fn test_close_forgets_the_pool() {
    let cache = ConnectionCache::new(DatabaseConfig::default());
    let first = cache.get().await.unwrap();
    first
        .execute("CREATE TABLE scratch (id INTEGER PRIMARY KEY)", &[])
        .await
        .unwrap();

    cache.close().await;
    assert!(!cache.is_connected());
    assert!(first.pool().is_closed());

    // A fresh in-memory database
    let second = cache.get().await.unwrap();
    assert!(!has_table(&second, "scratch").await);
    cache.close().await;
}

#[tokio::test]
async fn test_failed_connection_is_shared_until_close() {
    let dir = TempDir::new().unwrap();
    let cache = ConnectionCache::new(file_config(&dir, "missing/child.db"));

    let results = join_all((0..4).map(|_| cache.get())).await;
    for result in results {
        assert_matches!(result, Err(OrmError::Driver(_)));
    }
    assert!(!cache.is_connected());

    // Still failing after the directory appears: the error is memoized
    std::fs::create_dir(dir.path().join("missing")).unwrap();
    assert_matches!(cache.get().await, Err(OrmError::Driver(_)));

    cache.close().await;
    let db = cache.get().await.unwrap();
    assert!(cache.is_connected());
    db.execute("SELECT 1", &[]).await.unwrap();
    cache.close().await;
}

#[tokio::test]
async fn test_file_database_outlives_the_cache() {
    let dir = TempDir::new().unwrap();
    let config = file_config(&dir, "joinery.db");

    let cache = ConnectionCache::new(config.clone());
    let db = cache.get().await.unwrap();
    let result = db
        .execute("CREATE TABLE kept (id INTEGER PRIMARY KEY)", &[])
        .await
        .unwrap();
    assert_eq!(result.rows_affected(), 0);
    cache.close().await;

    let reopened = Database::connect(&config).await.unwrap();
    assert!(has_table(&reopened, "kept").await);
    reopened.close().await;
}
