//! Database layer for local SQLite storage.
//!
//! Holds only the settings that must survive a restart: feed repo selection,
//! followed users, team definitions, and a generic JSON key-value table.
//! Cached forge data is deliberately not persisted.

pub mod pool;
pub mod settings;

use std::path::{Path, PathBuf};

use crate::error::SyncError;

/// Get the path to the SQLite database file inside the app data directory.
pub fn get_db_path(app_data_dir: &Path) -> PathBuf {
    app_data_dir.join("forge-sync.db")
}

/// Initialize the database: create the file if needed and run migrations.
pub async fn initialize(db_path: &Path) -> Result<pool::DbPool, SyncError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            SyncError::database_with_op(
                format!("Failed to create database directory: {}", e),
                "initialize",
            )
        })?;
    }

    let pool = pool::create_pool(db_path).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Run all pending migrations, tracked in a `_migrations` table.
async fn run_migrations(pool: &pool::DbPool) -> Result<(), SyncError> {
    let mut conn = pool.acquire().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            applied_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    let migrations = [(
        "0001_initial_schema",
        include_str!("migrations/0001_initial_schema.sql"),
    )];

    for (name, sql) in migrations {
        let applied: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM _migrations WHERE name = ?")
                .bind(name)
                .fetch_optional(&mut *conn)
                .await?;
        if applied.is_some() {
            continue;
        }

        for statement in split_statements(sql) {
            sqlx::query(&statement).execute(&mut *conn).await?;
        }
        sqlx::query("INSERT INTO _migrations (name) VALUES (?)")
            .bind(name)
            .execute(&mut *conn)
            .await?;
    }

    Ok(())
}

/// Split a migration file into statements, dropping comment lines.
fn split_statements(sql: &str) -> Vec<String> {
    sql.lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n")
        .split(';')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
