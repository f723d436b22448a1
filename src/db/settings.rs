//! Queries for the persisted settings tables.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::db::pool::DbPool;
use crate::error::SyncError;
use crate::models::RepoKey;

/// A named reviewer team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub name: String,
    pub members: Vec<String>,
}

/// Read a JSON setting by key.
pub async fn get_setting<T: DeserializeOwned>(
    pool: &DbPool,
    key: &str,
) -> Result<Option<T>, SyncError> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;

    match row {
        Some((value,)) => Ok(Some(serde_json::from_str(&value)?)),
        None => Ok(None),
    }
}

/// Write a JSON setting, replacing any previous value.
pub async fn set_setting<T: Serialize>(
    pool: &DbPool,
    key: &str,
    value: &T,
) -> Result<(), SyncError> {
    let json = serde_json::to_string(value)?;
    sqlx::query(
        r#"
        INSERT INTO settings (key, value, updated_at)
        VALUES (?, ?, strftime('%s', 'now'))
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(json)
    .execute(pool)
    .await?;
    Ok(())
}

/// Repositories selected for the activity feed, in insertion order.
pub async fn list_feed_repos(pool: &DbPool) -> Result<Vec<RepoKey>, SyncError> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT owner, repo FROM feed_repos ORDER BY id")
            .fetch_all(pool)
            .await?;
    Ok(rows
        .into_iter()
        .map(|(owner, repo)| RepoKey { owner, repo })
        .collect())
}

/// Add a repository to the feed selection. Adding twice is a no-op.
pub async fn add_feed_repo(pool: &DbPool, repo: &RepoKey) -> Result<(), SyncError> {
    sqlx::query("INSERT OR IGNORE INTO feed_repos (owner, repo) VALUES (?, ?)")
        .bind(&repo.owner)
        .bind(&repo.repo)
        .execute(pool)
        .await?;
    Ok(())
}

/// Remove a repository from the feed selection.
pub async fn remove_feed_repo(pool: &DbPool, repo: &RepoKey) -> Result<(), SyncError> {
    sqlx::query("DELETE FROM feed_repos WHERE owner = ? AND repo = ?")
        .bind(&repo.owner)
        .bind(&repo.repo)
        .execute(pool)
        .await?;
    Ok(())
}

/// All followed user logins, sorted.
pub async fn list_followed_users(pool: &DbPool) -> Result<Vec<String>, SyncError> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT login FROM followed_users ORDER BY login")
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(login,)| login).collect())
}

/// Follow a user. Following twice is a no-op.
pub async fn follow_user(pool: &DbPool, login: &str) -> Result<(), SyncError> {
    sqlx::query("INSERT OR IGNORE INTO followed_users (login) VALUES (?)")
        .bind(login)
        .execute(pool)
        .await?;
    Ok(())
}

/// Unfollow a user.
pub async fn unfollow_user(pool: &DbPool, login: &str) -> Result<(), SyncError> {
    sqlx::query("DELETE FROM followed_users WHERE login = ?")
        .bind(login)
        .execute(pool)
        .await?;
    Ok(())
}

/// All teams with their members, sorted by team name.
pub async fn list_teams(pool: &DbPool) -> Result<Vec<Team>, SyncError> {
    let rows: Vec<(String, Option<String>)> = sqlx::query_as(
        r#"
        SELECT t.name, m.login
        FROM teams t
        LEFT JOIN team_members m ON m.team_id = t.id
        ORDER BY t.name, m.login
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut teams: Vec<Team> = Vec::new();
    for (name, login) in rows {
        match teams.last_mut() {
            Some(team) if team.name == name => {
                if let Some(login) = login {
                    team.members.push(login);
                }
            }
            _ => teams.push(Team {
                name,
                members: login.into_iter().collect(),
            }),
        }
    }
    Ok(teams)
}

/// Create or replace a team and its member list.
pub async fn save_team(pool: &DbPool, team: &Team) -> Result<(), SyncError> {
    let mut tx = pool.begin().await?;

    sqlx::query("INSERT OR IGNORE INTO teams (name) VALUES (?)")
        .bind(&team.name)
        .execute(&mut *tx)
        .await?;
    let (team_id,): (i64,) = sqlx::query_as("SELECT id FROM teams WHERE name = ?")
        .bind(&team.name)
        .fetch_one(&mut *tx)
        .await?;

    sqlx::query("DELETE FROM team_members WHERE team_id = ?")
        .bind(team_id)
        .execute(&mut *tx)
        .await?;
    for login in &team.members {
        sqlx::query("INSERT OR IGNORE INTO team_members (team_id, login) VALUES (?, ?)")
            .bind(team_id)
            .bind(login)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Delete a team and its members.
pub async fn delete_team(pool: &DbPool, name: &str) -> Result<(), SyncError> {
    sqlx::query("DELETE FROM teams WHERE name = ?")
        .bind(name)
        .execute(pool)
        .await?;
    Ok(())
}
