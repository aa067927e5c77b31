// BSD 3-Clause License
// Copyright (c) 2025, OpenDX - TDSlicerHub
//
//! CRUD operations for session persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::FromRow;
use tracing::debug;
use uuid::Uuid;

use super::pool::DbPool;

/// Persistent session model: one row per (user, container) pair.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub id: Uuid,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub url_path: String,
    pub service_address: Option<String>,
    pub container_name: String,
    pub restart: bool,
    pub gpu: bool,
    pub info: JsonValue,
}

impl Session {
    /// Whether this session is listed on the landing page.
    pub fn shared(&self) -> bool {
        self.info
            .get("shared")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)
    }

    /// Most recent CPU measurement recorded by the reaper.
    pub fn cpu_pct(&self) -> f64 {
        self.info
            .get("CPU_pct")
            .and_then(JsonValue::as_f64)
            .unwrap_or(0.0)
    }
}

/// Fields supplied at session creation; everything else is defaulted.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: Uuid,
    pub username: String,
    pub url_path: String,
    pub container_name: String,
    pub gpu: bool,
}

pub async fn create(
    ex: impl sqlx::PgExecutor<'_>,
    new: &NewSession,
) -> Result<Session, sqlx::Error> {
    let session = sqlx::query_as::<_, Session>(
        r#"
        INSERT INTO sessions (id, username, url_path, container_name, gpu, info)
        VALUES ($1, $2, $3, $4, $5, '{"shared": false, "CPU_pct": 0.0}'::jsonb)
        RETURNING *
        "#,
    )
    .bind(new.id)
    .bind(&new.username)
    .bind(&new.url_path)
    .bind(&new.container_name)
    .bind(new.gpu)
    .fetch_one(ex)
    .await?;

    debug!("Created session {} for user {}", new.id, new.username);
    Ok(session)
}

/// Whether an error is the unique-username constraint firing, i.e. a
/// concurrent login already created this user's session.
pub fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|d| d.is_unique_violation())
        .unwrap_or(false)
}

pub async fn get_by_id(pool: &DbPool, id: Uuid) -> Result<Option<Session>, sqlx::Error> {
    sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn get_by_user(pool: &DbPool, username: &str) -> Result<Option<Session>, sqlx::Error> {
    sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE username = $1")
        .bind(username)
        .fetch_optional(pool)
        .await
}

pub async fn list_all(pool: &DbPool) -> Result<Vec<Session>, sqlx::Error> {
    sqlx::query_as::<_, Session>("SELECT * FROM sessions ORDER BY created_at")
        .fetch_all(pool)
        .await
}

pub async fn count(pool: &DbPool) -> Result<i64, sqlx::Error> {
    let n: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sessions")
        .fetch_one(pool)
        .await?;
    Ok(n.0)
}

pub async fn set_service_address(
    ex: impl sqlx::PgExecutor<'_>,
    id: Uuid,
    address: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE sessions SET service_address = $1 WHERE id = $2")
        .bind(address)
        .bind(id)
        .execute(ex)
        .await?;

    debug!("Set service address {} for session {}", address, id);
    Ok(())
}

pub async fn set_shared(pool: &DbPool, id: Uuid, shared: bool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE sessions SET info = jsonb_set(info, '{shared}', to_jsonb($1::boolean)) WHERE id = $2",
    )
    .bind(shared)
    .bind(id)
    .execute(pool)
    .await?;

    debug!("Session {} shared = {}", id, shared);
    Ok(())
}

pub async fn set_restart(pool: &DbPool, id: Uuid, restart: bool) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE sessions SET restart = $1 WHERE id = $2")
        .bind(restart)
        .bind(id)
        .execute(pool)
        .await?;

    debug!("Session {} restart = {}", id, restart);
    Ok(())
}

/// Record a CPU sample and, when the container counted as active, refresh the
/// activity timestamp in the same statement.
pub async fn record_activity(
    pool: &DbPool,
    id: Uuid,
    cpu_pct: f64,
    active: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE sessions
        SET info = jsonb_set(info, '{CPU_pct}', to_jsonb($1::float8)),
            last_activity = CASE WHEN $2 THEN NOW() ELSE last_activity END
        WHERE id = $3
        "#,
    )
    .bind(cpu_pct)
    .bind(active)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn touch(pool: &DbPool, id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE sessions SET last_activity = NOW() WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete(pool: &DbPool, id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM sessions WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    debug!("Deleted session {}", id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(info: JsonValue) -> Session {
        Session {
            id: Uuid::new_v4(),
            username: "free_user".to_string(),
            created_at: Utc::now(),
            last_activity: Utc::now(),
            url_path: "/abc/".to_string(),
            service_address: None,
            container_name: "tds-free_user".to_string(),
            restart: false,
            gpu: false,
            info,
        }
    }

    #[test]
    fn test_shared_defaults_false() {
        let s = sample(serde_json::json!({}));
        assert!(!s.shared());
    }

    #[test]
    fn test_info_accessors() {
        let s = sample(serde_json::json!({"shared": true, "CPU_pct": 42.5}));
        assert!(s.shared());
        assert!((s.cpu_pct() - 42.5).abs() < f64::EPSILON);
    }
}
