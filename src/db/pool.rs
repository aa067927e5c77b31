// BSD 3-Clause License
// Copyright (c) 2025, OpenDX - TDSlicerHub
//
//! Database Connection Pool

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::config::DatabaseConfig;

pub type DbPool = PgPool;

pub async fn init_pool(cfg: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    info!("Connecting to the session store...");
    let pool = PgPoolOptions::new()
        .max_connections(cfg.max_connections)
        .min_connections(cfg.min_connections)
        .acquire_timeout(Duration::from_secs(cfg.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(cfg.idle_timeout_secs))
        .connect(&cfg.connection_string)
        .await?;

    info!("Session store connection pool established");
    Ok(pool)
}

pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    info!("Running database migrations...");
    let migration_sql = include_str!("../../migrations/001_initial.sql");
    sqlx::raw_sql(migration_sql).execute(pool).await?;
    info!("Database migrations completed successfully");
    Ok(())
}
