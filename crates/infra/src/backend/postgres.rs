//! Postgres-backed token store.
//!
//! Tables (created on connect if missing):
//!
//! | table | key | columns |
//! |-------|-----|---------|
//! | `stepwise_jobs` | `id` | `token JSONB`, `updated_at TIMESTAMPTZ` |
//! | `stepwise_blobs` | `(job_id, key)` | `bytes BYTEA`, `updated_at TIMESTAMPTZ` |
//!
//! Blobs carry no foreign key to `stepwise_jobs` because a fresh job may
//! write blobs before its first `save`. `delete` removes both in one
//! transaction.
//!
//! The [`Backend`] contract is synchronous, so the store owns a
//! current-thread Tokio runtime and blocks on it. Do not call it from inside
//! an async task.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use tokio::runtime::Runtime;
use tracing::instrument;

use stepwise_core::{JobId, Token};

use super::{Backend, BackendError, CleanupFailure, JobEntry};
use crate::config::BackendConfig;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS stepwise_jobs (
        id         TEXT PRIMARY KEY,
        token      JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stepwise_blobs (
        job_id     TEXT NOT NULL,
        key        TEXT NOT NULL,
        bytes      BYTEA NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (job_id, key)
    )
    "#,
];

#[derive(Debug)]
pub struct PostgresBackend {
    pool: PgPool,
    runtime: Runtime,
    auto_blob_threshold: usize,
    cleanup_age: Duration,
}

impl PostgresBackend {
    /// Connect to `config.database_url` and make sure the schema exists.
    pub fn connect(config: &BackendConfig) -> Result<Self, BackendError> {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| BackendError::Storage("database_url is not configured".to_string()))?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| BackendError::storage("start runtime", e))?;

        let pool = runtime
            .block_on(PgPoolOptions::new().max_connections(4).connect(url))
            .map_err(|e| BackendError::storage("connect", e))?;

        let backend = Self {
            pool,
            runtime,
            auto_blob_threshold: config.auto_blob_threshold,
            cleanup_age: config.cleanup_age,
        };
        backend.migrate()?;
        Ok(backend)
    }

    fn migrate(&self) -> Result<(), BackendError> {
        self.runtime.block_on(async {
            for statement in SCHEMA {
                sqlx::query(statement)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| BackendError::storage("migrate", e))?;
            }
            Ok(())
        })
    }
}

impl Backend for PostgresBackend {
    #[instrument(skip(self), fields(job_id = %id), err)]
    fn load(&self, id: &JobId) -> Result<Token, BackendError> {
        let row: Option<(Json<Token>,)> = self
            .runtime
            .block_on(
                sqlx::query_as("SELECT token FROM stepwise_jobs WHERE id = $1")
                    .bind(id.as_str())
                    .fetch_optional(&self.pool),
            )
            .map_err(|e| BackendError::storage("load", e))?;

        row.map(|(Json(token),)| token)
            .ok_or_else(|| BackendError::NotFound(id.clone()))
    }

    #[instrument(skip(self, token), fields(job_id = %id), err)]
    fn save(&self, id: &JobId, token: &Token) -> Result<(), BackendError> {
        self.runtime
            .block_on(
                sqlx::query(
                    r#"
                    INSERT INTO stepwise_jobs (id, token, updated_at)
                    VALUES ($1, $2, NOW())
                    ON CONFLICT (id)
                    DO UPDATE SET token = EXCLUDED.token, updated_at = NOW()
                    "#,
                )
                .bind(id.as_str())
                .bind(Json(token))
                .execute(&self.pool),
            )
            .map_err(|e| BackendError::storage("save", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    fn delete(&self, id: &JobId) -> Result<(), BackendError> {
        self.runtime.block_on(async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| BackendError::storage("delete", e))?;

            sqlx::query("DELETE FROM stepwise_blobs WHERE job_id = $1")
                .bind(id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| BackendError::storage("delete blobs", e))?;
            sqlx::query("DELETE FROM stepwise_jobs WHERE id = $1")
                .bind(id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| BackendError::storage("delete job", e))?;

            tx.commit()
                .await
                .map_err(|e| BackendError::storage("delete commit", e))
        })
    }

    fn store_blob(&self, id: &JobId, key: &str, bytes: &[u8]) -> Result<(), BackendError> {
        self.runtime
            .block_on(
                sqlx::query(
                    r#"
                    INSERT INTO stepwise_blobs (job_id, key, bytes, updated_at)
                    VALUES ($1, $2, $3, NOW())
                    ON CONFLICT (job_id, key)
                    DO UPDATE SET bytes = EXCLUDED.bytes, updated_at = NOW()
                    "#,
                )
                .bind(id.as_str())
                .bind(key)
                .bind(bytes)
                .execute(&self.pool),
            )
            .map_err(|e| BackendError::storage("store_blob", e))?;
        Ok(())
    }

    fn fetch_blob(&self, id: &JobId, key: &str) -> Result<Vec<u8>, BackendError> {
        let row: Option<(Vec<u8>,)> = self
            .runtime
            .block_on(
                sqlx::query_as("SELECT bytes FROM stepwise_blobs WHERE job_id = $1 AND key = $2")
                    .bind(id.as_str())
                    .bind(key)
                    .fetch_optional(&self.pool),
            )
            .map_err(|e| BackendError::storage("fetch_blob", e))?;

        row.map(|(bytes,)| bytes)
            .ok_or_else(|| BackendError::BlobNotFound {
                id: id.clone(),
                key: key.to_string(),
            })
    }

    fn list(&self) -> Result<Vec<Result<JobEntry, CleanupFailure>>, BackendError> {
        let rows: Vec<(String, DateTime<Utc>)> = self
            .runtime
            .block_on(
                sqlx::query_as(
                    r#"
                    SELECT id, MAX(updated_at) AS updated_at
                    FROM (
                        SELECT id, updated_at FROM stepwise_jobs
                        UNION ALL
                        SELECT job_id AS id, updated_at FROM stepwise_blobs
                    ) AS touched
                    GROUP BY id
                    ORDER BY id
                    "#,
                )
                .fetch_all(&self.pool),
            )
            .map_err(|e| BackendError::storage("list", e))?;

        Ok(rows
            .into_iter()
            .map(|(raw, updated_at)| {
                JobId::parse(raw.as_str())
                    .map(|id| JobEntry { id, updated_at })
                    .map_err(|e| CleanupFailure {
                        job: raw,
                        error: e.to_string(),
                    })
            })
            .collect())
    }

    fn auto_blob_threshold(&self) -> usize {
        self.auto_blob_threshold
    }

    fn cleanup_age(&self) -> Duration {
        self.cleanup_age
    }
}
