//! Postgres `DocumentBackend`.
//!
//! Documents live in a single `documents` table keyed by (collection, key)
//! with a JSONB body and a `version` column carrying the optimistic check.
//! Expiry is honored on read; the partial index on `expires_at` keeps the
//! periodic sweep cheap.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::debug;

use super::{Collection, DocumentBackend, StoreError, StoreResult, StoredDocument};

const DDL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        collection TEXT NOT NULL,
        key TEXT NOT NULL,
        version BIGINT NOT NULL DEFAULT 0,
        body JSONB NOT NULL,
        expires_at TIMESTAMPTZ,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (collection, key)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS documents_expires_at_idx
        ON documents (expires_at) WHERE expires_at IS NOT NULL
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS documents_mapping_cpf_idx
        ON documents ((body->>'cpf')) WHERE collection = 'phone_mapping'
    "#,
];

/// Postgres-backed document store.
pub struct SqlBackend {
    pool: PgPool,
}

impl SqlBackend {
    /// Connect the pool.
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(map_sqlx)?;

        Ok(Self { pool })
    }

    /// Build from an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_sqlx(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::Database(db) => StoreError::SchemaReject(db.message().to_string()),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::SchemaReject(format!("decode failure: {e}"))
        }
        other => StoreError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl DocumentBackend for SqlBackend {
    async fn get(&self, collection: Collection, key: &str) -> StoreResult<Option<StoredDocument>> {
        let row = sqlx::query(
            "SELECT version, body, expires_at FROM documents
             WHERE collection = $1 AND key = $2
               AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(collection.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(StoredDocument {
            version: row.try_get("version").map_err(map_sqlx)?,
            body: row.try_get("body").map_err(map_sqlx)?,
            expires_at: row
                .try_get::<Option<DateTime<Utc>>, _>("expires_at")
                .map_err(map_sqlx)?,
        }))
    }

    async fn put(
        &self,
        collection: Collection,
        key: &str,
        doc: StoredDocument,
        expected_version: Option<i64>,
    ) -> StoreResult<()> {
        let affected = match expected_version {
            None => sqlx::query(
                "INSERT INTO documents (collection, key, version, body, expires_at)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (collection, key) DO UPDATE
                     SET version = EXCLUDED.version,
                         body = EXCLUDED.body,
                         expires_at = EXCLUDED.expires_at,
                         updated_at = now()",
            )
            .bind(collection.as_str())
            .bind(key)
            .bind(doc.version)
            .bind(&doc.body)
            .bind(doc.expires_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?
            .rows_affected(),

            Some(0) => sqlx::query(
                "INSERT INTO documents (collection, key, version, body, expires_at)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (collection, key) DO NOTHING",
            )
            .bind(collection.as_str())
            .bind(key)
            .bind(doc.version)
            .bind(&doc.body)
            .bind(doc.expires_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?
            .rows_affected(),

            Some(expected) => sqlx::query(
                "UPDATE documents
                 SET version = $3, body = $4, expires_at = $5, updated_at = now()
                 WHERE collection = $1 AND key = $2 AND version = $6",
            )
            .bind(collection.as_str())
            .bind(key)
            .bind(doc.version)
            .bind(&doc.body)
            .bind(doc.expires_at)
            .bind(expected)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?
            .rows_affected(),
        };

        if affected == 0 {
            let expected = expected_version.unwrap_or(0);
            let found = self
                .get(collection, key)
                .await?
                .map_or(0, |current| current.version);
            return Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected,
                found,
            });
        }

        debug!(%collection, key, version = doc.version, "document upserted");
        Ok(())
    }

    async fn delete(&self, collection: Collection, key: &str) -> StoreResult<bool> {
        let affected = sqlx::query(
            "DELETE FROM documents
             WHERE collection = $1 AND key = $2
               AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(collection.as_str())
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?
        .rows_affected();

        Ok(affected > 0)
    }

    async fn ensure_indexes(&self) -> StoreResult<()> {
        for statement in DDL {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
        }
        // Opportunistic sweep of expired verification documents.
        sqlx::query("DELETE FROM documents WHERE expires_at IS NOT NULL AND expires_at <= now()")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }
}
