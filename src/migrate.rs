//! Database schema migrations and the embedding-identity meta guard.
//!
//! Creates all required tables and ensures idempotent execution.
//!
//! # Schema
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `memory_meta` | Embedding identity and chunk parameters (key/value) |
//! | `memory_files` | One row per indexed path per source, with aggregate hash |
//! | `memory_chunks` | Line-anchored chunks with text, tsvector, and embedding |
//! | `embedding_cache` | `(provider, model, provider_key, hash) → vector` |
//! | `memory_actors` | Canonical actors owned by the actor directory |
//! | `memory_actor_aliases` | Normalized alias rows per actor |
//!
//! # Idempotency
//!
//! Everything uses `CREATE ... IF NOT EXISTS`; column additions since the
//! first schema revision run as `ADD COLUMN IF NOT EXISTS` so deployments
//! upgrade in place. The vector similarity index is the one lazy object:
//! it needs the dimensionality, which is only known after the first
//! embedding batch, so [`ensure_vector_index`] is called from the sync
//! path once dims are recorded.

use anyhow::Result;
use sqlx::PgPool;

use crate::config::Config;
use crate::db::quote_ident;
use crate::models::MetaSnapshot;

pub async fn run_migrations(pool: &PgPool, config: &Config) -> Result<()> {
    if config.store.schema != "public" {
        sqlx::query(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_ident(&config.store.schema)
        ))
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS memory_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS memory_files (
            path TEXT NOT NULL,
            source TEXT NOT NULL,
            session_key TEXT,
            hash TEXT NOT NULL,
            mtime BIGINT NOT NULL,
            size BIGINT NOT NULL,
            role TEXT,
            actor_type TEXT,
            actor_id TEXT,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (path, source)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS memory_chunks (
            id TEXT PRIMARY KEY,
            path TEXT NOT NULL,
            source TEXT NOT NULL,
            session_key TEXT,
            role TEXT NOT NULL,
            actor_type TEXT NOT NULL,
            actor_id TEXT NOT NULL,
            message_id TEXT,
            message_created_at BIGINT,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            hash TEXT NOT NULL,
            model TEXT NOT NULL,
            text TEXT NOT NULL,
            embedding vector,
            text_tsv tsvector GENERATED ALWAYS AS (to_tsvector('english', text)) STORED,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embedding_cache (
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            provider_key TEXT NOT NULL,
            hash TEXT NOT NULL,
            embedding vector NOT NULL,
            dims INTEGER NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (provider, model, provider_key, hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS memory_actors (
            actor_id TEXT PRIMARY KEY,
            actor_type TEXT NOT NULL,
            display_name TEXT,
            metadata JSONB,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS memory_actor_aliases (
            alias_norm TEXT NOT NULL,
            actor_id TEXT NOT NULL,
            alias TEXT NOT NULL,
            source TEXT,
            confidence DOUBLE PRECISION NOT NULL DEFAULT 1,
            metadata JSONB,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (alias_norm, actor_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Columns added after the first schema revision.
    for statement in [
        "ALTER TABLE memory_chunks ADD COLUMN IF NOT EXISTS message_id TEXT",
        "ALTER TABLE memory_chunks ADD COLUMN IF NOT EXISTS message_created_at BIGINT",
        "ALTER TABLE memory_chunks ADD COLUMN IF NOT EXISTS actor_type TEXT NOT NULL DEFAULT 'agent'",
        "ALTER TABLE memory_chunks ADD COLUMN IF NOT EXISTS actor_id TEXT NOT NULL DEFAULT ''",
        "ALTER TABLE memory_files ADD COLUMN IF NOT EXISTS role TEXT",
        "ALTER TABLE memory_files ADD COLUMN IF NOT EXISTS actor_type TEXT",
        "ALTER TABLE memory_files ADD COLUMN IF NOT EXISTS actor_id TEXT",
    ] {
        sqlx::query(statement).execute(pool).await?;
    }

    for statement in [
        "CREATE INDEX IF NOT EXISTS idx_memory_chunks_path ON memory_chunks(path)",
        "CREATE INDEX IF NOT EXISTS idx_memory_chunks_source ON memory_chunks(source)",
        "CREATE INDEX IF NOT EXISTS idx_memory_chunks_model ON memory_chunks(model)",
        "CREATE INDEX IF NOT EXISTS idx_memory_chunks_session_key ON memory_chunks(session_key)",
        "CREATE INDEX IF NOT EXISTS idx_memory_chunks_actor_id ON memory_chunks(actor_id)",
        "CREATE INDEX IF NOT EXISTS idx_memory_chunks_created_at ON memory_chunks(created_at)",
        "CREATE INDEX IF NOT EXISTS idx_memory_chunks_updated_at ON memory_chunks(updated_at)",
        "CREATE INDEX IF NOT EXISTS idx_memory_chunks_message_id ON memory_chunks(message_id)",
        "CREATE INDEX IF NOT EXISTS idx_memory_chunks_message_created_at ON memory_chunks(message_created_at)",
        "CREATE INDEX IF NOT EXISTS idx_memory_chunks_session_recent ON memory_chunks(session_key, message_created_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_memory_chunks_tsv ON memory_chunks USING gin(text_tsv)",
        "CREATE INDEX IF NOT EXISTS idx_memory_actor_aliases_norm ON memory_actor_aliases(alias_norm)",
    ] {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}

/// Create the cosine similarity index once the dimensionality is known.
///
/// The `embedding` column is dimensionless so different deployments can
/// share the schema; the index is built over a cast to the current dims.
pub async fn ensure_vector_index(pool: &PgPool, dims: i32) -> Result<()> {
    if dims < 1 {
        return Ok(());
    }
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_memory_chunks_embedding \
         ON memory_chunks USING hnsw ((embedding::vector({})) vector_cosine_ops)",
        dims
    ))
    .execute(pool)
    .await?;
    Ok(())
}

/// Read the meta singleton, if a previous sync wrote one.
pub async fn read_meta(pool: &PgPool) -> Result<Option<MetaSnapshot>> {
    let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM memory_meta")
        .fetch_all(pool)
        .await?;
    if rows.is_empty() {
        return Ok(None);
    }

    let get = |key: &str| -> Option<String> {
        rows.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    };

    Ok(Some(MetaSnapshot {
        model: get("model").unwrap_or_default(),
        provider: get("provider").unwrap_or_default(),
        provider_key: get("provider_key").unwrap_or_default(),
        chunk_tokens: get("chunk_tokens")
            .and_then(|v| v.parse().ok())
            .unwrap_or_default(),
        chunk_overlap: get("chunk_overlap")
            .and_then(|v| v.parse().ok())
            .unwrap_or_default(),
        vector_dims: get("vector_dims").and_then(|v| v.parse().ok()),
    }))
}

pub async fn write_meta(pool: &PgPool, meta: &MetaSnapshot) -> Result<()> {
    let entries = [
        ("model", meta.model.clone()),
        ("provider", meta.provider.clone()),
        ("provider_key", meta.provider_key.clone()),
        ("chunk_tokens", meta.chunk_tokens.to_string()),
        ("chunk_overlap", meta.chunk_overlap.to_string()),
    ];
    for (key, value) in entries {
        upsert_meta_value(pool, key, &value).await?;
    }
    if let Some(dims) = meta.vector_dims {
        upsert_meta_value(pool, "vector_dims", &dims.to_string()).await?;
    }
    Ok(())
}

pub async fn record_vector_dims(pool: &PgPool, dims: i32) -> Result<()> {
    upsert_meta_value(pool, "vector_dims", &dims.to_string()).await
}

async fn upsert_meta_value(pool: &PgPool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO memory_meta (key, value) VALUES ($1, $2) \
         ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

/// Compare the stored meta against the desired identity; on mismatch purge
/// chunks, file records, and any stale cache rows under the new identity,
/// then write the new meta.
///
/// Cache rows belonging to other fingerprints are left alone: a second
/// deployment sharing the store may still be reading them.
///
/// Returns `true` when a full rebuild was forced.
pub async fn ensure_meta(pool: &PgPool, desired: &MetaSnapshot) -> Result<bool> {
    let stored = read_meta(pool).await?;

    let rebuilt = match &stored {
        Some(existing) if existing.identity_matches(desired) => false,
        Some(_) => {
            sqlx::query("DELETE FROM memory_chunks").execute(pool).await?;
            sqlx::query("DELETE FROM memory_files").execute(pool).await?;
            sqlx::query(
                "DELETE FROM embedding_cache \
                 WHERE provider = $1 AND model = $2 AND provider_key = $3",
            )
            .bind(&desired.provider)
            .bind(&desired.model)
            .bind(&desired.provider_key)
            .execute(pool)
            .await?;
            sqlx::query("DELETE FROM memory_meta WHERE key = 'vector_dims'")
                .execute(pool)
                .await?;
            sqlx::query("DROP INDEX IF EXISTS idx_memory_chunks_embedding")
                .execute(pool)
                .await?;
            true
        }
        None => false,
    };

    if stored.is_none() || rebuilt {
        write_meta(pool, desired).await?;
    }
    Ok(rebuilt)
}
