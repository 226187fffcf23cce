//! Read-through embedding cache.
//!
//! Keyed by `(provider, model, provider_key, chunk_hash)` so two
//! deployments sharing a store but pointing at different embedding
//! endpoints never collide. Lookups and upserts run on the caller's
//! transaction connection: a file's chunks and the cache rows they
//! produced commit or roll back together.
//!
//! Within a batch, missing entries are deduplicated **by hash** — several
//! chunks may share content — and one embedding fans out to all of them. A
//! second dedup by normalized text is only a diagnostic signal: near-dupes
//! that differ in whitespace or case still embed separately, but we log
//! how much a normalizing key would have saved.

use anyhow::{bail, Result};
use pgvector::Vector;
use sqlx::{PgConnection, PgPool, Row};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::embedding::Embedder;

/// Cache partition for one provider identity.
#[derive(Debug, Clone, Copy)]
pub struct CacheKey<'a> {
    pub provider: &'a str,
    pub model: &'a str,
    pub provider_key: &'a str,
}

/// Result of resolving a batch: every requested hash maps to a vector.
pub struct CacheOutcome {
    pub vectors: HashMap<String, Vec<f32>>,
    /// Hashes served from the cache.
    pub hits: usize,
    /// Texts actually sent to the provider.
    pub embedded: usize,
}

/// Resolve embeddings for `(hash, text)` pairs, reading the cache first and
/// embedding only the unique misses.
///
/// Fails (and thereby aborts the caller's transaction) when the provider
/// returns fewer vectors than requested or an empty vector.
pub async fn resolve_embeddings(
    conn: &mut PgConnection,
    key: CacheKey<'_>,
    embedder: &Embedder,
    enabled: bool,
    items: &[(String, String)],
) -> Result<CacheOutcome> {
    // Dedupe by hash, preserving first-seen order for determinism.
    let mut unique: Vec<(&String, &String)> = Vec::new();
    let mut seen = HashSet::new();
    for (hash, text) in items {
        if seen.insert(hash.as_str()) {
            unique.push((hash, text));
        }
    }

    let mut vectors: HashMap<String, Vec<f32>> = HashMap::new();

    if enabled && !unique.is_empty() {
        let hashes: Vec<String> = unique.iter().map(|(h, _)| (*h).clone()).collect();
        let rows = sqlx::query(
            "SELECT hash, embedding FROM embedding_cache \
             WHERE provider = $1 AND model = $2 AND provider_key = $3 AND hash = ANY($4)",
        )
        .bind(key.provider)
        .bind(key.model)
        .bind(key.provider_key)
        .bind(&hashes)
        .fetch_all(&mut *conn)
        .await?;

        for row in rows {
            let hash: String = row.get("hash");
            let embedding: Vector = row.get("embedding");
            vectors.insert(hash, embedding.to_vec());
        }
    }

    let hits = vectors.len();
    let missing: Vec<(&String, &String)> = unique
        .iter()
        .filter(|(hash, _)| !vectors.contains_key(*hash))
        .copied()
        .collect();

    if !missing.is_empty() {
        let normalized: HashSet<String> = missing
            .iter()
            .map(|(_, text)| text.trim().to_lowercase())
            .collect();
        if normalized.len() < missing.len() {
            debug!(
                misses = missing.len(),
                normalized = normalized.len(),
                "near-duplicate chunk texts in embedding batch"
            );
        }

        let texts: Vec<String> = missing.iter().map(|(_, text)| (*text).clone()).collect();
        let embedded = embedder.embed_batch(&texts).await?;
        if embedded.len() != missing.len() {
            bail!(
                "embedding provider returned {} vectors for {} texts",
                embedded.len(),
                missing.len()
            );
        }

        for ((hash, _), vector) in missing.iter().zip(embedded.into_iter()) {
            if vector.is_empty() {
                bail!("embedding provider returned an empty vector");
            }
            if enabled {
                sqlx::query(
                    "INSERT INTO embedding_cache \
                       (provider, model, provider_key, hash, embedding, dims, updated_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, now()) \
                     ON CONFLICT (provider, model, provider_key, hash) DO UPDATE \
                       SET embedding = EXCLUDED.embedding, dims = EXCLUDED.dims, \
                           updated_at = now()",
                )
                .bind(key.provider)
                .bind(key.model)
                .bind(key.provider_key)
                .bind(hash.as_str())
                .bind(Vector::from(vector.clone()))
                .bind(vector.len() as i32)
                .execute(&mut *conn)
                .await?;
            }
            vectors.insert((*hash).clone(), vector);
        }
    }

    // Every requested hash must resolve; the fan-out below relies on it.
    for (hash, _) in items {
        if !vectors.contains_key(hash) {
            bail!("no embedding resolved for chunk hash {}", hash);
        }
    }

    Ok(CacheOutcome {
        vectors,
        hits,
        embedded: missing.len(),
    })
}

/// Trim a fingerprint partition to `max_entries`, dropping the oldest rows.
/// Called once per sync rather than per file.
pub async fn prune(pool: &PgPool, key: CacheKey<'_>, max_entries: usize) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM embedding_cache \
         WHERE provider = $1 AND model = $2 AND provider_key = $3 AND hash IN ( \
             SELECT hash FROM embedding_cache \
             WHERE provider = $1 AND model = $2 AND provider_key = $3 \
             ORDER BY updated_at DESC OFFSET $4 \
         )",
    )
    .bind(key.provider)
    .bind(key.model)
    .bind(key.provider_key)
    .bind(max_entries as i64)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
