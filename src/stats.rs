//! Index statistics and health overview.
//!
//! A quick summary of what's indexed: per-source file and chunk counts,
//! embedding coverage, and the recorded embedding identity. Used by
//! `mem stats` and by the tool surface's status fields.

use anyhow::Result;
use serde::Serialize;
use sqlx::PgPool;

use crate::migrate;
use crate::models::MetaSnapshot;

/// Per-source breakdown of file and chunk counts.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStats {
    pub source: String,
    pub files: i64,
    pub chunks: i64,
    pub embedded: i64,
}

/// Full status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub sources: Vec<SourceStats>,
    pub total_files: i64,
    pub total_chunks: i64,
    pub total_embedded: i64,
    pub cache_entries: i64,
    #[serde(skip)]
    pub meta: Option<MetaSnapshot>,
}

pub async fn collect_stats(pool: &PgPool) -> Result<IndexStats> {
    let rows: Vec<(String, i64, i64, i64)> = sqlx::query_as(
        "SELECT f.source, \
                COUNT(DISTINCT f.path), \
                COUNT(c.id), \
                COUNT(c.id) FILTER (WHERE c.embedding IS NOT NULL) \
         FROM memory_files f \
         LEFT JOIN memory_chunks c ON c.path = f.path AND c.source = f.source \
         GROUP BY f.source ORDER BY f.source",
    )
    .fetch_all(pool)
    .await?;

    let sources: Vec<SourceStats> = rows
        .into_iter()
        .map(|(source, files, chunks, embedded)| SourceStats {
            source,
            files,
            chunks,
            embedded,
        })
        .collect();

    let cache_entries: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embedding_cache")
        .fetch_one(pool)
        .await?;

    let meta = migrate::read_meta(pool).await?;

    Ok(IndexStats {
        total_files: sources.iter().map(|s| s.files).sum(),
        total_chunks: sources.iter().map(|s| s.chunks).sum(),
        total_embedded: sources.iter().map(|s| s.embedded).sum(),
        sources,
        cache_entries,
        meta,
    })
}

/// Render the stats as the `mem stats` table.
pub fn render_stats(stats: &IndexStats) -> String {
    let mut out = String::new();
    out.push_str("Memory Harness — Index Stats\n");
    out.push_str("============================\n\n");
    out.push_str(&format!("  Files:     {}\n", stats.total_files));
    out.push_str(&format!("  Chunks:    {}\n", stats.total_chunks));
    out.push_str(&format!(
        "  Embedded:  {} / {} ({}%)\n",
        stats.total_embedded,
        stats.total_chunks,
        if stats.total_chunks > 0 {
            stats.total_embedded * 100 / stats.total_chunks
        } else {
            0
        }
    ));
    out.push_str(&format!("  Cache:     {} entries\n", stats.cache_entries));

    if let Some(meta) = &stats.meta {
        out.push_str(&format!(
            "  Model:     {} ({}, key {})\n",
            meta.model, meta.provider, meta.provider_key
        ));
        if let Some(dims) = meta.vector_dims {
            out.push_str(&format!("  Dims:      {}\n", dims));
        }
    }

    if !stats.sources.is_empty() {
        out.push('\n');
        out.push_str(&format!(
            "  {:<12} {:>6} {:>8} {:>10}\n",
            "SOURCE", "FILES", "CHUNKS", "EMBEDDED"
        ));
        out.push_str(&format!("  {}\n", "-".repeat(40)));
        for s in &stats.sources {
            out.push_str(&format!(
                "  {:<12} {:>6} {:>8} {:>10}\n",
                s.source, s.files, s.chunks, s.embedded
            ));
        }
    }
    out
}
