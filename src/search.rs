//! Keyword, vector, and hybrid retrieval over indexed chunks.
//!
//! Keyword search ranks with the full-text index (`ts_rank` over the
//! generated tsvector, higher is better). Vector search orders by cosine
//! distance (`<=>`), scoring `1 - distance`. Hybrid runs both over a
//! shared candidate budget and fuses per chunk id:
//!
//! ```text
//! score = vector_weight × v_score + text_weight × t_score
//! ```
//!
//! with missing signals contributing 0. Ties break by vector score, then
//! lexical rank. The retriever is deterministic and never decorates
//! results — citations are the tool surface's concern.

use anyhow::Result;
use pgvector::Vector;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::warn;

use crate::config::Config;
use crate::embedding::Embedder;
use crate::models::{SearchHit, SearchMode, SessionScope};
use crate::recency::RecencyWindow;
use crate::scope::ResolvedScope;

/// Snippets are clamped to this many UTF-16 code units.
const SNIPPET_MAX_UTF16: usize = 700;

/// Candidate lists are clamped to this many rows per signal.
const MAX_CANDIDATES: i64 = 200;

/// Validated retrieval request.
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub query: String,
    pub mode: SearchMode,
    pub max_results: usize,
    pub min_score: f64,
    pub scope: ResolvedScope,
    pub window: RecencyWindow,
}

#[derive(Debug, Clone)]
struct Candidate {
    id: String,
    path: String,
    source: String,
    start_line: i32,
    end_line: i32,
    text: String,
    vector_score: f64,
    text_score: f64,
    /// Position in the lexical ranking, for tie breaks.
    text_rank: usize,
}

/// Execute a search. Empty queries return immediately without touching the
/// store; a failed or all-zero query embedding degrades to keyword-only.
pub async fn search_chunks(
    pool: &PgPool,
    config: &Config,
    embedder: &Embedder,
    params: &SearchParams,
) -> Result<Vec<SearchHit>> {
    if params.query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let hybrid = &config.query.hybrid;
    let candidates = ((params.max_results as f64 * hybrid.candidate_multiplier).floor() as i64)
        .clamp(1, MAX_CANDIDATES);

    let run_keyword = match params.mode {
        SearchMode::Keyword => true,
        SearchMode::Hybrid => hybrid.enabled,
        SearchMode::Vector => false,
    };
    let run_vector = params.mode != SearchMode::Keyword;

    let mut keyword_hits = if run_keyword {
        keyword_search(pool, params, candidates).await?
    } else {
        Vec::new()
    };

    let mut vector_hits = Vec::new();
    let mut vector_available = false;
    if run_vector {
        match embedder.embed_query(&params.query).await {
            Ok(query_vec) if query_vec.iter().any(|v| *v != 0.0) => {
                vector_hits = vector_search(
                    pool,
                    params,
                    candidates,
                    query_vec,
                    embedder.model_name(),
                )
                .await?;
                vector_available = true;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "query embedding failed; degrading to keyword search");
            }
        }
        if !vector_available && keyword_hits.is_empty() {
            keyword_hits = keyword_search(pool, params, candidates).await?;
        }
    }

    let weights = match (params.mode, vector_available) {
        (SearchMode::Keyword, _) | (_, false) => (0.0, 1.0),
        (SearchMode::Vector, true) => (1.0, 0.0),
        (SearchMode::Hybrid, true) if hybrid.enabled => {
            (hybrid.vector_weight, hybrid.text_weight)
        }
        (SearchMode::Hybrid, true) => (1.0, 0.0),
    };

    let mut fused = fuse_candidates(vector_hits, keyword_hits, weights.0, weights.1);
    fused.retain(|(score, _)| *score >= params.min_score);
    fused.truncate(params.max_results);

    Ok(fused
        .into_iter()
        .map(|(score, c)| SearchHit {
            path: c.path,
            source: c.source,
            start_line: c.start_line,
            end_line: c.end_line,
            score,
            snippet: clamp_utf16(&c.text, SNIPPET_MAX_UTF16),
            citation: None,
            vector_score: c.vector_score,
            text_score: c.text_score,
        })
        .collect())
}

/// Merge both signal lists per chunk id and sort by fused score, breaking
/// ties by vector score, then lexical rank, then id.
fn fuse_candidates(
    vector_hits: Vec<Candidate>,
    keyword_hits: Vec<Candidate>,
    vector_weight: f64,
    text_weight: f64,
) -> Vec<(f64, Candidate)> {
    let mut merged: Vec<Candidate> = vector_hits;
    for kw in keyword_hits {
        if let Some(existing) = merged.iter_mut().find(|c| c.id == kw.id) {
            existing.text_score = kw.text_score;
            existing.text_rank = kw.text_rank;
        } else {
            merged.push(kw);
        }
    }

    let mut scored: Vec<(f64, Candidate)> = merged
        .into_iter()
        .map(|c| {
            let score = vector_weight * c.vector_score + text_weight * c.text_score;
            (score, c)
        })
        .collect();

    scored.sort_by(|(sa, a), (sb, b)| {
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.vector_score
                    .partial_cmp(&a.vector_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.text_rank.cmp(&b.text_rank))
            .then_with(|| a.id.cmp(&b.id))
    });
    scored
}

async fn keyword_search(
    pool: &PgPool,
    params: &SearchParams,
    limit: i64,
) -> Result<Vec<Candidate>> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "SELECT id, path, source, start_line, end_line, text, \
         ts_rank(text_tsv, plainto_tsquery('english', ",
    );
    qb.push_bind(&params.query);
    qb.push(
        "))::float8 AS rank FROM memory_chunks \
         WHERE text_tsv @@ plainto_tsquery('english', ",
    );
    qb.push_bind(&params.query);
    qb.push(")");
    push_filters(&mut qb, params);
    qb.push(" ORDER BY rank DESC, id ASC LIMIT ");
    qb.push_bind(limit);

    let rows = qb.build().fetch_all(pool).await?;
    Ok(rows
        .into_iter()
        .enumerate()
        .map(|(position, row)| Candidate {
            id: row.get("id"),
            path: row.get("path"),
            source: row.get("source"),
            start_line: row.get("start_line"),
            end_line: row.get("end_line"),
            text: row.get("text"),
            vector_score: 0.0,
            text_score: row.get::<f64, _>("rank"),
            text_rank: position,
        })
        .collect())
}

async fn vector_search(
    pool: &PgPool,
    params: &SearchParams,
    limit: i64,
    query_vec: Vec<f32>,
    model: &str,
) -> Result<Vec<Candidate>> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "SELECT id, path, source, start_line, end_line, text, (embedding <=> ",
    );
    qb.push_bind(Vector::from(query_vec));
    qb.push(")::float8 AS distance FROM memory_chunks WHERE embedding IS NOT NULL AND model = ");
    qb.push_bind(model.to_string());
    push_filters(&mut qb, params);
    qb.push(" ORDER BY distance ASC, id ASC LIMIT ");
    qb.push_bind(limit);

    let rows = qb.build().fetch_all(pool).await?;
    Ok(rows
        .into_iter()
        .map(|row| Candidate {
            id: row.get("id"),
            path: row.get("path"),
            source: row.get("source"),
            start_line: row.get("start_line"),
            end_line: row.get("end_line"),
            text: row.get("text"),
            vector_score: 1.0 - row.get::<f64, _>("distance"),
            text_score: 0.0,
            text_rank: usize::MAX,
        })
        .collect())
}

/// Append the scope and time filters resolved in [`crate::scope`].
///
/// `session` scope is the privacy boundary: only the ambient session's
/// transcript rows are reachable, never memory files. With no ambient
/// session key the filter matches nothing rather than widening.
fn push_filters(qb: &mut QueryBuilder<Postgres>, params: &SearchParams) {
    let scope = &params.scope;
    match scope.scope {
        SessionScope::Session => {
            qb.push(" AND source = 'sessions' AND session_key = ");
            qb.push_bind(scope.session_key.clone().unwrap_or_default());
        }
        SessionScope::Actor => {
            qb.push(" AND (source = 'memory' OR (source = 'sessions'");
            if let Some(actor_id) = &scope.actor_id {
                qb.push(" AND actor_id = ");
                qb.push_bind(actor_id.clone());
            }
            if let Some(actor_type) = scope.actor_type {
                qb.push(" AND actor_type = ");
                qb.push_bind(actor_type.as_str());
            }
            qb.push("))");
        }
        SessionScope::Global => {
            if let Some(actor_id) = &scope.actor_id {
                qb.push(" AND actor_id = ");
                qb.push_bind(actor_id.clone());
            }
            if let Some(actor_type) = scope.actor_type {
                qb.push(" AND actor_type = ");
                qb.push_bind(actor_type.as_str());
            }
        }
    }
    if scope.scope == SessionScope::Session {
        if let Some(actor_id) = &scope.actor_id {
            qb.push(" AND actor_id = ");
            qb.push_bind(actor_id.clone());
        }
        if let Some(actor_type) = scope.actor_type {
            qb.push(" AND actor_type = ");
            qb.push_bind(actor_type.as_str());
        }
    }
    if let Some(role) = scope.role {
        qb.push(" AND role = ");
        qb.push_bind(role.as_str());
    }
    if let Some(after) = params.window.updated_after {
        qb.push(" AND updated_at >= ");
        qb.push_bind(after);
    }
    if let Some(before) = params.window.updated_before {
        qb.push(" AND updated_at <= ");
        qb.push_bind(before);
    }
}

/// Truncate to at most `max` UTF-16 code units without splitting a char.
fn clamp_utf16(text: &str, max: usize) -> String {
    let mut units = 0usize;
    let mut out = String::new();
    for c in text.chars() {
        units += c.len_utf16();
        if units > max {
            break;
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, vector_score: f64, text_score: f64, text_rank: usize) -> Candidate {
        Candidate {
            id: id.to_string(),
            path: format!("memory/{}.md", id),
            source: "memory".to_string(),
            start_line: 1,
            end_line: 1,
            text: id.to_string(),
            vector_score,
            text_score,
            text_rank,
        }
    }

    #[test]
    fn fusion_is_weighted_sum_with_missing_as_zero() {
        // A: strong lexical, absent from vector list. B: strong vector only.
        let vector_hits = vec![candidate("b", 0.9, 0.0, usize::MAX)];
        let keyword_hits = vec![candidate("a", 0.0, 0.8, 0)];
        let fused = fuse_candidates(vector_hits, keyword_hits, 0.5, 0.5);

        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].1.id, "b");
        assert!((fused[0].0 - 0.45).abs() < 1e-9);
        assert_eq!(fused[1].1.id, "a");
        assert!((fused[1].0 - 0.40).abs() < 1e-9);
    }

    #[test]
    fn fusion_merges_scores_for_shared_chunks() {
        let vector_hits = vec![candidate("x", 0.6, 0.0, usize::MAX)];
        let keyword_hits = vec![candidate("x", 0.0, 0.4, 0)];
        let fused = fuse_candidates(vector_hits, keyword_hits, 0.5, 0.5);
        assert_eq!(fused.len(), 1);
        assert!((fused[0].0 - 0.5).abs() < 1e-9);
        assert!((fused[0].1.vector_score - 0.6).abs() < 1e-9);
        assert!((fused[0].1.text_score - 0.4).abs() < 1e-9);
    }

    #[test]
    fn ties_break_by_vector_then_lexical_rank() {
        let a = candidate("a", 0.5, 0.1, 3);
        let b = candidate("b", 0.1, 0.5, 0);
        let c = candidate("c", 0.1, 0.5, 1);
        let fused = fuse_candidates(vec![a, b.clone(), c], vec![], 0.5, 0.5);
        // equal fused scores: a wins on vector score; b beats c on rank
        assert_eq!(fused[0].1.id, "a");
        assert_eq!(fused[1].1.id, "b");
        assert_eq!(fused[2].1.id, "c");
    }

    #[test]
    fn clamp_utf16_counts_code_units() {
        // '😀' is 2 UTF-16 units
        let text = "😀😀😀";
        assert_eq!(clamp_utf16(text, 4), "😀😀");
        assert_eq!(clamp_utf16(text, 5), "😀😀");
        assert_eq!(clamp_utf16(text, 6), "😀😀😀");
        assert_eq!(clamp_utf16("abc", 2), "ab");
        assert_eq!(clamp_utf16("abc", 10), "abc");
    }
}
