//! Agent-facing tool surface.
//!
//! Exposes `memory_search`, `memory_recall`, `memory_get`, and
//! `actor_lookup`. Every operation returns a JSON envelope and never
//! raises: failures are absorbed into `{disabled, error}` fields so a tool
//! call can always be rendered back to the model.
//!
//! Citation decoration and result clamping live here, at the edge — the
//! retriever stays deterministic and undecorated.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::actors;
use crate::config::CitationsMode;
use crate::manager::MemoryManager;
use crate::models::{
    ActorMatch, ActorType, ChatType, ChunkRole, SearchHit, SearchMode, SessionScope,
};
use crate::recency::{self, RecencyWindow};
use crate::scope::{self, QueryContext, ScopeOverrides};
use crate::search::{self, SearchParams};

/// Ambient abort signal honored before dispatch and after each query.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchRequest {
    pub query: String,
    pub mode: Option<SearchMode>,
    pub max_results: Option<usize>,
    pub min_score: Option<f64>,
    pub session_scope: Option<SessionScope>,
    pub actor_type: Option<ActorType>,
    pub actor_id: Option<String>,
    pub role: Option<ChunkRole>,
    /// Ambient session key of the conversation issuing the query.
    pub session_key: Option<String>,
    pub chat_type: Option<ChatType>,
    /// Context file paths already loaded by the runtime, for the recency
    /// window heuristic.
    pub context_paths: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RecallRequest {
    #[serde(flatten)]
    pub search: SearchRequest,
    pub time_window_hours: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct GetRequest {
    pub path: String,
    /// 1-based first line of the requested slice.
    pub from: Option<usize>,
    pub lines: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct LookupRequest {
    pub query: String,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackInfo {
    pub fallback_from: String,
    pub fallback_reason: String,
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SearchEnvelope {
    pub results: Vec<SearchHit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citations: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GetEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ActorsEnvelope {
    pub actors: Vec<ActorMatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The four tools, bound to one agent's manager.
#[derive(Clone)]
pub struct MemoryTools {
    manager: Arc<MemoryManager>,
}

impl MemoryTools {
    pub fn new(manager: Arc<MemoryManager>) -> Self {
        Self { manager }
    }

    /// Hybrid search with scope resolution, citation decoration, and
    /// optional result clamping.
    pub async fn memory_search(&self, req: SearchRequest, abort: &AbortFlag) -> SearchEnvelope {
        self.search_with_window(req, RecencyWindow::default(), abort)
            .await
    }

    /// Time-bounded recall: same as search with
    /// `updated_after = now - hours`.
    pub async fn memory_recall(&self, req: RecallRequest, abort: &AbortFlag) -> SearchEnvelope {
        let hours = req.time_window_hours.unwrap_or(24.0).max(0.0);
        let window = RecencyWindow {
            updated_after: Some(Utc::now() - chrono::Duration::seconds((hours * 3600.0) as i64)),
            updated_before: None,
        };
        self.search_with_window(req.search, window, abort).await
    }

    async fn search_with_window(
        &self,
        req: SearchRequest,
        window: RecencyWindow,
        abort: &AbortFlag,
    ) -> SearchEnvelope {
        if abort.is_aborted() {
            return SearchEnvelope {
                disabled: Some(true),
                error: Some("aborted".to_string()),
                ..Default::default()
            };
        }
        if req.query.trim().is_empty() {
            return SearchEnvelope {
                error: Some("query required".to_string()),
                ..Default::default()
            };
        }

        self.manager.coordinator().note_search();

        let config = self.manager.config();
        let ctx = self.ambient_context(&req);
        let overrides = ScopeOverrides {
            session_scope: req.session_scope,
            actor_id: trimmed(&req.actor_id),
            actor_type: req.actor_type,
            role: req.role,
        };
        let resolved = scope::resolve_scope(&ctx, &overrides, &req.query);

        let window = if window.is_empty() {
            recency::window_from_context_paths(&req.context_paths, Utc::now())
        } else {
            window
        };

        let params = SearchParams {
            query: req.query.clone(),
            mode: req.mode.unwrap_or(SearchMode::Hybrid),
            max_results: req.max_results.unwrap_or(config.query.max_results).max(1),
            min_score: req.min_score.unwrap_or(config.query.min_score),
            scope: resolved,
            window,
        };

        let mut envelope = match search::search_chunks(
            self.manager.pool(),
            config,
            self.manager.embedder(),
            &params,
        )
        .await
        {
            Ok(results) => SearchEnvelope {
                results,
                ..Default::default()
            },
            Err(e) => {
                if abort.is_aborted() {
                    return SearchEnvelope {
                        error: Some("aborted".to_string()),
                        ..Default::default()
                    };
                }
                warn!(error = %e, "memory search failed");
                return SearchEnvelope {
                    error: Some(e.to_string()),
                    ..Default::default()
                };
            }
        };
        if abort.is_aborted() {
            return SearchEnvelope {
                error: Some("aborted".to_string()),
                ..Default::default()
            };
        }

        let embedder = self.manager.embedder();
        envelope.provider = Some(embedder.id().to_string());
        envelope.model = Some(embedder.model_name().to_string());
        envelope.fallback = match (&embedder.fallback_from, &embedder.fallback_reason) {
            (Some(from), Some(reason)) => Some(FallbackInfo {
                fallback_from: from.clone(),
                fallback_reason: reason.clone(),
            }),
            _ => None,
        };

        let cite = match config.citations.mode {
            CitationsMode::On => true,
            CitationsMode::Off => false,
            CitationsMode::Auto => ctx.chat_type == Some(ChatType::Direct),
        };
        if cite {
            decorate_citations(&mut envelope.results);
            envelope.citations = Some(true);
        }

        if let Some(budget) = config.query.char_budget {
            clamp_results(&mut envelope.results, budget);
        }

        envelope
    }

    /// Read a markdown file from the workspace or an approved extra path.
    pub async fn memory_get(&self, req: GetRequest, abort: &AbortFlag) -> GetEnvelope {
        if abort.is_aborted() {
            return GetEnvelope {
                disabled: Some(true),
                error: Some("aborted".to_string()),
                ..Default::default()
            };
        }
        let path = req.path.trim();
        if path.is_empty() {
            return GetEnvelope {
                disabled: Some(true),
                error: Some("path required".to_string()),
                ..Default::default()
            };
        }

        let workspace = &self.manager.config().workspace;
        let resolved = match resolve_workspace_path(path, &workspace.root, &workspace.extra_paths) {
            Ok(resolved) => resolved,
            Err(reason) => {
                return GetEnvelope {
                    disabled: Some(true),
                    error: Some(reason),
                    ..Default::default()
                }
            }
        };

        let text = match std::fs::read_to_string(&resolved) {
            Ok(text) => text,
            Err(e) => {
                return GetEnvelope {
                    error: Some(format!("read failed: {}", e)),
                    ..Default::default()
                }
            }
        };

        let text = match (req.from, req.lines) {
            (None, None) => text,
            (from, lines) => {
                let start = from.unwrap_or(1).max(1) - 1;
                let sliced: Vec<&str> = text
                    .lines()
                    .skip(start)
                    .take(lines.unwrap_or(usize::MAX))
                    .collect();
                sliced.join("\n")
            }
        };

        GetEnvelope {
            text: Some(text),
            path: Some(path.to_string()),
            ..Default::default()
        }
    }

    /// Proxy to the actor directory lookup.
    pub async fn actor_lookup(&self, req: LookupRequest, abort: &AbortFlag) -> ActorsEnvelope {
        if abort.is_aborted() {
            return ActorsEnvelope {
                disabled: Some(true),
                error: Some("aborted".to_string()),
                ..Default::default()
            };
        }
        if req.query.trim().is_empty() {
            return ActorsEnvelope {
                error: Some("query required".to_string()),
                ..Default::default()
            };
        }
        match actors::lookup_actors(self.manager.pool(), &req.query, req.limit.unwrap_or(20)).await
        {
            Ok(actors) => ActorsEnvelope {
                actors,
                ..Default::default()
            },
            Err(e) => {
                warn!(error = %e, "actor lookup failed");
                ActorsEnvelope {
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        }
    }

    /// Fill in ambient actor and chat type from the session store when the
    /// caller only supplied a session key.
    fn ambient_context(&self, req: &SearchRequest) -> QueryContext {
        let mut ctx = QueryContext {
            session_key: trimmed(&req.session_key),
            chat_type: req.chat_type,
            actor_id: None,
        };
        let Some(session_key) = &ctx.session_key else {
            return ctx;
        };
        let store_path = self.manager.config().workspace.session_store();
        let Ok(identities) = actors::load_session_store(&store_path) else {
            return ctx;
        };
        if let Some(identity) = identities.iter().find(|i| &i.session_key == session_key) {
            ctx.actor_id = identity.user_id.clone();
            if ctx.chat_type.is_none() {
                ctx.chat_type = identity.chat_type;
            }
        }
        ctx
    }
}

/// Append `path#Lstart[-Lend]` to each snippet and set the citation field.
fn decorate_citations(results: &mut [SearchHit]) {
    for hit in results {
        let citation = if hit.start_line == hit.end_line {
            format!("{}#L{}", hit.path, hit.start_line)
        } else {
            format!("{}#L{}-L{}", hit.path, hit.start_line, hit.end_line)
        };
        hit.snippet = format!("{}\n{}", hit.snippet, citation);
        hit.citation = Some(citation);
    }
}

/// Keep full snippets until the character budget runs out; the first
/// overflowing snippet is truncated and the list ends there.
fn clamp_results(results: &mut Vec<SearchHit>, budget: usize) {
    let mut remaining = budget;
    let mut keep = 0usize;
    for hit in results.iter_mut() {
        let len = hit.snippet.chars().count();
        if len <= remaining {
            remaining -= len;
            keep += 1;
        } else {
            if remaining > 0 {
                hit.snippet = hit.snippet.chars().take(remaining).collect();
                keep += 1;
            }
            break;
        }
    }
    results.truncate(keep);
}

/// Resolve a user-supplied path against the workspace, rejecting
/// non-markdown files, symlinks, and escapes that do not land in a
/// configured extra path.
fn resolve_workspace_path(
    path: &str,
    root: &Path,
    extra_paths: &[PathBuf],
) -> Result<PathBuf, String> {
    let requested = Path::new(path);
    if requested.extension().and_then(|e| e.to_str()) != Some("md") {
        return Err("only .md paths are readable".to_string());
    }

    let candidate = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        root.join(requested)
    };

    if std::fs::symlink_metadata(&candidate)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
    {
        return Err("symlinks are not readable".to_string());
    }

    let canonical = std::fs::canonicalize(&candidate).map_err(|_| "path not found".to_string())?;

    if let Ok(canonical_root) = std::fs::canonicalize(root) {
        if canonical.starts_with(&canonical_root) {
            return Ok(canonical);
        }
    }
    for extra in extra_paths {
        let Ok(canonical_extra) = std::fs::canonicalize(extra) else {
            continue;
        };
        if canonical.starts_with(&canonical_extra) || canonical == canonical_extra {
            return Ok(canonical);
        }
    }
    Err("path escapes the workspace".to_string())
}

fn trimmed(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(path: &str, start: i32, end: i32, snippet: &str) -> SearchHit {
        SearchHit {
            path: path.to_string(),
            source: "memory".to_string(),
            start_line: start,
            end_line: end,
            score: 1.0,
            snippet: snippet.to_string(),
            citation: None,
            vector_score: 0.0,
            text_score: 0.0,
        }
    }

    #[test]
    fn citations_single_and_ranged() {
        let mut results = vec![hit("memory/a.md", 3, 3, "one"), hit("memory/b.md", 1, 4, "two")];
        decorate_citations(&mut results);
        assert_eq!(results[0].citation.as_deref(), Some("memory/a.md#L3"));
        assert!(results[0].snippet.ends_with("memory/a.md#L3"));
        assert_eq!(results[1].citation.as_deref(), Some("memory/b.md#L1-L4"));
    }

    #[test]
    fn clamp_truncates_first_overflow_and_ends_list() {
        let mut results = vec![
            hit("a.md", 1, 1, "aaaaa"),
            hit("b.md", 1, 1, "bbbbb"),
            hit("c.md", 1, 1, "ccccc"),
        ];
        clamp_results(&mut results, 8);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].snippet, "aaaaa");
        assert_eq!(results[1].snippet, "bbb");
    }

    #[test]
    fn clamp_exact_budget_keeps_all() {
        let mut results = vec![hit("a.md", 1, 1, "12345"), hit("b.md", 1, 1, "678")];
        clamp_results(&mut results, 8);
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].snippet, "678");
    }

    #[test]
    fn clamp_zero_budget_empties() {
        let mut results = vec![hit("a.md", 1, 1, "aaaaa")];
        clamp_results(&mut results, 0);
        assert!(results.is_empty());
    }

    #[test]
    fn workspace_path_rules() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::write(root.join("MEMORY.md"), "x").unwrap();
        std::fs::write(root.join("notes.txt"), "x").unwrap();

        assert!(resolve_workspace_path("MEMORY.md", root, &[]).is_ok());
        assert!(resolve_workspace_path("notes.txt", root, &[]).is_err());
        assert!(resolve_workspace_path("../outside.md", root, &[]).is_err());
        assert!(resolve_workspace_path("missing.md", root, &[]).is_err());
    }

    #[test]
    fn extra_paths_allow_escapes() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("ws");
        std::fs::create_dir(&root).unwrap();
        let extra_dir = tmp.path().join("shared");
        std::fs::create_dir(&extra_dir).unwrap();
        std::fs::write(extra_dir.join("team.md"), "x").unwrap();

        let extra = vec![extra_dir.clone()];
        let resolved = resolve_workspace_path(
            extra_dir.join("team.md").to_str().unwrap(),
            &root,
            &extra,
        );
        assert!(resolved.is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::write(root.join("real.md"), "x").unwrap();
        std::os::unix::fs::symlink(root.join("real.md"), root.join("link.md")).unwrap();
        assert!(resolve_workspace_path("link.md", root, &[]).is_err());
    }
}
