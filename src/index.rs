//! Incremental file indexer.
//!
//! One sync pass per source:
//!
//! 1. enumerate candidate files (markdown walk for `memory`, transcript
//!    listing for `sessions`),
//! 2. compute file entries with an aggregate content hash (transcripts are
//!    parsed first; the hash covers the normalized message text),
//! 3. diff against stored file rows — unchanged hashes are skipped,
//!    vanished paths are deleted along with their chunks,
//! 4. re-index changed files: chunk, resolve embeddings through the cache,
//!    and replace rows inside one transaction per file,
//! 5. ensure the vector index exists for the recorded dims.
//!
//! A failure on one file rolls back that file only; the sync continues and
//! the report is marked dirty. The embedding-identity guard
//! ([`crate::migrate::ensure_meta`]) runs before any diffing, so identity
//! changes purge and rebuild everything.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use pgvector::Vector;
use sqlx::PgPool;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::actors::{self, SessionIdentity};
use crate::cache::{self, CacheKey};
use crate::chunk::{chunk_text, hash_text};
use crate::config::Config;
use crate::embedding::Embedder;
use crate::extract;
use crate::migrate;
use crate::models::{
    ActorType, ChunkRecord, ChunkRole, FileEntry, FileRecord, MetaSnapshot, Source,
};
use crate::progress::SyncProgressReporter;

/// Everything a sync pass needs; owned by the manager, shared with the
/// coordinator.
pub struct IndexCore {
    pub pool: PgPool,
    pub config: Config,
    pub embedder: Embedder,
    /// Checked between files; set on manager teardown.
    pub cancelled: AtomicBool,
}

/// Outcome of one sync pass. Cheap to clone so concurrent callers can all
/// receive the shared in-flight result.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub files_indexed: u64,
    pub files_unchanged: u64,
    pub files_removed: u64,
    pub chunks_written: u64,
    pub embeds_requested: u64,
    pub cache_hits: u64,
    /// The embedding identity changed and everything was purged first.
    pub rebuilt: bool,
    /// At least one file failed and was left at its prior hash.
    pub dirty: bool,
    /// `(source, files, chunks)` counts after the pass.
    pub source_counts: Vec<(String, i64, i64)>,
}

impl IndexCore {
    fn desired_meta(&self) -> MetaSnapshot {
        MetaSnapshot {
            model: self.embedder.model_name().to_string(),
            provider: self.embedder.id().to_string(),
            provider_key: self.embedder.fingerprint().to_string(),
            chunk_tokens: self.config.chunking.tokens,
            chunk_overlap: self.config.chunking.overlap,
            vector_dims: None,
        }
    }

    fn cache_key(&self) -> CacheKey<'_> {
        CacheKey {
            provider: self.embedder.id(),
            model: self.embedder.model_name(),
            provider_key: self.embedder.fingerprint(),
        }
    }
}

/// Run a full sync pass over every configured source.
pub async fn sync_all(
    core: &IndexCore,
    progress: &dyn SyncProgressReporter,
) -> Result<SyncReport> {
    let mut report = SyncReport {
        rebuilt: migrate::ensure_meta(&core.pool, &core.desired_meta()).await?,
        ..Default::default()
    };

    let identities = actors::load_session_store(&core.config.workspace.session_store())
        .unwrap_or_else(|e| {
            warn!(error = %e, "session store snapshot unreadable; continuing without it");
            Vec::new()
        });

    let mut dims_seen: Option<i32> = migrate::read_meta(&core.pool)
        .await?
        .and_then(|m| m.vector_dims);

    for source in core.config.source_kinds() {
        let candidates = match source {
            Source::Memory => enumerate_memory(&core.config)?,
            Source::Sessions => enumerate_sessions(&core.config, &identities)?,
        };
        sync_source(core, source, candidates, &mut report, &mut dims_seen, progress).await?;
    }

    if core.config.source_kinds().contains(&Source::Sessions) {
        actors::sync_actors(
            &core.pool,
            &identities,
            &core.config.workspace.agent_actor_id(),
            &core.config.workspace.agent_id,
        )
        .await?;
    }

    if let Some(dims) = dims_seen {
        migrate::record_vector_dims(&core.pool, dims).await?;
        if core.config.store.vector.enabled {
            migrate::ensure_vector_index(&core.pool, dims).await?;
        }
    }

    if core.config.cache.enabled {
        cache::prune(&core.pool, core.cache_key(), core.config.cache.max_entries).await?;
    }

    report.source_counts = source_counts(&core.pool).await?;
    Ok(report)
}

async fn sync_source(
    core: &IndexCore,
    source: Source,
    candidates: Vec<FileEntry>,
    report: &mut SyncReport,
    dims_seen: &mut Option<i32>,
    progress: &dyn SyncProgressReporter,
) -> Result<()> {
    let existing: Vec<FileRecord> =
        sqlx::query_as("SELECT path, source, hash FROM memory_files WHERE source = $1")
            .bind(source.as_str())
            .fetch_all(&core.pool)
            .await?;

    let candidate_paths: HashSet<&str> = candidates.iter().map(|c| c.path.as_str()).collect();
    let stale: Vec<String> = existing
        .iter()
        .filter(|record| !candidate_paths.contains(record.path.as_str()))
        .map(|record| record.path.clone())
        .collect();

    if !stale.is_empty() {
        sqlx::query("DELETE FROM memory_chunks WHERE source = $1 AND path = ANY($2)")
            .bind(source.as_str())
            .bind(&stale)
            .execute(&core.pool)
            .await?;
        sqlx::query("DELETE FROM memory_files WHERE source = $1 AND path = ANY($2)")
            .bind(source.as_str())
            .bind(&stale)
            .execute(&core.pool)
            .await?;
        report.files_removed += stale.len() as u64;
    }

    let to_index: Vec<&FileEntry> = candidates
        .iter()
        .filter(|entry| {
            existing
                .iter()
                .find(|record| record.path == entry.path)
                .map(|record| record.hash != entry.hash)
                .unwrap_or(true)
        })
        .collect();
    report.files_unchanged += (candidates.len() - to_index.len()) as u64;

    let total = to_index.len() as u64;
    for (n, entry) in to_index.into_iter().enumerate() {
        if core.cancelled.load(Ordering::Relaxed) {
            bail!("sync cancelled");
        }
        progress.report(n as u64, total, &entry.path);
        match index_file(core, entry).await {
            Ok(stats) => {
                report.files_indexed += 1;
                report.chunks_written += stats.chunks;
                report.embeds_requested += stats.embedded;
                report.cache_hits += stats.cache_hits;
                if let Some(dims) = stats.dims {
                    *dims_seen = Some(dims);
                }
            }
            Err(e) => {
                warn!(path = %entry.path, error = %e, "failed to index file; leaving prior state");
                report.dirty = true;
            }
        }
    }
    progress.report(total, total, source.as_str());
    Ok(())
}

struct FileStats {
    chunks: u64,
    embedded: u64,
    cache_hits: u64,
    dims: Option<i32>,
}

/// Replace one file's rows atomically: resolve embeddings, delete prior
/// chunks for `(path, source)`, upsert the file row, bulk-insert chunks.
async fn index_file(core: &IndexCore, entry: &FileEntry) -> Result<FileStats> {
    let records = chunk_entry(&core.config, entry);

    let items: Vec<(String, String)> = records
        .iter()
        .map(|record| (record.hash.clone(), record.text.clone()))
        .collect();

    let mut tx = core.pool.begin().await?;

    let outcome = cache::resolve_embeddings(
        &mut *tx,
        core.cache_key(),
        &core.embedder,
        core.config.cache.enabled,
        &items,
    )
    .await?;

    sqlx::query("DELETE FROM memory_chunks WHERE path = $1 AND source = $2")
        .bind(&entry.path)
        .bind(entry.source.as_str())
        .execute(&mut *tx)
        .await?;

    let memory_file = entry.source == Source::Memory;
    sqlx::query(
        "INSERT INTO memory_files \
           (path, source, session_key, hash, mtime, size, role, actor_type, actor_id, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now()) \
         ON CONFLICT (path, source) DO UPDATE SET \
           session_key = EXCLUDED.session_key, hash = EXCLUDED.hash, \
           mtime = EXCLUDED.mtime, size = EXCLUDED.size, role = EXCLUDED.role, \
           actor_type = EXCLUDED.actor_type, actor_id = EXCLUDED.actor_id, \
           updated_at = now()",
    )
    .bind(&entry.path)
    .bind(entry.source.as_str())
    .bind(&entry.session_key)
    .bind(&entry.hash)
    .bind(entry.mtime)
    .bind(entry.size)
    .bind(memory_file.then(|| entry.role.as_str()))
    .bind(memory_file.then(|| entry.actor_type.as_str()))
    .bind(memory_file.then(|| entry.actor_id.as_str()))
    .execute(&mut *tx)
    .await?;

    let mut dims = None;
    for record in &records {
        let vector = outcome
            .vectors
            .get(&record.hash)
            .cloned()
            .context("missing embedding after cache resolution")?;
        dims = Some(vector.len() as i32);

        sqlx::query(
            "INSERT INTO memory_chunks \
               (id, path, source, session_key, role, actor_type, actor_id, message_id, \
                message_created_at, start_line, end_line, hash, model, text, embedding, \
                created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, \
                now(), now())",
        )
        .bind(&record.id)
        .bind(&record.path)
        .bind(record.source.as_str())
        .bind(&record.session_key)
        .bind(record.role.as_str())
        .bind(record.actor_type.as_str())
        .bind(&record.actor_id)
        .bind(&record.message_id)
        .bind(record.message_created_at)
        .bind(record.start_line)
        .bind(record.end_line)
        .bind(&record.hash)
        .bind(core.embedder.model_name())
        .bind(&record.text)
        .bind(Vector::from(vector))
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    Ok(FileStats {
        chunks: records.len() as u64,
        embedded: outcome.embedded as u64,
        cache_hits: outcome.hits as u64,
        dims,
    })
}

/// Turn a file entry into chunk records. Memory files are chunked as one
/// document; each transcript message is chunked independently so its
/// chunks inherit the message's role, actor, and timestamp.
pub fn chunk_entry(config: &Config, entry: &FileEntry) -> Vec<ChunkRecord> {
    let tokens = config.chunking.tokens;
    let overlap = config.chunking.overlap;
    let mut records = Vec::new();

    match entry.source {
        Source::Memory => {
            for piece in chunk_text(&entry.content, tokens, overlap) {
                records.push(ChunkRecord {
                    id: Uuid::new_v4().to_string(),
                    path: entry.path.clone(),
                    source: entry.source,
                    session_key: entry.session_key.clone(),
                    role: entry.role,
                    actor_type: entry.actor_type,
                    actor_id: entry.actor_id.clone(),
                    message_id: None,
                    message_created_at: None,
                    start_line: piece.start_line,
                    end_line: piece.end_line,
                    hash: piece.hash,
                    text: piece.text,
                });
            }
        }
        Source::Sessions => {
            for message in &entry.messages {
                let (actor_type, actor_id) = match message.role {
                    ChunkRole::Assistant | ChunkRole::System => {
                        (ActorType::Agent, entry.actor_id.clone())
                    }
                    ChunkRole::User => (ActorType::Human, entry.user_actor_id()),
                };
                for piece in chunk_text(&message.text, tokens, overlap) {
                    records.push(ChunkRecord {
                        id: Uuid::new_v4().to_string(),
                        path: entry.path.clone(),
                        source: entry.source,
                        session_key: entry.session_key.clone(),
                        role: message.role,
                        actor_type,
                        actor_id: actor_id.clone(),
                        message_id: Some(message.message_id.clone()),
                        message_created_at: message.created_at,
                        start_line: piece.start_line,
                        end_line: piece.end_line,
                        hash: piece.hash,
                        text: piece.text,
                    });
                }
            }
        }
    }

    records
}

/// Walk the workspace memory layout plus configured extra paths, accepting
/// only markdown files and rejecting symlinks. Deterministic ordering.
pub fn enumerate_memory(config: &Config) -> Result<Vec<FileEntry>> {
    let workspace = &config.workspace;
    let root = &workspace.root;
    let excludes = default_exclude_set()?;
    let mut files: Vec<(PathBuf, String)> = Vec::new();

    for name in ["MEMORY.md", "memory.md"] {
        let path = root.join(name);
        if is_regular_markdown(&path) {
            files.push((path, name.to_string()));
        }
    }

    let memory_dir = root.join("memory");
    if memory_dir.is_dir() {
        for dir_entry in WalkDir::new(&memory_dir).follow_links(false) {
            let dir_entry = dir_entry?;
            let path = dir_entry.path();
            if !dir_entry.file_type().is_file() || !is_regular_markdown(path) {
                continue;
            }
            let rel = path
                .strip_prefix(root)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");
            if excludes.is_match(&rel) {
                continue;
            }
            files.push((path.to_path_buf(), rel));
        }
    }

    for extra in &workspace.extra_paths {
        if extra.is_dir() {
            for dir_entry in WalkDir::new(extra).follow_links(false) {
                let dir_entry = dir_entry?;
                let path = dir_entry.path();
                if !dir_entry.file_type().is_file() || !is_regular_markdown(path) {
                    continue;
                }
                let rel = forward_slashes(path);
                if excludes.is_match(&rel) {
                    continue;
                }
                files.push((path.to_path_buf(), rel));
            }
        } else if is_regular_markdown(extra) {
            files.push((extra.clone(), forward_slashes(extra)));
        }
    }

    files.sort_by(|a, b| a.1.cmp(&b.1));
    files.dedup_by(|a, b| a.1 == b.1);

    let agent_actor = workspace.agent_actor_id();
    let mut entries = Vec::with_capacity(files.len());
    for (path, rel) in files {
        let metadata = std::fs::metadata(&path)?;
        let content = std::fs::read_to_string(&path).unwrap_or_default();
        entries.push(FileEntry {
            path: rel,
            source: Source::Memory,
            session_key: None,
            hash: hash_text(&content),
            mtime: mtime_epoch(&metadata),
            size: metadata.len() as i64,
            content,
            role: ChunkRole::System,
            actor_type: ActorType::Agent,
            actor_id: agent_actor.clone(),
            user_actor_id: None,
            messages: Vec::new(),
        });
    }
    Ok(entries)
}

/// List the per-agent transcript directory and parse each transcript. The
/// normalized message text is the content basis for the file-level hash.
pub fn enumerate_sessions(
    config: &Config,
    identities: &[SessionIdentity],
) -> Result<Vec<FileEntry>> {
    let dir = config.workspace.sessions_dir();
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let by_id = actors::by_session_id(identities);
    let agent_actor = config.workspace.agent_actor_id();

    let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension().and_then(|e| e.to_str()) == Some("jsonl")
                && !std::fs::symlink_metadata(p)
                    .map(|m| m.file_type().is_symlink())
                    .unwrap_or(true)
        })
        .collect();
    paths.sort();

    let mut entries = Vec::new();
    for path in paths {
        let session_id = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let identity = by_id.get(session_id.as_str());
        let session_key = identity
            .map(|i| i.session_key.clone())
            .unwrap_or_else(|| session_id.clone());

        let metadata = std::fs::metadata(&path)?;
        let raw = std::fs::read_to_string(&path).unwrap_or_default();
        let messages = extract::extract_messages(
            &raw,
            &session_id,
            config.sessions.recent_window_messages,
        );
        let content = extract::transcript_content(&messages);

        entries.push(FileEntry {
            path: format!("sessions/{}.jsonl", session_id),
            source: Source::Sessions,
            session_key: Some(session_key),
            hash: hash_text(&content),
            mtime: mtime_epoch(&metadata),
            size: metadata.len() as i64,
            content,
            role: ChunkRole::User,
            actor_type: ActorType::Human,
            actor_id: agent_actor.clone(),
            user_actor_id: identity.and_then(|i| i.user_id.clone()),
            messages,
        });
    }

    Ok(entries)
}

async fn source_counts(pool: &PgPool) -> Result<Vec<(String, i64, i64)>> {
    let rows: Vec<(String, i64, i64)> = sqlx::query_as(
        "SELECT f.source, COUNT(DISTINCT f.path), COUNT(c.id) \
         FROM memory_files f \
         LEFT JOIN memory_chunks c ON c.path = f.path AND c.source = f.source \
         GROUP BY f.source ORDER BY f.source",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Directories no workspace walk should descend into.
fn default_exclude_set() -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in ["**/.git/**", "**/node_modules/**", "**/target/**"] {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

fn is_regular_markdown(path: &Path) -> bool {
    if path.extension().and_then(|e| e.to_str()) != Some("md") {
        return false;
    }
    match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata.file_type().is_file(),
        Err(_) => false,
    }
}

fn forward_slashes(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn mtime_epoch(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionMessage;

    fn test_config(root: &Path) -> Config {
        let toml_src = format!(
            r#"
[store.postgres]
url = "postgres://localhost/test"

[workspace]
root = "{}"
agent_id = "a"
"#,
            root.display()
        );
        toml::from_str(&toml_src).unwrap()
    }

    #[test]
    fn memory_walk_accepts_layout_and_rejects_non_markdown() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::write(root.join("MEMORY.md"), "index file").unwrap();
        std::fs::create_dir(root.join("memory")).unwrap();
        std::fs::write(root.join("memory/2024-06-01.md"), "daily note").unwrap();
        std::fs::write(root.join("memory/raw.txt"), "not markdown").unwrap();
        std::fs::write(root.join("unrelated.md"), "outside layout").unwrap();

        let entries = enumerate_memory(&test_config(root)).unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["MEMORY.md", "memory/2024-06-01.md"]);
        assert_eq!(entries[0].role, ChunkRole::System);
        assert_eq!(entries[0].actor_id, "agent:a");
    }

    #[cfg(unix)]
    #[test]
    fn memory_walk_rejects_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::create_dir(root.join("memory")).unwrap();
        std::fs::write(root.join("memory/real.md"), "real").unwrap();
        std::os::unix::fs::symlink(root.join("memory/real.md"), root.join("memory/link.md"))
            .unwrap();

        let entries = enumerate_memory(&test_config(root)).unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["memory/real.md"]);
    }

    #[test]
    fn session_chunks_inherit_message_identity() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let entry = FileEntry {
            path: "sessions/s1.jsonl".to_string(),
            source: Source::Sessions,
            session_key: Some("agent:a:tg:direct:7".to_string()),
            hash: "h".to_string(),
            mtime: 0,
            size: 0,
            content: String::new(),
            role: ChunkRole::User,
            actor_type: ActorType::Human,
            actor_id: "agent:a".to_string(),
            user_actor_id: Some("tg:+1234".to_string()),
            messages: vec![
                SessionMessage {
                    role: ChunkRole::User,
                    text: "alpha bravo".to_string(),
                    message_id: "s1#0".to_string(),
                    created_at: Some(1_717_243_200_000),
                },
                SessionMessage {
                    role: ChunkRole::Assistant,
                    text: "charlie".to_string(),
                    message_id: "s1#1".to_string(),
                    created_at: None,
                },
            ],
        };

        let records = chunk_entry(&config, &entry);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message_id.as_deref(), Some("s1#0"));
        assert_eq!(records[0].message_created_at, Some(1_717_243_200_000));
        assert_eq!(records[0].role, ChunkRole::User);
        assert_eq!(records[0].actor_type, ActorType::Human);
        assert_eq!(records[0].actor_id, "tg:+1234");
        assert_eq!(records[1].message_id.as_deref(), Some("s1#1"));
        assert_eq!(records[1].actor_type, ActorType::Agent);
        assert_eq!(records[1].actor_id, "agent:a");
        for record in &records {
            assert_eq!(record.session_key.as_deref(), Some("agent:a:tg:direct:7"));
            assert!(record.start_line <= record.end_line);
        }
    }

    #[test]
    fn memory_chunks_carry_system_role() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let entry = FileEntry {
            path: "MEMORY.md".to_string(),
            source: Source::Memory,
            session_key: None,
            hash: "h".to_string(),
            mtime: 0,
            size: 0,
            content: "line one\nline two".to_string(),
            role: ChunkRole::System,
            actor_type: ActorType::Agent,
            actor_id: "agent:a".to_string(),
            user_actor_id: None,
            messages: Vec::new(),
        };
        let records = chunk_entry(&config, &entry);
        assert!(!records.is_empty());
        for record in &records {
            assert_eq!(record.role, ChunkRole::System);
            assert_eq!(record.message_id, None);
        }
    }
}
