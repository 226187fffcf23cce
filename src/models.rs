//! Core data types used throughout the memory index.
//!
//! These types represent the files, chunks, and search results that flow
//! through the indexing and retrieval pipeline. The data lifecycle is:
//!
//! ```text
//! workspace / transcripts → FileEntry → chunk() → ChunkRecord
//!                                           ↓
//!                                      embed() → pgvector column
//!                                           ↓
//!                                     search() → SearchHit
//! ```
//!
//! A **[`FileEntry`]** is produced by the indexer's walk before any diffing
//! or storage. A **[`ChunkRecord`]** is the stored, line-anchored unit of
//! embedding and search. A **[`SearchHit`]** is returned by the retriever
//! with a fused relevance score and snippet.

use serde::{Deserialize, Serialize};

/// Which family a row was indexed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Markdown memory files inside the agent workspace.
    Memory,
    /// JSONL session transcripts.
    Sessions,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Memory => "memory",
            Source::Sessions => "sessions",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "memory" => Some(Source::Memory),
            "sessions" => Some(Source::Sessions),
            _ => None,
        }
    }
}

/// Role attached to a chunk. `System` only ever appears on memory files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkRole {
    User,
    Assistant,
    System,
}

impl ChunkRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkRole::User => "user",
            ChunkRole::Assistant => "assistant",
            ChunkRole::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(ChunkRole::User),
            "assistant" => Some(ChunkRole::Assistant),
            "system" => Some(ChunkRole::System),
            _ => None,
        }
    }
}

/// Whether the actor behind a chunk is a person or the agent itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorType {
    Human,
    Agent,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::Human => "human",
            ActorType::Agent => "agent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "human" => Some(ActorType::Human),
            "agent" => Some(ActorType::Agent),
            _ => None,
        }
    }
}

/// Conversation shape reported by the channel for the ambient session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Direct,
    Group,
}

/// Privacy scope a query runs under.
///
/// | Scope | Session rows | Memory files |
/// |---|---|---|
/// | `Session` | this `session_key` only | excluded |
/// | `Actor` | this actor only | included |
/// | `Global` | all | included |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionScope {
    Session,
    Actor,
    Global,
}

/// Retrieval strategy for a single query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Hybrid,
    Vector,
    Keyword,
}

/// One message extracted from a session transcript.
///
/// Each message is chunked independently; every derived chunk inherits the
/// message's role, actor, `message_id`, and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionMessage {
    pub role: ChunkRole,
    pub text: String,
    /// Synthetic id assigned at index time, stable within one transcript pass.
    pub message_id: String,
    /// Milliseconds since epoch, when the event carried a usable timestamp.
    pub created_at: Option<i64>,
}

/// A candidate file discovered by the indexer's walk, before diffing.
///
/// For transcripts, `content` is the normalized role-labelled text the
/// file-level hash is computed over, and `messages` holds the parsed
/// messages that will be chunked individually.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Relative, forward-slash path.
    pub path: String,
    pub source: Source,
    pub session_key: Option<String>,
    /// Aggregate content hash deciding re-indexing.
    pub hash: String,
    pub mtime: i64,
    pub size: i64,
    pub content: String,
    pub role: ChunkRole,
    pub actor_type: ActorType,
    /// Owning actor: the agent for memory files and assistant messages.
    pub actor_id: String,
    /// Resolved counterparty for user-message chunks in transcripts.
    pub user_actor_id: Option<String>,
    /// Parsed messages for `source = sessions`; empty for memory files.
    pub messages: Vec<SessionMessage>,
}

impl FileEntry {
    /// Actor id for user-message chunks; `unknown` when the session store
    /// could not resolve the counterparty.
    pub fn user_actor_id(&self) -> String {
        self.user_actor_id
            .clone()
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// A stored file row, used for hash diffing between syncs.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FileRecord {
    pub path: String,
    pub source: String,
    pub hash: String,
}

/// A chunk ready for insertion, embedding attached by the indexer.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: String,
    pub path: String,
    pub source: Source,
    pub session_key: Option<String>,
    pub role: ChunkRole,
    pub actor_type: ActorType,
    pub actor_id: String,
    pub message_id: Option<String>,
    pub message_created_at: Option<i64>,
    /// 1-based, inclusive.
    pub start_line: i32,
    pub end_line: i32,
    /// SHA-256 hex of the exact chunk text.
    pub hash: String,
    pub text: String,
}

/// The embedding-identity singleton persisted in `memory_meta`.
///
/// A mismatch on anything except `vector_dims` forces a full rebuild:
/// chunks, file records, and cache rows are purged before the next sync.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaSnapshot {
    pub model: String,
    pub provider: String,
    pub provider_key: String,
    pub chunk_tokens: usize,
    pub chunk_overlap: usize,
    pub vector_dims: Option<i32>,
}

impl MetaSnapshot {
    /// True when the embedding identity and chunk parameters match; dims are
    /// recorded lazily and never force a rebuild on their own.
    pub fn identity_matches(&self, other: &MetaSnapshot) -> bool {
        self.model == other.model
            && self.provider == other.provider
            && self.provider_key == other.provider_key
            && self.chunk_tokens == other.chunk_tokens
            && self.chunk_overlap == other.chunk_overlap
    }
}

/// A lookup result: one actor with its best alias evidence.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorMatch {
    pub actor_id: String,
    pub actor_type: String,
    pub display_name: Option<String>,
    pub confidence: f64,
    pub aliases: Vec<String>,
}

/// A search result produced by the retriever.
///
/// `score` is the fused score; the per-signal scores are kept for tie
/// breaking and for the hybrid fusion tests.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub path: String,
    pub source: String,
    pub start_line: i32,
    pub end_line: i32,
    pub score: f64,
    pub snippet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citation: Option<String>,
    #[serde(skip)]
    pub vector_score: f64,
    #[serde(skip)]
    pub text_score: f64,
}
