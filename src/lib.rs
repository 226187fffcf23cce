//! # Memory Harness
//!
//! **A persistent hybrid memory index for long-running conversational agents.**
//!
//! Memory Harness ingests two source families — markdown memory files in an
//! agent workspace and JSONL session transcripts — chunks and embeds them,
//! persists full-text and vector representations in Postgres (pgvector),
//! and serves hybrid keyword + vector search with session, actor, and time
//! scoping through four agent-facing tools.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Workspace   │──▶│   Indexer    │──▶│   Postgres   │
//! │ md + jsonl   │   │ chunk+embed  │   │ tsvector+vec │
//! └──────────────┘   └──────────────┘   └──────┬───────┘
//!                                              │
//!                         ┌────────────────────┤
//!                         ▼                    ▼
//!                    ┌─────────┐        ┌────────────┐
//!                    │   CLI   │        │ Tool server│
//!                    │  (mem)  │        │   (HTTP)   │
//!                    └─────────┘        └────────────┘
//! ```
//!
//! ## Data flow
//!
//! 1. The **indexer** ([`index`]) walks memory files and transcripts,
//!    diffs aggregate content hashes, and re-indexes only what changed.
//! 2. The **chunker** ([`chunk`]) splits text into line-anchored,
//!    overlapping chunks with stable SHA-256 hashes.
//! 3. The **embedding provider** ([`embedding`]) embeds chunk batches
//!    through a fallback chain; the **cache** ([`cache`]) deduplicates by
//!    chunk hash under a per-provider fingerprint.
//! 4. The **scope resolver** ([`scope`]) maps each query's ambient context
//!    to a privacy filter set; the **retriever** ([`search`]) runs
//!    keyword, vector, or fused hybrid retrieval under it.
//! 5. The **tool surface** ([`tools`]) exposes `memory_search`,
//!    `memory_recall`, `memory_get`, and `actor_lookup` envelopes to the
//!    agent, via the CLI (`mem`) or the HTTP server ([`server`]).
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types: chunks, files, actors, search hits |
//! | [`chunk`] | Line-anchored overlapping chunker |
//! | [`extract`] | JSONL transcript → messages |
//! | [`embedding`] | Provider trait, openai/gemini/local, fingerprinting |
//! | [`cache`] | Read-through embedding cache keyed by fingerprint |
//! | [`db`] | Postgres pool with schema-pinned connections |
//! | [`migrate`] | Idempotent schema bootstrap and the meta guard |
//! | [`index`] | Incremental, per-file-transactional indexer |
//! | [`actors`] | Actor directory built from the session store |
//! | [`scope`] | Pure query-scope resolver |
//! | [`search`] | Keyword / vector / hybrid retrieval and fusion |
//! | [`recency`] | Time-window hints from context file paths |
//! | [`sync`] | Sync dedup, session warm-up, dirty tracking |
//! | [`manager`] | Per-agent manager and process-wide registry |
//! | [`stats`] | Index counts and coverage |
//! | [`progress`] | Sync progress reporting |
//! | [`tools`] | The four agent-facing tool operations |
//! | [`server`] | HTTP tool endpoints (axum) |

pub mod actors;
pub mod cache;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod index;
pub mod manager;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod recency;
pub mod scope;
pub mod search;
pub mod server;
pub mod stats;
pub mod sync;
pub mod tools;
