use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::models::Source;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub store: StoreConfig,
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default = "default_sources")]
    pub sources: Vec<String>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub citations: CitationsConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_driver")]
    pub driver: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub vector: VectorConfig,
}

/// Either a full connection `url` or the component fields.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct PostgresConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    /// Agent workspace root holding MEMORY.md / memory/.
    pub root: PathBuf,
    /// Stable agent identifier; agent actors are `agent:<id>`.
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    /// Directory of `<session_id>.jsonl` transcripts.
    /// Defaults to `<root>/sessions`.
    #[serde(default)]
    pub sessions_dir: Option<PathBuf>,
    /// Session store snapshot (session_key → origin/channel entry).
    /// Defaults to `<sessions_dir>/sessions.json`.
    #[serde(default)]
    pub session_store: Option<PathBuf>,
    /// Additional markdown files or directories searchable by memory_get.
    #[serde(default)]
    pub extra_paths: Vec<PathBuf>,
}

impl WorkspaceConfig {
    pub fn sessions_dir(&self) -> PathBuf {
        self.sessions_dir
            .clone()
            .unwrap_or_else(|| self.root.join("sessions"))
    }

    pub fn session_store(&self) -> PathBuf {
        self.session_store
            .clone()
            .unwrap_or_else(|| self.sessions_dir().join("sessions.json"))
    }

    pub fn agent_actor_id(&self) -> String {
        format!("agent:{}", self.agent_id)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_tokens")]
    pub tokens: usize,
    #[serde(default = "default_chunk_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            tokens: default_chunk_tokens(),
            overlap: default_chunk_overlap(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `openai`, `gemini`, or `local`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Provider tried when the requested one fails to initialize.
    #[serde(default)]
    pub fallback: Option<String>,
    #[serde(default)]
    pub remote: RemoteEmbeddingConfig,
    #[serde(default)]
    pub local: LocalEmbeddingConfig,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            fallback: None,
            remote: RemoteEmbeddingConfig::default(),
            local: LocalEmbeddingConfig::default(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RemoteEmbeddingConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Extra headers sent with every request; part of the provider
    /// fingerprint, so changing them invalidates cached vectors.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LocalEmbeddingConfig {
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Total character budget across returned snippets; unset = unlimited.
    #[serde(default)]
    pub char_budget: Option<usize>,
    #[serde(default)]
    pub hybrid: HybridConfig,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            min_score: default_min_score(),
            max_results: default_max_results(),
            char_budget: None,
            hybrid: HybridConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HybridConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: f64,
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_text_weight")]
    pub text_weight: f64,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            candidate_multiplier: default_candidate_multiplier(),
            vector_weight: default_vector_weight(),
            text_weight: default_text_weight(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_cache_max_entries(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_true")]
    pub on_session_start: bool,
    #[serde(default = "default_true")]
    pub on_search: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            on_session_start: true,
            on_search: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CitationsConfig {
    #[serde(default)]
    pub mode: CitationsMode,
}

/// `auto` turns citations on for direct chats and off otherwise.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CitationsMode {
    On,
    Off,
    #[default]
    Auto,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionsConfig {
    /// Index session transcripts only when set; mirrors the
    /// `experimental.sessionMemory` switch of the agent runtime.
    #[serde(default = "default_true")]
    pub session_memory: bool,
    /// Only the most recent N messages of a transcript are indexed
    /// (0 = unlimited).
    #[serde(default)]
    pub recent_window_messages: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            session_memory: true,
            recent_window_messages: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_driver() -> String {
    "postgres".to_string()
}
fn default_schema() -> String {
    "public".to_string()
}
fn default_max_connections() -> u32 {
    5
}
fn default_agent_id() -> String {
    "main".to_string()
}
fn default_chunk_tokens() -> usize {
    400
}
fn default_chunk_overlap() -> usize {
    80
}
fn default_provider() -> String {
    "openai".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_min_score() -> f64 {
    0.0
}
fn default_max_results() -> usize {
    12
}
fn default_candidate_multiplier() -> f64 {
    4.0
}
fn default_vector_weight() -> f64 {
    0.6
}
fn default_text_weight() -> f64 {
    0.4
}
fn default_cache_max_entries() -> usize {
    100_000
}
fn default_bind() -> String {
    "127.0.0.1:7343".to_string()
}
fn default_true() -> bool {
    true
}
fn default_sources() -> Vec<String> {
    vec!["memory".to_string(), "sessions".to_string()]
}

impl Config {
    /// Sources to index, in declaration order. Validated at load time, so
    /// this never fails after construction.
    pub fn source_kinds(&self) -> Vec<Source> {
        self.sources
            .iter()
            .filter_map(|s| Source::parse(s))
            .filter(|s| *s != Source::Sessions || self.sessions.session_memory)
            .collect()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.store.driver != "postgres" {
        anyhow::bail!(
            "Unknown store driver: '{}'. Only postgres is supported.",
            config.store.driver
        );
    }

    if config.store.postgres.url.is_none() && config.store.postgres.database.is_none() {
        anyhow::bail!("store.postgres requires either url or host/database fields");
    }

    if config.chunking.tokens == 0 {
        anyhow::bail!("chunking.tokens must be > 0");
    }

    if config.sources.is_empty() {
        anyhow::bail!("sources must not be empty");
    }
    for source in &config.sources {
        if Source::parse(source).is_none() {
            anyhow::bail!(
                "Unknown source: '{}'. Available: memory, sessions",
                source
            );
        }
    }

    match config.embedding.provider.as_str() {
        "openai" | "gemini" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be openai, gemini, or local.",
            other
        ),
    }
    if let Some(fallback) = &config.embedding.fallback {
        match fallback.as_str() {
            "openai" | "gemini" | "local" => {}
            other => anyhow::bail!("Unknown fallback provider: '{}'", other),
        }
    }

    if config.query.max_results == 0 {
        anyhow::bail!("query.max_results must be >= 1");
    }
    if config.query.hybrid.candidate_multiplier < 1.0 {
        anyhow::bail!("query.hybrid.candidate_multiplier must be >= 1.0");
    }
    if config.query.hybrid.vector_weight < 0.0 || config.query.hybrid.text_weight < 0.0 {
        anyhow::bail!("query.hybrid weights must be >= 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    const MINIMAL: &str = r#"
[store.postgres]
url = "postgres://localhost/memdex"

[workspace]
root = "/tmp/ws"
"#;

    #[test]
    fn minimal_config_loads_with_defaults() {
        let config = parse(MINIMAL).unwrap();
        assert_eq!(config.store.schema, "public");
        assert_eq!(config.chunking.tokens, 400);
        assert_eq!(config.chunking.overlap, 80);
        assert!(config.query.hybrid.enabled);
        assert_eq!(config.sources, vec!["memory", "sessions"]);
        assert_eq!(config.citations.mode, CitationsMode::Auto);
    }

    #[test]
    fn empty_sources_rejected() {
        let src = format!("{}\nsources = []\n", MINIMAL);
        assert!(parse(&src).is_err());
    }

    #[test]
    fn unknown_source_rejected() {
        let src = format!("{}\nsources = [\"emails\"]\n", MINIMAL);
        assert!(parse(&src).is_err());
    }

    #[test]
    fn unknown_provider_rejected() {
        let src = format!("{}\n[embedding]\nprovider = \"cohere\"\n", MINIMAL);
        assert!(parse(&src).is_err());
    }

    #[test]
    fn session_memory_switch_drops_sessions_source() {
        let src = format!("{}\n[sessions]\nsession_memory = false\n", MINIMAL);
        let config = parse(&src).unwrap();
        assert_eq!(config.source_kinds(), vec![Source::Memory]);
    }
}
