//! # Memory Harness CLI (`mem`)
//!
//! The `mem` binary is the operational interface to the memory index. It
//! provides commands for schema initialization, index syncing, search,
//! recall, file retrieval, actor lookup, stats, and the HTTP tool server.
//!
//! ## Usage
//!
//! ```bash
//! mem --config ./config/mem.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mem init` | Create tables, indexes, and the vector extension |
//! | `mem sync` | Index workspace memory files and session transcripts |
//! | `mem search "<query>"` | Search indexed chunks |
//! | `mem recall "<query>" --hours 48` | Time-bounded recall |
//! | `mem get <path>` | Read a workspace markdown file |
//! | `mem actors "<query>"` | Look up actors by name or alias |
//! | `mem stats` | Index counts and embedding coverage |
//! | `mem serve mcp` | Start the HTTP tool server |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use memory_harness::config;
use memory_harness::index;
use memory_harness::manager;
use memory_harness::models::{ActorType, ChunkRole, SearchMode, SessionScope};
use memory_harness::progress::ProgressMode;
use memory_harness::server;
use memory_harness::stats;
use memory_harness::tools::{
    AbortFlag, GetRequest, LookupRequest, MemoryTools, RecallRequest, SearchRequest,
};

/// Memory Harness — a persistent hybrid memory index for long-running
/// conversational agents.
#[derive(Parser)]
#[command(
    name = "mem",
    about = "Persistent hybrid memory index for conversational agents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/mem.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the store schema. Idempotent.
    Init,

    /// Index memory files and session transcripts.
    Sync {
        /// Reason recorded in logs (manual, session-start, search).
        #[arg(long, default_value = "manual")]
        reason: String,

        /// Emit progress as JSON lines on stderr.
        #[arg(long)]
        json_progress: bool,
    },

    /// Search indexed chunks.
    Search {
        query: String,

        /// Search mode: hybrid, vector, or keyword.
        #[arg(long, default_value = "hybrid")]
        mode: String,

        /// Scope override: session, actor, or global.
        #[arg(long)]
        scope: Option<String>,

        /// Ambient session key.
        #[arg(long)]
        session: Option<String>,

        /// Restrict to one actor id.
        #[arg(long)]
        actor: Option<String>,

        /// Restrict to an actor type: human or agent.
        #[arg(long)]
        actor_type: Option<String>,

        /// Restrict to a role: user, assistant, or system.
        #[arg(long)]
        role: Option<String>,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,

        /// Minimum fused score.
        #[arg(long)]
        min_score: Option<f64>,
    },

    /// Search bounded to the trailing time window.
    Recall {
        query: String,

        /// Window size in hours.
        #[arg(long, default_value_t = 24.0)]
        hours: f64,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Read a markdown file from the workspace.
    Get {
        path: String,

        /// 1-based first line of the slice.
        #[arg(long)]
        from: Option<usize>,

        /// Number of lines to return.
        #[arg(long)]
        lines: Option<usize>,
    },

    /// Look up actors by display name or alias.
    Actors {
        query: String,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show index counts and embedding coverage.
    Stats,

    /// Serve the memory tools over HTTP.
    Serve {
        #[command(subcommand)]
        service: ServeService,
    },
}

#[derive(Subcommand)]
enum ServeService {
    /// Start the MCP-style tool server.
    Mcp,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "memory_harness=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = memory_harness::db::connect(&cfg).await?;
            memory_harness::migrate::run_migrations(&pool, &cfg).await?;
            pool.close().await;
            println!("Store initialized successfully.");
        }
        Commands::Sync {
            reason,
            json_progress,
        } => {
            let manager = manager::manager_for(&cfg).await?;
            let mode = if json_progress {
                ProgressMode::Json
            } else {
                ProgressMode::default_for_tty()
            };
            let reporter = mode.reporter();
            let report = index::sync_all(manager.core(), reporter.as_ref()).await?;
            println!("sync ({})", reason);
            println!("  indexed:   {} files", report.files_indexed);
            println!("  unchanged: {} files", report.files_unchanged);
            println!("  removed:   {} files", report.files_removed);
            println!("  chunks:    {}", report.chunks_written);
            println!(
                "  embeddings: {} requested, {} cache hits",
                report.embeds_requested, report.cache_hits
            );
            if report.rebuilt {
                println!("  full rebuild: embedding identity changed");
            }
            for (source, files, chunks) in &report.source_counts {
                println!("  {}: {} files, {} chunks", source, files, chunks);
            }
            if report.dirty {
                println!("  warning: some files failed and were left stale");
            }
            manager::close_all().await;
        }
        Commands::Search {
            query,
            mode,
            scope,
            session,
            actor,
            actor_type,
            role,
            limit,
            min_score,
        } => {
            let manager = manager::manager_for(&cfg).await?;
            let tools = MemoryTools::new(manager.clone());
            let req = SearchRequest {
                query,
                mode: parse_mode(&mode)?,
                max_results: limit,
                min_score,
                session_scope: parse_scope(scope.as_deref())?,
                actor_type: parse_actor_type(actor_type.as_deref())?,
                actor_id: actor,
                role: parse_role(role.as_deref())?,
                session_key: session,
                ..Default::default()
            };
            let envelope = tools.memory_search(req, &AbortFlag::new()).await;
            print_search_envelope(&serde_json::to_value(&envelope)?);
            manager::close_all().await;
        }
        Commands::Recall {
            query,
            hours,
            limit,
        } => {
            let manager = manager::manager_for(&cfg).await?;
            let tools = MemoryTools::new(manager.clone());
            let req = RecallRequest {
                search: SearchRequest {
                    query,
                    max_results: limit,
                    ..Default::default()
                },
                time_window_hours: Some(hours),
            };
            let envelope = tools.memory_recall(req, &AbortFlag::new()).await;
            print_search_envelope(&serde_json::to_value(&envelope)?);
            manager::close_all().await;
        }
        Commands::Get { path, from, lines } => {
            let manager = manager::manager_for(&cfg).await?;
            let tools = MemoryTools::new(manager.clone());
            let envelope = tools
                .memory_get(GetRequest { path, from, lines }, &AbortFlag::new())
                .await;
            match (envelope.text, envelope.error) {
                (Some(text), _) => println!("{}", text),
                (None, Some(error)) => {
                    eprintln!("Error: {}", error);
                    std::process::exit(1);
                }
                _ => {}
            }
            manager::close_all().await;
        }
        Commands::Actors { query, limit } => {
            let manager = manager::manager_for(&cfg).await?;
            let tools = MemoryTools::new(manager.clone());
            let envelope = tools
                .actor_lookup(LookupRequest { query, limit }, &AbortFlag::new())
                .await;
            if let Some(error) = envelope.error {
                eprintln!("Error: {}", error);
                std::process::exit(1);
            }
            if envelope.actors.is_empty() {
                println!("No actors.");
            }
            for actor in envelope.actors {
                println!(
                    "{}  [{}]  {}  (confidence {:.2})",
                    actor.actor_id,
                    actor.actor_type,
                    actor.display_name.as_deref().unwrap_or("(unnamed)"),
                    actor.confidence
                );
                if !actor.aliases.is_empty() {
                    println!("    aliases: {}", actor.aliases.join(", "));
                }
            }
            manager::close_all().await;
        }
        Commands::Stats => {
            let manager = manager::manager_for(&cfg).await?;
            let collected = stats::collect_stats(manager.pool()).await?;
            print!("{}", stats::render_stats(&collected));
            manager::close_all().await;
        }
        Commands::Serve { service } => match service {
            ServeService::Mcp => {
                let manager = manager::manager_for(&cfg).await?;
                server::run_server(manager).await?;
            }
        },
    }

    Ok(())
}

fn parse_mode(s: &str) -> anyhow::Result<Option<SearchMode>> {
    match s {
        "hybrid" => Ok(Some(SearchMode::Hybrid)),
        "vector" => Ok(Some(SearchMode::Vector)),
        "keyword" => Ok(Some(SearchMode::Keyword)),
        other => anyhow::bail!("Unknown search mode: {}. Use hybrid, vector, or keyword.", other),
    }
}

fn parse_scope(s: Option<&str>) -> anyhow::Result<Option<SessionScope>> {
    match s {
        None => Ok(None),
        Some("session") => Ok(Some(SessionScope::Session)),
        Some("actor") => Ok(Some(SessionScope::Actor)),
        Some("global") => Ok(Some(SessionScope::Global)),
        Some(other) => anyhow::bail!("Unknown scope: {}. Use session, actor, or global.", other),
    }
}

fn parse_actor_type(s: Option<&str>) -> anyhow::Result<Option<ActorType>> {
    match s {
        None => Ok(None),
        Some(value) => ActorType::parse(value)
            .map(Some)
            .ok_or_else(|| anyhow::anyhow!("Unknown actor type: {}. Use human or agent.", value)),
    }
}

fn parse_role(s: Option<&str>) -> anyhow::Result<Option<ChunkRole>> {
    match s {
        None => Ok(None),
        Some(value) => ChunkRole::parse(value).map(Some).ok_or_else(|| {
            anyhow::anyhow!("Unknown role: {}. Use user, assistant, or system.", value)
        }),
    }
}

fn print_search_envelope(envelope: &serde_json::Value) {
    let results = envelope
        .get("results")
        .and_then(|r| r.as_array())
        .cloned()
        .unwrap_or_default();

    if let Some(error) = envelope.get("error").and_then(|e| e.as_str()) {
        eprintln!("Error: {}", error);
    }
    if results.is_empty() {
        println!("No results.");
        return;
    }
    for (i, hit) in results.iter().enumerate() {
        let path = hit.get("path").and_then(|v| v.as_str()).unwrap_or("");
        let score = hit.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let start = hit.get("startLine").and_then(|v| v.as_i64()).unwrap_or(0);
        let end = hit.get("endLine").and_then(|v| v.as_i64()).unwrap_or(0);
        let snippet = hit.get("snippet").and_then(|v| v.as_str()).unwrap_or("");
        println!("{}. [{:.3}] {}:{}-{}", i + 1, score, path, start, end);
        println!("    {}", snippet.replace('\n', " "));
    }
}
