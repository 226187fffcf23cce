//! Per-agent memory manager and the process-wide registry.
//!
//! A manager owns the store pool, the resolved embedding provider, and the
//! sync coordinator for one agent. Reads never block sync: they issue
//! their own pool queries. The registry replaces ad-hoc global caches
//! with explicit per-agent objects and a teardown pathway.

use anyhow::Result;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::db;
use crate::embedding::Embedder;
use crate::index::IndexCore;
use crate::migrate;
use crate::sync::SyncCoordinator;

pub struct MemoryManager {
    core: Arc<IndexCore>,
    coordinator: Arc<SyncCoordinator>,
}

impl MemoryManager {
    /// Resolve the embedding provider, open the pool, and run migrations.
    /// This is the one place initialization-time misconfiguration surfaces
    /// as a hard failure; afterwards errors are absorbed into envelopes.
    pub async fn connect(config: Config) -> Result<Arc<Self>> {
        let embedder = Embedder::new(&config.embedding)?;
        let pool = db::connect(&config).await?;
        migrate::run_migrations(&pool, &config).await?;

        let core = Arc::new(IndexCore {
            pool,
            config,
            embedder,
            cancelled: AtomicBool::new(false),
        });
        let coordinator = SyncCoordinator::new(core.clone());
        Ok(Arc::new(Self { core, coordinator }))
    }

    pub fn pool(&self) -> &PgPool {
        &self.core.pool
    }

    pub fn config(&self) -> &Config {
        &self.core.config
    }

    pub fn embedder(&self) -> &Embedder {
        &self.core.embedder
    }

    pub fn core(&self) -> &Arc<IndexCore> {
        &self.core
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    /// Stop accepting new per-file work and release the pool. In-flight
    /// transactions run to completion; subsequent steps observe the
    /// cancellation flag and abort.
    pub async fn close(&self) {
        self.core.cancelled.store(true, Ordering::SeqCst);
        self.core.pool.close().await;
    }
}

static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<MemoryManager>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, Arc<MemoryManager>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Get or create the manager for the config's agent id.
pub async fn manager_for(config: &Config) -> Result<Arc<MemoryManager>> {
    let agent_id = config.workspace.agent_id.clone();
    let mut managers = registry().lock().await;
    if let Some(manager) = managers.get(&agent_id) {
        return Ok(manager.clone());
    }
    let manager = MemoryManager::connect(config.clone()).await?;
    managers.insert(agent_id, manager.clone());
    Ok(manager)
}

/// Tear down every registered manager; used on process shutdown.
pub async fn close_all() {
    let managers: Vec<Arc<MemoryManager>> = {
        let mut registry = registry().lock().await;
        registry.drain().map(|(_, manager)| manager).collect()
    };
    for manager in managers {
        manager.close().await;
    }
}
