//! Sync coordination.
//!
//! Serializes index syncs to a single in-flight future per manager:
//! concurrent callers await the same shared future instead of racing the
//! walk. Session warm-ups are fire-and-forget tasks whose failures are
//! logged and dropped, de-duplicated per session key for 60 seconds.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::index::{self, IndexCore, SyncReport};
use crate::progress::NoProgress;

/// Sessions are warmed at most once per this interval.
const WARM_TTL: Duration = Duration::from_secs(60);

/// Cloneable sync error so every waiter on the shared future gets one.
#[derive(Debug, Clone)]
pub struct SyncFailure(pub Arc<anyhow::Error>);

impl fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for SyncFailure {}

type SharedSync = Shared<BoxFuture<'static, Result<SyncReport, SyncFailure>>>;

struct InFlight {
    generation: u64,
    future: SharedSync,
}

/// Deduplicates concurrent syncs and owns the warmed-session set.
pub struct SyncCoordinator {
    core: Arc<IndexCore>,
    in_flight: Mutex<Option<InFlight>>,
    generation: AtomicU64,
    warmed: StdMutex<HashMap<String, Instant>>,
    /// Set when a sync left files stale or before the first sync completes.
    dirty: AtomicBool,
}

impl SyncCoordinator {
    pub fn new(core: Arc<IndexCore>) -> Arc<Self> {
        Arc::new(Self {
            core,
            in_flight: Mutex::new(None),
            generation: AtomicU64::new(0),
            warmed: StdMutex::new(HashMap::new()),
            dirty: AtomicBool::new(true),
        })
    }

    /// Run a sync, or join the one already running. Idempotent under
    /// concurrency: all callers of an in-flight sync receive its result.
    pub async fn sync(&self, reason: &str) -> Result<SyncReport, SyncFailure> {
        let (future, generation) = {
            let mut guard = self.in_flight.lock().await;
            match guard.as_ref() {
                Some(running) => (running.future.clone(), running.generation),
                None => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let core = self.core.clone();
                    let reason = reason.to_string();
                    let future: SharedSync = async move {
                        debug!(reason = %reason, "memory sync started");
                        index::sync_all(&core, &NoProgress)
                            .await
                            .map_err(|e| SyncFailure(Arc::new(e)))
                    }
                    .boxed()
                    .shared();
                    *guard = Some(InFlight {
                        generation,
                        future: future.clone(),
                    });
                    (future, generation)
                }
            }
        };

        let result = future.await;

        {
            let mut guard = self.in_flight.lock().await;
            if guard
                .as_ref()
                .map(|running| running.generation == generation)
                .unwrap_or(false)
            {
                *guard = None;
            }
        }

        match &result {
            Ok(report) => self.dirty.store(report.dirty, Ordering::SeqCst),
            Err(_) => self.dirty.store(true, Ordering::SeqCst),
        }
        result
    }

    /// Fire-and-forget sync at session start. Each session key is warmed
    /// at most once per minute; the task must not keep the process alive,
    /// so its failure is logged and dropped.
    pub fn warm_session(self: &Arc<Self>, session_key: &str) {
        if !self.core.config.sync.on_session_start {
            return;
        }
        {
            let mut warmed = self.warmed.lock().expect("warmed set poisoned");
            let now = Instant::now();
            warmed.retain(|_, inserted| now.duration_since(*inserted) < WARM_TTL);
            if warmed.contains_key(session_key) {
                return;
            }
            warmed.insert(session_key.to_string(), now);
        }

        let coordinator = Arc::clone(self);
        let session_key = session_key.to_string();
        tokio::spawn(async move {
            if let Err(e) = coordinator.sync("session-start").await {
                warn!(session_key = %session_key, error = %e, "session warm-up sync failed");
            }
        });
    }

    /// Called by the tool surface before a search: when the index is
    /// dirty, kick off a background sync and let the search proceed
    /// against current state.
    pub fn note_search(self: &Arc<Self>) {
        if !self.core.config.sync.on_search {
            return;
        }
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return;
        }
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = coordinator.sync("search").await {
                warn!(error = %e, "background sync failed");
            }
        });
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }
}
