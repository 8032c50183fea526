//! Snapshot cache manager.
//!
//! Three tiers answer a snapshot list request: a TTL-bounded memory cache,
//! the persisted store, and a full sync through the gateway. Background
//! flows (stats backfill, delta check) then fill in what is missing. Only
//! results for the active repository reach the displayed state.

mod clock;
pub mod events;
pub mod loading;
mod memory;
mod slots;
mod sync;

pub use clock::{Clock, SystemClock};
pub use events::{EngineEvent, EventBroadcaster};
pub use loading::LoadingState;
pub use memory::RepositoryCache;
pub use sync::{BackfillOutcome, DeltaOutcome};

use crate::config::CacheConfig;
use crate::connections::RepositoryConnection;
use crate::error::CoreError;
use crate::gateway::BackupGateway;
use crate::models::{Snapshot, SnapshotRecord, SnapshotStats};
use crate::session::SessionRegistry;
use crate::store::SnapshotStore;
use crate::Result;
use loading::LoadingTracker;
use memory::{missing_stats, MemoryCache};
use serde::Serialize;
use slots::TaskSlots;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// What the UI renders for the active repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayState {
    pub repo_id: Option<String>,
    /// Newest first.
    pub snapshots: Vec<SnapshotRecord>,
    pub loading: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadSource {
    MemoryCache,
    PersistedStore,
    FullSync,
    /// A full sync started by an earlier call is still running.
    SyncInProgress,
}

#[derive(Debug)]
pub struct LoadOutcome {
    pub repo_id: String,
    pub count: usize,
    pub source: LoadSource,
    /// Backfill and delta check spawned for cached results.
    pub background: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct SnapshotCacheManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: CacheConfig,
    gateway: Arc<dyn BackupGateway>,
    store: Arc<dyn SnapshotStore>,
    clock: Arc<dyn Clock>,
    session: SessionRegistry,
    memory: MemoryCache,
    slots: Arc<TaskSlots>,
    loading: LoadingTracker,
    events: EventBroadcaster,
    display: watch::Sender<DisplayState>,
    shutdown: CancellationToken,
}

impl SnapshotCacheManager {
    pub fn new(config: CacheConfig, gateway: Arc<dyn BackupGateway>, store: Arc<dyn SnapshotStore>) -> Self {
        Self::with_clock(config, gateway, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: CacheConfig,
        gateway: Arc<dyn BackupGateway>,
        store: Arc<dyn SnapshotStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let events = EventBroadcaster::new();
        let shutdown = CancellationToken::new();
        let (display, _) = watch::channel(DisplayState::default());

        Self {
            inner: Arc::new(Inner {
                config,
                gateway,
                store,
                clock,
                session: SessionRegistry::new(),
                memory: MemoryCache::new(),
                slots: Arc::new(TaskSlots::new(shutdown.clone())),
                loading: LoadingTracker::new(events.clone()),
                events,
                display,
                shutdown,
            }),
        }
    }

    /// Makes `conn`'s repository active and shows its snapshots from the
    /// cheapest tier that has them. A cold start runs the full sync inline.
    pub async fn load_snapshots(&self, conn: &RepositoryConnection) -> Result<LoadOutcome> {
        self.load(conn, false).await
    }

    /// Drops the memory entry, cancels background work and reloads with a
    /// delta check that ignores the interval.
    pub async fn refresh_snapshots(&self, conn: &RepositoryConnection) -> Result<LoadOutcome> {
        info!(repo_id = %conn.repo_id, "Refreshing snapshots");
        self.inner.memory.evict(&conn.repo_id);
        self.inner.slots.cancel(&conn.repo_id);
        self.load(conn, true).await
    }

    async fn load(&self, conn: &RepositoryConnection, force_delta: bool) -> Result<LoadOutcome> {
        let inner = &self.inner;
        let repo_id = conn.repo_id.as_str();

        if let Some(entry) = inner.memory.fresh(repo_id, self.now(), inner.config.memory_ttl_secs) {
            debug!(repo_id, count = entry.records.len(), "Serving snapshots from memory cache");
            self.activate(repo_id, Some(&entry.records));
            self.announce_published(repo_id, &entry.records);
            return Ok(self.loaded(conn, &entry.records, LoadSource::MemoryCache, force_delta));
        }

        self.activate(repo_id, None);

        match inner.store.load_all(repo_id).await {
            Ok(records) if !records.is_empty() => {
                info!(repo_id, count = records.len(), "Loaded snapshots from store");
                inner.memory.store(repo_id, records.clone(), self.now());
                self.publish(repo_id, &records);
                return Ok(self.loaded(conn, &records, LoadSource::PersistedStore, force_delta));
            }
            Ok(_) => debug!(repo_id, "No stored snapshots"),
            Err(e) => warn!(repo_id, error = %e, "Failed to read stored snapshots, falling back to full sync"),
        }

        match self.full_sync(conn).await {
            Ok(Some(count)) => Ok(LoadOutcome {
                repo_id: repo_id.to_string(),
                count,
                source: LoadSource::FullSync,
                background: None,
            }),
            Ok(None) => {
                info!(repo_id, "Full sync already running");
                let records = inner.memory.records(repo_id).unwrap_or_default();
                if !records.is_empty() {
                    self.publish(repo_id, &records);
                }
                Ok(LoadOutcome {
                    repo_id: repo_id.to_string(),
                    count: records.len(),
                    source: LoadSource::SyncInProgress,
                    background: None,
                })
            }
            Err(e) => {
                self.fail_load(repo_id, &e);
                Err(e)
            }
        }
    }

    fn loaded(
        &self,
        conn: &RepositoryConnection,
        records: &[SnapshotRecord],
        source: LoadSource,
        force_delta: bool,
    ) -> LoadOutcome {
        self.inner.events.send(EngineEvent::SnapshotsLoaded {
            repo_id: conn.repo_id.clone(),
            count: records.len(),
            source,
        });
        let background = self.spawn_refinement(conn.clone(), missing_stats(records), force_delta);
        LoadOutcome {
            repo_id: conn.repo_id.clone(),
            count: records.len(),
            source,
            background: Some(background),
        }
    }

    /// Backfill first, then the delta check, one after the other. A forced
    /// check runs only once the repository's slots are free; a cancelled
    /// backfill ends the task.
    fn spawn_refinement(&self, conn: RepositoryConnection, pending: Vec<Snapshot>, force_delta: bool) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let repo_id = conn.repo_id.as_str();
            let slots = &manager.inner.slots;
            if force_delta {
                // Cancelled flows may still be finishing their last batch.
                slots.wait_idle(repo_id).await;
            }
            if !pending.is_empty() {
                let outcome = manager.backfill_stats(&conn, pending).await;
                debug!(repo_id, ?outcome, "Backfill finished");
                if outcome == BackfillOutcome::Cancelled {
                    return;
                }
            }
            loop {
                match manager.check_for_new_snapshots(&conn, force_delta).await {
                    Ok(DeltaOutcome::Busy) if force_delta && !manager.inner.shutdown.is_cancelled() => {
                        slots.wait_idle(repo_id).await;
                    }
                    Ok(outcome) => {
                        debug!(repo_id, ?outcome, "Delta check finished");
                        break;
                    }
                    Err(e) => {
                        warn!(repo_id, error = %e, "Delta check failed");
                        break;
                    }
                }
            }
        })
    }

    /// Fetches stats for one snapshot on demand, persists and shows them.
    pub async fn load_single_snapshot_stats(
        &self,
        conn: &RepositoryConnection,
        snapshot_id: &str,
    ) -> Result<SnapshotStats> {
        let inner = &self.inner;
        let repo_id = conn.repo_id.as_str();
        let snapshot = self.find_snapshot(repo_id, snapshot_id).await?;

        let _scope = inner.loading.scope(
            repo_id,
            LoadingState::ManualLoad {
                snapshot_name: snapshot.display_name(),
            },
        );
        info!(repo_id, snapshot_id = %snapshot.short_id, "Loading snapshot stats");

        let stats = self.fetch_stats(conn, &snapshot.id, &inner.shutdown).await?;
        let record = SnapshotRecord::with_stats(snapshot, stats);
        if let Err(e) = inner.store.save_batch(repo_id, std::slice::from_ref(&record)).await {
            warn!(repo_id, error = %e, "Failed to persist snapshot stats");
        }

        inner.memory.merge_stats(repo_id, record.id(), stats);
        inner.session.with_active(repo_id, || {
            inner
                .display
                .send_if_modified(|display| apply_stats(&mut display.snapshots, record.id(), stats));
        });
        inner.events.send(EngineEvent::StatsUpdated {
            repo_id: repo_id.to_string(),
            snapshot_id: record.id().to_string(),
            stats,
        });
        Ok(stats)
    }

    async fn find_snapshot(&self, repo_id: &str, snapshot_id: &str) -> Result<Snapshot> {
        if let Some(record) = self.inner.memory.find(repo_id, snapshot_id) {
            return Ok(record.snapshot);
        }
        self.inner
            .store
            .load_all(repo_id)
            .await?
            .into_iter()
            .find(|r| r.matches(snapshot_id))
            .map(|r| r.snapshot)
            .ok_or_else(|| CoreError::UnknownSnapshot(snapshot_id.to_string()))
    }

    /// Patches the displayed list only; nothing is persisted.
    pub fn update_snapshot_stats(&self, snapshot_id: &str, stats: SnapshotStats) -> bool {
        self.inner
            .display
            .send_if_modified(|display| apply_stats(&mut display.snapshots, snapshot_id, stats))
    }

    /// Empties the display and deactivates the session. Caches are kept.
    pub fn clear_snapshots(&self) {
        let inner = &self.inner;
        inner.session.clear();
        inner.display.send_replace(DisplayState::default());
    }

    pub fn cancel_background(&self, repo_id: &str) {
        info!(repo_id, "Cancelling background work");
        self.inner.slots.cancel(repo_id);
    }

    /// Cancels work, waits for in-flight batches to land, then deletes
    /// everything cached for the repository.
    pub async fn forget_repository(&self, repo_id: &str) -> Result<()> {
        let inner = &self.inner;
        inner.slots.cancel(repo_id);
        inner.slots.wait_idle(repo_id).await;
        inner.memory.evict(repo_id);
        inner.loading.remove(repo_id);
        if inner.session.is_active(repo_id) {
            self.clear_snapshots();
        }
        inner.store.clear_repository(repo_id).await?;
        info!(repo_id, "Repository cache cleared");
        Ok(())
    }

    /// Cancels all background work; later flows start cancelled.
    pub fn shutdown(&self) {
        info!("Shutting down cache manager");
        self.inner.shutdown.cancel();
    }

    pub fn display(&self) -> watch::Receiver<DisplayState> {
        self.inner.display.subscribe()
    }

    pub fn snapshots(&self) -> Vec<SnapshotRecord> {
        self.inner.display.borrow().snapshots.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.display.borrow().loading
    }

    pub fn error(&self) -> Option<String> {
        self.inner.display.borrow().error.clone()
    }

    pub fn loading_state(&self, repo_id: &str) -> LoadingState {
        self.inner.loading.get(repo_id)
    }

    pub fn active_repository(&self) -> Option<String> {
        self.inner.session.active()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    fn now(&self) -> i64 {
        self.inner.clock.now()
    }

    /// Activation and display reset happen under one session lock.
    fn activate(&self, repo_id: &str, records: Option<&[SnapshotRecord]>) {
        let inner = &self.inner;
        inner.session.activate_with(repo_id, || {
            inner.display.send_replace(DisplayState {
                repo_id: Some(repo_id.to_string()),
                snapshots: records.map(<[SnapshotRecord]>::to_vec).unwrap_or_default(),
                loading: records.is_none(),
                error: None,
            });
        });
    }

    /// Replaces the displayed list if `repo_id` is still active.
    fn publish(&self, repo_id: &str, records: &[SnapshotRecord]) -> bool {
        let inner = &self.inner;
        let published = inner
            .session
            .with_active(repo_id, || {
                inner.display.send_modify(|display| {
                    display.snapshots = records.to_vec();
                    display.loading = false;
                    display.error = None;
                });
            })
            .is_some();

        if published {
            self.announce_published(repo_id, records);
        } else {
            trace!(repo_id, "Dropping results for inactive repository");
        }
        published
    }

    fn announce_published(&self, repo_id: &str, records: &[SnapshotRecord]) {
        self.inner.events.send(EngineEvent::SnapshotsPublished {
            repo_id: repo_id.to_string(),
            count: records.len(),
            with_stats: records.iter().filter(|r| r.has_stats()).count(),
        });
    }

    fn fail_load(&self, repo_id: &str, err: &CoreError) {
        let inner = &self.inner;
        inner.loading.set(repo_id, LoadingState::Idle);

        if err.is_cancelled() {
            info!(repo_id, "Snapshot load cancelled");
            inner.session.with_active(repo_id, || {
                inner.display.send_modify(|display| display.loading = false);
            });
            return;
        }

        let message = err.user_message();
        error!(repo_id, error = %err, "Failed to load snapshots");
        inner.session.with_active(repo_id, || {
            inner.display.send_modify(|display| {
                display.loading = false;
                display.error = Some(message.clone());
            });
        });
        inner.events.send(EngineEvent::LoadFailed {
            repo_id: repo_id.to_string(),
            error: message,
        });
    }
}

fn apply_stats(records: &mut [SnapshotRecord], snapshot_id: &str, stats: SnapshotStats) -> bool {
    match records.iter_mut().find(|r| r.id() == snapshot_id) {
        Some(record) => {
            record.stats = Some(stats);
            true
        }
        None => false,
    }
}
