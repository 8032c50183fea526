//! Background flows: full sync, delta check and stats backfill.

use super::events::EngineEvent;
use super::loading::{LoadingScope, LoadingState, LoadingTracker};
use super::slots::{SlotGuard, TaskKind};
use super::{LoadSource, SnapshotCacheManager};
use crate::connections::RepositoryConnection;
use crate::error::CoreError;
use crate::models::{sort_newest_first, Snapshot, SnapshotRecord, SnapshotStats};
use crate::Result;
use futures_util::future::join_all;
use std::collections::HashSet;
use std::future::Future;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    /// Checked too recently.
    Skipped,
    UpToDate,
    /// New snapshots found and their stats fetched.
    Added(usize),
    Cancelled,
    /// Another sync holds the repository.
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillOutcome {
    Completed { fetched: usize },
    Cancelled,
    Busy,
}

#[derive(Debug, Default)]
struct BatchReport {
    fetched: usize,
    cancelled: bool,
}

struct StatsProgress<'a> {
    scope: LoadingScope<'a>,
    processed: usize,
    total: usize,
}

impl<'a> StatsProgress<'a> {
    fn start(tracker: &'a LoadingTracker, repo_id: &str, total: usize) -> Self {
        let scope = tracker.scope(
            repo_id,
            LoadingState::FetchingStats {
                processed: 0,
                total: Some(total),
            },
        );
        Self {
            scope,
            processed: 0,
            total,
        }
    }

    fn advance(&mut self, count: usize) {
        self.processed += count;
        self.scope.update(LoadingState::FetchingStats {
            processed: self.processed,
            total: Some(self.total),
        });
    }
}

async fn cancellable<T>(token: &CancellationToken, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(CoreError::Cancelled),
        result = fut => result,
    }
}

impl SnapshotCacheManager {
    /// Lists every snapshot and fetches all stats, newest first.
    /// `None` when a sync for the repository is already running.
    pub async fn full_sync(&self, conn: &RepositoryConnection) -> Result<Option<usize>> {
        let Some(slot) = self.inner.slots.try_acquire(&conn.repo_id, TaskKind::Sync) else {
            return Ok(None);
        };
        self.sync_all(conn, &slot).await.map(Some)
    }

    async fn sync_all(&self, conn: &RepositoryConnection, slot: &SlotGuard) -> Result<usize> {
        let inner = &self.inner;
        let repo_id = conn.repo_id.as_str();
        let token = slot.token();
        info!(repo_id, "Starting full snapshot sync");

        let mut snapshots = cancellable(token, inner.gateway.list_snapshots(conn)).await?;
        sort_newest_first(&mut snapshots);
        let total = snapshots.len();

        let records: Vec<SnapshotRecord> = snapshots.iter().cloned().map(SnapshotRecord::pending).collect();
        inner.memory.store(repo_id, records.clone(), self.now());
        self.publish(repo_id, &records);
        inner.events.send(EngineEvent::SnapshotsLoaded {
            repo_id: repo_id.to_string(),
            count: total,
            source: LoadSource::FullSync,
        });

        if let Err(e) = inner.store.save_metadata_only(repo_id, &snapshots).await {
            warn!(repo_id, error = %e, "Failed to persist snapshot metadata");
        }

        let (newest, rest) = snapshots.split_at(inner.config.priority_count.min(total));
        let mut progress = StatsProgress::start(&inner.loading, repo_id, total);
        let mut report = self.fetch_in_batches(conn, newest, token, Some(&mut progress)).await;
        if !report.cancelled {
            let more = self.fetch_in_batches(conn, rest, token, Some(&mut progress)).await;
            report.fetched += more.fetched;
            report.cancelled = more.cancelled;
        }
        drop(progress);

        if report.cancelled {
            info!(repo_id, fetched = report.fetched, "Full sync cancelled");
        } else if let Err(e) = inner.store.touch_last_check(repo_id, self.now()).await {
            warn!(repo_id, error = %e, "Failed to record sync time");
        }

        self.reload_from_store(repo_id).await;
        info!(repo_id, total, fetched = report.fetched, "Full sync complete");
        Ok(total)
    }

    /// Lists snapshots and processes only the ids the store has never seen.
    /// Without `force`, does nothing until the check interval has passed.
    pub async fn check_for_new_snapshots(&self, conn: &RepositoryConnection, force: bool) -> Result<DeltaOutcome> {
        let inner = &self.inner;
        let repo_id = conn.repo_id.as_str();
        let Some(slot) = inner.slots.try_acquire(repo_id, TaskKind::Sync) else {
            debug!(repo_id, "Sync already running, skipping delta check");
            return Ok(DeltaOutcome::Busy);
        };
        let token = slot.token();

        if !force {
            let meta = inner.store.get_meta(repo_id).await?;
            let elapsed = self.now().saturating_sub(meta.last_delta_check);
            if elapsed < inner.config.delta_check_interval_secs as i64 {
                debug!(repo_id, elapsed, "Delta check not due");
                return Ok(DeltaOutcome::Skipped);
            }
        }
        if token.is_cancelled() {
            return Ok(DeltaOutcome::Cancelled);
        }

        let _scope = inner.loading.scope(repo_id, LoadingState::BackgroundSync);
        let listed = match cancellable(token, inner.gateway.list_snapshots(conn)).await {
            Ok(listed) => listed,
            Err(e) if e.is_cancelled() => {
                info!(repo_id, "Delta check cancelled");
                return Ok(DeltaOutcome::Cancelled);
            }
            Err(e) => return Err(e),
        };

        let cached: HashSet<String> = inner.store.list_cached_ids(repo_id).await?.into_iter().collect();
        let mut added: Vec<Snapshot> = listed.into_iter().filter(|s| !cached.contains(&s.id)).collect();
        if added.is_empty() {
            if token.is_cancelled() {
                return Ok(DeltaOutcome::Cancelled);
            }
            debug!(repo_id, "No new snapshots");
            inner.store.touch_last_check(repo_id, self.now()).await?;
            return Ok(DeltaOutcome::UpToDate);
        }
        sort_newest_first(&mut added);
        info!(repo_id, count = added.len(), "Found new snapshots");

        if let Err(e) = inner.store.save_metadata_only(repo_id, &added).await {
            warn!(repo_id, error = %e, "Failed to persist new snapshot metadata");
        }
        let pending: Vec<SnapshotRecord> = added.iter().cloned().map(SnapshotRecord::pending).collect();
        self.merge_and_publish(repo_id, &pending);

        let report = self.fetch_in_batches(conn, &added, token, None).await;
        if report.cancelled {
            info!(repo_id, fetched = report.fetched, "Delta check cancelled");
            return Ok(DeltaOutcome::Cancelled);
        }

        inner.store.touch_last_check(repo_id, self.now()).await?;
        Ok(DeltaOutcome::Added(added.len()))
    }

    /// Fetches stats for `pending` in batches; yields to any running sync.
    pub async fn backfill_stats(&self, conn: &RepositoryConnection, pending: Vec<Snapshot>) -> BackfillOutcome {
        let inner = &self.inner;
        let repo_id = conn.repo_id.as_str();
        let Some(slot) = inner.slots.try_acquire(repo_id, TaskKind::Backfill) else {
            debug!(repo_id, "Sync or backfill already running, skipping backfill");
            return BackfillOutcome::Busy;
        };
        if pending.is_empty() {
            return BackfillOutcome::Completed { fetched: 0 };
        }

        info!(repo_id, count = pending.len(), "Backfilling missing snapshot stats");
        let mut progress = StatsProgress::start(&inner.loading, repo_id, pending.len());
        let report = self
            .fetch_in_batches(conn, &pending, slot.token(), Some(&mut progress))
            .await;

        if report.cancelled {
            info!(repo_id, fetched = report.fetched, "Backfill cancelled");
            BackfillOutcome::Cancelled
        } else {
            BackfillOutcome::Completed {
                fetched: report.fetched,
            }
        }
    }

    /// A batch in flight always completes; cancellation is checked between batches.
    async fn fetch_in_batches(
        &self,
        conn: &RepositoryConnection,
        snapshots: &[Snapshot],
        token: &CancellationToken,
        mut progress: Option<&mut StatsProgress<'_>>,
    ) -> BatchReport {
        let inner = &self.inner;
        let repo_id = conn.repo_id.as_str();
        let mut report = BatchReport::default();

        for (index, batch) in snapshots.chunks(inner.config.batch_size()).enumerate() {
            if token.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let results = join_all(batch.iter().map(|s| self.fetch_stats(conn, &s.id, token))).await;
            let fetched: Vec<SnapshotRecord> = batch
                .iter()
                .zip(results)
                .filter_map(|(snapshot, result)| match result {
                    Ok(stats) => Some(SnapshotRecord::with_stats(snapshot.clone(), stats)),
                    Err(e) => {
                        warn!(repo_id, snapshot_id = %snapshot.short_id, error = %e, "Failed to fetch snapshot stats");
                        None
                    }
                })
                .collect();

            report.fetched += fetched.len();
            if let Some(progress) = progress.as_mut() {
                progress.advance(batch.len());
            }
            if fetched.is_empty() {
                continue;
            }

            if let Err(e) = inner.store.save_batch(repo_id, &fetched).await {
                warn!(repo_id, error = %e, "Failed to persist snapshot stats");
            }
            self.republish_batch(repo_id, &fetched).await;
            debug!(repo_id, batch = index + 1, fetched = fetched.len(), "Stats batch stored");
        }

        if token.is_cancelled() {
            report.cancelled = true;
        }
        report
    }

    /// Timeout per attempt; transient failures are retried with doubling backoff.
    pub(super) async fn fetch_stats(
        &self,
        conn: &RepositoryConnection,
        snapshot_id: &str,
        token: &CancellationToken,
    ) -> Result<SnapshotStats> {
        let config = &self.inner.config;
        let mut backoff = config.retry_backoff();
        let mut attempt = 0;

        loop {
            let result = match timeout(
                config.stats_timeout(),
                self.inner.gateway.snapshot_stats(conn, snapshot_id),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(CoreError::Timeout {
                    command: format!("stats {snapshot_id}"),
                    timeout_secs: config.stats_timeout_secs,
                }),
            };

            match result {
                Err(e) if e.is_transient() && attempt < config.stats_retries && !token.is_cancelled() => {
                    attempt += 1;
                    debug!(snapshot_id, attempt, error = %e, "Retrying snapshot stats");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                other => return other,
            }
        }
    }

    /// Folds the store's rows and then the batch into memory and republishes.
    /// Stats the store failed to keep stay visible.
    async fn republish_batch(&self, repo_id: &str, fetched: &[SnapshotRecord]) {
        match self.inner.store.load_all(repo_id).await {
            Ok(records) => {
                self.inner.memory.merge_records(repo_id, &records);
            }
            Err(e) => warn!(repo_id, error = %e, "Failed to reload snapshots after batch"),
        }
        self.merge_and_publish(repo_id, fetched);
    }

    async fn reload_from_store(&self, repo_id: &str) {
        match self.inner.store.load_all(repo_id).await {
            Ok(records) => {
                self.inner.memory.touch(repo_id, self.now());
                self.merge_and_publish(repo_id, &records);
            }
            Err(e) => warn!(repo_id, error = %e, "Failed to reload snapshots after sync"),
        }
    }

    /// Evicted entries are not recreated, so forgotten repositories stay forgotten.
    fn merge_and_publish(&self, repo_id: &str, incoming: &[SnapshotRecord]) {
        if !self.inner.memory.merge_records(repo_id, incoming) {
            return;
        }
        if let Some(records) = self.inner.memory.records(repo_id) {
            self.publish(repo_id, &records);
        }
    }
}
