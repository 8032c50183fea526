use super::loading::LoadingState;
use super::LoadSource;
use crate::models::SnapshotStats;
use serde::Serialize;
use tokio::sync::broadcast;

const BROADCAST_CAPACITY: usize = 256;

/// Change notifications for whoever renders the cache manager's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum EngineEvent {
    /// A load call has something to show for `repo_id`.
    #[serde(rename = "snapshots:loaded", rename_all = "camelCase")]
    SnapshotsLoaded {
        repo_id: String,
        count: usize,
        source: LoadSource,
    },

    /// The displayed list was replaced with rows for the active repository.
    #[serde(rename = "snapshots:published", rename_all = "camelCase")]
    SnapshotsPublished {
        repo_id: String,
        count: usize,
        with_stats: usize,
    },

    #[serde(rename = "loading:changed", rename_all = "camelCase")]
    LoadingChanged { repo_id: String, state: LoadingState },

    #[serde(rename = "stats:updated", rename_all = "camelCase")]
    StatsUpdated {
        repo_id: String,
        snapshot_id: String,
        stats: SnapshotStats,
    },

    #[serde(rename = "load:failed", rename_all = "camelCase")]
    LoadFailed { repo_id: String, error: String },
}

#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// No subscribers is not an error.
    pub fn send(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
