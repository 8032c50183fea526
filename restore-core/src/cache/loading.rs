//! Per-repository loading indicator.

use super::events::{EngineEvent, EventBroadcaster};
use dashmap::DashMap;
use serde::Serialize;
use std::mem::discriminant;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LoadingState {
    #[default]
    Idle,
    /// Delta check running.
    BackgroundSync,
    /// Batched stats fetch running.
    #[serde(rename_all = "camelCase")]
    FetchingStats {
        processed: usize,
        total: Option<usize>,
    },
    /// One user-requested stats fetch.
    #[serde(rename_all = "camelCase")]
    ManualLoad { snapshot_name: String },
}

impl LoadingState {
    pub fn is_idle(&self) -> bool {
        matches!(self, LoadingState::Idle)
    }

    fn same_kind(&self, other: &LoadingState) -> bool {
        discriminant(self) == discriminant(other)
    }
}

pub struct LoadingTracker {
    states: DashMap<String, LoadingState>,
    events: EventBroadcaster,
}

impl LoadingTracker {
    pub fn new(events: EventBroadcaster) -> Self {
        Self {
            states: DashMap::new(),
            events,
        }
    }

    pub fn get(&self, repo_id: &str) -> LoadingState {
        self.states
            .get(repo_id)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn set(&self, repo_id: &str, state: LoadingState) {
        self.states.insert(repo_id.to_string(), state.clone());
        self.events.send(EngineEvent::LoadingChanged {
            repo_id: repo_id.to_string(),
            state,
        });
    }

    /// Back to idle, unless another flow has since taken over the indicator.
    pub fn finish(&self, repo_id: &str, owner: &LoadingState) {
        let reset = match self.states.get_mut(repo_id) {
            Some(mut state) if state.same_kind(owner) => {
                *state = LoadingState::Idle;
                true
            }
            _ => false,
        };
        if reset {
            self.events.send(EngineEvent::LoadingChanged {
                repo_id: repo_id.to_string(),
                state: LoadingState::Idle,
            });
        }
    }

    pub fn remove(&self, repo_id: &str) {
        self.states.remove(repo_id);
    }

    /// Sets `state` now and resets it when the scope drops, on every exit path.
    pub fn scope(&self, repo_id: &str, state: LoadingState) -> LoadingScope<'_> {
        self.set(repo_id, state.clone());
        LoadingScope {
            tracker: self,
            repo_id: repo_id.to_string(),
            owner: state,
        }
    }
}

pub struct LoadingScope<'a> {
    tracker: &'a LoadingTracker,
    repo_id: String,
    owner: LoadingState,
}

impl LoadingScope<'_> {
    /// Progress update within the same kind of state.
    pub fn update(&mut self, state: LoadingState) {
        self.tracker.set(&self.repo_id, state.clone());
        self.owner = state;
    }
}

impl Drop for LoadingScope<'_> {
    fn drop(&mut self) {
        self.tracker.finish(&self.repo_id, &self.owner);
    }
}
