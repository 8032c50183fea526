//! Tracks which repository's results may reach the displayed state.

use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct SessionRegistry {
    active: Mutex<Option<String>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<String>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Switching does not cancel the previous repository's background work.
    pub fn set_active(&self, repo_id: &str) {
        *self.lock() = Some(repo_id.to_string());
    }

    pub fn clear(&self) {
        *self.lock() = None;
    }

    pub fn is_active(&self, repo_id: &str) -> bool {
        self.lock().as_deref() == Some(repo_id)
    }

    pub fn active(&self) -> Option<String> {
        self.lock().clone()
    }

    /// Runs `f` only while `repo_id` is active, holding the registry lock
    /// so no `set_active` can interleave with the mutation.
    pub fn with_active<R>(&self, repo_id: &str, f: impl FnOnce() -> R) -> Option<R> {
        let guard = self.lock();
        if guard.as_deref() == Some(repo_id) {
            Some(f())
        } else {
            None
        }
    }

    /// Sets `repo_id` active and runs `f` under the same lock.
    pub fn activate_with<R>(&self, repo_id: &str, f: impl FnOnce() -> R) -> R {
        let mut guard = self.lock();
        *guard = Some(repo_id.to_string());
        f()
    }
}
