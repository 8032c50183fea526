//! At most one sync-class and one backfill task per repository.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Full sync or delta check.
    Sync,
    /// Stats backfill; never runs beside a sync.
    Backfill,
}

#[derive(Debug, Default)]
struct RepoTasks {
    sync: Option<CancellationToken>,
    backfill: Option<CancellationToken>,
}

impl RepoTasks {
    fn slot(&mut self, kind: TaskKind) -> &mut Option<CancellationToken> {
        match kind {
            TaskKind::Sync => &mut self.sync,
            TaskKind::Backfill => &mut self.backfill,
        }
    }

    fn is_empty(&self) -> bool {
        self.sync.is_none() && self.backfill.is_none()
    }
}

#[derive(Debug)]
pub struct TaskSlots {
    repos: DashMap<String, RepoTasks>,
    root: CancellationToken,
    released: Notify,
}

impl TaskSlots {
    /// Every slot token is a child of `root`.
    pub fn new(root: CancellationToken) -> Self {
        Self {
            repos: DashMap::new(),
            root,
            released: Notify::new(),
        }
    }

    /// Claims the slot atomically; `None` if it, or a sync for a backfill, is taken.
    pub fn try_acquire(self: &Arc<Self>, repo_id: &str, kind: TaskKind) -> Option<SlotGuard> {
        let mut tasks = self.repos.entry(repo_id.to_string()).or_default();
        let busy = match kind {
            TaskKind::Sync => tasks.sync.is_some(),
            TaskKind::Backfill => tasks.sync.is_some() || tasks.backfill.is_some(),
        };
        if busy {
            return None;
        }

        let token = self.root.child_token();
        *tasks.slot(kind) = Some(token.clone());
        Some(SlotGuard {
            slots: Arc::clone(self),
            repo_id: repo_id.to_string(),
            kind,
            token,
        })
    }

    fn is_idle(&self, repo_id: &str) -> bool {
        self.repos.get(repo_id).map_or(true, |tasks| tasks.is_empty())
    }

    /// Resolves once no slot of `repo_id` is held.
    pub async fn wait_idle(&self, repo_id: &str) {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if self.is_idle(repo_id) {
                return;
            }
            released.await;
        }
    }

    pub fn cancel(&self, repo_id: &str) {
        if let Some(tasks) = self.repos.get(repo_id) {
            for token in [&tasks.sync, &tasks.backfill].into_iter().flatten() {
                token.cancel();
            }
        }
    }

    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    fn release(&self, repo_id: &str, kind: TaskKind) {
        if let Some(mut tasks) = self.repos.get_mut(repo_id) {
            *tasks.slot(kind) = None;
        }
        self.repos.remove_if(repo_id, |_, tasks| tasks.is_empty());
        self.released.notify_waiters();
    }
}

/// Holds a slot until dropped.
#[derive(Debug)]
pub struct SlotGuard {
    slots: Arc<TaskSlots>,
    repo_id: String,
    kind: TaskKind,
    token: CancellationToken,
}

impl SlotGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slots.release(&self.repo_id, self.kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slots() -> Arc<TaskSlots> {
        Arc::new(TaskSlots::new(CancellationToken::new()))
    }

    #[test]
    fn test_one_sync_per_repository() {
        let slots = slots();
        let guard = slots.try_acquire("r1", TaskKind::Sync).unwrap();
        assert!(slots.try_acquire("r1", TaskKind::Sync).is_none());
        assert!(slots.try_acquire("r2", TaskKind::Sync).is_some());

        drop(guard);
        assert!(slots.is_idle("r1"));
        assert!(slots.try_acquire("r1", TaskKind::Sync).is_some());
    }

    #[test]
    fn test_backfill_waits_for_sync() {
        let slots = slots();
        let sync = slots.try_acquire("r1", TaskKind::Sync).unwrap();
        assert!(slots.try_acquire("r1", TaskKind::Backfill).is_none());
        drop(sync);

        let _backfill = slots.try_acquire("r1", TaskKind::Backfill).unwrap();
        assert!(slots.try_acquire("r1", TaskKind::Backfill).is_none());
        assert!(slots.try_acquire("r1", TaskKind::Sync).is_some());
    }

    #[test]
    fn test_cancel_is_per_repository() {
        let slots = slots();
        let a = slots.try_acquire("a", TaskKind::Sync).unwrap();
        let b = slots.try_acquire("b", TaskKind::Backfill).unwrap();

        slots.cancel("a");
        assert!(a.token().is_cancelled());
        assert!(!b.token().is_cancelled());

        slots.cancel_all();
        assert!(b.token().is_cancelled());
        assert!(slots.try_acquire("c", TaskKind::Sync).unwrap().token().is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_idle_resolves_on_release() {
        let slots = slots();
        slots.wait_idle("r1").await;

        let guard = slots.try_acquire("r1", TaskKind::Sync).unwrap();
        let waiter = {
            let slots = Arc::clone(&slots);
            tokio::spawn(async move { slots.wait_idle("r1").await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert!(slots.is_idle("r1"));
    }
}
