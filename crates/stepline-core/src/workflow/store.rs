//! In-memory workflow store with retention-based cleanup.
//!
//! Workflows live behind `Arc<tokio::sync::RwLock<_>>` handles so status
//! queries never block on step execution: the orchestrator takes the write
//! lock only between rounds, and readers snapshot whatever state is current.
//!
//! Retention: terminal workflows (completed/failed/cancelled) beyond the
//! most recent N by completion time are purged by a periodic sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use stepline_types::workflow::{Workflow, WorkflowSnapshot, WorkflowStatus};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Shared handle to a stored workflow.
pub type WorkflowHandle = Arc<RwLock<Workflow>>;

/// In-memory registry of workflow instances.
#[derive(Debug, Default)]
pub struct WorkflowStore {
    workflows: DashMap<Uuid, WorkflowHandle>,
}

impl WorkflowStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a workflow, returning its ID.
    pub fn insert(&self, workflow: Workflow) -> Uuid {
        let id = workflow.id;
        self.workflows.insert(id, Arc::new(RwLock::new(workflow)));
        id
    }

    /// Look up a workflow handle by ID.
    pub fn get(&self, id: Uuid) -> Option<WorkflowHandle> {
        self.workflows.get(&id).map(|entry| entry.value().clone())
    }

    /// Remove a workflow. Returns `true` if it existed.
    pub fn remove(&self, id: Uuid) -> bool {
        self.workflows.remove(&id).is_some()
    }

    /// Number of stored workflows.
    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    /// Collect all handles up front so no DashMap shard lock is held across
    /// an await point.
    fn handles(&self) -> Vec<WorkflowHandle> {
        self.workflows
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// List workflow snapshots, optionally filtered by status and/or owner.
    pub async fn list(
        &self,
        status: Option<WorkflowStatus>,
        owner: Option<&str>,
    ) -> Vec<WorkflowSnapshot> {
        let mut snapshots = Vec::new();
        for handle in self.handles() {
            let workflow = handle.read().await;
            if status.is_some_and(|s| workflow.status != s) {
                continue;
            }
            if owner.is_some_and(|o| workflow.owner.as_deref() != Some(o)) {
                continue;
            }
            snapshots.push(workflow.snapshot());
        }
        snapshots.sort_by_key(|s| s.created_at);
        snapshots
    }

    /// Run one retention sweep: purge terminal workflows beyond the most
    /// recent `keep` by completion time. Returns the number purged.
    pub async fn cleanup_once(&self, keep: usize) -> usize {
        let mut terminal: Vec<(Uuid, Option<DateTime<Utc>>)> = Vec::new();
        for handle in self.handles() {
            let workflow = handle.read().await;
            if workflow.status.is_terminal() {
                terminal.push((workflow.id, workflow.completed_at));
            }
        }

        if terminal.len() <= keep {
            return 0;
        }

        // Most recently completed first; entries without a completion time
        // sort oldest.
        terminal.sort_by(|a, b| b.1.cmp(&a.1));

        let mut purged = 0;
        for (id, _) in terminal.into_iter().skip(keep) {
            if self.workflows.remove(&id).is_some() {
                purged += 1;
            }
        }

        if purged > 0 {
            tracing::info!(purged, keep, "retention cleanup purged workflows");
        }
        purged
    }

    /// Spawn the periodic retention sweep.
    ///
    /// Returns a token; cancelling it stops the background task.
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        keep: usize,
    ) -> CancellationToken {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let store = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so a sweep only runs
            // after a full interval has elapsed.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        store.cleanup_once(keep).await;
                    }
                }
            }
            tracing::debug!("retention cleanup task stopped");
        });

        token
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
