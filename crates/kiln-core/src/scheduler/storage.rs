use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::types::{Progress, TaskId, TaskState};
use crate::error::ConvertError;
use crate::format::ConvertedFile;

/// Highest percentage a task may report before it is actually done.
const MAX_RUNNING_PERCENT: u8 = 99;

/// Shared progress map, one record per task id.
///
/// Every mutation goes through a method that enforces the forward-only state
/// machine and the non-decreasing percentage, so a late update from a
/// converter can never resurrect a finished task.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    inner: Arc<RwLock<HashMap<TaskId, Progress>>>,
    retention: Duration,
}

impl ProgressStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            retention,
        }
    }

    pub async fn insert(&self, progress: Progress) {
        self.inner
            .write()
            .await
            .insert(progress.task_id.clone(), progress);
    }

    /// Latest snapshot, or `None` for unknown ids and expired terminal records.
    pub async fn get(&self, id: &TaskId) -> Option<Progress> {
        let now = Utc::now();
        self.inner
            .read()
            .await
            .get(id)
            .filter(|p| !self.expired(p, now))
            .cloned()
    }

    pub async fn mark_running(&self, id: &TaskId) {
        self.update(id, |p| {
            if p.state.can_advance_to(TaskState::Running) {
                p.state = TaskState::Running;
                p.percent = p.percent.max(5);
                p.message = "started".into();
                true
            } else {
                false
            }
        })
        .await;
    }

    /// Report intermediate progress for a running task.
    pub async fn advance(&self, id: &TaskId, percent: u8, message: &str) {
        self.update(id, |p| {
            if p.state != TaskState::Running {
                return false;
            }
            p.percent = p.percent.max(percent.min(MAX_RUNNING_PERCENT));
            p.message = message.to_owned();
            true
        })
        .await;
    }

    pub async fn complete(&self, id: &TaskId, file: ConvertedFile, output_filename: String, cache_hit: bool) {
        self.update(id, move |p| {
            if !p.state.can_advance_to(TaskState::Done) {
                return false;
            }
            p.state = TaskState::Done;
            p.percent = 100;
            p.message = (if cache_hit { "done (served from cache)" } else { "done" }).to_owned();
            p.mime = Some(file.mime);
            p.output_filename = Some(output_filename);
            p.result = Some(file.bytes);
            p.cache_hit = cache_hit;
            true
        })
        .await;
    }

    pub async fn fail(&self, id: &TaskId, error: &ConvertError) {
        self.update(id, |p| {
            if !p.state.can_advance_to(TaskState::Error) {
                return false;
            }
            p.state = TaskState::Error;
            p.message = error.to_string();
            p.error_kind = Some(error.kind());
            true
        })
        .await;
    }

    /// Drop terminal records older than the retention period.
    pub async fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let mut map = self.inner.write().await;
        let before = map.len();
        map.retain(|_, p| !self.expired(p, now));
        before - map.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    fn expired(&self, p: &Progress, now: DateTime<Utc>) -> bool {
        let Ok(retention) = chrono::Duration::from_std(self.retention) else {
            return false;
        };
        p.state.is_terminal() && p.updated_at + retention <= now
    }

    /// Apply `f` and bump `updated_at` if it reports a change.
    async fn update(&self, id: &TaskId, f: impl FnOnce(&mut Progress) -> bool) {
        if let Some(p) = self.inner.write().await.get_mut(id) {
            if f(p) {
                p.updated_at = Utc::now();
            }
        }
    }
}
