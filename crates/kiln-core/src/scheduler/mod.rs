//! Bounded-concurrency task scheduler.
//!
//! [`Scheduler::enqueue`] records a `queued` [`Progress`] and hands the task
//! to a dispatch loop over an unbounded channel, so it never waits for a
//! slot. The loop waits for an [`AdmissionGate`] permit for the task's
//! client, the same counters synchronous conversions draw from, marks the
//! task `running` and drives it on its own tokio task:
//!
//! 1. cache hit → `done` at 100 %, converter untouched;
//! 2. miss → [`Converter`] (in-process codec or external tools), relaying
//!    progress through a [`ProgressReporter`];
//! 3. success populates the cache, failure becomes terminal `error`.
//!
//! Dropping the permit frees the slot for the next queued task.

mod storage;
mod types;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::admission::{AdmissionGate, ConcurrencyPermit};
use crate::cache::{CacheKey, ConversionCache};
use crate::codec::ImageCodec;
use crate::config::ServiceConfig;
use crate::error::ConvertError;
use crate::format::{Category, ConvertedFile};
use crate::health::{Alert, HealthMonitor};
use crate::tools::ToolAdapter;

pub use storage::ProgressStore;
pub use types::{
    ConversionJob, ConversionRequest, Progress, SchedulerLoad, TaskId, TaskState,
};

/// Performs one conversion. Implementations must be cancellation-safe and
/// must not touch [`Progress`] except through the reporter.
#[async_trait]
pub trait Converter: Send + Sync + 'static {
    async fn convert(
        &self,
        job: &ConversionJob,
        progress: &ProgressReporter,
    ) -> Result<ConvertedFile, ConvertError>;
}

/// Handle a converter uses to publish intermediate progress.
///
/// A detached reporter (synchronous conversions) discards updates.
#[derive(Debug, Clone, Default)]
pub struct ProgressReporter {
    target: Option<(ProgressStore, TaskId)>,
}

impl ProgressReporter {
    pub fn detached() -> Self {
        Self::default()
    }

    fn attached(store: ProgressStore, id: TaskId) -> Self {
        Self {
            target: Some((store, id)),
        }
    }

    pub async fn update(&self, percent: u8, message: &str) {
        if let Some((store, id)) = &self.target {
            store.advance(id, percent, message).await;
        }
    }
}

/// Default converter: rasters in-process, everything else via external tools.
#[derive(Debug)]
pub struct ConversionPipeline {
    codec: ImageCodec,
    tools: Arc<ToolAdapter>,
}

impl ConversionPipeline {
    pub fn new(tools: Arc<ToolAdapter>) -> Self {
        Self {
            codec: ImageCodec,
            tools,
        }
    }
}

#[async_trait]
impl Converter for ConversionPipeline {
    async fn convert(
        &self,
        job: &ConversionJob,
        progress: &ProgressReporter,
    ) -> Result<ConvertedFile, ConvertError> {
        if job.category == Category::Image && ImageCodec::supports(&job.from, &job.to) {
            progress.update(15, "preparing image").await;
            progress.update(30, "transcoding").await;
            let out = self
                .codec
                .convert(job.input.clone(), job.to.clone(), job.image)
                .await?;
            progress.update(80, "encoding output").await;
            return Ok(out);
        }
        self.tools
            .convert(job.category, &job.from, &job.to, &job.options, &job.input, progress)
            .await
    }
}

/// Result of a synchronous conversion.
#[derive(Debug, Clone)]
pub struct InlineResult {
    pub file: ConvertedFile,
    pub output_filename: String,
    pub cache_hit: bool,
}

#[derive(Debug)]
struct QueuedTask {
    id: TaskId,
    job: ConversionJob,
}

/// State shared by the scheduler handle, the dispatch loop and running tasks.
struct Context {
    config: Arc<ServiceConfig>,
    converter: Arc<dyn Converter>,
    cache: ConversionCache,
    progress: ProgressStore,
    health: Arc<HealthMonitor>,
    gate: Arc<AdmissionGate>,
    queued: AtomicUsize,
}

#[derive(Clone)]
pub struct Scheduler {
    ctx: Arc<Context>,
    submit_tx: mpsc::UnboundedSender<QueuedTask>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("load", &self.load())
            .field("cache", &self.ctx.cache)
            .finish()
    }
}

impl Scheduler {
    /// Spawn the dispatch loop and return a handle. The loop exits once every
    /// handle is dropped.
    pub fn start(
        config: Arc<ServiceConfig>,
        converter: Arc<dyn Converter>,
        cache: ConversionCache,
        health: Arc<HealthMonitor>,
        gate: Arc<AdmissionGate>,
    ) -> Self {
        let ctx = Arc::new(Context {
            progress: ProgressStore::new(config.progress_retention),
            config,
            converter,
            cache,
            health,
            gate,
            queued: AtomicUsize::new(0),
        });
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::run_loop(submit_rx, Arc::clone(&ctx)));
        Self { ctx, submit_tx }
    }

    async fn run_loop(mut rx: mpsc::UnboundedReceiver<QueuedTask>, ctx: Arc<Context>) {
        while let Some(task) = rx.recv().await {
            // FIFO: a task whose client is at its cap holds back the ones behind it.
            let permit = ctx.gate.acquire_wait(&task.job.client).await;
            ctx.queued.fetch_sub(1, Ordering::SeqCst);
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                ctx.execute(task).await;
                drop(permit);
            });
        }
        debug!("scheduler dispatch loop stopped");
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.ctx.config
    }

    /// Validate `request` and enqueue it.
    pub async fn submit(&self, request: ConversionRequest) -> Result<TaskId, ConvertError> {
        let job = request.validate(&self.ctx.config)?;
        Ok(self.enqueue(job).await)
    }

    /// Record the task as queued and hand it to the dispatch loop. Returns
    /// without waiting for a slot.
    pub async fn enqueue(&self, job: ConversionJob) -> TaskId {
        let ctx = &self.ctx;
        let evicted = ctx.progress.evict_expired().await;
        if evicted > 0 {
            debug!(evicted, "evicted retained progress records");
        }

        let id = TaskId::new();
        let pending = ctx.queued.fetch_add(1, Ordering::SeqCst) + 1;
        let limit = ctx.config.queue_soft_limit;
        let warning = (pending > limit).then(|| {
            ctx.health.alert(Alert::QueueSoftLimit { pending, limit });
            format!("queue is above its soft limit ({pending} pending, limit {limit}); expect delays")
        });
        ctx.progress.insert(Progress::queued(id.clone(), warning)).await;
        info!(task_id = %id, category = %job.category, from = %job.from, to = %job.to, pending, "task queued");

        let task = QueuedTask { id: id.clone(), job };
        if self.submit_tx.send(task).is_err() {
            ctx.queued.fetch_sub(1, Ordering::SeqCst);
            let err = ConvertError::Internal("scheduler is not running".into());
            ctx.progress.fail(&id, &err).await;
        }
        id
    }

    pub async fn get_progress(&self, id: &TaskId) -> Option<Progress> {
        self.ctx.progress.get(id).await
    }

    /// Running counts every admitted conversion, scheduled or synchronous.
    pub fn load(&self) -> SchedulerLoad {
        let ctx = &self.ctx;
        SchedulerLoad {
            queued: ctx.queued.load(Ordering::SeqCst),
            running: ctx.gate.running_total() as usize,
            capacity: ctx.config.global_concurrency as usize,
        }
    }

    /// Synchronous path: validate, consult the cache, convert, populate the
    /// cache, all under the caller's admission `permit`.
    ///
    /// The work runs on its own task that owns the permit. Past `deadline`
    /// the caller gets `Timeout`, but the slot stays taken until the work
    /// stops, and a late result still lands in the cache.
    pub async fn convert_inline(
        &self,
        permit: ConcurrencyPermit,
        request: ConversionRequest,
        deadline: Duration,
    ) -> Result<InlineResult, ConvertError> {
        let job = request.validate(&self.ctx.config)?;
        let ctx = Arc::clone(&self.ctx);
        let work = tokio::spawn(async move {
            let result = ctx.convert_admitted(&job).await;
            drop(permit);
            result
        });
        match tokio::time::timeout(deadline, work).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) if e.is_panic() => Err(ConvertError::ConversionFailed("converter panicked".into())),
            Ok(Err(_)) => Err(ConvertError::Internal("conversion was cancelled".into())),
            Err(_) => Err(ConvertError::Timeout {
                operation: "convert".into(),
                after: deadline,
            }),
        }
    }
}

impl Context {
    async fn convert_admitted(&self, job: &ConversionJob) -> Result<InlineResult, ConvertError> {
        let (file, cache_hit) = match self.cache.get(&job.key).await {
            Some(hit) => (hit, true),
            None => {
                let file = self.converter.convert(job, &ProgressReporter::detached()).await?;
                self.store_in_cache(&job.key, &file).await;
                (file, false)
            }
        };
        Ok(InlineResult {
            output_filename: file.output_filename(&job.filename),
            file,
            cache_hit,
        })
    }

    async fn execute(&self, task: QueuedTask) {
        let QueuedTask { id, job } = task;
        self.progress.mark_running(&id).await;
        debug!(task_id = %id, "task running");

        let job = Arc::new(job);
        let (result, cache_hit) = match self.cache.get(&job.key).await {
            Some(hit) => (Ok(hit), true),
            None => (self.run_converter(&id, Arc::clone(&job)).await, false),
        };

        match result {
            Ok(file) => {
                if !cache_hit {
                    self.store_in_cache(&job.key, &file).await;
                }
                let name = file.output_filename(&job.filename);
                let size = file.bytes.len();
                self.progress.complete(&id, file, name, cache_hit).await;
                self.health.record_task_outcome(true, cache_hit);
                info!(task_id = %id, cache_hit, size, "task done");
            }
            Err(e) => {
                self.progress.fail(&id, &e).await;
                self.health.record_task_outcome(false, false);
                warn!(task_id = %id, kind = %e.kind(), error = %e, "task failed");
            }
        }
    }

    /// Run the converter on its own task so a panic surfaces as an error
    /// instead of tearing down the slot.
    async fn run_converter(&self, id: &TaskId, job: Arc<ConversionJob>) -> Result<ConvertedFile, ConvertError> {
        let converter = Arc::clone(&self.converter);
        let reporter = ProgressReporter::attached(self.progress.clone(), id.clone());
        match tokio::spawn(async move { converter.convert(&job, &reporter).await }).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(ConvertError::ConversionFailed("converter panicked".into())),
            Err(_) => Err(ConvertError::Internal("conversion was cancelled".into())),
        }
    }

    async fn store_in_cache(&self, key: &CacheKey, file: &ConvertedFile) {
        if let Err(e) = self.cache.set(key, file, self.config.cache_ttl).await {
            warn!(%key, error = %e, "failed to persist conversion result");
        }
    }
}
