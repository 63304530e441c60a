use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use uuid::Uuid;

use crate::cache::CacheKey;
use crate::codec::ImageOptions;
use crate::config::ServiceConfig;
use crate::error::{ConvertError, ErrorKind};
use crate::format::{Category, Format};

/// Opaque, collision-resistant task identifier (UUID v4).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for TaskId {
    type Err = ConvertError;

    /// Anything that is not a UUID cannot name a task, so it is reported the
    /// same way as an unknown id.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| ConvertError::NotFound(s.to_owned()))
    }
}

/// Lifecycle of a task: `queued → running → done | error`, never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Done,
    Error,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Error)
    }

    fn rank(&self) -> u8 {
        match self {
            TaskState::Queued => 0,
            TaskState::Running => 1,
            TaskState::Done | TaskState::Error => 2,
        }
    }

    /// Whether moving from `self` to `next` respects the state machine.
    pub fn can_advance_to(&self, next: TaskState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// What a client hands the core: raw, unvalidated inputs.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    /// Who asked; counted against the per-client concurrency cap.
    pub client: String,
    pub category: Category,
    /// Source format; inferred from `filename` when absent.
    pub from: Option<String>,
    pub to: String,
    pub input: Bytes,
    pub filename: String,
    pub options: BTreeMap<String, String>,
}

/// A request that passed validation, with its cache key precomputed.
#[derive(Debug, Clone)]
pub struct ConversionJob {
    pub client: String,
    pub category: Category,
    pub from: Format,
    pub to: Format,
    pub input: Bytes,
    pub filename: String,
    pub options: BTreeMap<String, String>,
    pub image: ImageOptions,
    pub key: CacheKey,
}

impl ConversionRequest {
    /// Fail fast on anything that would waste a slot: empty or oversized
    /// payloads, unknown formats, and targets outside the allowed set.
    pub fn validate(self, config: &ServiceConfig) -> Result<ConversionJob, ConvertError> {
        if self.input.is_empty() {
            return Err(ConvertError::BadRequest("missing file".into()));
        }
        let size = self.input.len() as u64;
        if size > config.max_upload_bytes {
            return Err(ConvertError::PayloadTooLarge {
                size,
                limit: config.max_upload_bytes,
            });
        }

        let category = self.category;
        let allowed = || config.allowed_targets_display(category);
        let to = Format::parse(&self.to)
            .filter(|f| config.is_allowed_target(category, f))
            .ok_or_else(|| {
                ConvertError::BadRequest(format!(
                    "unsupported target format '{}'; allowed: {}",
                    self.to.trim(),
                    allowed()
                ))
            })?;

        let from = match self.from.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => Format::parse(raw)
                .ok_or_else(|| ConvertError::BadRequest(format!("invalid source format '{raw}'")))?,
            None => Format::from_filename(&self.filename).ok_or_else(|| {
                ConvertError::BadRequest(
                    "cannot infer the source format; pass 'from' or a file name with an extension"
                        .into(),
                )
            })?,
        };
        if !category.knows(&from) {
            return Err(ConvertError::BadRequest(format!(
                "unsupported source format '{from}' for {category}"
            )));
        }

        let image = match category {
            Category::Image => ImageOptions::from_map(&self.options)?,
            _ if self.options.is_empty() => ImageOptions::default(),
            _ => {
                return Err(ConvertError::BadRequest(format!(
                    "{category} conversions take no options"
                )));
            }
        };

        let key = CacheKey::new(&self.input, &from, &to, &self.options);
        Ok(ConversionJob {
            client: self.client,
            category,
            from,
            to,
            input: self.input,
            filename: self.filename,
            options: self.options,
            image,
            key,
        })
    }
}

/// Observable state of one task. Only the scheduler writes these.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub task_id: TaskId,
    pub state: TaskState,
    /// 0..=100, non-decreasing.
    pub percent: u8,
    pub message: String,
    /// Advisory note, e.g. the queue being above its soft limit.
    pub warning: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub mime: Option<String>,
    pub output_filename: Option<String>,
    /// Result bytes; present only when `state` is `Done`.
    pub result: Option<Bytes>,
    pub cache_hit: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Progress {
    pub fn queued(task_id: TaskId, warning: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            state: TaskState::Queued,
            percent: 0,
            message: "queued".into(),
            warning,
            error_kind: None,
            mime: None,
            output_filename: None,
            result: None,
            cache_hit: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Queue depth and slot usage, used for poll hints and health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerLoad {
    pub queued: usize,
    pub running: usize,
    pub capacity: usize,
}
