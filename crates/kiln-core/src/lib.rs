//! kiln-core – the scheduling heart of the kiln conversion service.
//!
//! Requests flow leaf-to-root through:
//! 1. [`admission::AdmissionGate`] – sliding-window rate limit and
//!    per-client/global concurrency caps.
//! 2. [`scheduler::Scheduler`] – task queue, bounded run-loop and progress.
//! 3. [`cache::ConversionCache`] – content-addressed results with TTL.
//! 4. [`codec::ImageCodec`] / [`tools::ToolAdapter`] – the actual conversion,
//!    in-process for rasters, supervised subprocesses for everything else.
//! 5. [`health::HealthMonitor`] – observes all of the above and scores it.
//!
//! Every numeric limit comes from [`config::ServiceConfig`].

pub mod admission;
pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod format;
pub mod health;
pub mod poll;
pub mod scheduler;
pub mod tools;

pub use admission::{AdmissionGate, ConcurrencyPermit, RateDecision};
pub use cache::{CacheKey, ConversionCache};
pub use config::{ConfigAdjustment, LoadedConfig, ServiceConfig};
pub use error::{ConvertError, ErrorKind};
pub use format::{Category, ConvertedFile, Format};
pub use health::{Alert, AlertSink, HealthMonitor, HealthReport, RequestSpan};
pub use poll::{PollGuard, PollPolicy};
pub use scheduler::{
    ConversionRequest, Converter, Progress, ProgressReporter, Scheduler, TaskId, TaskState,
};
pub use tools::ToolAdapter;
