//! External tool adapter.
//!
//! Converts documents, vectors and the raster formats the in-process codec
//! cannot write by driving native converters as subprocesses:
//!
//! 1. plan up to two strategies for the `(category, from, to)` pair;
//! 2. probe the tools they need (results cached for a minute) and drop the
//!    strategies that cannot run;
//! 3. write the input into a private temp directory and run the survivors in
//!    order, each step under the tool deadline.
//!
//! A timeout ends the request immediately. A non-zero exit or missing output
//! moves on to the next strategy; when none is left the request fails with
//! the last tool's stderr.

pub mod plan;
pub mod process;

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use strum::{AsRefStr, Display, EnumIter, IntoEnumIterator};

use crate::config::ServiceConfig;
use crate::error::ConvertError;
use crate::format::{Category, ConvertedFile, Format};
use crate::scheduler::ProgressReporter;

use plan::{Arg, Step, Strategy};
use process::RunFailure;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_TTL: Duration = Duration::from_secs(60);

/// Native converters the adapter knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum Tool {
    Soffice,
    Pandoc,
    Inkscape,
    RsvgConvert,
    Magick,
    #[strum(serialize = "convert")]
    ImageMagickLegacy,
    #[strum(serialize = "gs")]
    Ghostscript,
    #[strum(serialize = "pdftocairo")]
    PdfToCairo,
}

impl Tool {
    /// Program name looked up on `PATH` when no override is configured.
    pub fn default_program(&self) -> &'static str {
        match self {
            Tool::Soffice => "soffice",
            Tool::Pandoc => "pandoc",
            Tool::Inkscape => "inkscape",
            Tool::RsvgConvert => "rsvg-convert",
            Tool::Magick => "magick",
            Tool::ImageMagickLegacy => "convert",
            Tool::Ghostscript => "gs",
            Tool::PdfToCairo => "pdftocairo",
        }
    }

    fn version_args(&self) -> &'static [&'static str] {
        match self {
            Tool::PdfToCairo => &["-v"],
            _ => &["--version"],
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Probe {
    available: bool,
    at: Instant,
}

#[derive(Debug)]
pub struct ToolAdapter {
    programs: HashMap<Tool, String>,
    timeout: Duration,
    probes: Mutex<HashMap<Tool, Probe>>,
}

impl ToolAdapter {
    pub fn new(config: &ServiceConfig) -> Self {
        Self::with_programs(config.tool_programs.clone(), config.tool_timeout)
    }

    pub fn with_programs(programs: HashMap<Tool, String>, timeout: Duration) -> Self {
        Self {
            programs,
            timeout,
            probes: Mutex::new(HashMap::new()),
        }
    }

    pub fn program(&self, tool: Tool) -> &str {
        self.programs
            .get(&tool)
            .map(String::as_str)
            .unwrap_or_else(|| tool.default_program())
    }

    /// Whether `tool` answers its version command. Cached for a minute.
    pub async fn is_available(&self, tool: Tool) -> bool {
        let now = Instant::now();
        if let Some(hit) = self.cached_probe(tool, now) {
            return hit;
        }
        let available = process::probe(self.program(tool), tool.version_args(), PROBE_TIMEOUT).await;
        tracing::debug!(%tool, program = self.program(tool), available, "probed tool");
        self.probes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tool, Probe { available, at: now });
        available
    }

    fn cached_probe(&self, tool: Tool, now: Instant) -> Option<bool> {
        let probes = self.probes.lock().unwrap_or_else(|e| e.into_inner());
        probes
            .get(&tool)
            .filter(|p| now.duration_since(p.at) < PROBE_TTL)
            .map(|p| p.available)
    }

    /// Availability of every known tool, for the health endpoint.
    pub async fn inventory(&self) -> BTreeMap<String, bool> {
        let mut out = BTreeMap::new();
        for tool in Tool::iter() {
            out.insert(tool.to_string(), self.is_available(tool).await);
        }
        out
    }

    pub async fn convert(
        &self,
        category: Category,
        from: &Format,
        to: &Format,
        options: &BTreeMap<String, String>,
        input: &Bytes,
        progress: &ProgressReporter,
    ) -> Result<ConvertedFile, ConvertError> {
        let planned = plan::plan(category, from, to, options)?;
        progress.update(10, "checking conversion tools").await;

        let mut runnable = Vec::with_capacity(planned.len());
        let mut missing = None;
        for strategy in planned {
            match self.first_missing(&strategy).await {
                None => runnable.push(strategy),
                Some(tool) => {
                    tracing::debug!(strategy = strategy.name, %tool, "skipping strategy; tool unavailable");
                    missing.get_or_insert(tool);
                }
            }
        }
        if runnable.is_empty() {
            let tool = missing.map(|t| self.program(t).to_owned()).unwrap_or_default();
            return Err(ConvertError::ToolUnavailable { tool });
        }

        progress.update(15, "preparing input").await;
        let workdir = tempfile::Builder::new()
            .prefix("kiln-")
            .tempdir()
            .map_err(|e| ConvertError::Internal(format!("cannot create work directory: {e}")))?;
        let input_path = workdir.path().join(format!("input.{}", from.extension()));
        let out_dir = workdir.path().join("out");
        tokio::fs::write(&input_path, input)
            .await
            .map_err(|e| ConvertError::Internal(format!("cannot stage input: {e}")))?;
        tokio::fs::create_dir(&out_dir)
            .await
            .map_err(|e| ConvertError::Internal(format!("cannot create output directory: {e}")))?;

        let mut last_failure = String::new();
        for (attempt, strategy) in runnable.iter().enumerate() {
            let (percent, message) = if attempt == 0 {
                (30, format!("converting with {}", strategy.name))
            } else {
                (55, format!("retrying with {}", strategy.name))
            };
            progress.update(percent, &message).await;

            match self.run_strategy(strategy, &input_path, &out_dir).await {
                Ok(output) => {
                    progress.update(80, "reading output").await;
                    let bytes = tokio::fs::read(&output).await.map_err(|e| {
                        ConvertError::Internal(format!("cannot read tool output: {e}"))
                    })?;
                    cleanup(workdir);
                    return Ok(ConvertedFile::new(to, bytes));
                }
                Err(StrategyFailure::Fatal(err)) => {
                    cleanup(workdir);
                    return Err(err);
                }
                Err(StrategyFailure::Failed(detail)) => {
                    tracing::warn!(strategy = strategy.name, %detail, "conversion strategy failed");
                    last_failure = format!("{}: {detail}", strategy.name);
                }
            }
        }

        cleanup(workdir);
        Err(ConvertError::ConversionFailed(last_failure))
    }

    async fn first_missing(&self, strategy: &Strategy) -> Option<Tool> {
        for tool in strategy.tools() {
            if !self.is_available(tool).await {
                return Some(tool);
            }
        }
        None
    }

    async fn run_strategy(
        &self,
        strategy: &Strategy,
        input: &Path,
        out_dir: &Path,
    ) -> Result<PathBuf, StrategyFailure> {
        let mut current = input.to_path_buf();
        for step in &strategy.steps {
            let output = out_dir.join(&step.output);
            let args = render_args(step, &current, &output, out_dir);
            let program = self.program(step.tool);
            tracing::debug!(tool = %step.tool, program, "running conversion step");

            match process::run(program, &args, out_dir, self.timeout).await {
                Ok(()) => {}
                Err(RunFailure::TimedOut) => {
                    return Err(StrategyFailure::Fatal(ConvertError::Timeout {
                        operation: program.to_owned(),
                        after: self.timeout,
                    }));
                }
                Err(RunFailure::Missing) => {
                    return Err(StrategyFailure::Fatal(ConvertError::ToolUnavailable {
                        tool: program.to_owned(),
                    }));
                }
                Err(RunFailure::Exited { status, stderr }) => {
                    return Err(StrategyFailure::Failed(if stderr.is_empty() {
                        format!("{program} exited with {status}")
                    } else {
                        format!("{program} exited with {status}: {stderr}")
                    }));
                }
                Err(RunFailure::Io(e)) => {
                    return Err(StrategyFailure::Failed(format!("{program}: {e}")));
                }
            }

            if !tokio::fs::try_exists(&output).await.unwrap_or(false) {
                return Err(StrategyFailure::Failed(format!(
                    "{program} did not produce {}",
                    step.output
                )));
            }
            current = output;
        }
        Ok(current)
    }
}

enum StrategyFailure {
    /// Stop here, no fallback.
    Fatal(ConvertError),
    /// Try the next strategy.
    Failed(String),
}

fn render_args(step: &Step, input: &Path, output: &Path, out_dir: &Path) -> Vec<OsString> {
    step.args
        .iter()
        .map(|arg| match arg {
            Arg::Lit(s) => OsString::from(s),
            Arg::Owned(s) => OsString::from(s),
            Arg::Input => input.as_os_str().to_owned(),
            Arg::Output => output.as_os_str().to_owned(),
            Arg::OutDir => out_dir.as_os_str().to_owned(),
        })
        .collect()
}

fn cleanup(workdir: tempfile::TempDir) {
    let path = workdir.path().to_path_buf();
    if let Err(e) = workdir.close() {
        tracing::debug!(path = %path.display(), error = %e, "work directory cleanup failed");
    }
}
