//! Validated, range-clamped service tunables.
//!
//! Every limit the core consumes is read here from `KILN_*` variables. Values
//! outside their documented band are clamped, unparsable ones fall back to the
//! default; either way a [`ConfigAdjustment`] is recorded so the caller can
//! raise an alert instead of crashing.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use strum::IntoEnumIterator;

use crate::format::{Category, Format};
use crate::tools::Tool;

/// A tunable with a default and an inclusive `[min, max]` band.
#[derive(Debug, Clone, Copy)]
pub struct Bounded<T> {
    pub key: &'static str,
    pub default: T,
    pub min: T,
    pub max: T,
}

/// One value that did not make it into the config as written.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigAdjustment {
    pub key: String,
    pub requested: String,
    pub applied: String,
    pub reason: String,
}

impl<T> Bounded<T>
where
    T: Copy + PartialOrd + FromStr + Display,
{
    pub const fn new(key: &'static str, default: T, min: T, max: T) -> Self {
        Self { key, default, min, max }
    }

    /// Resolve a raw string (or its absence) into a value inside the band.
    pub fn resolve(&self, raw: Option<&str>, adjustments: &mut Vec<ConfigAdjustment>) -> T {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return self.default;
        };
        let Ok(value) = raw.parse::<T>() else {
            adjustments.push(self.adjustment(raw, self.default, "not a valid number"));
            return self.default;
        };
        if value < self.min {
            adjustments.push(self.adjustment(raw, self.min, "below minimum"));
            self.min
        } else if value > self.max {
            adjustments.push(self.adjustment(raw, self.max, "above maximum"));
            self.max
        } else {
            value
        }
    }

    fn adjustment(&self, requested: &str, applied: T, reason: &str) -> ConfigAdjustment {
        ConfigAdjustment {
            key: self.key.to_owned(),
            requested: requested.to_owned(),
            applied: applied.to_string(),
            reason: format!("{reason} (allowed {}..={})", self.min, self.max),
        }
    }
}

pub const MAX_UPLOAD_BYTES: Bounded<u64> =
    Bounded::new("KILN_MAX_UPLOAD_BYTES", 50 * 1024 * 1024, 1024, 512 * 1024 * 1024);
pub const REQUEST_TIMEOUT_MS: Bounded<u64> =
    Bounded::new("KILN_REQUEST_TIMEOUT_MS", 120_000, 1_000, 600_000);
pub const TOOL_TIMEOUT_MS: Bounded<u64> = Bounded::new("KILN_TOOL_TIMEOUT_MS", 30_000, 100, 300_000);
pub const RATE_WINDOW_MS: Bounded<u64> =
    Bounded::new("KILN_RATE_WINDOW_MS", 60_000, 1_000, 3_600_000);
pub const RATE_MAX_PER_CLIENT: Bounded<u32> =
    Bounded::new("KILN_RATE_MAX_PER_CLIENT", 30, 1, 10_000);
pub const CLIENT_CONCURRENCY: Bounded<u32> = Bounded::new("KILN_CLIENT_CONCURRENCY", 2, 1, 64);
pub const GLOBAL_CONCURRENCY: Bounded<u32> = Bounded::new("KILN_GLOBAL_CONCURRENCY", 4, 1, 256);
pub const QUEUE_SOFT_LIMIT: Bounded<usize> = Bounded::new("KILN_QUEUE_SOFT_LIMIT", 50, 1, 10_000);
pub const CACHE_TTL_SECS: Bounded<u64> = Bounded::new("KILN_CACHE_TTL_SECS", 3_600, 1, 604_800);
pub const PROGRESS_RETENTION_SECS: Bounded<u64> =
    Bounded::new("KILN_PROGRESS_RETENTION_SECS", 3_600, 1, 86_400);
pub const POLL_MIN_INTERVAL_MS: Bounded<u64> =
    Bounded::new("KILN_POLL_MIN_INTERVAL_MS", 1_000, 50, 60_000);
pub const POLL_BASE_MS: Bounded<u64> = Bounded::new("KILN_POLL_BASE_MS", 1_500, 100, 60_000);
pub const POLL_MAX_MS: Bounded<u64> = Bounded::new("KILN_POLL_MAX_MS", 10_000, 500, 120_000);
pub const HEALTH_WINDOW_SECS: Bounded<u64> = Bounded::new("KILN_HEALTH_WINDOW_SECS", 60, 5, 3_600);
pub const HEALTH_ALERT_THRESHOLD: Bounded<f64> =
    Bounded::new("KILN_HEALTH_ALERT_THRESHOLD", 6.0, 0.0, 10.0);

/// All limits used by admission, scheduling, caching, tools and health.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub max_upload_bytes: u64,
    pub request_timeout: Duration,
    pub tool_timeout: Duration,
    pub rate_window: Duration,
    pub rate_max_per_client: u32,
    pub client_concurrency: u32,
    pub global_concurrency: u32,
    pub queue_soft_limit: usize,
    pub cache_ttl: Duration,
    pub progress_retention: Duration,
    pub poll_min_interval: Duration,
    pub poll_base: Duration,
    pub poll_max: Duration,
    pub health_window: Duration,
    pub health_alert_threshold: f64,
    /// Allowed target formats per category.
    pub allowed_formats: HashMap<Category, Vec<Format>>,
    /// Program overrides for external tools (`KILN_TOOL_SOFFICE=/opt/lo/soffice`).
    pub tool_programs: HashMap<Tool, String>,
}

/// A config plus everything that had to be corrected while building it.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: ServiceConfig,
    pub adjustments: Vec<ConfigAdjustment>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig::from_lookup(|_| None).config
    }
}

impl ServiceConfig {
    /// Build from the process environment.
    pub fn from_env() -> LoadedConfig {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment in production, a
    /// map in tests).
    pub fn from_lookup<F>(lookup: F) -> LoadedConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut adj = Vec::new();
        let get = |b_key: &str| lookup(b_key);

        let max_upload_bytes = MAX_UPLOAD_BYTES.resolve(get(MAX_UPLOAD_BYTES.key).as_deref(), &mut adj);
        let request_timeout = ms(REQUEST_TIMEOUT_MS.resolve(get(REQUEST_TIMEOUT_MS.key).as_deref(), &mut adj));
        let tool_timeout = ms(TOOL_TIMEOUT_MS.resolve(get(TOOL_TIMEOUT_MS.key).as_deref(), &mut adj));
        let rate_window = ms(RATE_WINDOW_MS.resolve(get(RATE_WINDOW_MS.key).as_deref(), &mut adj));
        let rate_max_per_client =
            RATE_MAX_PER_CLIENT.resolve(get(RATE_MAX_PER_CLIENT.key).as_deref(), &mut adj);
        let mut client_concurrency =
            CLIENT_CONCURRENCY.resolve(get(CLIENT_CONCURRENCY.key).as_deref(), &mut adj);
        let global_concurrency =
            GLOBAL_CONCURRENCY.resolve(get(GLOBAL_CONCURRENCY.key).as_deref(), &mut adj);
        let queue_soft_limit = QUEUE_SOFT_LIMIT.resolve(get(QUEUE_SOFT_LIMIT.key).as_deref(), &mut adj);
        let cache_ttl = secs(CACHE_TTL_SECS.resolve(get(CACHE_TTL_SECS.key).as_deref(), &mut adj));
        let progress_retention =
            secs(PROGRESS_RETENTION_SECS.resolve(get(PROGRESS_RETENTION_SECS.key).as_deref(), &mut adj));
        let mut poll_min = POLL_MIN_INTERVAL_MS.resolve(get(POLL_MIN_INTERVAL_MS.key).as_deref(), &mut adj);
        let mut poll_base = POLL_BASE_MS.resolve(get(POLL_BASE_MS.key).as_deref(), &mut adj);
        let poll_max = POLL_MAX_MS.resolve(get(POLL_MAX_MS.key).as_deref(), &mut adj);
        let health_window = secs(HEALTH_WINDOW_SECS.resolve(get(HEALTH_WINDOW_SECS.key).as_deref(), &mut adj));
        let health_alert_threshold =
            HEALTH_ALERT_THRESHOLD.resolve(get(HEALTH_ALERT_THRESHOLD.key).as_deref(), &mut adj);

        if client_concurrency > global_concurrency {
            adj.push(cross_field(
                CLIENT_CONCURRENCY.key,
                client_concurrency,
                global_concurrency,
                "cannot exceed KILN_GLOBAL_CONCURRENCY",
            ));
            client_concurrency = global_concurrency;
        }
        if poll_min > poll_max {
            adj.push(cross_field(POLL_MIN_INTERVAL_MS.key, poll_min, poll_max, "cannot exceed KILN_POLL_MAX_MS"));
            poll_min = poll_max;
        }
        if poll_base < poll_min || poll_base > poll_max {
            let applied = poll_base.clamp(poll_min, poll_max);
            adj.push(cross_field(
                POLL_BASE_MS.key,
                poll_base,
                applied,
                "must lie between the poll minimum and maximum",
            ));
            poll_base = applied;
        }

        let mut allowed_formats = HashMap::new();
        for category in Category::iter() {
            let key = format!("KILN_{}_FORMATS", category.as_ref().to_ascii_uppercase());
            let formats = resolve_formats(category, &key, get(&key).as_deref(), &mut adj);
            allowed_formats.insert(category, formats);
        }

        let mut tool_programs = HashMap::new();
        for tool in Tool::iter() {
            let key = format!("KILN_TOOL_{}", tool.as_ref().to_ascii_uppercase().replace('-', "_"));
            if let Some(program) = get(&key).map(|p| p.trim().to_owned()).filter(|p| !p.is_empty()) {
                tool_programs.insert(tool, program);
            }
        }

        LoadedConfig {
            config: ServiceConfig {
                max_upload_bytes,
                request_timeout,
                tool_timeout,
                rate_window,
                rate_max_per_client,
                client_concurrency,
                global_concurrency,
                queue_soft_limit,
                cache_ttl,
                progress_retention,
                poll_min_interval: ms(poll_min),
                poll_base: ms(poll_base),
                poll_max: ms(poll_max),
                health_window,
                health_alert_threshold,
                allowed_formats,
                tool_programs,
            },
            adjustments: adj,
        }
    }

    pub fn allowed_targets(&self, category: Category) -> &[Format] {
        self.allowed_formats
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_allowed_target(&self, category: Category, format: &Format) -> bool {
        self.allowed_targets(category).contains(format)
    }

    /// Human-readable list for error messages: `png, jpeg, webp`.
    pub fn allowed_targets_display(&self, category: Category) -> String {
        self.allowed_targets(category)
            .iter()
            .map(Format::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

fn secs(v: u64) -> Duration {
    Duration::from_secs(v)
}

fn cross_field<T: Display>(key: &str, requested: T, applied: T, reason: &str) -> ConfigAdjustment {
    ConfigAdjustment {
        key: key.to_owned(),
        requested: requested.to_string(),
        applied: applied.to_string(),
        reason: reason.to_owned(),
    }
}

fn resolve_formats(
    category: Category,
    key: &str,
    raw: Option<&str>,
    adjustments: &mut Vec<ConfigAdjustment>,
) -> Vec<Format> {
    let defaults = || {
        category
            .default_targets()
            .iter()
            .filter_map(|f| Format::parse(f))
            .collect::<Vec<_>>()
    };
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return defaults();
    };

    let mut formats: Vec<Format> = Vec::new();
    let mut rejected = Vec::new();
    for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        match Format::parse(token).filter(|f| category.knows(f)) {
            Some(f) if !formats.contains(&f) => formats.push(f),
            Some(_) => {}
            None => rejected.push(token.to_owned()),
        }
    }

    if formats.is_empty() {
        let fallback = defaults();
        adjustments.push(ConfigAdjustment {
            key: key.to_owned(),
            requested: raw.to_owned(),
            applied: join(&fallback),
            reason: format!("no usable {category} formats; using defaults"),
        });
        return fallback;
    }
    if !rejected.is_empty() {
        adjustments.push(ConfigAdjustment {
            key: key.to_owned(),
            requested: raw.to_owned(),
            applied: join(&formats),
            reason: format!("dropped unknown {category} formats: {}", rejected.join(", ")),
        });
    }
    formats
}

fn join(formats: &[Format]) -> String {
    formats.iter().map(Format::as_str).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(pairs: &[(&str, &str)]) -> LoadedConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        ServiceConfig::from_lookup(move |k| map.get(k).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let loaded = load(&[]);
        assert!(loaded.adjustments.is_empty());
        let cfg = loaded.config;
        assert_eq!(cfg.tool_timeout, Duration::from_secs(30));
        assert_eq!(cfg.global_concurrency, 4);
        assert_eq!(
            cfg.allowed_targets_display(Category::Image),
            "png, jpeg, webp, avif, tiff, heif"
        );
    }

    #[test]
    fn out_of_range_values_are_clamped_and_reported() {
        let loaded = load(&[("KILN_GLOBAL_CONCURRENCY", "9999"), ("KILN_RATE_MAX_PER_CLIENT", "0")]);
        assert_eq!(loaded.config.global_concurrency, 256);
        assert_eq!(loaded.config.rate_max_per_client, 1);
        assert_eq!(loaded.adjustments.len(), 2);
        assert_eq!(loaded.adjustments[0].key, "KILN_RATE_MAX_PER_CLIENT");
        assert_eq!(loaded.adjustments[0].applied, "1");
    }

    #[test]
    fn garbage_falls_back_to_default() {
        let loaded = load(&[("KILN_TOOL_TIMEOUT_MS", "thirty seconds")]);
        assert_eq!(loaded.config.tool_timeout, Duration::from_secs(30));
        assert_eq!(loaded.adjustments[0].reason, "not a valid number (allowed 100..=300000)");
    }

    #[test]
    fn client_concurrency_never_exceeds_global() {
        let loaded = load(&[("KILN_CLIENT_CONCURRENCY", "8"), ("KILN_GLOBAL_CONCURRENCY", "3")]);
        assert_eq!(loaded.config.client_concurrency, 3);
        assert!(loaded.adjustments.iter().any(|a| a.key == "KILN_CLIENT_CONCURRENCY"));
    }

    #[test]
    fn poll_band_is_ordered() {
        let loaded = load(&[("KILN_POLL_BASE_MS", "200"), ("KILN_POLL_MIN_INTERVAL_MS", "900")]);
        let cfg = loaded.config;
        assert!(cfg.poll_min_interval <= cfg.poll_base);
        assert!(cfg.poll_base <= cfg.poll_max);
        assert_eq!(cfg.poll_base, Duration::from_millis(900));
    }

    #[test]
    fn format_lists_drop_unknown_tokens() {
        let loaded = load(&[("KILN_IMAGE_FORMATS", "PNG, jpg, exe, png")]);
        let targets: Vec<_> = loaded.config.allowed_targets(Category::Image).to_vec();
        assert_eq!(targets, vec![Format::parse("png").unwrap(), Format::parse("jpeg").unwrap()]);
        assert_eq!(loaded.adjustments.len(), 1);
        assert!(loaded.adjustments[0].reason.contains("exe"));
    }

    #[test]
    fn empty_format_list_uses_defaults() {
        let loaded = load(&[("KILN_VECTOR_FORMATS", "exe,bat")]);
        assert_eq!(loaded.config.allowed_targets(Category::Vector).len(), 4);
        assert_eq!(loaded.adjustments.len(), 1);
    }

    #[test]
    fn tool_programs_are_overridable() {
        let loaded = load(&[("KILN_TOOL_SOFFICE", "/opt/libreoffice/program/soffice")]);
        assert_eq!(
            loaded.config.tool_programs.get(&Tool::Soffice).map(String::as_str),
            Some("/opt/libreoffice/program/soffice")
        );
    }
}
