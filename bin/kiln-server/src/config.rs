//! Server configuration, loaded from environment variables at startup.
//!
//! Conversion limits (upload size, concurrency, polling, ...) are not here;
//! they live in [`kiln_core::ServiceConfig`] and are clamped there.

/// Runtime configuration for kiln-server.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:3000"`).
    pub bind_address: String,

    /// sqlx SQLite URL of the durable cache. Empty disables it and the
    /// cache runs in memory only.
    pub cache_database_url: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Comma-separated CORS origins; `None` allows any origin.
    pub cors_allowed_origins: Option<String>,

    /// Serve `/api-docs/openapi.json`.
    pub enable_openapi: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_owned(),
            cache_database_url: String::new(),
            log_level: "info".to_owned(),
            log_json: false,
            cors_allowed_origins: None,
            enable_openapi: true,
        }
    }
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            bind_address: env_or("KILN_BIND", "0.0.0.0:3000"),
            cache_database_url: env_or("KILN_CACHE_DATABASE_URL", "sqlite://kiln-cache.db?mode=rwc"),
            log_level: env_or("KILN_LOG", "info"),
            log_json: parse_flag("KILN_LOG_JSON", false),
            cors_allowed_origins: std::env::var("KILN_CORS_ORIGINS")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            enable_openapi: parse_flag("KILN_ENABLE_OPENAPI", true),
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}
