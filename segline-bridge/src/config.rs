//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use segline_core::{AllowGrowth, ConsumerOptions, ResizePolicy, Strict};

/// Transfer configuration. File: ~/.config/segline/config.toml or /etc/segline/config.toml.
/// Env overrides: SEGLINE_CHUNK_SIZE, SEGLINE_PIPELINE_DEPTH, SEGLINE_REQUEST_TIMEOUT_MS, SEGLINE_LOG.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Segment size in bytes (default 4096).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Concurrent segment requests per download (default 5).
    #[serde(default = "default_pipeline_depth")]
    pub pipeline_depth: u32,
    /// Per-request timeout (default 4000 ms).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub resize: ResizeMode,
    /// tracing filter used when RUST_LOG is unset (default "info").
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

/// What a download does when the producer reports a larger final segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeMode {
    /// Fail the transfer.
    #[default]
    Strict,
    /// Extend the segment table.
    Grow,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },
}

fn default_chunk_size() -> u64 {
    segline_core::DEFAULT_CHUNK_SIZE
}
fn default_pipeline_depth() -> u32 {
    segline_core::DEFAULT_PIPELINE_DEPTH
}
fn default_request_timeout_ms() -> u64 {
    4000
}
fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            pipeline_depth: default_pipeline_depth(),
            request_timeout_ms: default_request_timeout_ms(),
            resize: ResizeMode::default(),
            log_filter: default_log_filter(),
        }
    }
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn consumer_options(&self) -> ConsumerOptions {
        ConsumerOptions {
            chunk_size: self.chunk_size,
            pipeline_depth: self.pipeline_depth,
        }
    }

    pub fn resize_policy(&self) -> Box<dyn ResizePolicy> {
        match self.resize {
            ResizeMode::Strict => Box::new(Strict),
            ResizeMode::Grow => Box::new(AllowGrowth),
        }
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(s) = lookup("SEGLINE_CHUNK_SIZE") {
            self.chunk_size = parse_env("SEGLINE_CHUNK_SIZE", s)?;
        }
        if let Some(s) = lookup("SEGLINE_PIPELINE_DEPTH") {
            self.pipeline_depth = parse_env("SEGLINE_PIPELINE_DEPTH", s)?;
        }
        if let Some(s) = lookup("SEGLINE_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = parse_env("SEGLINE_REQUEST_TIMEOUT_MS", s)?;
        }
        if let Some(s) = lookup("SEGLINE_LOG") {
            self.log_filter = s;
        }
        Ok(())
    }

    /// Install the global subscriber with `log_filter`; `RUST_LOG` still wins.
    pub fn init_logging(&self) {
        crate::logging::init_logging(&self.log_filter);
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { var, value })
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Result<Config, ConfigError> {
    load_from(&config_paths(), |var| std::env::var(var).ok())
}

/// Defaults, then the first of `paths` that exists, then overrides from `lookup`.
pub fn load_from(
    paths: &[PathBuf],
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Config, ConfigError> {
    let mut c = match paths.iter().find(|p| p.exists()) {
        Some(p) => load_file(p)?,
        None => Config::default(),
    };
    c.apply_env(lookup)?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/segline/config.toml"));
    }
    out.push(PathBuf::from("/etc/segline/config.toml"));
    out
}

/// Parse one config file; missing keys take their defaults.
pub fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
