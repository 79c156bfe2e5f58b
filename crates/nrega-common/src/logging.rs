//! Logging configuration and initialization
//!
//! Every MGNREGA binary initializes logging through [`init_logging`]. Output can
//! go to the console, to a daily rolling file, or both, as text or JSON.
//!
//! Use structured fields rather than formatting values into the message:
//!
//! ```rust
//! use tracing::{info, warn};
//!
//! # let run_id = "3f1c";
//! # let failed = 2;
//! info!(run_id = %run_id, "Ingestion run started");
//! warn!(run_id = %run_id, records_failed = failed, "Ingestion run finished with rejections");
//! ```
//!
//! # Example
//!
//! ```no_run
//! use nrega_common::logging::{init_logging, LogConfig};
//! use tracing::Level;
//!
//! let config = LogConfig::new("nrega-ingest")
//!     .with_level(Level::DEBUG)
//!     .merge_env()
//!     .unwrap_or_else(|_| LogConfig::new("nrega-ingest"));
//! let _guard = init_logging(&config).expect("logging");
//! tracing::info!("Application started");
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
    registry::Registry,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::error::{NregaError, Result};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Where log lines are written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

impl LogOutput {
    fn console(self) -> bool {
        self != LogOutput::File
    }

    fn file(self) -> bool {
        self != LogOutput::Console
    }
}

impl FromStr for LogOutput {
    type Err = NregaError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "console" | "stdout" => Ok(Self::Console),
            "file" => Ok(Self::File),
            "both" => Ok(Self::Both),
            other => Err(NregaError::config(format!(
                "LOG_OUTPUT must be console, file or both, got '{}'",
                other
            ))),
        }
    }
}

/// Logging configuration
///
/// Built with `LogConfig::new(prefix)` and the `with_*` setters, then usually
/// overlaid with [`LogConfig::merge_env`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub output: LogOutput,
    /// One JSON object per line instead of human-readable text
    pub json: bool,
    pub log_dir: PathBuf,
    /// Rolling files are named `<prefix>.<yyyy-mm-dd>`
    pub file_prefix: String,
    /// Extra `EnvFilter` directives, e.g. "sqlx=warn,reqwest=info"
    pub directives: Option<String>,
    /// Include source file and line in each event
    pub with_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new("nrega")
    }
}

impl LogConfig {
    pub fn new(file_prefix: impl Into<String>) -> Self {
        Self {
            level: Level::INFO,
            output: LogOutput::Console,
            json: false,
            log_dir: PathBuf::from("./logs"),
            file_prefix: file_prefix.into(),
            directives: None,
            with_location: false,
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn with_directives(mut self, directives: impl Into<String>) -> Self {
        self.directives = Some(directives.into());
        self
    }

    /// Overlay `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT` (text|json), `LOG_DIR`,
    /// `LOG_FILE_PREFIX`, `LOG_FILTER` and `LOG_LOCATION` on top of `self`
    pub fn merge_env(mut self) -> Result<Self> {
        if let Some(level) = env_var("LOG_LEVEL") {
            self.level = level
                .parse()
                .map_err(|_| NregaError::config(format!("LOG_LEVEL '{}' is not a level", level)))?;
        }
        if let Some(output) = env_var("LOG_OUTPUT") {
            self.output = output.parse()?;
        }
        if let Some(format) = env_var("LOG_FORMAT") {
            self.json = match format.to_ascii_lowercase().as_str() {
                "json" => true,
                "text" => false,
                other => {
                    return Err(NregaError::config(format!(
                        "LOG_FORMAT must be text or json, got '{}'",
                        other
                    )))
                },
            };
        }
        self.log_dir = env_var("LOG_DIR").map(PathBuf::from).unwrap_or(self.log_dir);
        self.file_prefix = env_var("LOG_FILE_PREFIX").unwrap_or(self.file_prefix);
        self.directives = env_var("LOG_FILTER").or(self.directives);
        self.with_location = env_var("LOG_LOCATION")
            .map(|v| matches!(v.as_str(), "1" | "true"))
            .unwrap_or(self.with_location);
        Ok(self)
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        let mut filter = EnvFilter::from_default_env().add_directive(self.level.into());

        let extra = self.directives.as_deref().unwrap_or_default();
        for directive in extra.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            let parsed = directive.parse().map_err(|e| {
                NregaError::Logging(format!("Invalid filter directive '{}': {}", directive, e))
            })?;
            filter = filter.add_directive(parsed);
        }

        Ok(filter)
    }

    fn fmt_layer<W>(&self, writer: W, ansi: bool) -> BoxedLayer
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_file(self.with_location)
            .with_line_number(self.with_location);

        if self.json {
            layer.json().boxed()
        } else {
            layer.boxed()
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Keeps the non-blocking file writer alive; drop it only at shutdown.
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global tracing subscriber
///
/// Must be called once per process. The returned guard flushes buffered file
/// output when dropped.
pub fn init_logging(config: &LogConfig) -> Result<LogGuard> {
    let filter = config.env_filter()?;
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut file_guard = None;

    if config.output.console() {
        layers.push(config.fmt_layer(std::io::stdout, true));
    }

    if config.output.file() {
        std::fs::create_dir_all(&config.log_dir)?;
        let appender = tracing_appender::rolling::daily(&config.log_dir, &config.file_prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(config.fmt_layer(writer, false));
        file_guard = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| NregaError::Logging(e.to_string()))?;

    Ok(LogGuard { _file: file_guard })
}
