//! Process-wide tracing setup for the harness and worker binaries.

use crate::config::{ConfigResult, EnvParser};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Output format of the console and file layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "pretty" | "text" | "" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Filter directive: a level (`info`) or a full `EnvFilter` string.
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
    /// Console output on stderr instead of stdout.
    pub stderr: bool,
}

impl LogConfig {
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            format: LogFormat::Pretty,
            file: None,
            stderr: false,
        }
    }

    /// Read `HCI_LOG_LEVEL`, `HCI_LOG_FORMAT` and `HCI_LOG_FILE`.
    ///
    /// Unusable values are reported together; nothing is logged yet at this
    /// point, so the caller surfaces the error.
    pub fn from_env(default_level: &str) -> ConfigResult<Self> {
        let mut parser = EnvParser::new();
        let config = Self {
            level: parser.get_log_level("LOG_LEVEL", default_level).value,
            format: parser
                .get_parsed("LOG_FORMAT", LogFormat::Pretty, "pretty or json", LogFormat::parse)
                .value,
            file: parser
                .get_optional_string("LOG_FILE")
                .value
                .filter(|f| !f.trim().is_empty())
                .map(PathBuf::from),
            stderr: false,
        };
        parser.finish()?;
        Ok(config)
    }

    #[must_use]
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.level).unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Keeps the non-blocking file writer alive; hold for the process lifetime.
#[must_use = "dropping the guards stops file logging"]
pub struct LoggingGuards {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber described by `config`.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards> {
    let mut layers: Vec<BoxedLayer> = Vec::new();

    let console: BoxedLayer = match (config.format, config.stderr) {
        (LogFormat::Json, true) => fmt::layer().json().with_writer(std::io::stderr).boxed(),
        (LogFormat::Json, false) => fmt::layer().json().boxed(),
        (LogFormat::Pretty, true) => fmt::layer().with_writer(std::io::stderr).boxed(),
        (LogFormat::Pretty, false) => fmt::layer().boxed(),
    };
    layers.push(console);

    let mut file_guard = None;
    if let Some(path) = &config.file {
        let (writer, guard) = file_writer(path)?;
        let layer: BoxedLayer = match config.format {
            LogFormat::Json => fmt::layer().json().with_writer(writer).boxed(),
            LogFormat::Pretty => fmt::layer().with_ansi(false).with_writer(writer).boxed(),
        };
        layers.push(layer);
        file_guard = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(config.filter())
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LoggingGuards { _file: file_guard })
}

fn file_writer(path: &Path) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let name = path
        .file_name()
        .with_context(|| format!("Log file path has no file name: {}", path.display()))?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    let appender = tracing_appender::rolling::never(&dir, name);
    Ok(tracing_appender::non_blocking(appender))
}
