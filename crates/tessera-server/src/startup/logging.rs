//! Logging setup
//!
//! | Log File        | Component                  | Target Prefixes      |
//! |-----------------|----------------------------|----------------------|
//! | tessera.log     | Root logger (all events)   | (all)                |
//! | discovery.log   | Registration and resolvers | tessera_discovery    |
//! | access.log      | gRPC / HTTP request logs   | tessera_server::access |
//!
//! Console output is human-readable (`pretty`) or one JSON object per line
//! (`json`). `RUST_LOG` overrides the configured level on every layer.

use std::path::PathBuf;

use serde::Deserialize;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// Tracing target used by the request logging layers
pub const ACCESS_TARGET: &str = "tessera_server::access";

struct ComponentLogDef {
    file_name: &'static str,
    targets: &'static [&'static str],
}

const COMPONENT_LOGS: &[ComponentLogDef] = &[
    ComponentLogDef {
        file_name: "discovery.log",
        targets: &["tessera_discovery"],
    },
    ComponentLogDef {
        file_name: "access.log",
        targets: &[ACCESS_TARGET],
    },
];

/// Log rotation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Daily,
    Hourly,
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Console output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, colored (development)
    Pretty,
    /// One JSON object per event (production)
    Json,
}

/// `logging` configuration section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum level when `RUST_LOG` is not set
    pub level: String,
    pub format: LogFormat,
    /// Enable console output
    pub console: bool,
    /// Enable rolling file output
    pub file: bool,
    /// Directory for log files
    pub dir: PathBuf,
    pub rotation: LogRotation,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            console: true,
            file: false,
            dir: PathBuf::from("logs"),
            rotation: LogRotation::Daily,
        }
    }
}

impl LoggingConfig {
    /// Configured level, falling back to INFO when unparsable
    pub fn level(&self) -> Level {
        self.level.parse().unwrap_or(Level::INFO)
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level().to_string()))
    }
}

/// Guard that keeps the logging system alive.
///
/// Dropping it flushes all buffered file output.
pub struct LoggingGuard {
    _file_guards: Vec<WorkerGuard>,
}

/// Initialize the global subscriber
///
/// All filtering is per-layer: console and root file use `EnvFilter`,
/// component files use [`Targets`] so they capture their modules fully.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard, Box<dyn std::error::Error>> {
    if config.file {
        std::fs::create_dir_all(&config.dir)?;
    }

    let mut guards: Vec<WorkerGuard> = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.console {
        let layer = match config.format {
            LogFormat::Pretty => fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_filter(config.env_filter())
                .boxed(),
            LogFormat::Json => fmt::layer()
                .json()
                .with_current_span(true)
                .with_target(true)
                .with_filter(config.env_filter())
                .boxed(),
        };
        layers.push(layer);
    }

    if config.file {
        let root_appender =
            RollingFileAppender::new(config.rotation.into(), &config.dir, "tessera.log");
        let (root_nb, root_guard) = tracing_appender::non_blocking(root_appender);
        guards.push(root_guard);

        let root_layer = fmt::layer()
            .with_writer(root_nb)
            .with_target(true)
            .with_thread_names(true)
            .with_ansi(false)
            .with_filter(config.env_filter());
        layers.push(Box::new(root_layer));

        for component in COMPONENT_LOGS {
            let appender =
                RollingFileAppender::new(config.rotation.into(), &config.dir, component.file_name);
            let (nb, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);

            let mut targets = Targets::new();
            for target in component.targets {
                targets = targets.with_target(*target, LevelFilter::TRACE);
            }

            let layer = fmt::layer()
                .with_writer(nb)
                .with_target(true)
                .with_ansi(false)
                .with_filter(targets);
            layers.push(Box::new(layer));
        }
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| format!("Failed to initialize logging: {}", e))?;

    if config.file {
        tracing::info!(
            log_dir = %config.dir.display(),
            component_files = COMPONENT_LOGS.len(),
            "File logging initialized"
        );
    }

    Ok(LoggingGuard {
        _file_guards: guards,
    })
}
