//! Logging and metrics set-up.
//!
//! Logs always go to stderr through a [`ConsoleWriter`] that can be muted at
//! runtime, and optionally to a daily-rotated file. Metrics are exported over
//! a Prometheus listener when an address is configured.

use crate::config::ObservabilityConfig;
use crate::error::{PurgemanError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::{EitherWriter, MakeWriter};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static CONSOLE_MUTED: AtomicBool = AtomicBool::new(false);

/// Stderr writer that turns into a sink once [`silence_console`] was called.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleWriter;

impl<'a> MakeWriter<'a> for ConsoleWriter {
    type Writer = EitherWriter<io::Stderr, io::Sink>;

    fn make_writer(&'a self) -> Self::Writer {
        if is_console_silenced() {
            EitherWriter::B(io::sink())
        } else {
            EitherWriter::A(io::stderr())
        }
    }
}

/// Stop writing log lines to stderr. The file destination is unaffected.
pub fn silence_console() {
    CONSOLE_MUTED.store(true, Ordering::SeqCst);
}

/// Whether console output has been silenced.
pub fn is_console_silenced() -> bool {
    CONSOLE_MUTED.load(Ordering::SeqCst)
}

/// Keeps the background log file writer alive. Drop it last.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Initialize logging and, if configured, the metrics exporter.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init(config: &ObservabilityConfig) -> Result<LoggingGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| PurgemanError::InvalidConfig {
            field: "observability.log_level".to_string(),
            reason: e.to_string(),
        })?;

    let console = (!config.json_logs).then(|| fmt::layer().with_writer(ConsoleWriter));
    let console_json = config
        .json_logs
        .then(|| fmt::layer().json().with_writer(ConsoleWriter));

    let (file, guard) = match &config.log_path {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(file_appender(path)?);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(console_json)
        .with(file)
        .try_init()
        .map_err(|e| PurgemanError::Internal(format!("Failed to init logging: {}", e)))?;

    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| {
                PurgemanError::Internal(format!("Failed to install metrics exporter: {}", e))
            })?;
        info!(addr = %addr, "Metrics exporter listening");
    }

    Ok(LoggingGuard { _file: guard })
}

/// Daily-rotated appender writing `<path>.<date>` next to `path`.
fn file_appender(path: &Path) -> Result<RollingFileAppender> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| PurgemanError::InvalidConfig {
            field: "observability.log_path".to_string(),
            reason: format!("'{}' does not name a file", path.display()),
        })?;

    let directory = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file_name)
        .build(directory)
        .map_err(|e| {
            PurgemanError::Config(format!(
                "cannot open log file '{}': {}",
                path.display(),
                e
            ))
        })
}
