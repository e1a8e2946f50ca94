use std::path::PathBuf;

use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, Protocol, WithExportConfig};
use opentelemetry_sdk::{Resource, logs::SdkLoggerProvider};
use thiserror::Error;
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{EnvFilter, Layer, Registry, filter::Directive, fmt, prelude::*};

pub const SERVICE_NAME: &str = "logship";
pub const LOG_FILE_PREFIX: &str = "logship.log";

/// Targets that would feed their own log export back into the exporter.
const EXPORT_NOISE: [&str; 5] = ["hyper=off", "tonic=off", "h2=off", "reqwest=off", "opentelemetry=off"];

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("could not create log directory {path}: {source}")]
    LogDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not build OTLP log exporter: {0}")]
    Exporter(String),

    #[error("could not install subscriber: {0}")]
    Init(String),
}

#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `logship=debug`.
    pub level: String,
    /// Daily rolling file next to stdout when set.
    pub log_dir: Option<PathBuf>,
    /// OTLP/HTTP logs endpoint, e.g. `http://localhost:4318/v1/logs`.
    pub otel_endpoint: Option<String>,
}

/// Keeps the file writer and the OTLP provider alive. Flushes on drop.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
    provider: Option<SdkLoggerProvider>,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("log exporter shutdown failed: {e}");
            }
        }
    }
}

/// `RUST_LOG` wins over the configured level; an unparsable level falls back
/// to `info`.
fn level_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn export_filter(level: &str) -> EnvFilter {
    EXPORT_NOISE
        .iter()
        .filter_map(|d| d.parse::<Directive>().ok())
        .fold(level_filter(level), EnvFilter::add_directive)
}

fn init_logs(endpoint: &str) -> Result<SdkLoggerProvider, LoggerError> {
    let exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| LoggerError::Exporter(e.to_string()))?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(Resource::builder().with_service_name(SERVICE_NAME).build())
        .build())
}

/// Install the global subscriber: stdout, plus an optional rolling file and
/// an optional OTLP log export.
pub fn init_tracing(config: &LogConfig) -> Result<LogGuard, LoggerError> {
    let stdout = fmt::layer().with_target(true).with_filter(level_filter(&config.level));

    let (file, file_guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|source| LoggerError::LogDir {
                path: dir.clone(),
                source,
            })?;
            let (writer, guard) = tracing_appender::non_blocking(rolling::daily(dir, LOG_FILE_PREFIX));
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(level_filter(&config.level));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let provider = config.otel_endpoint.as_deref().map(init_logs).transpose()?;
    let otel = provider
        .as_ref()
        .map(|p| OpenTelemetryTracingBridge::new(p).with_filter(export_filter(&config.level)));

    Registry::default()
        .with(stdout)
        .with(file)
        .with(otel)
        .try_init()
        .map_err(|e| LoggerError::Init(e.to_string()))?;

    Ok(LogGuard {
        _file: file_guard,
        provider,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn export_filter_silences_transport_crates() {
        let rendered = export_filter("debug").to_string();
        for target in ["hyper", "reqwest", "tonic"] {
            assert!(rendered.contains(&format!("{target}=off")), "{rendered}");
        }
    }

    #[test]
    fn installs_once_with_file_layer() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("logs");
        let config = LogConfig {
            level: "debug".into(),
            log_dir: Some(dir.clone()),
            otel_endpoint: None,
        };

        let guard = init_tracing(&config).unwrap();
        assert!(dir.is_dir());
        tracing::info!("hello from the logger test");

        assert!(matches!(init_tracing(&config), Err(LoggerError::Init(_))));
        drop(guard);
    }
}
