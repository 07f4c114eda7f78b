use anyhow::{Context, Result};
use std::path::Path;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};
use warden_config::domains::logging::{LogFormat, LogLevel, LogTarget};
use warden_config::LoggingConfig;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Keeps non-blocking file writers alive; drop it last
#[must_use = "dropping the guard stops file logging"]
#[derive(Default)]
pub struct LoggingGuard {
    _guards: Vec<WorkerGuard>,
}

/// Initialize logging from configuration
pub fn init_logging_from_config(config: &LoggingConfig) -> Result<LoggingGuard> {
    let mut guards = Vec::new();
    let mut layers: Vec<BoxedLayer> = Vec::with_capacity(config.targets.len());

    for target in &config.targets {
        match target {
            LogTarget::Console { level } => {
                let layer = fmt_layer(config.format, config.include_location, true, std::io::stdout)
                    .with_filter(level_filter(level.unwrap_or(config.level)))
                    .boxed();
                layers.push(layer);
            }
            LogTarget::File { path, level } => {
                let (writer, guard) = file_writer(Path::new(path))?;
                guards.push(guard);
                let layer = fmt_layer(config.format, config.include_location, false, writer)
                    .with_filter(level_filter(level.unwrap_or(config.level)))
                    .boxed();
                layers.push(layer);
            }
        }
    }

    let env_filter = EnvFilter::try_new(config.level.as_str())
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(LoggingGuard { _guards: guards })
}

/// Initialize simple tracing for basic console output
pub fn init_simple_tracing(log_level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_new(log_level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}

/// Initialize tracing for worker and bridge-server processes
///
/// Output goes to stderr because stdout carries protocol traffic.
pub fn init_worker_tracing(log_level: Option<&str>) -> Result<()> {
    let env_filter = match log_level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| {
            eprintln!("Invalid log level '{}', falling back to 'info'", level);
            EnvFilter::new("info")
        }),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    if tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}

fn fmt_layer<W>(format: LogFormat, include_location: bool, ansi: bool, writer: W) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_thread_ids(true)
        .with_file(include_location)
        .with_line_number(include_location);

    match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Text => layer.boxed(),
    }
}

fn file_writer(
    path: &Path,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let directory = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .with_context(|| format!("Log file path has no file name: {}", path.display()))?;

    std::fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory {}", directory.display()))?;

    let appender = tracing_appender::rolling::never(directory, file_name);
    Ok(tracing_appender::non_blocking(appender))
}

pub(crate) fn level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Error => LevelFilter::ERROR,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Trace => LevelFilter::TRACE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter_mapping() {
        assert_eq!(level_filter(LogLevel::Error), LevelFilter::ERROR);
        assert_eq!(level_filter(LogLevel::Info), LevelFilter::INFO);
        assert_eq!(level_filter(LogLevel::Trace), LevelFilter::TRACE);
    }

    #[test]
    fn test_file_writer_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("warden.log");

        let (_writer, _guard) = file_writer(&path).unwrap();
        assert!(dir.path().join("nested").is_dir());
    }

    #[test]
    fn test_simple_tracing_can_be_called_twice() {
        assert!(init_simple_tracing("debug").is_ok());
        assert!(init_simple_tracing("not a filter ((").is_ok());
    }
}
