//! File logging.
//!
//! stdout belongs to the chat front-end, so every event goes to
//! `<data_dir>/logs/relaydock.log`.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::paths;

const DEFAULT_FILTER: &str = "info,hyper=warn,reqwest=warn,tungstenite=warn";
const LOG_FILE: &str = "relaydock.log";

const FILTER_VAR: &str = "RELAYDOCK_LOG_FILTER";
const FORMAT_VAR: &str = "RELAYDOCK_LOG_FORMAT";
const RUN_ID_VAR: &str = "RELAYDOCK_RUN_ID";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    fn from_var(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("pretty") => Self::Pretty,
            _ => Self::Json,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
        }
    }
}

/// Logging knobs taken from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// First parseable of `RELAYDOCK_LOG_FILTER`, `RUST_LOG`, then the default
    pub filter: String,
    pub format: LogFormat,
    /// Correlates every line of one process run
    pub run_id: String,
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::resolve(|key| std::env::var(key).ok())
    }

    fn resolve(var: impl Fn(&str) -> Option<String>) -> Self {
        let filter = [var(FILTER_VAR), var("RUST_LOG")]
            .into_iter()
            .flatten()
            .find(|f| EnvFilter::try_new(f).is_ok())
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());

        Self {
            filter,
            format: LogFormat::from_var(var(FORMAT_VAR).as_deref()),
            run_id: var(RUN_ID_VAR).unwrap_or_else(default_run_id),
        }
    }
}

fn default_run_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("pid-{}-{}", std::process::id(), now)
}

pub struct LoggingHandle {
    pub run_id: String,
    pub guard: WorkerGuard,
}

/// Install the global subscriber.
pub fn init_logging(data_dir: &Path, settings: LogSettings) -> anyhow::Result<LoggingHandle> {
    let log_dir = paths::log_dir(data_dir);
    std::fs::create_dir_all(&log_dir)?;
    let log_path = log_dir.join(LOG_FILE);

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(&log_dir, LOG_FILE));
    let filter = EnvFilter::try_new(&settings.filter)?;

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match settings.format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .with_writer(writer)
            .json()
            .flatten_event(true)
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_current_span(true)
            .with_filter(filter)
            .boxed(),
    };
    tracing_subscriber::registry().with(layer).try_init()?;

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        log_path = %log_path.display(),
        format = settings.format.as_str(),
        filter = %settings.filter,
        run_id = %settings.run_id,
    );

    Ok(LoggingHandle {
        run_id: settings.run_id,
        guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve(vars: &[(&str, &str)]) -> LogSettings {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LogSettings::resolve(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let settings = resolve(&[]);
        assert_eq!(settings.filter, DEFAULT_FILTER);
        assert_eq!(settings.format, LogFormat::Json);
        assert!(settings.run_id.starts_with("pid-"));
    }

    #[test]
    fn own_filter_wins_over_rust_log() {
        let settings = resolve(&[(FILTER_VAR, "debug"), ("RUST_LOG", "warn")]);
        assert_eq!(settings.filter, "debug");

        let settings = resolve(&[("RUST_LOG", "warn")]);
        assert_eq!(settings.filter, "warn");
    }

    #[test]
    fn unparseable_filter_falls_through() {
        let settings = resolve(&[(FILTER_VAR, "relaydock=loud"), ("RUST_LOG", "trace")]);
        assert_eq!(settings.filter, "trace");
    }

    #[test]
    fn format_and_run_id_from_environment() {
        let settings = resolve(&[(FORMAT_VAR, "Pretty"), (RUN_ID_VAR, "ci-42")]);
        assert_eq!(settings.format, LogFormat::Pretty);
        assert_eq!(settings.run_id, "ci-42");
        assert_eq!(resolve(&[(FORMAT_VAR, "xml")]).format, LogFormat::Json);
    }
}
