//! Tracing setup for the shell.
//!
//! Everything goes to `<data_dir>/logs/shell.log` through a non-blocking
//! appender. `ULTRA_LOG_STDERR=1` also echoes events to stderr, which is
//! handy when running the shell from a terminal.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

const DEFAULT_FILTER: &str = "info,tower_http=warn,hyper=warn";
const LOG_FILE: &str = "shell.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    fn from_env() -> Self {
        match std::env::var("ULTRA_LOG_FORMAT") {
            Ok(value) if value.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
        }
    }
}

pub struct LoggingHandle {
    pub run_id: String,
    pub guard: WorkerGuard,
}

pub fn init_logging(log_dir: &Path) -> anyhow::Result<LoggingHandle> {
    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join(LOG_FILE);

    if std::env::var("ULTRA_TRUNCATE_LOG_ON_START").as_deref() == Ok("1") {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&log_path)?;
    }

    let filter_source = std::env::var("ULTRA_LOG_FILTER")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| DEFAULT_FILTER.to_string());
    let filter =
        EnvFilter::try_new(&filter_source).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, LOG_FILE));
    let format = LogFormat::from_env();

    let mut layers = vec![file_layer(writer, format)];
    if std::env::var("ULTRA_LOG_STDERR").as_deref() == Ok("1") {
        layers.push(
            fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_target(false)
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers.with_filter(filter))
        .try_init()?;

    let run_id = std::env::var("ULTRA_SHELL_RUN_ID").unwrap_or_else(|_| {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        format!("pid-{}-{}", std::process::id(), now)
    });

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        log_path = %log_path.display(),
        format = format.as_str(),
        filter = %filter_source,
        shell_run_id = %run_id,
    );

    Ok(LoggingHandle { run_id, guard })
}

fn file_layer(writer: NonBlocking, format: LogFormat) -> BoxedLayer {
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .with_writer(writer)
            .json()
            .flatten_event(true)
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_current_span(true)
            .boxed(),
    }
}
