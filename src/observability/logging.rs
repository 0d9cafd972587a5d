use crate::config::LoggingConfig;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_NAME: &str = "renewer.log";
const DEFAULT_LOG_DIR: &str = "logs";

fn default_level(level: &str) -> Level {
    match level {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install the global subscriber. Keep the returned guard alive for the
/// lifetime of the process when logging to a file.
pub fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level(&config.level).into())
        .from_env_lossy();

    let json = config.format == "json";

    if config.output == "file" {
        let dir = config.file_path.as_deref().unwrap_or(DEFAULT_LOG_DIR);
        let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let registry = tracing_subscriber::registry().with(env_filter);
        if json {
            registry.with(fmt::layer().json().with_writer(non_blocking)).init();
        } else {
            registry.with(fmt::layer().with_ansi(false).with_writer(non_blocking)).init();
        }
        return Some(guard);
    }

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(fmt::layer().json().with_writer(std::io::stdout)).init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stdout)).init();
    }
    None
}
