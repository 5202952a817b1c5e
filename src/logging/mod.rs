pub mod config;

pub use config::LoggingConfig;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// Держатель фоновых ресурсов логирования: гард файлового writer'а живёт,
/// пока жив handle.
pub struct LoggingHandle {
    _file_guard: Option<WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Инициализация логирования с конфигурацией.
pub fn init_logging(
    mut config: LoggingConfig,
) -> Result<LoggingHandle, Box<dyn std::error::Error>> {
    config.apply_env_overrides();
    config.validate()?;
    config.ensure_log_dir()?;

    let env_filter = EnvFilter::try_new(&config.level)?;
    let mut layers: Vec<BoxedLayer> = vec![env_filter.boxed()];

    // Console layer
    if config.console_enabled {
        layers.push(tracing_subscriber::fmt::layer().with_target(true).boxed());
    }

    // File layer
    let file_guard = if config.file_enabled {
        let appender = tracing_appender::rolling::never(&config.log_dir, &config.file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .boxed(),
        );
        Some(guard)
    } else {
        None
    };

    tracing_subscriber::registry().with(layers).init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_level = %config.level,
        console_enabled = config.console_enabled,
        file_enabled = config.file_enabled,
        "logging initialized"
    );

    Ok(LoggingHandle { _file_guard: file_guard })
}
