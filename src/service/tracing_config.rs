use dotenv::dotenv;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use super::{AppResult, LogConfig};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

fn env_filter(verbose: u8) -> EnvFilter {
    // RUST_LOG wins over the command line verbosity
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        })
    })
}

/// Stdout only logging, used by tests and local runs.
pub fn setup_local_tracing(verbose: u8) -> AppResult<()> {
    dotenv().ok();
    let timer = ChronoLocal::new(TIME_FORMAT.to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_line_number(true);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter(verbose))
        .init();
    Ok(())
}

/// Logs to stdout and, when `log.dir` is set, to an hourly rolling file as well.
///
/// The returned guard flushes the non-blocking file writer on drop and must be
/// kept alive for the lifetime of the process.
pub fn setup_tracing(log: &LogConfig, verbose: u8) -> AppResult<Option<WorkerGuard>> {
    let Some(dir) = log.dir.as_ref() else {
        setup_local_tracing(verbose)?;
        return Ok(None);
    };
    dotenv().ok();

    let file_appender = tracing_appender::rolling::hourly(dir, "gatewire.log");
    let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);
    let writer = non_blocking.and(std::io::stdout);

    let timer = ChronoLocal::new(TIME_FORMAT.to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter(verbose))
        .init();

    Ok(Some(worker_guard))
}
