use dotenv::dotenv;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use super::AppResult;

/// Holds the non-blocking appender guard, dropping it flushes the
/// remaining log lines.
pub struct LogGuard {
    _worker_guard: WorkerGuard,
}

pub fn setup_local_tracing() -> AppResult<()> {
    dotenv().ok();
    let timer = ChronoLocal::new("%Y-%m-%d %H:%M:%S%.6f".to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_line_number(true);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    Ok(())
}

pub fn setup_tracing() -> LogGuard {
    dotenv().ok();
    let file_appender = tracing_appender::rolling::hourly("logs", "stonerpc.log");

    let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);

    // tee into the console and the rolling file
    let writer = non_blocking.and(std::io::stdout);

    let timer = ChronoLocal::new("%Y-%m-%d %H:%M:%S%.6f".to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(true)
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    LogGuard {
        _worker_guard: worker_guard,
    }
}
