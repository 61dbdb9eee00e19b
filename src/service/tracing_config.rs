use dotenv::dotenv;
use tracing::trace;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use super::AppResult;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Keeps the non-blocking log writer alive; dropping it flushes pending lines.
pub struct TracingGuard {
    _worker_guard: WorkerGuard,
}

/// Console-only subscriber, used by tests and short-lived tools.
///
/// Safe to call more than once: a second registration is ignored.
pub fn setup_local_tracing() -> AppResult<()> {
    dotenv().ok();
    let timer = ChronoLocal::new(TIMESTAMP_FORMAT.to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_line_number(true);
    if let Err(e) = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
    {
        trace!("local tracing already initialized: {}", e);
    }
    Ok(())
}

/// Console plus an hourly rolling file under `log_dir`.
pub fn setup_tracing(log_dir: &str) -> TracingGuard {
    dotenv().ok();
    let file_appender = tracing_appender::rolling::hourly(log_dir, "devcom.log");
    let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);
    let writer = non_blocking.and(std::io::stdout);

    let timer = ChronoLocal::new(TIMESTAMP_FORMAT.to_string());
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

    TracingGuard {
        _worker_guard: worker_guard,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_tracing_can_be_set_up_twice() {
        assert!(setup_local_tracing().is_ok());
        assert!(setup_local_tracing().is_ok());
    }
}
