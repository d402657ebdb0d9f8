use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install a process-wide tracing subscriber: env-filter (`RUST_LOG`,
/// default `info`), non-blocking stdout writer, JSON lines.
///
/// Opt-in convenience for embedding applications that have no subscriber of
/// their own; the shield itself only emits `tracing` events and works under
/// whatever subscriber the host installs. Call at most once per process.
pub fn init_tracing() {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    // The writer guard must outlive the process to keep flushing.
    std::mem::forget(guard);
}
