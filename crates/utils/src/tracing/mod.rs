use isorun_core::ISORUN_LOG_VAR;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Re-export tracing macros for convenience
pub use tracing::{debug, error, info, instrument, span, trace, warn, Level, Span};

/// Initialize the tracing system
///
/// Records always go to stderr: the child inherits stdout and its output
/// must not be interleaved with ours. The filter is read from `RUST_LOG`,
/// then `ISORUN_LOG`, then falls back to `default_level`.
pub fn init(default_level: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env(ISORUN_LOG_VAR))
        .or_else(|_| EnvFilter::try_new(default_level))?;

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(is_tty())
        .compact()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}

/// Check if stderr is attached to a terminal
fn is_tty() -> bool {
    std::io::IsTerminal::is_terminal(&std::io::stderr())
}

/// Create a span covering one task invocation
pub fn run_span(run_id: &str) -> Span {
    span!(Level::INFO, "run", run_id = %run_id)
}

/// Emit a structured event when a pipeline phase finishes
pub fn phase_completed(phase: &str, duration_ms: u64) {
    info!(phase = %phase, duration_ms = %duration_ms, "phase_completed");
}

/// Emit a structured event for cache lookups
pub fn cache_event(cache: &str, key: &str, hit: bool) {
    if hit {
        trace!(cache = %cache, key = %key, "cache_hit");
    } else {
        debug!(cache = %cache, key = %key, "cache_miss");
    }
}
