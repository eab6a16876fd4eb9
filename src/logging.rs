use tracing_subscriber::EnvFilter;

/// Installs the global subscriber, filtered by `RUST_LOG` (default `info`).
///
/// With `json`, events are written as one JSON object per line including
/// the current span, so every job log carries its queue, type and attempt.
/// Calling this again is a no-op.
pub fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let _ = if json {
        builder
            .json()
            .with_current_span(true)
            .with_target(false)
            .try_init()
    } else {
        builder.try_init()
    };
}
