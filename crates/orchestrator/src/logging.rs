//! Logging setup shared by binaries embedding the facade.

/// The output format for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line on stderr, with flattened event fields.
    Json,
    /// Human-readable compact text.
    Text,
}

/// Initializes the global tracing subscriber. `filter` is an env-filter
/// directive such as `info` or `executor=debug,info`. Panics if a global
/// subscriber is already installed.
pub fn init_logging(format: LogFormat, filter: &str) {
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Json => builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .init(),
        LogFormat::Text => builder.compact().with_ansi(false).init(),
    }
}
