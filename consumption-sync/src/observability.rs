use tracing_subscriber::EnvFilter;

/// Default filter directive for this crate. `--debug` raises it.
pub fn default_directive(debug: bool) -> &'static str {
    if debug {
        "consumption_sync=debug"
    } else {
        "consumption_sync=info"
    }
}

/// A non-empty, valid `RUST_LOG` wins outright; otherwise the `--debug`
/// default applies.
pub fn env_filter(debug: bool, rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .map(str::trim)
        .filter(|dirs| !dirs.is_empty())
        .and_then(|dirs| EnvFilter::try_new(dirs).ok())
        .unwrap_or_else(|| EnvFilter::new(default_directive(debug)))
}

pub fn init_tracing(debug: bool) {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(debug, rust_log.as_deref()))
        .with_target(false)
        .init();

    tracing::debug!("Debug logging enabled");
}
