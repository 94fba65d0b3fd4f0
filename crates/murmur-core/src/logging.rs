/// Logging initialization for hosts and tests: tracing-subscriber fmt to
/// stderr, filter overridable via `RUST_LOG`.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur_core=debug,info".into()),
        )
        .try_init();
}
