use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

/// Installs the global tracing subscriber shared by all binaries.
///
/// `RUST_LOG` wins when set; otherwise the caller's fallback filter is
/// applied, so every binary picks its own default verbosity.
pub fn init_tracing(default_filter: &str) -> Result<(), anyhow::Error> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}
