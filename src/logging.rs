use tracing_subscriber::EnvFilter;

/// Installs the global fmt subscriber. Returns an error if a subscriber is
/// already set, so callers (tests in particular) can `.ok()` the result.
pub fn init() -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_subscriber::util::SubscriberInitExt as _;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .finish()
        .try_init()
}
