use alyx_server::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber from the `logging` config section.
/// `RUST_LOG` still wins when set.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    // A second init (tests, embedding) is harmless.
    let _ = result;
}
