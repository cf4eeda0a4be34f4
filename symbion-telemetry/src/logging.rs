use tracing_subscriber::{fmt, EnvFilter};

pub const DEFAULT_FILTER: &str = "info";

/// `RUST_LOG` d'abord, puis le filtre de la config, sinon `info`
pub fn env_filter(configured: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(configured.unwrap_or(DEFAULT_FILTER)))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installe le subscriber global. Sans effet si un autre est déjà en place.
pub fn init_logging(configured: Option<&str>) {
    let _ = fmt().with_env_filter(env_filter(configured)).with_target(true).try_init();
}
