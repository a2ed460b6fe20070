pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod tenant_config;
pub mod tenant_registry;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the process-wide tracing subscriber: an `EnvFilter` read from
/// `RUST_LOG` (falling back to `info`) feeding an fmt layer with targets
/// suppressed, matching how every binary in this workspace wires up logging.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
