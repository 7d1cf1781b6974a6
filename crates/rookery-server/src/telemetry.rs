//! Logging initialization.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the tracing subscriber.
///
/// The filter comes from the `--log` flag, then `RUST_LOG`, then a default
/// that keeps the server chatty and its dependencies quiet.
pub fn init(flag: Option<&str>) -> anyhow::Result<()> {
    let filter = match flag {
        Some(spec) => EnvFilter::try_new(spec)?,
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,rookery_jsm=debug,rookery_dialback=debug")),
    };

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();

    Ok(())
}
