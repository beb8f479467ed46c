//! Tracing setup for binaries embedding the upload core.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,ferry_upload=info,ferry_storage=info,ferry_metadata=info";

/// Install the global tracing subscriber: `RUST_LOG` (or [`DEFAULT_FILTER`]) plus a fmt layer.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()))
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;
    Ok(())
}
