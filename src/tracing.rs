use anyhow::anyhow;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

use crate::conf;

/// Installs the global subscriber. `RUST_LOG` takes precedence over the
/// configured level.
pub fn init() -> anyhow::Result<()> {
    let level = LevelFilter::from_level(conf::global().log_level);
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|error| anyhow!("Failed to initialize tracing: {error}"))?;
    Ok(())
}
