use std::path::Path;

use anyhow::{Context, Result};
use lumen_protocol::GatewayConfig;

/// Load configuration from `path` (defaults applied for any absent keys),
/// overlay the recognized environment variables, then validate. Returns the
/// `ERROR:`/`WARNING:` issue strings alongside the config so the caller can
/// log them before deciding whether to exit.
pub fn load(path: &Path) -> Result<GatewayConfig> {
    let raw = if path.exists() {
        std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?
    } else {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        String::new()
    };

    let mut config: GatewayConfig =
        toml::from_str(&raw).with_context(|| format!("failed to parse config file {}", path.display()))?;
    config.apply_env_overrides();
    Ok(config)
}
