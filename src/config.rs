//! `dnbd-client.toml` configuration — optional defaults the CLI flags then
//! override. Modeled on `ProbeConfig` in the teacher's `src/config.rs`: a
//! struct of `Option<T>` fields loaded with `toml::from_str`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Default multicast group, `addr[:port]`.
    #[serde(default)]
    pub mcast: Option<String>,
    /// Default cache file path.
    #[serde(default)]
    pub cache: Option<String>,
    /// Heartbeat interval in seconds (default 4, §4.5).
    #[serde(default)]
    pub heartbeat_secs: Option<u64>,
    /// Retransmit timeout bounds in milliseconds (min, max, stalled), §4.4.
    #[serde(default)]
    pub timeout_min_ms: Option<u64>,
    #[serde(default)]
    pub timeout_max_ms: Option<u64>,
    #[serde(default)]
    pub timeout_stalled_ms: Option<u64>,
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(cfg)
    }

    pub fn default_example() -> Self {
        ClientConfig {
            mcast: Some("239.0.0.1:5001".into()),
            cache: Some("/var/cache/dnbd/client0.cache".into()),
            heartbeat_secs: Some(4),
            timeout_min_ms: Some(dnbd_core::pipeline::DEFAULT_TIMEOUT_MIN_MS),
            timeout_max_ms: Some(dnbd_core::pipeline::DEFAULT_TIMEOUT_MAX_MS),
            timeout_stalled_ms: Some(dnbd_core::pipeline::DEFAULT_TIMEOUT_STALLED_MS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_yields_default() {
        let cfg = ClientConfig::load(Path::new("/nonexistent/dnbd-client.toml")).unwrap();
        assert!(cfg.mcast.is_none());
    }

    #[test]
    fn round_trips_through_toml() {
        let example = ClientConfig::default_example();
        let text = toml::to_string_pretty(&example).unwrap();
        let parsed: ClientConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.mcast, example.mcast);
    }
}
