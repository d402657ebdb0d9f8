pub mod types;


pub use types::*;

use crate::error::ShieldError;
use anyhow::Result;
use std::path::Path;

impl ShieldConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used — allowing the shield to start with zero configuration.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: ShieldConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            ShieldConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            "config: loaded, default_limit={}, default_window={}s, default_kind={}, monitor_interval={}s",
            config.default_limit,
            config.default_window,
            config.default_kind,
            config.monitor_interval_secs
        );
        Ok(config)
    }

    /// Apply environment variable overrides for the top-level knobs.
    /// Scoped policies (routes, clients) come from the file or the setter
    /// API only.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SHIELD_DEFAULT_LIMIT") {
            if let Ok(n) = v.parse::<u32>() {
                self.default_limit = n;
            }
        }
        if let Ok(v) = std::env::var("SHIELD_DEFAULT_WINDOW") {
            if let Ok(n) = v.parse::<u32>() {
                self.default_window = n;
            }
        }
        if let Ok(v) = std::env::var("SHIELD_DEFAULT_KIND") {
            if let Ok(kind) = v.parse() {
                self.default_kind = kind;
            }
        }
        if let Ok(v) = std::env::var("SHIELD_MONITOR_INTERVAL") {
            if let Ok(n) = v.parse::<u64>() {
                self.monitor_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("SHIELD_METRICS_RETENTION") {
            if let Ok(n) = v.parse::<u64>() {
                self.metrics_retention_secs = n;
            }
        }
        if let Ok(v) = std::env::var("SHIELD_AUTO_ADAPT") {
            self.auto_adapt = v == "true" || v == "1";
        }
    }

    pub fn validate(&self) -> Result<(), ShieldError> {
        if self.default_limit < 1 {
            return Err(ShieldError::InvalidLimit);
        }
        if self.default_window < 1 {
            return Err(ShieldError::InvalidWindow);
        }
        if self.metrics_retention_secs < self.monitor_interval_secs {
            return Err(ShieldError::RetentionTooShort {
                retention: self.metrics_retention_secs,
                interval: self.monitor_interval_secs,
            });
        }
        for route in &self.routes {
            if route.limit < 1 {
                return Err(ShieldError::InvalidLimit);
            }
            if route.window == Some(0) {
                return Err(ShieldError::InvalidWindow);
            }
        }
        for client in &self.clients {
            if client.limit < 1 {
                return Err(ShieldError::InvalidLimit);
            }
            if client.window == Some(0) {
                return Err(ShieldError::InvalidWindow);
            }
        }
        for entry in &self.client_routes {
            if entry.limit < 1 {
                return Err(ShieldError::InvalidLimit);
            }
            if entry.window == Some(0) {
                return Err(ShieldError::InvalidWindow);
            }
        }
        Ok(())
    }
}
