//! Configuration management for the Keystone server.
//!
//! Loads the TOML configuration file, validates it and converts it into
//! the host and core configuration types.

use anyhow::Context;
use keystone_core::{BuildIdentity, CoreConfig, DispatcherConfig, RevisionTag, TimeoutPolicy};
use keystone_host::HostConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Network settings of the WebSocket host
    #[serde(default)]
    pub server: ServerSettings,
    /// Dispatcher and tick loop settings
    #[serde(default)]
    pub core: CoreSettings,
    /// What the server reports about its own build
    #[serde(default)]
    pub build: BuildSettings,
    /// Logging configuration settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Network address to bind the server to (e.g., "127.0.0.1:8080")
    pub bind_address: String,
    /// Maximum number of concurrent client connections
    pub max_connections: usize,
    /// WebSocket handshake timeout in milliseconds
    pub handshake_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            max_connections: 1000,
            handshake_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreSettings {
    /// Upper bound on waiting for consumers, in milliseconds
    pub dispatch_timeout_ms: u64,
    /// Verdict for messages whose consumers did not finish in time
    pub timeout_policy: TimeoutPolicy,
    /// Main thread tick interval in milliseconds (50 = 20 ticks per second)
    pub tick_interval_ms: u64,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            dispatch_timeout_ms: keystone_core::DEFAULT_DISPATCH_TIMEOUT.as_millis() as u64,
            timeout_policy: TimeoutPolicy::Forward,
            tick_interval_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    /// Self-reported build string, e.g. "git-Paper-196 (MC: 1.20.4)"
    pub version: String,
    /// Internal implementation package, when the server exposes one
    pub implementation_package: Option<String>,
    /// Extra mappings keyed by release or full build string, e.g. `"1.20.6" = "v1_20_R4"`
    pub releases: BTreeMap<String, String>,
    /// Release mappings that win over the implementation package
    pub overrides: BTreeMap<String, String>,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            version: "1.20.4-R0.1-SNAPSHOT".to_string(),
            implementation_package: None,
            releases: BTreeMap::new(),
            overrides: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, writes the default configuration there
    /// and returns it.
    pub async fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Checks addresses, timeouts, revision tags and the log level.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!(
                "Invalid bind address: {}",
                &self.server.bind_address
            ));
        }

        if self.server.max_connections == 0 {
            return Err("max_connections must be at least 1".to_string());
        }
        if self.server.handshake_timeout_ms == 0 {
            return Err("handshake_timeout_ms must be greater than 0".to_string());
        }
        if self.core.dispatch_timeout_ms == 0 {
            return Err("dispatch_timeout_ms must be greater than 0".to_string());
        }
        if self.core.tick_interval_ms == 0 {
            return Err("tick_interval_ms must be greater than 0".to_string());
        }

        if self.build.version.trim().is_empty() {
            return Err("Build version cannot be empty".to_string());
        }
        for (release, tag) in self.build.releases.iter().chain(&self.build.overrides) {
            if tag.parse::<RevisionTag>().is_err() {
                return Err(format!("Invalid revision tag for {release}: {tag}"));
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }

    pub fn to_host_config(&self) -> anyhow::Result<HostConfig> {
        Ok(HostConfig {
            bind_address: self
                .server
                .bind_address
                .parse()
                .with_context(|| format!("bind address {}", self.server.bind_address))?,
            max_connections: self.server.max_connections,
            handshake_timeout_ms: self.server.handshake_timeout_ms,
        })
    }

    pub fn to_core_config(&self) -> anyhow::Result<CoreConfig> {
        Ok(CoreConfig {
            dispatcher: DispatcherConfig {
                timeout: Duration::from_millis(self.core.dispatch_timeout_ms),
                timeout_policy: self.core.timeout_policy,
            },
            releases: parse_tags(&self.build.releases)?,
            overrides: parse_tags(&self.build.overrides)?,
        })
    }

    pub fn build_identity(&self) -> BuildIdentity {
        let identity = BuildIdentity::new(self.build.version.clone());
        match &self.build.implementation_package {
            Some(package) => identity.with_package(package.clone()),
            None => identity,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.core.tick_interval_ms)
    }
}

fn parse_tags(table: &BTreeMap<String, String>) -> anyhow::Result<Vec<(String, RevisionTag)>> {
    table
        .iter()
        .map(|(release, tag)| Ok((release.clone(), tag.parse::<RevisionTag>()?)))
        .collect()
}
