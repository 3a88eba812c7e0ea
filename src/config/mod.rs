pub mod types;


pub use types::*;

use anyhow::Result;
use std::path::Path;

impl BridgeConfig {
    /// Load configuration from a downstreams file (if it exists) and apply
    /// environment variable overrides. When the file does not exist the
    /// bridge starts with an empty server list; the listener still comes up
    /// and the retry loop simply has nothing to probe.
    ///
    /// `DOWNSTREAMS_JSON` takes precedence over any file content for the
    /// server list.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: BridgeConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, starting with no configured upstreams",
                path.display()
            );
            BridgeConfig::default()
        };

        config.apply_env_overrides()?;
        config.normalize();
        config.validate()?;
        tracing::info!(
            "config: loaded, upstreams={}, port={}",
            config.servers.len(),
            config.port
        );
        Ok(config)
    }

    /// Apply environment variable overrides. `DOWNSTREAMS_JSON` replaces the
    /// server list wholesale and must be a valid downstreams document.
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("DOWNSTREAMS_JSON") {
            let doc: DownstreamsConfig = serde_json::from_str(&v)
                .map_err(|e| anyhow::anyhow!("invalid DOWNSTREAMS_JSON: {}", e))?;
            self.servers = doc.servers;
        }

        if let Ok(v) = std::env::var("PORT") {
            self.port = v
                .parse::<u16>()
                .map_err(|_| anyhow::anyhow!("invalid PORT: {}", v))?;
        }
        if let Ok(v) = std::env::var("BASE_URL") {
            if !v.is_empty() {
                self.base_url = Some(v);
            }
        }
        if let Ok(v) = std::env::var("BASE_URL_HEADER") {
            if !v.is_empty() {
                self.base_url_header = v;
            }
        }
        if let Ok(v) = std::env::var("BRIDGE_API_KEY") {
            if !v.is_empty() {
                self.api_key = Some(v);
            }
        }
        if let Ok(v) = std::env::var("REQUIRED_GROUPS") {
            self.required_groups = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = std::env::var("STARTUP_WAIT_TIME") {
            if let Ok(n) = v.parse::<u64>() {
                self.startup_wait_ms = n;
            }
        }
        if let Ok(v) = std::env::var("RETRY_INTERVAL") {
            if let Ok(n) = v.parse::<u64>() {
                self.retry_interval_ms = n;
            }
        }
        if let Ok(v) = std::env::var("SERVER_HEALTH_TIMEOUT") {
            if let Ok(n) = v.parse::<u64>() {
                self.probe_timeout_ms = n;
            }
        }
        if let Ok(v) = std::env::var("API_PATH_PREFIX") {
            if !v.is_empty() {
                self.api_path_prefix = Some(v);
            }
        }

        Ok(())
    }

    /// Canonicalize loaded values: upstream URLs lose their trailing slash
    /// (identity is the URL, so `http://u/` and `http://u` must compare
    /// equal), the API path prefix gains a leading slash and loses a
    /// trailing one, and the base-URL header is lowercased.
    fn normalize(&mut self) {
        for server in &mut self.servers {
            while server.url.ends_with('/') {
                server.url.pop();
            }
        }
        if let Some(base) = &mut self.base_url {
            while base.ends_with('/') {
                base.pop();
            }
        }
        if let Some(prefix) = &mut self.api_path_prefix {
            while prefix.ends_with('/') {
                prefix.pop();
            }
            if !prefix.is_empty() && !prefix.starts_with('/') {
                prefix.insert(0, '/');
            }
            if prefix.is_empty() {
                self.api_path_prefix = None;
            }
        }
        self.base_url_header = self.base_url_header.to_ascii_lowercase();
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            if server.url.is_empty() {
                anyhow::bail!("upstream url cannot be empty");
            }
            if !server.url.starts_with("http://") && !server.url.starts_with("https://") {
                anyhow::bail!("upstream url must be absolute http(s): {}", server.url);
            }
            if !seen.insert(server.url.as_str()) {
                anyhow::bail!("duplicate upstream url: {}", server.url);
            }
        }
        if !self.required_groups.is_empty() && self.api_key.is_none() {
            tracing::warn!("config: required_groups set without an api key, auth is disabled");
        }
        Ok(())
    }

    pub fn startup_wait(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.startup_wait_ms)
    }

    pub fn retry_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.retry_interval_ms)
    }

    pub fn probe_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.probe_timeout_ms)
    }
}
