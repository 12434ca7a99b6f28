use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MonitorConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub webrtc: WebrtcConfig,
    #[serde(default)]
    pub spy: SpyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to operator UI static files
    #[serde(default = "default_web_root")]
    pub web_root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// UDP host:port of the engine's ng control channel
    #[serde(default = "default_engine_address")]
    pub address: String,
}

/// Settings for the two WebRTC sides: the backend legs towards the engine
/// and the browser-facing leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebrtcConfig {
    /// Lower bound of the UDP port range used for backend ICE (0 = ephemeral)
    #[serde(default)]
    pub min_port: u16,
    /// Upper bound of the UDP port range used for backend ICE (0 = ephemeral)
    #[serde(default)]
    pub max_port: u16,
    /// Host-candidate IPs advertised to the engine (NAT 1-to-1 mapping)
    #[serde(default)]
    pub nat_1to1_ips: Vec<String>,
    /// Host-candidate IPs advertised to browsers (empty = interface addresses)
    #[serde(default)]
    pub browser_nat_1to1_ips: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpyConfig {
    /// Seconds a spectator-less spy source survives before its engine
    /// subscriptions are released (0 = keep until backend failure)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            web_root: default_web_root(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            address: default_engine_address(),
        }
    }
}

impl Default for WebrtcConfig {
    fn default() -> Self {
        Self {
            min_port: 0,
            max_port: 0,
            nat_1to1_ips: Vec::new(),
            browser_nat_1to1_ips: Vec::new(),
        }
    }
}

impl Default for SpyConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_web_root() -> String {
    "web/dist".to_string()
}

fn default_engine_address() -> String {
    "127.0.0.1:2223".to_string()
}

fn default_idle_timeout() -> u64 {
    300
}

impl MonitorConfig {
    /// Semantic validation. Returns human-readable issues prefixed with
    /// `ERROR:` or `WARN:`; the caller decides whether to abort.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.engine.address.parse::<std::net::SocketAddr>().is_err() {
            // Hostnames are resolved at connect time, but an address with no
            // port never works.
            if !self.engine.address.contains(':') {
                issues.push(format!(
                    "ERROR: engine.address '{}' has no port",
                    self.engine.address
                ));
            }
        }

        let (min, max) = (self.webrtc.min_port, self.webrtc.max_port);
        if (min == 0) != (max == 0) {
            issues.push(
                "ERROR: webrtc.min_port and webrtc.max_port must be set together".to_string(),
            );
        } else if min > max {
            issues.push(format!(
                "ERROR: webrtc.min_port {min} is greater than webrtc.max_port {max}"
            ));
        } else if min != 0 && max - min < 10 {
            issues.push(format!(
                "WARN: webrtc port range {min}-{max} allows very few concurrent spy sources"
            ));
        }

        if self.webrtc.nat_1to1_ips.is_empty() {
            issues.push(
                "WARN: webrtc.nat_1to1_ips is empty; the engine will see interface addresses"
                    .to_string(),
            );
        }
        for ip in self
            .webrtc
            .nat_1to1_ips
            .iter()
            .chain(&self.webrtc.browser_nat_1to1_ips)
        {
            if ip.parse::<std::net::IpAddr>().is_err() {
                issues.push(format!("ERROR: '{ip}' is not a valid IP address"));
            }
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

/// Read the TOML configuration at `path`. A missing file is not fatal:
/// the defaults work for a monitor running next to a local engine.
pub fn load_config(path: &Path) -> Result<MonitorConfig> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "No config file, running on defaults");
            return Ok(MonitorConfig::default());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("Cannot read {}", path.display()));
        }
    };

    let config = toml::from_str(&contents)
        .with_context(|| format!("Invalid TOML in {}", path.display()))?;
    tracing::info!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: MonitorConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.engine.address, "127.0.0.1:2223");
        assert_eq!(config.webrtc.min_port, 0);
        assert_eq!(config.spy.idle_timeout, 300);
    }

    #[test]
    fn partial_toml_overrides() {
        let config: MonitorConfig = toml::from_str(
            r#"
            [engine]
            address = "10.0.0.5:2223"

            [webrtc]
            min_port = 30000
            max_port = 31000
            nat_1to1_ips = ["203.0.113.5"]

            [spy]
            idle_timeout = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.address, "10.0.0.5:2223");
        assert_eq!(config.webrtc.min_port, 30000);
        assert_eq!(config.webrtc.nat_1to1_ips, vec!["203.0.113.5"]);
        assert_eq!(config.spy.idle_timeout, 0);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn validate_rejects_lopsided_port_range() {
        let mut config = MonitorConfig::default();
        config.webrtc.min_port = 30000;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("must be set together")));
    }

    #[test]
    fn validate_rejects_inverted_port_range() {
        let mut config = MonitorConfig::default();
        config.webrtc.min_port = 31000;
        config.webrtc.max_port = 30000;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("ERROR:")));
    }

    #[test]
    fn validate_rejects_bad_nat_ip() {
        let mut config = MonitorConfig::default();
        config.webrtc.nat_1to1_ips = vec!["not-an-ip".to_string()];
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("not-an-ip")));
    }

    #[test]
    fn validate_warns_on_empty_nat_ips() {
        let config = MonitorConfig::default();
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().all(|i| i.starts_with("WARN:")));
    }
}
