//! Configuration management

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Upstream HTTP client configuration
    pub upstream: UpstreamConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Environment variables use the `LATCHKEY_` prefix with `__` as the
    /// section separator, e.g. `LATCHKEY_SERVER__PORT=8080`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("LATCHKEY_").split("__"));

        figment.extract().map_err(|e| Error::Config(e.to_string()))
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,
    /// Cookie name prefix; also names the storage file
    pub prefix: String,
    /// Human-readable name shown on login surfaces
    pub display_name: String,
    /// Public root URI of this server (issuer), e.g. `https://id.example.com`.
    /// Seeded into storage on first start.
    pub root_uri: String,
    /// Directory for the JSON storage file
    pub storage_dir: String,
    /// Directory for the relational database (domains, rate-limit state)
    pub database_dir: String,
    /// Directory for the admin API unix socket
    pub api_socket_dir: String,
    /// Whether the server sits behind a reverse proxy (trust forwarded headers)
    pub behind_proxy: bool,
    /// Optional path to a geo-IP database used by the email login collaborator
    pub geo_db_path: Option<String>,
    /// Enable the FedCM login surfaces
    pub fedcm_enable: bool,
    /// Downgrade forward-auth validation failures to "no identity"
    pub forward_auth_passthrough: bool,
    /// Additional domains this server answers auth requests on
    pub auth_domains: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 1616,
            prefix: "latchkey".to_string(),
            display_name: "latchkey".to_string(),
            root_uri: String::new(),
            storage_dir: ".".to_string(),
            database_dir: ".".to_string(),
            api_socket_dir: ".".to_string(),
            behind_proxy: false,
            geo_db_path: None,
            fedcm_enable: false,
            forward_auth_passthrough: false,
            auth_domains: Vec::new(),
        }
    }
}

/// Upstream HTTP client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Deadline for every upstream call (discovery, JWKS, token, profile)
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.server.port, 1616);
        assert_eq!(config.server.prefix, "latchkey");
        assert!(!config.server.behind_proxy);
        assert!(!config.server.fedcm_enable);
        assert!(!config.server.forward_auth_passthrough);
        assert_eq!(config.upstream.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn load_without_file_uses_defaults() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.server.port, 1616);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let result = Config::load(Some(Path::new("/nonexistent/latchkey.yaml")));
        assert!(result.is_err());
    }
}
