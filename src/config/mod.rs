//! Configuration module for the TURN relay
//!
//! This module provides configuration structures for:
//! - Transport settings for the listening UDP socket
//! - Authentication realm, static users and nonce freshness
//! - Allocation limits, relay addressing and denied peer ranges
//! - Resource lifetimes
//! - Throttling of escalated error logs

use crate::error::{Error, Result};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use serde_with::DurationSeconds;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Configuration for the listening socket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Network interface to listen on
    pub listen_address: IpAddr,

    /// UDP port for STUN/TURN
    pub port: u16,

    /// Receive buffer size for a single datagram
    pub buffer_size: usize,
}

/// Configuration for authentication
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Realm presented to clients in challenges
    pub realm: String,

    /// Static username to password table
    #[serde(default)]
    pub users: HashMap<String, String>,

    /// How long an issued nonce stays fresh
    #[serde_as(as = "DurationSeconds<u64>")]
    pub nonce_timeout: Duration,
}

/// Configuration for TURN allocations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Maximum concurrent allocations
    pub max_allocations: usize,

    /// Address relay sockets are bound on
    pub relay_address: IpAddr,

    /// Lowest relay port
    pub min_port: u16,

    /// Highest relay port
    pub max_port: u16,

    /// CIDR ranges peers may never be permitted from
    #[serde(default)]
    pub denied_peer_ranges: Vec<String>,
}

/// Configuration for resource lifetimes
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Lifetime granted when the client does not ask for one
    #[serde_as(as = "DurationSeconds<u64>")]
    pub allocation_lifetime: Duration,

    /// Upper bound for any requested lifetime
    #[serde_as(as = "DurationSeconds<u64>")]
    pub max_allocation_lifetime: Duration,

    /// How long permissions remain valid
    #[serde_as(as = "DurationSeconds<u64>")]
    pub permission_lifetime: Duration,

    /// How long channel bindings remain valid
    #[serde_as(as = "DurationSeconds<u64>")]
    pub channel_bind_timeout: Duration,

    /// How often to sweep expired resources
    #[serde_as(as = "DurationSeconds<u64>")]
    pub cleanup_interval: Duration,
}

/// Configuration for escalated error logging
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Escalated errors logged per source within one window
    pub error_log_limit: usize,

    /// Window for the error log limit
    #[serde_as(as = "DurationSeconds<u64>")]
    pub error_log_window: Duration,
}

/// Main server configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub transport: TransportConfig,
    pub auth: AuthConfig,
    pub turn: TurnConfig,
    pub timeouts: TimeoutConfig,
    pub logging: LoggingConfig,
}

impl ServerConfig {
    /// Get the bind address for UDP
    pub fn get_bind_address(&self) -> SocketAddr {
        SocketAddr::new(self.transport.listen_address, self.transport.port)
    }

    /// Get the authentication realm
    pub fn get_realm(&self) -> &str {
        &self.auth.realm
    }

    /// Get maximum allowed allocations
    pub fn get_max_allocations(&self) -> usize {
        self.turn.max_allocations
    }

    /// Get default allocation lifetime
    pub fn get_allocation_lifetime(&self) -> Duration {
        self.timeouts.allocation_lifetime
    }

    /// Get maximum allocation lifetime
    pub fn get_max_allocation_lifetime(&self) -> Duration {
        self.timeouts.max_allocation_lifetime
    }

    /// Get permission lifetime duration
    pub fn get_permission_lifetime(&self) -> Duration {
        self.timeouts.permission_lifetime
    }

    /// Get channel binding lifetime duration
    pub fn get_channel_bind_timeout(&self) -> Duration {
        self.timeouts.channel_bind_timeout
    }

    /// Get nonce timeout duration
    pub fn get_nonce_timeout(&self) -> Duration {
        self.auth.nonce_timeout
    }

    /// Get cleanup interval duration
    pub fn get_cleanup_interval(&self) -> Duration {
        self.timeouts.cleanup_interval
    }

    /// Get network buffer size
    pub fn get_buffer_size(&self) -> usize {
        self.transport.buffer_size
    }

    /// Parse the denied peer ranges
    pub fn get_denied_peer_ranges(&self) -> Result<Vec<IpNetwork>> {
        self.turn
            .denied_peer_ranges
            .iter()
            .map(|range| {
                range
                    .parse::<IpNetwork>()
                    .map_err(|e| Error::Config(format!("Invalid denied peer range {}: {}", range, e)))
            })
            .collect()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.auth.realm.is_empty() {
            return Err(Error::Config("realm must not be empty".into()));
        }
        if self.auth.nonce_timeout.is_zero() {
            return Err(Error::Config("nonce_timeout must be greater than 0".into()));
        }
        if self.transport.buffer_size < 1500 {
            return Err(Error::Config("buffer_size must be at least 1500".into()));
        }
        if self.turn.max_allocations == 0 {
            return Err(Error::Config("max_allocations must be greater than 0".into()));
        }
        if self.turn.min_port > self.turn.max_port {
            return Err(Error::Config("min_port must not exceed max_port".into()));
        }
        if self.timeouts.allocation_lifetime > self.timeouts.max_allocation_lifetime {
            return Err(Error::Config(
                "allocation_lifetime must not exceed max_allocation_lifetime".into(),
            ));
        }
        if self.timeouts.permission_lifetime.is_zero() || self.timeouts.channel_bind_timeout.is_zero() {
            return Err(Error::Config("permission and channel lifetimes must be greater than 0".into()));
        }
        if self.timeouts.cleanup_interval.is_zero() {
            return Err(Error::Config("cleanup_interval must be greater than 0".into()));
        }
        if self.logging.error_log_window.is_zero() {
            return Err(Error::Config("error_log_window must be greater than 0".into()));
        }
        self.get_denied_peer_ranges()?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: ServerConfig = serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;

        Ok(config)
    }
}

// Default implementation provides reasonable defaults for all settings
impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig {
                listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                port: 3478,
                buffer_size: 1600,
            },
            auth: AuthConfig {
                realm: "turn.example.com".to_string(),
                users: HashMap::new(),
                nonce_timeout: Duration::from_secs(3600),
            },
            turn: TurnConfig {
                max_allocations: 10000,
                relay_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                min_port: 49152,
                max_port: 65535,
                denied_peer_ranges: vec![],
            },
            timeouts: TimeoutConfig {
                allocation_lifetime: Duration::from_secs(600),
                max_allocation_lifetime: Duration::from_secs(3600),
                permission_lifetime: Duration::from_secs(300),
                channel_bind_timeout: Duration::from_secs(600),
                cleanup_interval: Duration::from_secs(60),
            },
            logging: LoggingConfig {
                error_log_limit: 10,
                error_log_window: Duration::from_secs(60),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();

        assert_eq!(config.transport.port, 3478);
        assert_eq!(config.get_realm(), "turn.example.com");
        assert!(config.auth.users.is_empty());
        assert_eq!(config.get_allocation_lifetime(), Duration::from_secs(600));
        assert_eq!(config.get_max_allocation_lifetime(), Duration::from_secs(3600));
        assert_eq!(config.get_permission_lifetime(), Duration::from_secs(300));
        assert_eq!(config.get_channel_bind_timeout(), Duration::from_secs(600));
        assert_eq!(config.get_nonce_timeout(), Duration::from_secs(3600));
        assert_eq!(config.get_cleanup_interval(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bind_address() {
        let mut config = ServerConfig::default();
        config.transport.listen_address = "127.0.0.1".parse().unwrap();
        config.transport.port = 3478;

        assert_eq!(config.get_bind_address().to_string(), "127.0.0.1:3478");
    }

    #[test]
    fn test_config_validation() {
        let mut config = ServerConfig::default();

        config.turn.max_allocations = 0;
        assert!(config.validate().is_err());

        config.turn.max_allocations = 10;
        config.turn.min_port = 60000;
        config.turn.max_port = 50000;
        assert!(config.validate().is_err());

        config.turn.min_port = 50000;
        config.timeouts.allocation_lifetime = Duration::from_secs(7200);
        assert!(config.validate().is_err());

        config.timeouts.allocation_lifetime = Duration::from_secs(600);
        config.turn.denied_peer_ranges = vec!["not-a-range".into()];
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.turn.denied_peer_ranges = vec!["10.0.0.0/8".into(), "::1/128".into()];
        assert!(config.validate().is_ok());
        assert_eq!(config.get_denied_peer_ranges().unwrap().len(), 2);
    }

    #[test]
    fn test_config_file_loading() {
        let config_str = r#"
        {
            "transport": {
                "listen_address": "0.0.0.0",
                "port": 3478,
                "buffer_size": 2048
            },
            "auth": {
                "realm": "custom.realm",
                "users": { "alice": "wonderland" },
                "nonce_timeout": 600
            },
            "turn": {
                "max_allocations": 50,
                "relay_address": "127.0.0.1",
                "min_port": 50000,
                "max_port": 50100,
                "denied_peer_ranges": ["169.254.0.0/16"]
            },
            "timeouts": {
                "allocation_lifetime": 600,
                "max_allocation_lifetime": 3600,
                "permission_lifetime": 300,
                "channel_bind_timeout": 600,
                "cleanup_interval": 30
            },
            "logging": {
                "error_log_limit": 5,
                "error_log_window": 10
            }
        }"#;

        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("config.json");
        std::fs::write(&config_path, config_str).unwrap();

        let config = ServerConfig::from_file(&config_path).unwrap();

        assert_eq!(config.transport.buffer_size, 2048);
        assert_eq!(config.get_realm(), "custom.realm");
        assert_eq!(config.auth.users.get("alice").map(String::as_str), Some("wonderland"));
        assert_eq!(config.get_nonce_timeout(), Duration::from_secs(600));
        assert_eq!(config.get_max_allocations(), 50);
        assert_eq!(config.turn.relay_address.to_string(), "127.0.0.1");
        assert_eq!(config.get_cleanup_interval(), Duration::from_secs(30));
        assert_eq!(config.logging.error_log_limit, 5);
    }

    #[test]
    fn test_config_file_rejects_invalid() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("config.json");
        std::fs::write(&config_path, "{ \"transport\": 1 }").unwrap();

        assert!(matches!(
            ServerConfig::from_file(&config_path),
            Err(Error::Config(_))
        ));
    }
}
