//! Engine configuration
//!
//! Tunables for the tunneling engine: the advertised TCP window, the
//! open-socket ceiling with its post-purge target, and the per-protocol idle
//! budgets. Defaults match the platform: hosts with a 64-descriptor
//! readiness-set limit get a lower ceiling to leave room for the embedder's
//! own descriptors.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default advertised TCP window size (bytes)
pub const DEFAULT_TCP_WINDOW: u16 = 64240;

/// Open-socket ceiling on hosts with a 64-descriptor readiness-set limit
const MAX_SOCKETS_SMALL: usize = 55;
/// Post-purge target paired with [`MAX_SOCKETS_SMALL`]
const SOCKETS_AFTER_PURGE_SMALL: usize = 40;

/// Open-socket ceiling elsewhere
const MAX_SOCKETS_LARGE: usize = 128;
/// Post-purge target paired with [`MAX_SOCKETS_LARGE`]
const SOCKETS_AFTER_PURGE_LARGE: usize = 96;

fn default_max_sockets() -> usize {
    if cfg!(windows) {
        MAX_SOCKETS_SMALL
    } else {
        MAX_SOCKETS_LARGE
    }
}

fn default_sockets_after_purge() -> usize {
    if cfg!(windows) {
        SOCKETS_AFTER_PURGE_SMALL
    } else {
        SOCKETS_AFTER_PURGE_LARGE
    }
}

fn default_tcp_window() -> u16 {
    DEFAULT_TCP_WINDOW
}

fn default_tcp_timeout() -> u64 {
    30
}

fn default_udp_timeout() -> u64 {
    15
}

fn default_icmp_timeout() -> u64 {
    5
}

fn default_icmp_enabled() -> bool {
    true
}

/// Engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Maximum TCP window the engine advertises to the client
    #[serde(default = "default_tcp_window")]
    pub max_tcp_window: u16,

    /// Open-socket ceiling; reaching it triggers an eager purge before a new
    /// connection is created
    #[serde(default = "default_max_sockets")]
    pub max_sockets: usize,

    /// Number of open sockets to fall back to when the overload purge runs
    #[serde(default = "default_sockets_after_purge")]
    pub sockets_after_purge: usize,

    /// Idle budget for TCP connections (seconds)
    #[serde(default = "default_tcp_timeout")]
    pub tcp_timeout_secs: u64,

    /// Idle budget for UDP connections (seconds)
    #[serde(default = "default_udp_timeout")]
    pub udp_timeout_secs: u64,

    /// Idle budget for ICMP echo flows (seconds)
    #[serde(default = "default_icmp_timeout")]
    pub icmp_timeout_secs: u64,

    /// Whether to open the shared raw ICMP socket at startup
    ///
    /// Raw sockets need elevated privileges on most platforms; with this off
    /// the engine still forwards TCP and UDP and drops ICMP packets.
    #[serde(default = "default_icmp_enabled")]
    pub icmp: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_tcp_window: default_tcp_window(),
            max_sockets: default_max_sockets(),
            sockets_after_purge: default_sockets_after_purge(),
            tcp_timeout_secs: default_tcp_timeout(),
            udp_timeout_secs: default_udp_timeout(),
            icmp_timeout_secs: default_icmp_timeout(),
            icmp: default_icmp_enabled(),
        }
    }
}

impl EngineConfig {
    /// Create a configuration with platform defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the advertised TCP window
    #[must_use]
    pub fn with_tcp_window(mut self, window: u16) -> Self {
        self.max_tcp_window = window;
        self
    }

    /// Set the open-socket ceiling and its post-purge target
    #[must_use]
    pub fn with_socket_ceiling(mut self, max: usize, after_purge: usize) -> Self {
        self.max_sockets = max;
        self.sockets_after_purge = after_purge;
        self
    }

    /// Set all three idle budgets at once
    #[must_use]
    pub fn with_timeouts(mut self, tcp: Duration, udp: Duration, icmp: Duration) -> Self {
        self.tcp_timeout_secs = tcp.as_secs();
        self.udp_timeout_secs = udp.as_secs();
        self.icmp_timeout_secs = icmp.as_secs();
        self
    }

    /// Disable the shared raw ICMP socket
    #[must_use]
    pub fn without_icmp(mut self) -> Self {
        self.icmp = false;
        self
    }

    /// Get the idle budget for an IP protocol number, if it is one the
    /// engine tracks
    #[must_use]
    pub fn timeout_for(&self, protocol: crate::packet::Proto) -> u64 {
        match protocol {
            crate::packet::Proto::Tcp => self.tcp_timeout_secs,
            crate::packet::Proto::Udp => self.udp_timeout_secs,
            crate::packet::Proto::Icmp => self.icmp_timeout_secs,
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the socket ceiling is zero,
    /// the post-purge target does not leave headroom below the ceiling, or
    /// any idle budget is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sockets == 0 {
            return Err(ConfigError::validation("max_sockets must be nonzero"));
        }
        if self.sockets_after_purge >= self.max_sockets {
            return Err(ConfigError::validation(format!(
                "sockets_after_purge ({}) must be below max_sockets ({})",
                self.sockets_after_purge, self.max_sockets
            )));
        }
        if self.tcp_timeout_secs == 0 || self.udp_timeout_secs == 0 || self.icmp_timeout_secs == 0 {
            return Err(ConfigError::validation("idle timeouts must be nonzero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.max_tcp_window, 64240);
        assert!(config.sockets_after_purge < config.max_sockets);
        assert_eq!(config.tcp_timeout_secs, 30);
        assert_eq!(config.udp_timeout_secs, 15);
        assert_eq!(config.icmp_timeout_secs, 5);
        assert!(config.icmp);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new()
            .with_tcp_window(8192)
            .with_socket_ceiling(10, 4)
            .with_timeouts(
                Duration::from_secs(60),
                Duration::from_secs(20),
                Duration::from_secs(10),
            )
            .without_icmp();

        assert_eq!(config.max_tcp_window, 8192);
        assert_eq!(config.max_sockets, 10);
        assert_eq!(config.sockets_after_purge, 4);
        assert_eq!(config.tcp_timeout_secs, 60);
        assert!(!config.icmp);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let config = EngineConfig::new().with_socket_ceiling(10, 10);
        assert!(config.validate().is_err());

        let config = EngineConfig::new().with_socket_ceiling(0, 0);
        assert!(config.validate().is_err());

        let mut config = EngineConfig::new();
        config.udp_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = EngineConfig::new().with_socket_ceiling(12, 6);
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_sockets, 12);
        assert_eq!(back.sockets_after_purge, 6);

        // Partial documents pick up the defaults
        let sparse: EngineConfig = serde_json::from_str("{\"max_tcp_window\": 1024}").unwrap();
        assert_eq!(sparse.max_tcp_window, 1024);
        assert_eq!(sparse.tcp_timeout_secs, 30);
    }
}
