//! Configuration types for the ONVIF SOAP engine.

use crate::error::SoapError;
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OnvifConfig {
    /// Config version
    pub version: String,

    /// Client dispatcher settings
    pub client: ClientConfig,

    /// UsernameToken validation on the server side
    pub security: SecurityConfig,

    /// Server dispatcher settings
    pub server: ServerConfig,

    /// WS-Discovery settings
    pub discovery: DiscoveryConfig,
}

impl Default for OnvifConfig {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            client: ClientConfig::default(),
            security: SecurityConfig::default(),
            server: ServerConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl OnvifConfig {
    /// Parse YAML and validate.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, SoapError> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| SoapError::Config(format!("invalid YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SoapError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    /// Check values serde cannot.
    pub fn validate(&self) -> Result<(), SoapError> {
        for pattern in &self.security.exempt_actions {
            Pattern::new(pattern).map_err(|e| {
                SoapError::Config(format!("invalid exempt action pattern '{}': {}", pattern, e))
            })?;
        }
        if self.security.allowed_password_types.is_empty() {
            return Err(SoapError::Config(
                "security.allowed_password_types must not be empty".to_string(),
            ));
        }
        if self.client.timeout_ms == 0 {
            return Err(SoapError::Config("client.timeout_ms must be > 0".to_string()));
        }
        if self.discovery.window_ms == 0 {
            return Err(SoapError::Config("discovery.window_ms must be > 0".to_string()));
        }
        if !self.discovery.multicast_group.is_multicast() {
            return Err(SoapError::Config(format!(
                "discovery.multicast_group {} is not a multicast address",
                self.discovery.multicast_group
            )));
        }
        Ok(())
    }
}

/// Client dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,

    /// Log full request and response envelopes at trace level
    pub trace_messages: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            trace_messages: false,
        }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// WS-Security validation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Reject requests without a valid UsernameToken
    pub require_auth: bool,

    /// Allowed distance between `Created` and the local clock (seconds)
    pub max_clock_skew_secs: u64,

    /// Accepted UsernameToken password types
    pub allowed_password_types: Vec<PasswordType>,

    /// Actions served without authentication (glob patterns)
    pub exempt_actions: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            require_auth: true,
            max_clock_skew_secs: 300, // 5 minutes
            allowed_password_types: vec![PasswordType::PasswordDigest],
            exempt_actions: vec!["*/GetSystemDateAndTime".to_string()],
        }
    }
}

impl SecurityConfig {
    pub fn max_clock_skew(&self) -> Duration {
        Duration::from_secs(self.max_clock_skew_secs)
    }
}

/// WS-Security UsernameToken password types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PasswordType {
    /// Plain text password (not recommended)
    #[serde(rename = "PasswordText")]
    PasswordText,
    /// Digested password (SHA-1 with nonce and timestamp)
    #[serde(rename = "PasswordDigest")]
    PasswordDigest,
}

const PASSWORD_TEXT_URI: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordText";
const PASSWORD_DIGEST_URI: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordDigest";

impl PasswordType {
    /// `Type` attribute value on `wsse:Password`.
    pub fn uri(&self) -> &'static str {
        match self {
            Self::PasswordText => PASSWORD_TEXT_URI,
            Self::PasswordDigest => PASSWORD_DIGEST_URI,
        }
    }

    /// Map a `Type` attribute back. Bare fragments are accepted too.
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri.trim().rsplit('#').next() {
            Some("PasswordText") => Some(Self::PasswordText),
            Some("PasswordDigest") => Some(Self::PasswordDigest),
            _ => None,
        }
    }
}

/// Server dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Maximum request size to process (bytes)
    pub max_body_size: usize,

    /// Maximum element nesting in a request envelope
    pub max_body_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_body_size: 1_048_576, // 1MB
            max_body_depth: 32,
        }
    }
}

/// WS-Discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Multicast group probes go to
    pub multicast_group: Ipv4Addr,

    /// Discovery port
    pub port: u16,

    /// Collection window for one probe (milliseconds)
    pub window_ms: u64,

    /// Multicast TTL
    pub ttl: u32,

    /// Local interface for multicast membership
    pub interface: Ipv4Addr,

    /// Local address the probing socket binds to
    pub client_bind: SocketAddr,

    /// Address the responder binds to
    pub listen_addr: SocketAddr,

    /// Join the multicast group when the responder binds
    pub join_multicast: bool,

    /// Largest datagram accepted
    pub max_datagram_size: usize,

    /// Unicast targets. When non-empty probes go here instead of the group.
    pub targets: Vec<SocketAddr>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            multicast_group: Ipv4Addr::new(239, 255, 255, 250),
            port: 3702,
            window_ms: 3000,
            ttl: 4,
            interface: Ipv4Addr::UNSPECIFIED,
            client_bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 3702)),
            join_multicast: true,
            max_datagram_size: 65535,
            targets: Vec::new(),
        }
    }
}

impl DiscoveryConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Where probes are sent.
    pub fn destinations(&self) -> Vec<SocketAddr> {
        if self.targets.is_empty() {
            vec![SocketAddr::from((self.multicast_group, self.port))]
        } else {
            self.targets.clone()
        }
    }
}
