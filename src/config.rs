use crate::error::ProxyError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;
use zeroize::Zeroizing;

/// Environment variable carrying the overlay auth key.
pub const AUTH_KEY_ENV: &str = "TS_AUTHKEY";

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8384";
pub const DEFAULT_GATEWAY_ADDR: &str = "127.0.0.1:1055";
pub const DEFAULT_NODE_NAME: &str = "tailgate";

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8384))
}

fn default_gateway_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 1055))
}

fn default_node_name() -> String {
    DEFAULT_NODE_NAME.to_string()
}

fn default_dial_timeout_secs() -> u64 {
    15
}

fn default_max_header_size() -> usize {
    16 * 1024 // 16KB default header size limit
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Text
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(ProxyError::Config(format!("Invalid log format: {}. Must be one of: text, json", s))),
        }
    }
}

/// Runtime configuration. Built once at startup and shared read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Display name of this node on the overlay network
    #[serde(default = "default_node_name")]
    pub node_name: String,
    #[serde(default)]
    pub verbose: bool,
    /// SOCKS5 endpoint of the local overlay gateway
    #[serde(default = "default_gateway_addr")]
    pub gateway_addr: SocketAddr,
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            node_name: default_node_name(),
            verbose: false,
            gateway_addr: default_gateway_addr(),
            dial_timeout_secs: default_dial_timeout_secs(),
            max_header_size: default_max_header_size(),
            log_format: LogFormat::Text,
        }
    }
}

fn hostname_label() -> &'static Regex {
    static LABEL: OnceLock<Regex> = OnceLock::new();
    LABEL.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?$").expect("static regex")
    })
}

impl ProxyConfig {
    pub fn from_file(path: &str) -> Result<Self, ProxyError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("Invalid configuration file {}: {}", path, e)))
    }

    pub fn to_file(&self, path: &str) -> Result<(), ProxyError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ProxyError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        if !hostname_label().is_match(&self.node_name) {
            return Err(ProxyError::Config(format!(
                "Invalid node name '{}': must be a single DNS label (letters, digits, '-')",
                self.node_name
            )));
        }
        if self.dial_timeout_secs == 0 {
            return Err(ProxyError::Config("dial_timeout_secs must be greater than 0".to_string()));
        }
        if self.max_header_size < 1024 {
            return Err(ProxyError::Config(format!(
                "max_header_size must be at least 1024 bytes, got {}",
                self.max_header_size
            )));
        }
        Ok(())
    }
}

/// Overlay auth key. Wiped from memory on drop and never printed.
#[derive(Clone)]
pub struct Credential(Zeroizing<String>);

impl Credential {
    pub fn new(key: impl Into<String>) -> Result<Self, ProxyError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(ProxyError::Credential("auth key is empty".to_string()));
        }
        Ok(Self(Zeroizing::new(key)))
    }

    pub fn from_env() -> Result<Self, ProxyError> {
        let key = std::env::var(AUTH_KEY_ENV)
            .map_err(|_| ProxyError::Credential(format!("{} is not set", AUTH_KEY_ENV)))?;
        Self::new(key)
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}
