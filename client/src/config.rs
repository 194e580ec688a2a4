//! Configuration for Outpost
//!
//! `TunnelConfig` is the validated, immutable input of a tunnel session.
//! `ConfigFile` is its on-disk form (outpost.yml), with durations in seconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use outpost_shared::protocol::{Protocol, TUNNEL_PATH};
use outpost_shared::{Error, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};

/// Settings for one tunnel session
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Broker URL; http(s) is mapped onto ws(s)
    pub server_url: String,
    /// Bearer token; empty means no Authorization header
    pub token: String,
    pub subdomain: String,
    pub local_host: String,
    pub local_port: u16,
    pub protocol: Protocol,
    /// Bounds the control-channel dial and every local dial
    pub connect_timeout: Duration,
    /// Extra control-channel connect attempts after the first
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub heartbeat_interval: Duration,
    /// Transport ping cadence
    pub keepalive_interval: Duration,
    /// Grace on top of `keepalive_interval` before the channel counts as dead
    pub keepalive_timeout: Duration,
    /// How long in-flight relays may drain on close
    pub shutdown_timeout: Duration,
    /// How long a relay waits for the first byte of local output
    pub response_timeout: Duration,
    /// Once output has started, a relay stops reading after this much silence
    pub idle_timeout: Duration,
}

impl TunnelConfig {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>, subdomain: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            token: token.into(),
            subdomain: subdomain.into(),
            local_host: default_host(),
            local_port: default_port(),
            protocol: Protocol::Http,
            connect_timeout: Duration::from_secs(default_timeout()),
            retry_count: default_retry_count(),
            retry_delay: Duration::from_secs(default_retry_delay()),
            heartbeat_interval: Duration::from_secs(default_heartbeat()),
            keepalive_interval: Duration::from_secs(default_keepalive_interval()),
            keepalive_timeout: Duration::from_secs(default_keepalive_timeout()),
            shutdown_timeout: Duration::from_secs(default_shutdown_timeout()),
            response_timeout: Duration::from_secs(default_response_timeout()),
            idle_timeout: Duration::from_secs(default_idle_timeout()),
        }
    }

    /// HTTP tunnel to a local port
    pub fn http(server_url: impl Into<String>, token: impl Into<String>, subdomain: impl Into<String>, local_port: u16) -> Self {
        Self {
            local_port,
            protocol: Protocol::Http,
            ..Self::new(server_url, token, subdomain)
        }
    }

    /// Raw TCP tunnel to a local port
    pub fn tcp(server_url: impl Into<String>, token: impl Into<String>, subdomain: impl Into<String>, local_port: u16) -> Self {
        Self {
            local_port,
            protocol: Protocol::Tcp,
            ..Self::new(server_url, token, subdomain)
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.websocket_url()?;

        if self.local_host.trim().is_empty() {
            return Err(Error::Config("local_host cannot be empty".to_string()));
        }
        if self.local_port == 0 {
            return Err(Error::Config("invalid local port 0".to_string()));
        }

        let durations = [
            ("connect_timeout", self.connect_timeout),
            ("heartbeat_interval", self.heartbeat_interval),
            ("keepalive_interval", self.keepalive_interval),
            ("keepalive_timeout", self.keepalive_timeout),
            ("shutdown_timeout", self.shutdown_timeout),
            ("response_timeout", self.response_timeout),
            ("idle_timeout", self.idle_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }

        Ok(())
    }

    /// Broker URL mapped onto the WebSocket scheme, ending in `/tunnel`
    pub fn websocket_url(&self) -> Result<Url> {
        normalize_broker_url(&self.server_url)
    }

    /// `host:port` of the local service
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }
}

/// Map an http(s)/ws(s) broker URL onto its WebSocket form.
///
/// The control channel lives at `/tunnel` under the broker's base path, so
/// `https://h/api` becomes `wss://h/api/tunnel`. A URL already ending in
/// `/tunnel` is kept as is.
pub fn normalize_broker_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| Error::Config(format!("invalid server URL '{}': {}", raw, e)))?;

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(Error::Config(format!("unsupported URL scheme '{}'", other))),
    };
    // http -> ws is a special-to-special change, which Url permits
    url.set_scheme(scheme)
        .map_err(|_| Error::Config(format!("cannot convert '{}' to a WebSocket URL", raw)))?;

    let base = url.path().trim_end_matches('/').to_string();
    let path = if base.ends_with(TUNNEL_PATH) {
        base
    } else {
        format!("{}{}", base, TUNNEL_PATH)
    };
    url.set_path(&path);

    Ok(url)
}

/// Root of outpost.yml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Broker URL
    pub server_url: String,

    /// Authentication token
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Administrative API base URL (defaults to the broker URL)
    #[serde(default)]
    pub api_url: Option<String>,

    /// Tunnel definition
    pub tunnel: TunnelSection,
}

/// The tunnel block of outpost.yml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSection {
    pub subdomain: String,

    /// Protocol: http or tcp
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,

    /// Local hostname to forward to
    #[serde(default = "default_host")]
    pub local_host: String,

    #[serde(default = "default_port")]
    pub local_port: u16,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,

    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_secs: u64,

    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

fn default_protocol() -> Protocol {
    Protocol::Http
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_timeout() -> u64 {
    30
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1
}

fn default_heartbeat() -> u64 {
    30
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_keepalive_timeout() -> u64 {
    10
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_response_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    5
}

impl ConfigFile {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read config file {}: {}", path.display(), e))
        })?;

        Self::parse(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: ConfigFile = serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;
        config.tunnel_config().validate()?;
        Ok(config)
    }

    /// Session settings described by this file
    pub fn tunnel_config(&self) -> TunnelConfig {
        let t = &self.tunnel;
        TunnelConfig {
            server_url: self.server_url.clone(),
            token: self.auth_token.clone().unwrap_or_default(),
            subdomain: t.subdomain.clone(),
            local_host: t.local_host.clone(),
            local_port: t.local_port,
            protocol: t.protocol,
            connect_timeout: Duration::from_secs(t.timeout_secs),
            retry_count: t.retry_count,
            retry_delay: Duration::from_secs(t.retry_delay_secs),
            heartbeat_interval: Duration::from_secs(t.heartbeat_secs),
            keepalive_interval: Duration::from_secs(t.keepalive_interval_secs),
            keepalive_timeout: Duration::from_secs(t.keepalive_timeout_secs),
            shutdown_timeout: Duration::from_secs(t.shutdown_timeout_secs),
            response_timeout: Duration::from_secs(t.response_timeout_secs),
            idle_timeout: Duration::from_secs(t.idle_timeout_secs),
        }
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = [
            "outpost.yml",
            "outpost.yaml",
            ".outpost.yml",
            ".outpost.yaml",
        ];

        // Check current directory
        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        // Check home directory
        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}
