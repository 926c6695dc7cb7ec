// Server configuration

use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub user_agent: String,
    pub transport: TransportConfig,
    pub media: MediaConfig,
    pub bridge: BridgeConfig,
    pub auth: AuthConfig,
    pub limits: LimitsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            user_agent: "voicebridge/1.0".to_string(),
            transport: TransportConfig::default(),
            media: MediaConfig::default(),
            bridge: BridgeConfig::default(),
            auth: AuthConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| Error::Parse(format!("config: {}", e)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub bind_ip: IpAddr,
    pub udp_port: u16,
    pub tcp_enabled: bool,
    pub tcp_port: u16,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            bind_ip: "0.0.0.0".parse().unwrap(),
            udp_port: 5060,
            tcp_enabled: false,
            tcp_port: 5060,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Address advertised in SDP answers and bound for RTP.
    pub media_ip: IpAddr,
    pub port_range: (u16, u16),
    pub jitter_target_ms: u32,
    pub jitter_max_late_ms: u32,
    pub rtp_timeout_secs: u64,
    /// Calls older than this are swept regardless of state.
    pub max_call_secs: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        MediaConfig {
            media_ip: "127.0.0.1".parse().unwrap(),
            port_range: (10_000, 20_000),
            jitter_target_ms: 40,
            jitter_max_late_ms: 60,
            rtp_timeout_secs: 30,
            max_call_secs: 4 * 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub endpoint_url: String,
    /// Shared secret for the HMAC signature in the auth frame.
    pub shared_secret: String,
    /// Bearer token presented in the auth frame.
    pub bearer_token: String,
    pub handshake_timeout_secs: u64,
    pub queue_depth: usize,
    pub idle_timeout_secs: u64,
    pub reconnect_max_attempts: u32,
    pub reconnect_initial_ms: u64,
    pub reconnect_cap_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            endpoint_url: "ws://127.0.0.1:8080/stream".to_string(),
            shared_secret: String::new(),
            bearer_token: String::new(),
            handshake_timeout_secs: 5,
            queue_depth: 100,
            idle_timeout_secs: 60,
            reconnect_max_attempts: 3,
            reconnect_initial_ms: 500,
            reconnect_cap_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub realm: String,
    /// Secret keying the time-bucketed nonce HMAC.
    pub nonce_secret: String,
    pub nonce_window_secs: u64,
    pub max_failed_attempts: u32,
    pub lockout_secs: i64,
    /// Server cap applied to requested registration Expires.
    pub registration_max_expires: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            realm: "voicebridge".to_string(),
            nonce_secret: "change-me".to_string(),
            nonce_window_secs: 300,
            max_failed_attempts: 5,
            lockout_secs: 30 * 60,
            registration_max_expires: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_calls: usize,
    pub ring_timeout_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            max_calls: 100,
            ring_timeout_secs: 60,
        }
    }
}
