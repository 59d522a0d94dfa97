use serde::Deserialize;

/// Complete Tether configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TetherConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Broker connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_url")]
    pub url: String,
    /// Outgoing heartbeat interval (milliseconds)
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_out_ms: u64,
    /// Expected incoming heartbeat interval (milliseconds)
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_in_ms: u64,
}

fn default_broker_url() -> String {
    std::env::var("BROKER_URL").unwrap_or_else(|_| "ws://localhost:15674/ws".to_string())
}

fn default_heartbeat_ms() -> u64 {
    10_000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            heartbeat_out_ms: default_heartbeat_ms(),
            heartbeat_in_ms: default_heartbeat_ms(),
        }
    }
}

/// Reconnection backoff configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    /// Initial backoff delay (milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff ceiling (milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Automatic reconnection stops after this many failed attempts
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    10
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<TetherConfig, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: TetherConfig = toml::from_str(&contents)?;
    Ok(config)
}
