use std::time::Duration;

use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::auth::ratelimit::FailPolicy;
use crate::ws::hub::HubLimits;

pub const DEFAULT_CONFIG_PATH: &str = "./realtime.toml";

/// Command-line flags. Only flags that were actually given serialize, so an
/// absent flag never shadows the TOML file or the environment.
#[derive(Parser, Serialize, Clone, Debug, Default)]
#[command(name = "realtime-hub", version, about = "Realtime connection and broadcast hub")]
pub struct Cli {
    /// Port to listen on [default: 8375]
    #[arg(long, env = "REALTIME_PORT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Bind address [default: 0.0.0.0]
    #[arg(long, env = "REALTIME_BIND_ADDRESS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,

    /// Path to TOML config file [default: ./realtime.toml]
    #[arg(long)]
    #[serde(skip)]
    pub config: Option<String>,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "REALTIME_JSON_LOGS")]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    #[serde(skip)]
    pub generate_config: bool,

    /// Redis URL for the shared store and cross-process pub/sub.
    /// Without one the hub runs single-process on an in-memory store.
    #[arg(long, env = "REALTIME_REDIS_URL")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,

    /// HS256 secret for bearer tokens. A random one is generated if unset.
    #[arg(long, env = "REALTIME_JWT_SECRET", hide_env_values = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,

    /// Identifies this process in presence reports. Random if unset.
    #[arg(long, env = "REALTIME_NODE_ID")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,

    /// "production", "development" or "test". Rate limiting is off outside production.
    #[arg(long, env = "REALTIME_ENVIRONMENT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

/// Effective settings after layering.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub bind_address: String,
    /// TOML file the settings were read from
    #[serde(default, skip_serializing)]
    pub config: String,
    #[serde(default)]
    pub json_logs: bool,
    #[serde(default, skip_serializing)]
    pub generate_config: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub environment: String,

    /// Capacity and timing limits (loaded from [limits] section in TOML)
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_conns_per_user: usize,
    pub max_total_conns: usize,
    /// Outbound frames buffered per connection before messages are dropped
    pub client_queue_size: usize,
    pub ticket_ttl_secs: u64,
    /// How long a consumed ticket still admits on this node
    pub consumed_ticket_grace_secs: u64,
    /// Pending game rooms idle longer than this are cancelled
    pub pending_room_max_idle_secs: u64,
    pub presence_ttl_secs: u64,
    pub presence_heartbeat_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub rate_limit_enabled: bool,
    pub rate_limit_fail_policy: FailPolicy,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_conns_per_user: 12,
            max_total_conns: 10_000,
            client_queue_size: 256,
            ticket_ttl_secs: 30,
            consumed_ticket_grace_secs: 10,
            pending_room_max_idle_secs: 600,
            presence_ttl_secs: 25,
            presence_heartbeat_secs: 10,
            shutdown_timeout_secs: 10,
            rate_limit_enabled: true,
            rate_limit_fail_policy: FailPolicy::Open,
        }
    }
}

impl LimitsConfig {
    pub fn hub_limits(&self) -> HubLimits {
        HubLimits {
            max_conns_per_user: self.max_conns_per_user,
            max_total_conns: self.max_total_conns,
            queue_capacity: self.client_queue_size,
        }
    }

    pub fn ticket_ttl(&self) -> Duration {
        Duration::from_secs(self.ticket_ttl_secs)
    }

    pub fn consumed_ticket_grace(&self) -> Duration {
        Duration::from_secs(self.consumed_ticket_grace_secs)
    }

    pub fn pending_room_max_idle(&self) -> Duration {
        Duration::from_secs(self.pending_room_max_idle_secs)
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence_ttl_secs)
    }

    pub fn presence_heartbeat(&self) -> Duration {
        Duration::from_secs(self.presence_heartbeat_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8375,
            bind_address: "0.0.0.0".to_string(),
            config: DEFAULT_CONFIG_PATH.to_string(),
            json_logs: false,
            generate_config: false,
            redis_url: None,
            jwt_secret: None,
            node_id: None,
            environment: "production".to_string(),
            limits: LimitsConfig::default(),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (REALTIME_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        Self::from_cli(Cli::parse())
    }

    pub fn from_cli(cli: Cli) -> Result<Self, figment::Error> {
        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        let mut config: Config = Self::figment(&config_path)
            .merge(Serialized::defaults(&cli))
            .extract()?;
        config.config = config_path;
        config.generate_config = cli.generate_config;
        Ok(config)
    }

    fn figment(config_path: &str) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("REALTIME_").split("__"))
    }

    /// Development and test deployments skip rate limiting.
    pub fn rate_limiting_enabled(&self) -> bool {
        self.limits.rate_limit_enabled && !matches!(self.environment.as_str(), "development" | "test")
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Realtime Hub Configuration
# Place this file at ./realtime.toml or specify with --config <path>
# All settings can be overridden via environment variables (REALTIME_PORT,
# REALTIME_LIMITS__TICKET_TTL_SECS, etc.) or CLI flags (--port, etc.)

# Server port (default: 8375)
# port = 8375

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Shared store and pub/sub. Leave unset to run a single in-memory node.
# redis_url = "redis://127.0.0.1:6379"

# HS256 secret used to verify bearer tokens
# jwt_secret = ""

# Name of this process in cross-node presence reports (default: random)
# node_id = "hub-1"

# "production", "development" or "test"
# environment = "production"

# ---- Limits ----
# [limits]
# max_conns_per_user = 12
# max_total_conns = 10000
# client_queue_size = 256          # frames buffered per socket
# ticket_ttl_secs = 30
# consumed_ticket_grace_secs = 10  # multi-pass upgrade window
# pending_room_max_idle_secs = 600 # stale pending game rooms
# presence_ttl_secs = 25
# presence_heartbeat_secs = 10
# shutdown_timeout_secs = 10
# rate_limit_enabled = true
# rate_limit_fail_policy = "open"  # or "closed"
"#
    .to_string()
}
