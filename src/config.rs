//! Configuration for Courier
//!
//! CLI arguments and environment variable handling using clap. `Args` is the
//! process-facing surface; `GatewayConfig` is the typed runtime view that the
//! connection layer consumes.

use clap::{Args as ClapArgs, Parser};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Courier - outbound messaging-gateway connection manager
#[derive(Parser, Debug, Clone)]
#[command(name = "courier")]
#[command(about = "Keeps paired messaging-gateway sessions alive and delivers outbound messages in order")]
pub struct Args {
    /// Address the status endpoint listens on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8090")]
    pub listen: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format (text, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Development mode: use the dry-run transport
    #[arg(long, env = "DEV_MODE", default_value_t = true, action = clap::ArgAction::Set)]
    pub dev_mode: bool,

    /// Register clients without connecting them
    #[arg(long, env = "WA_SERVICE_SKIP_INIT", default_value = "false")]
    pub skip_init: bool,

    /// Exit if any client is not ready after startup
    #[arg(long, env = "WA_FAIL_FAST_ON_INIT", default_value = "false")]
    pub fail_fast_on_init: bool,

    /// Gateway lifecycle tuning
    #[command(flatten)]
    pub gateway: GatewayArgs,
}

/// Gateway connection lifecycle configuration
#[derive(ClapArgs, Debug, Clone)]
pub struct GatewayArgs {
    /// Comma-separated client ids; the first one is the primary client
    #[arg(long, env = "WA_CLIENT_IDS", default_value = "wa-admin")]
    pub client_ids: String,

    /// Root directory for per-client session storage (default: ~/.courier/auth)
    #[arg(long, env = "WA_AUTH_DATA_PATH")]
    pub auth_data_path: Option<PathBuf>,

    /// Whether reinitialize clears stored credentials unless told otherwise
    #[arg(long, env = "WA_AUTH_CLEAR_SESSION_ON_REINIT", default_value = "false")]
    pub clear_session_on_reinit: bool,

    /// Default readiness wait for sends (default: max(auth-ready, fallback delay + 5s))
    #[arg(long, env = "WA_READY_TIMEOUT_MS")]
    pub ready_timeout_ms: Option<u64>,

    /// How long after authentication to wait for an explicit ready signal
    #[arg(long, env = "WA_AUTH_READY_TIMEOUT_MS", default_value = "45000")]
    pub auth_ready_timeout_ms: u64,

    /// Upper bound on a single connect attempt
    #[arg(long, env = "WA_CONNECT_TIMEOUT_MS", default_value = "180000")]
    pub connect_timeout_ms: u64,

    /// Delay before reconnecting after a non-logout disconnect
    #[arg(long, env = "WA_RECONNECT_DELAY_MS", default_value = "5000")]
    pub reconnect_delay_ms: u64,

    /// Outright connect failures tolerated before giving up
    #[arg(long, env = "WA_HARD_INIT_MAX_ATTEMPTS", default_value = "3")]
    pub hard_init_max_attempts: u32,

    #[arg(long, env = "WA_HARD_INIT_BASE_MS", default_value = "120000")]
    pub hard_init_base_ms: u64,

    #[arg(long, env = "WA_HARD_INIT_MAX_MS", default_value = "900000")]
    pub hard_init_max_ms: u64,

    /// Fallback readiness poller interval
    #[arg(long, env = "WA_FALLBACK_READY_DELAY_MS", default_value = "60000")]
    pub fallback_ready_delay_ms: u64,

    /// Cooldown after the poller exhausts its reconnect budget
    #[arg(long, env = "WA_FALLBACK_READY_COOLDOWN_MS", default_value = "300000")]
    pub fallback_ready_cooldown_ms: u64,

    /// Probe re-checks before the poller takes corrective action
    #[arg(long, env = "WA_FALLBACK_STATE_RETRIES", default_value = "3")]
    pub fallback_state_retries: u32,

    #[arg(long, env = "WA_FALLBACK_STATE_RETRY_MIN_MS", default_value = "15000")]
    pub fallback_state_retry_min_ms: u64,

    #[arg(long, env = "WA_FALLBACK_STATE_RETRY_MAX_MS", default_value = "30000")]
    pub fallback_state_retry_max_ms: u64,

    /// Poller-driven reconnects per cooldown window
    #[arg(long, env = "WA_FALLBACK_REINIT_ATTEMPTS", default_value = "2")]
    pub fallback_reinit_attempts: u32,

    /// Consecutive ambiguous cycles before a destructive reinitialize
    #[arg(long, env = "WA_FALLBACK_ESCALATION_CYCLES", default_value = "2")]
    pub fallback_escalation_cycles: u32,

    #[arg(long, env = "WA_CONNECT_INFLIGHT_WARN_MS", default_value = "120000")]
    pub connect_inflight_warn_ms: u64,

    #[arg(long, env = "WA_CONNECT_INFLIGHT_REINIT_MS", default_value = "300000")]
    pub connect_inflight_reinit_ms: u64,

    /// A fresh pairing code defers forced reinitialization for this long
    #[arg(long, env = "WA_PAIRING_GRACE_MS", default_value = "120000")]
    pub pairing_grace_ms: u64,

    /// Upper bound on a single transport status call
    #[arg(long, env = "WA_PROBE_TIMEOUT_MS", default_value = "5000")]
    pub probe_timeout_ms: u64,

    /// Transport calls per outbound message when rate limited
    #[arg(long, env = "WA_SEND_MAX_ATTEMPTS", default_value = "5")]
    pub send_max_attempts: u32,

    #[arg(long, env = "WA_SEND_BASE_DELAY_MS", default_value = "800")]
    pub send_base_delay_ms: u64,

    /// Pause before each outbound message
    #[arg(long, env = "WA_RESPONSE_DELAY_MS", default_value = "0")]
    pub response_delay_ms: u64,

    #[arg(long, env = "WA_SEND_QUEUE_CAPACITY", default_value = "1000")]
    pub send_queue_capacity: usize,

    /// Comma-separated admin phone numbers for operator notifications
    #[arg(long, env = "ADMIN_WHATSAPP")]
    pub admin_targets: Option<String>,
}

impl GatewayArgs {
    pub fn client_id_list(&self) -> Vec<String> {
        split_list(&self.client_ids)
    }

    pub fn admin_target_list(&self) -> Vec<String> {
        self.admin_targets
            .as_deref()
            .map(split_list)
            .unwrap_or_default()
    }

    pub fn to_config(&self) -> GatewayConfig {
        let defaults = GatewayConfig::default();
        let auth_ready_timeout = Duration::from_millis(self.auth_ready_timeout_ms);
        let fallback_delay = Duration::from_millis(self.fallback_ready_delay_ms);
        GatewayConfig {
            client_ids: self.client_id_list(),
            auth_data_path: self
                .auth_data_path
                .clone()
                .unwrap_or(defaults.auth_data_path),
            clear_session_on_reinit: self.clear_session_on_reinit,
            ready_timeout: self
                .ready_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| default_ready_timeout(auth_ready_timeout, fallback_delay)),
            auth_ready_timeout,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            hard_init_max_attempts: self.hard_init_max_attempts,
            hard_init_base_delay: Duration::from_millis(self.hard_init_base_ms),
            hard_init_max_delay: Duration::from_millis(self.hard_init_max_ms),
            fallback_delay,
            fallback_cooldown: Duration::from_millis(self.fallback_ready_cooldown_ms),
            fallback_state_retries: self.fallback_state_retries,
            fallback_retry_min_delay: Duration::from_millis(self.fallback_state_retry_min_ms),
            fallback_retry_max_delay: Duration::from_millis(self.fallback_state_retry_max_ms),
            fallback_reinit_attempts: self.fallback_reinit_attempts,
            fallback_escalation_cycles: self.fallback_escalation_cycles,
            connect_inflight_warn: Duration::from_millis(self.connect_inflight_warn_ms),
            connect_inflight_reinit: Duration::from_millis(self.connect_inflight_reinit_ms),
            pairing_grace: Duration::from_millis(self.pairing_grace_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            send_max_attempts: self.send_max_attempts,
            send_base_delay: Duration::from_millis(self.send_base_delay_ms),
            response_delay: Duration::from_millis(self.response_delay_ms),
            send_queue_capacity: self.send_queue_capacity,
            admin_targets: self.admin_target_list(),
        }
    }
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        let gateway = &self.gateway;
        if gateway.client_id_list().is_empty() {
            return Err("WA_CLIENT_IDS must name at least one client".to_string());
        }
        if let Some(bad) = gateway
            .client_id_list()
            .into_iter()
            .find(|id| !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'))
        {
            return Err(format!(
                "client id '{}' may only contain letters, digits, '-' and '_'",
                bad
            ));
        }
        if gateway.hard_init_base_ms > gateway.hard_init_max_ms {
            return Err("WA_HARD_INIT_BASE_MS must not exceed WA_HARD_INIT_MAX_MS".to_string());
        }
        if gateway.fallback_state_retry_min_ms > gateway.fallback_state_retry_max_ms {
            return Err(
                "WA_FALLBACK_STATE_RETRY_MIN_MS must not exceed WA_FALLBACK_STATE_RETRY_MAX_MS"
                    .to_string(),
            );
        }
        if gateway.connect_inflight_warn_ms > gateway.connect_inflight_reinit_ms {
            return Err(
                "WA_CONNECT_INFLIGHT_WARN_MS must not exceed WA_CONNECT_INFLIGHT_REINIT_MS"
                    .to_string(),
            );
        }
        if gateway.probe_timeout_ms == 0 {
            return Err("WA_PROBE_TIMEOUT_MS must be greater than zero".to_string());
        }
        if gateway.send_max_attempts == 0 {
            return Err("WA_SEND_MAX_ATTEMPTS must be at least 1".to_string());
        }
        if gateway.send_queue_capacity == 0 {
            return Err("WA_SEND_QUEUE_CAPACITY must be greater than zero".to_string());
        }
        if !matches!(self.log_format.as_str(), "text" | "json") {
            return Err(format!("LOG_FORMAT must be 'text' or 'json', got '{}'", self.log_format));
        }
        Ok(())
    }
}

/// Runtime configuration for the connection layer
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub client_ids: Vec<String>,
    pub auth_data_path: PathBuf,
    pub clear_session_on_reinit: bool,
    pub ready_timeout: Duration,
    pub auth_ready_timeout: Duration,
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
    pub hard_init_max_attempts: u32,
    pub hard_init_base_delay: Duration,
    pub hard_init_max_delay: Duration,
    pub fallback_delay: Duration,
    pub fallback_cooldown: Duration,
    pub fallback_state_retries: u32,
    pub fallback_retry_min_delay: Duration,
    pub fallback_retry_max_delay: Duration,
    pub fallback_reinit_attempts: u32,
    pub fallback_escalation_cycles: u32,
    pub connect_inflight_warn: Duration,
    pub connect_inflight_reinit: Duration,
    pub pairing_grace: Duration,
    pub probe_timeout: Duration,
    pub send_max_attempts: u32,
    pub send_base_delay: Duration,
    pub response_delay: Duration,
    pub send_queue_capacity: usize,
    pub admin_targets: Vec<String>,
}

impl GatewayConfig {
    pub fn primary_client_id(&self) -> Option<&str> {
        self.client_ids.first().map(String::as_str)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let auth_ready_timeout = Duration::from_secs(45);
        let fallback_delay = Duration::from_secs(60);
        Self {
            client_ids: vec!["wa-admin".to_string()],
            auth_data_path: default_auth_data_path(),
            clear_session_on_reinit: false,
            ready_timeout: default_ready_timeout(auth_ready_timeout, fallback_delay),
            auth_ready_timeout,
            connect_timeout: Duration::from_secs(180),
            reconnect_delay: Duration::from_secs(5),
            hard_init_max_attempts: 3,
            hard_init_base_delay: Duration::from_secs(120),
            hard_init_max_delay: Duration::from_secs(900),
            fallback_delay,
            fallback_cooldown: Duration::from_secs(300),
            fallback_state_retries: 3,
            fallback_retry_min_delay: Duration::from_secs(15),
            fallback_retry_max_delay: Duration::from_secs(30),
            fallback_reinit_attempts: 2,
            fallback_escalation_cycles: 2,
            connect_inflight_warn: Duration::from_secs(120),
            connect_inflight_reinit: Duration::from_secs(300),
            pairing_grace: Duration::from_secs(120),
            probe_timeout: Duration::from_secs(5),
            send_max_attempts: 5,
            send_base_delay: Duration::from_millis(800),
            response_delay: Duration::ZERO,
            send_queue_capacity: 1000,
            admin_targets: Vec::new(),
        }
    }
}

/// A send must outlast at least one fallback check.
fn default_ready_timeout(auth_ready: Duration, fallback_delay: Duration) -> Duration {
    auth_ready.max(fallback_delay + Duration::from_secs(5))
}

fn default_auth_data_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".courier")
        .join("auth")
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
