//! Centralized configuration management for the tunnel server.
//!
//! Most values have sane defaults; only `AUTHORITY_HOSTNAME` is required,
//! since it is baked into every certificate principal this process mints.

use std::sync::OnceLock;
use std::time::Duration;

// ============================================================================
// Environment variable names
// ============================================================================

mod env {
    pub const BIND_ADDR: &str = "TUNNEL_BIND_ADDR";
    pub const MANAGEMENT_ADDR: &str = "TUNNEL_MANAGEMENT_ADDR";
    pub const AUTHORITY_HOSTNAME: &str = "TUNNEL_AUTHORITY_HOSTNAME";
    pub const HEARTBEAT_PERIOD_SECS: &str = "TUNNEL_HEARTBEAT_PERIOD_SECS";
    pub const HOST_CERT_TTL_SECS: &str = "TUNNEL_HOST_CERT_TTL_SECS";
    pub const JOIN_TOKEN_TTL_SECS: &str = "TUNNEL_JOIN_TOKEN_TTL_SECS";
}

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3080";
const DEFAULT_MANAGEMENT_ADDR: &str = "0.0.0.0:3000";

/// Agents ping at this cadence; a site is marked offline past 2x this.
const DEFAULT_HEARTBEAT_PERIOD_SECS: u64 = 30;

/// Join tokens default to a one-hour window, matching typical single-use
/// provisioning flows.
const DEFAULT_JOIN_TOKEN_TTL_SECS: u64 = 3600;

// ============================================================================
// Global configuration (loaded once at startup)
// ============================================================================

static CONFIG: OnceLock<Config> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the SSH tunnel listener binds.
    pub bind_addr: String,
    /// Address the HTTP management/status API binds.
    pub management_addr: String,
    /// Hostname suffix appended to node names in minted certificate
    /// principals (`<node>.<authority_hostname>`).
    pub authority_hostname: String,
    /// How often a well-behaved agent is expected to heartbeat.
    pub heartbeat_period: Duration,
    /// Default TTL for join tokens.
    pub join_token_ttl: Duration,
}

impl Config {
    fn load() -> Self {
        let bind_addr =
            std::env::var(env::BIND_ADDR).unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
        let management_addr = std::env::var(env::MANAGEMENT_ADDR)
            .unwrap_or_else(|_| DEFAULT_MANAGEMENT_ADDR.to_string());
        let authority_hostname = std::env::var(env::AUTHORITY_HOSTNAME).unwrap_or_else(|_| {
            panic!(
                "{} environment variable is required",
                env::AUTHORITY_HOSTNAME
            )
        });

        let heartbeat_period = Duration::from_secs(read_u64(
            env::HEARTBEAT_PERIOD_SECS,
            DEFAULT_HEARTBEAT_PERIOD_SECS,
        ));
        let join_token_ttl =
            Duration::from_secs(read_u64(env::JOIN_TOKEN_TTL_SECS, DEFAULT_JOIN_TOKEN_TTL_SECS));

        Self {
            bind_addr,
            management_addr,
            authority_hostname,
            heartbeat_period,
            join_token_ttl,
        }
    }
}

fn read_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ============================================================================
// Public API
// ============================================================================

/// Initialize configuration. Must be called once at startup.
/// Panics if required environment variables are missing.
pub fn init() {
    CONFIG.get_or_init(Config::load);
}

/// Get the global configuration. Panics if not initialized.
pub fn get() -> &'static Config {
    CONFIG.get().expect("Config not initialized. Call config::init() first.")
}

/// The host certificate principal this process mints for a joining node.
/// Takes `authority_hostname` explicitly rather than reading it from the
/// global `Config` so callers that already have it in hand (and tests that
/// never call `init()`) don't need a live global config just to format it.
pub fn principal_for(node_name: &str, authority_hostname: &str) -> String {
    format!("{}.{}", node_name, authority_hostname)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn principal_joins_node_and_authority_hostname() {
        assert_eq!(principal_for("edge-a", "cluster.example"), "edge-a.cluster.example");
    }

    #[test]
    fn read_u64_falls_back_to_default() {
        std::env::remove_var("TUNNEL_TEST_MISSING");
        assert_eq!(read_u64("TUNNEL_TEST_MISSING", 42), 42);
    }

    #[test]
    fn read_u64_parses_present_value() {
        std::env::set_var("TUNNEL_TEST_PRESENT", "99");
        assert_eq!(read_u64("TUNNEL_TEST_PRESENT", 42), 99);
        std::env::remove_var("TUNNEL_TEST_PRESENT");
    }
}
