//! Runtime configuration, loadable from environment variables.

use std::time::Duration;

/// Which security layer to use. `None` is permitted for local development only
/// and must log a prominent warning.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum SecurityMode {
	None,
	#[default]
	Psk,
}

impl std::str::FromStr for SecurityMode {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"none" => Ok(Self::None),
			"psk" => Ok(Self::Psk),
			other => Err(format!("unknown security mode: {other}")),
		}
	}
}

/// Every runtime tunable the core exposes, with sensible defaults.
#[derive(Debug, Clone)]
pub struct RpcConfig {
	pub handshake_timeout: Duration,
	pub manifest_retries: u32,
	pub manifest_retry_delays: Vec<Duration>,
	pub world_state_period: Duration,
	pub heartbeat_period: Duration,
	pub heartbeat_initial_delay: Duration,
	pub available_zones_period: Duration,
	pub boundary_threshold_units: f64,
	pub neighbour_eviction_age: Duration,
	pub security_mode: SecurityMode,
	pub session_ttl: Duration,
	/// Threshold of consecutive AEAD decryption failures that tears a `Connection`
	/// down.
	pub max_consecutive_decrypt_failures: u32,
}

impl Default for RpcConfig {
	fn default() -> Self {
		Self {
			handshake_timeout: Duration::from_secs(10),
			manifest_retries: 3,
			// Progressive retry delays so a slow server gets more breathing room each attempt.
			manifest_retry_delays: vec![
				Duration::from_millis(500),
				Duration::from_millis(800),
				Duration::from_millis(1100),
			],
			world_state_period: Duration::from_millis(16),
			heartbeat_period: Duration::from_secs(5),
			heartbeat_initial_delay: Duration::from_secs(1),
			available_zones_period: Duration::from_secs(2),
			boundary_threshold_units: 50.0,
			neighbour_eviction_age: Duration::from_secs(10),
			security_mode: SecurityMode::Psk,
			session_ttl: Duration::from_secs(4 * 60 * 60),
			max_consecutive_decrypt_failures: 16,
		}
	}
}

impl RpcConfig {
	/// Overlays environment variables onto [`Self::default`]. Unset or unparsable
	/// variables fall back to the default silently.
	pub fn from_env() -> Self {
		let mut cfg = Self::default();

		if let Some(v) = env_duration_ms("RPC_HANDSHAKE_TIMEOUT_MS") {
			cfg.handshake_timeout = v;
		}
		if let Some(v) = env_u32("RPC_MANIFEST_RETRIES") {
			cfg.manifest_retries = v;
		}
		if let Some(v) = env_duration_ms("RPC_WORLD_STATE_PERIOD_MS") {
			cfg.world_state_period = v;
		}
		if let Some(v) = env_duration_ms("RPC_HEARTBEAT_PERIOD_MS") {
			cfg.heartbeat_period = v;
		}
		if let Some(v) = env_duration_ms("RPC_AVAILABLE_ZONES_PERIOD_MS") {
			cfg.available_zones_period = v;
		}
		if let Some(v) = env_f64("RPC_BOUNDARY_THRESHOLD_UNITS") {
			cfg.boundary_threshold_units = v;
		}
		if let Some(v) = env_duration_ms("RPC_NEIGHBOUR_EVICTION_AGE_MS") {
			cfg.neighbour_eviction_age = v;
		}
		if let Ok(v) = std::env::var("SECURITY_MODE") {
			if let Ok(mode) = v.parse() {
				cfg.security_mode = mode;
			}
		}
		if let Some(v) = env_duration_ms("SECURITY_SESSION_TTL_MS") {
			cfg.session_ttl = v;
		}

		cfg
	}
}

fn env_duration_ms(key: &str) -> Option<Duration> {
	std::env::var(key).ok()?.parse::<u64>().ok().map(Duration::from_millis)
}

fn env_u32(key: &str) -> Option<u32> {
	std::env::var(key).ok()?.parse().ok()
}

fn env_f64(key: &str) -> Option<f64> {
	std::env::var(key).ok()?.parse().ok()
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_defaults_match_spec() {
		let cfg = RpcConfig::default();
		assert_eq!(cfg.handshake_timeout, Duration::from_secs(10));
		assert_eq!(cfg.manifest_retries, 3);
		assert_eq!(cfg.world_state_period, Duration::from_millis(16));
		assert_eq!(cfg.heartbeat_period, Duration::from_secs(5));
		assert_eq!(cfg.available_zones_period, Duration::from_secs(2));
		assert_eq!(cfg.boundary_threshold_units, 50.0);
		assert_eq!(cfg.neighbour_eviction_age, Duration::from_secs(10));
	}
}
