//! Process-level configuration: an optional, partially-specified YAML
//! document resolves into a fully-populated `Config` with defaults applied
//! and cross-field invariants checked once, synchronously, at load time.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;

use crate::policy::ConfigValidationError;

/// As loaded from YAML; every field optional so a minimal or empty file is
/// valid and defaults fill the rest.
#[derive(Debug, Default, Deserialize)]
pub struct RawConfig {
	pub listen_addr: Option<String>,
	pub ca_dir: Option<PathBuf>,
	pub auth_token: Option<String>,
	pub bind_all_interfaces: Option<bool>,
	pub max_body_log_bytes: Option<usize>,
	pub network_policy: Option<RawNetworkPolicy>,
	pub upstream_chain: Option<Vec<RawChainEntry>>,
	pub aws: Option<RawAwsConfig>,
}

#[derive(Debug, Deserialize)]
pub struct RawNetworkPolicy {
	pub mode: Option<String>,
	#[serde(default)]
	pub patterns: Vec<String>,
	#[serde(default)]
	pub grants: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawChainEntry {
	External { name: String, url: String },
	Managed { name: String, image: String, #[serde(default)] env: std::collections::HashMap<String, String> },
}

#[derive(Debug, Deserialize)]
pub struct RawAwsConfig {
	pub role_arn: String,
	pub role_session_name: Option<String>,
	pub external_id: Option<String>,
	pub duration_seconds: Option<i32>,
}

/// Resolved, fully-populated engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
	pub listen_addr: SocketAddr,
	pub ca_dir: PathBuf,
	pub auth_token: Option<String>,
	pub bind_all_interfaces: bool,
	pub max_body_log_bytes: usize,
	pub network_policy: crate::policy::NetworkPolicy,
	pub upstream_chain: Vec<crate::chain::ChainEntry>,
	pub aws: Option<AwsConfig>,
}

#[derive(Debug, Clone)]
pub struct AwsConfig {
	pub role_arn: String,
	pub role_session_name: String,
	pub external_id: Option<String>,
	pub duration_seconds: i32,
}

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:0";
const DEFAULT_CA_DIR: &str = ".moat/ca";
/// Default cap on how much of a request body gets captured for logging.
const DEFAULT_MAX_BODY_LOG_BYTES: usize = 8 * 1024;
const DEFAULT_DURATION_SECONDS: i32 = 3600;

impl RawConfig {
	pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
		serde_yaml::from_str(yaml)
	}

	/// Applies defaults and validates cross-field invariants. Never fails at
	/// request time: every relay/MCP/grant/bind
	/// problem surfaces here.
	pub fn resolve(self) -> Result<Config, ConfigValidationError> {
		let listen_addr = self
			.listen_addr
			.as_deref()
			.unwrap_or(DEFAULT_LISTEN_ADDR)
			.parse()
			.map_err(|_| ConfigValidationError::InvalidPattern("listen_addr".to_string()))?;

		let bind_all_interfaces = self.bind_all_interfaces.unwrap_or(false);
		if bind_all_interfaces && self.auth_token.is_none() {
			return Err(ConfigValidationError::BindAllInterfacesWithoutAuthToken);
		}

		let network_policy = match self.network_policy {
			Some(raw) => {
				let mode = match raw.mode.as_deref() {
					Some("permissive") => crate::policy::PolicyMode::Permissive,
					Some("strict") | None => crate::policy::PolicyMode::Strict,
					Some(other) => return Err(ConfigValidationError::InvalidPattern(other.to_string())),
				};
				let mut patterns = Vec::with_capacity(raw.patterns.len());
				for p in &raw.patterns {
					patterns.push(crate::policy::HostPattern::parse(p).map_err(|_| ConfigValidationError::InvalidPattern(p.clone()))?);
				}
				crate::policy::NetworkPolicy { mode, patterns, grants: raw.grants }
			}
			None => crate::policy::NetworkPolicy::permissive(),
		};

		let mut seen_entry_names = std::collections::HashSet::new();
		let mut upstream_chain = Vec::new();
		for entry in self.upstream_chain.unwrap_or_default() {
			let name = match &entry {
				RawChainEntry::External { name, .. } => name.clone(),
				RawChainEntry::Managed { name, .. } => name.clone(),
			};
			if !seen_entry_names.insert(name.clone()) {
				return Err(ConfigValidationError::DuplicateRelay(name));
			}
			upstream_chain.push(match entry {
				RawChainEntry::External { name, url } => crate::chain::ChainEntry::External {
					name,
					url: url::Url::parse(&url).map_err(|_| ConfigValidationError::InvalidPattern(url))?,
				},
				RawChainEntry::Managed { name, image, env } => crate::chain::ChainEntry::Managed { name, image, env },
			});
		}

		let aws = self.aws.map(|raw| AwsConfig {
			role_arn: raw.role_arn,
			role_session_name: raw.role_session_name.unwrap_or_else(|| "moat".to_string()),
			external_id: raw.external_id,
			duration_seconds: raw.duration_seconds.unwrap_or(DEFAULT_DURATION_SECONDS),
		});

		Ok(Config {
			listen_addr,
			ca_dir: self.ca_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_CA_DIR)),
			auth_token: self.auth_token,
			bind_all_interfaces,
			max_body_log_bytes: self.max_body_log_bytes.unwrap_or(DEFAULT_MAX_BODY_LOG_BYTES),
			network_policy,
			upstream_chain,
			aws,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_apply_to_empty_config() {
		let config = RawConfig::default().resolve().unwrap();
		assert_eq!(config.max_body_log_bytes, DEFAULT_MAX_BODY_LOG_BYTES);
		assert!(!config.bind_all_interfaces);
		assert_eq!(config.network_policy.mode, crate::policy::PolicyMode::Permissive);
	}

	#[test]
	fn bind_all_interfaces_requires_auth_token() {
		let raw = RawConfig { bind_all_interfaces: Some(true), ..Default::default() };
		assert_eq!(raw.resolve().unwrap_err(), ConfigValidationError::BindAllInterfacesWithoutAuthToken);
	}

	#[test]
	fn bind_all_interfaces_with_auth_token_succeeds() {
		let raw = RawConfig { bind_all_interfaces: Some(true), auth_token: Some("t".into()), ..Default::default() };
		assert!(raw.resolve().is_ok());
	}

	#[test]
	fn duplicate_chain_entry_names_rejected() {
		let raw = RawConfig {
			upstream_chain: Some(vec![
				RawChainEntry::External { name: "a".into(), url: "http://localhost:1".into() },
				RawChainEntry::External { name: "a".into(), url: "http://localhost:2".into() },
			]),
			..Default::default()
		};
		assert!(raw.resolve().is_err());
	}

	#[test]
	fn yaml_round_trips_a_minimal_config() {
		let yaml = "listen_addr: \"127.0.0.1:9090\"\nauth_token: \"secret\"\n";
		let raw = RawConfig::from_yaml(yaml).unwrap();
		let config = raw.resolve().unwrap();
		assert_eq!(config.listen_addr, "127.0.0.1:9090".parse::<SocketAddr>().unwrap());
		assert_eq!(config.auth_token.as_deref(), Some("secret"));
	}
}
