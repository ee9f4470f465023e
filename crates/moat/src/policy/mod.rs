//! Host/port pattern matching and the fixed grant→hosts table.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[path = "policy_tests.rs"]
#[cfg(test)]
mod tests;

/// A single `host[:port]` or `*.suffix[:port]` pattern. Immutable once parsed.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HostPattern {
	host: String,
	port: u16,
	is_wildcard: bool,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MatchError {
	#[error("no pattern admits {host}:{port}")]
	NoMatch { host: String, port: u16 },
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("empty host pattern")]
pub struct ParsePatternError;

impl HostPattern {
	/// Parses `host[:port]` or `*.suffix[:port]`. A port that fails to parse
	/// (non-numeric or outside 1..=65535) does not reject the pattern — it
	/// downgrades it to "no port specified".
	pub fn parse(raw: &str) -> Result<Self, ParsePatternError> {
		let raw = raw.trim();
		if raw.is_empty() {
			return Err(ParsePatternError);
		}

		let (host_part, port) = match raw.rsplit_once(':') {
			Some((h, p)) if !h.is_empty() => match p.parse::<u16>() {
				Ok(port) if port >= 1 => (h, port),
				_ => (h, 0),
			},
			_ => (raw, 0),
		};

		let (is_wildcard, host) = match host_part.strip_prefix("*.") {
			Some(suffix) if !suffix.is_empty() => (true, suffix.to_lowercase()),
			_ => (false, host_part.to_lowercase()),
		};

		if host.is_empty() {
			return Err(ParsePatternError);
		}

		Ok(HostPattern { host, port, is_wildcard })
	}

	/// True if `(host, port)` is admitted by this pattern.
	pub fn matches(&self, host: &str, port: u16) -> bool {
		let port_ok = if self.port == 0 { port == 80 || port == 443 } else { self.port == port };
		if !port_ok {
			return false;
		}
		let host = host.to_lowercase();
		if self.is_wildcard {
			host.ends_with(&format!(".{}", self.host))
		} else {
			host == self.host
		}
	}
}

impl fmt::Display for HostPattern {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.is_wildcard {
			write!(f, "*.{}", self.host)?;
		} else {
			write!(f, "{}", self.host)?;
		}
		if self.port != 0 {
			write!(f, ":{}", self.port)?;
		}
		Ok(())
	}
}

impl FromStr for HostPattern {
	type Err = ParsePatternError;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		HostPattern::parse(s)
	}
}

/// Checks `(host, port)` against a pattern list, the shape testable property
/// 4 exercises directly.
pub fn match_host(patterns: &[HostPattern], host: &str, port: u16) -> Result<(), MatchError> {
	if patterns.iter().any(|p| p.matches(host, port)) {
		Ok(())
	} else {
		Err(MatchError::NoMatch { host: host.to_string(), port })
	}
}

/// Resolves a grant identifier (`github`, `github:repo`, …) to its host
/// patterns. Unknown grants resolve to the empty list — they never widen a
/// policy. The scope after `:` is accepted but otherwise unused here; finer
/// scoping (e.g. limiting `github:repo` to specific repos) is a credential
/// store concern, not a host-matching one.
pub fn grant_hosts(grant: &str) -> Vec<HostPattern> {
	let base = grant.split(':').next().unwrap_or(grant);
	let raw: &[&str] = match base {
		"github" => &["github.com", "api.github.com", "*.github.com", "*.githubusercontent.com"],
		"anthropic" => &["api.anthropic.com", "*.anthropic.com"],
		"openai" => &["api.openai.com", "chatgpt.com", "*.openai.com"],
		// `*.amazonaws.com` already admits every `sts.<region>.amazonaws.com`
		// host; the global endpoint is listed separately since it has no
		// subdomain for the wildcard to match against.
		"aws" => &["sts.amazonaws.com", "*.amazonaws.com"],
		_ => &[],
	};
	raw.iter().map(|p| HostPattern::parse(p).expect("grant table patterns are valid")).collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PolicyMode {
	Permissive,
	#[default]
	Strict,
}

/// Per-run network policy.
#[derive(Clone, Debug, Default)]
pub struct NetworkPolicy {
	pub mode: PolicyMode,
	pub patterns: Vec<HostPattern>,
	pub grants: Vec<String>,
}

impl NetworkPolicy {
	pub fn permissive() -> Self {
		NetworkPolicy { mode: PolicyMode::Permissive, patterns: Vec::new(), grants: Vec::new() }
	}

	pub fn strict(patterns: Vec<HostPattern>, grants: Vec<String>) -> Self {
		NetworkPolicy { mode: PolicyMode::Strict, patterns, grants }
	}

	fn combined_patterns(&self) -> Vec<HostPattern> {
		let mut all = self.patterns.clone();
		for grant in &self.grants {
			all.extend(grant_hosts(grant));
		}
		all
	}

	/// True if the run is allowed to reach `(host, port)`. Permissive mode
	/// always allows; strict mode (including an empty allow list, per spec
	/// §3) denies unless some explicit pattern or resolved grant admits it.
	pub fn allows(&self, host: &str, port: u16) -> bool {
		match self.mode {
			PolicyMode::Permissive => true,
			PolicyMode::Strict => match_host(&self.combined_patterns(), host, port).is_ok(),
		}
	}
}

/// Raised by `Config::resolve` when process-level config is
/// self-inconsistent; never raised at request time.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigValidationError {
	#[error("duplicate relay name `{0}`")]
	DuplicateRelay(String),
	#[error("duplicate mcp server name `{0}`")]
	DuplicateMcpServer(String),
	#[error("bind_all_interfaces requires an auth_token to be configured")]
	BindAllInterfacesWithoutAuthToken,
	#[error("invalid host pattern `{0}`")]
	InvalidPattern(String),
}
