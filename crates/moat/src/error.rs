use thiserror::Error;

use crate::ca::CertError;
use crate::chain::ChainError;
use crate::context::RegistryError;
use crate::policy::ConfigValidationError;

/// Every way a request can fail inside the engine, mapped to the response
/// behavior it should produce. Handlers match on this to decide the HTTP
/// status/body; nothing here is allowed to leak credential material.
#[derive(Error, Debug)]
pub enum ProxyError {
	#[error("proxy authentication required")]
	AuthRequired,

	#[error("authentication token invalid")]
	AuthInvalid,

	#[error("request blocked by network policy")]
	PolicyDenied,

	#[error("failed to reach upstream `{0}`")]
	UpstreamDialError(String),

	#[error("upstream request to `{0}` timed out")]
	UpstreamTimeout(String),

	#[error("failed to generate certificate")]
	CertGenError(#[from] CertError),

	#[error(
		"no credential found for grant `{grant}`; run `moat grant add {grant}` to provision it"
	)]
	CredentialMissing { grant: String },

	#[error("invalid configuration: {0}")]
	ConfigError(String),

	#[error("invariant violation: {0}")]
	InvariantViolation(String),

	#[error("no run context for this connection")]
	UnknownRun,

	#[error("unknown relay `{0}`")]
	UnknownRelay(String),

	#[error("unknown mcp server `{0}`")]
	UnknownMcpServer(String),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Http(#[from] http::Error),

	#[error(transparent)]
	Hyper(#[from] hyper::Error),
}

impl From<RegistryError> for ProxyError {
	fn from(e: RegistryError) -> Self {
		ProxyError::ConfigError(e.to_string())
	}
}

impl From<ChainError> for ProxyError {
	fn from(e: ChainError) -> Self {
		ProxyError::UpstreamDialError(e.to_string())
	}
}

impl From<ConfigValidationError> for ProxyError {
	fn from(e: ConfigValidationError) -> Self {
		ProxyError::ConfigError(e.to_string())
	}
}

impl ProxyError {
	/// Status code a caller should answer with; kept separate from `Display`
	/// since the wire body is intentionally terser than the internal message.
	pub fn status(&self) -> http::StatusCode {
		use http::StatusCode;
		match self {
			ProxyError::AuthRequired | ProxyError::AuthInvalid => StatusCode::PROXY_AUTHENTICATION_REQUIRED,
			ProxyError::PolicyDenied => StatusCode::PROXY_AUTHENTICATION_REQUIRED,
			ProxyError::UpstreamDialError(_) | ProxyError::UpstreamTimeout(_) => StatusCode::BAD_GATEWAY,
			ProxyError::CredentialMissing { .. } => StatusCode::INTERNAL_SERVER_ERROR,
			ProxyError::UnknownRelay(_) | ProxyError::UnknownMcpServer(_) => StatusCode::NOT_FOUND,
			ProxyError::UnknownRun => StatusCode::UNAUTHORIZED,
			ProxyError::ConfigError(_) | ProxyError::InvariantViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
			ProxyError::CertGenError(_) => StatusCode::INTERNAL_SERVER_ERROR,
			ProxyError::Io(_) | ProxyError::Http(_) | ProxyError::Hyper(_) => StatusCode::BAD_GATEWAY,
		}
	}
}
