//! AWS STS credential vending, ECS credential-process format. Uses the
//! `aws-sdk-sts` crate for the `AssumeRole` call (see DESIGN.md).

use std::time::{Duration, SystemTime};

use aws_sdk_sts::Client as StsClient;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "aws_tests.rs"]
mod tests;

const EARLY_REFRESH_BUFFER: Duration = Duration::from_secs(5 * 60);

#[derive(Clone)]
pub struct AwsCreds {
	pub access_key_id: String,
	pub secret_access_key: String,
	pub session_token: String,
	pub expires_at: SystemTime,
}

impl std::fmt::Debug for AwsCreds {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AwsCreds")
			.field("access_key_id", &self.access_key_id)
			.field("secret_access_key", &"[REDACTED]")
			.field("session_token", &"[REDACTED]")
			.field("expires_at", &self.expires_at)
			.finish()
	}
}

/// Body shape for the ECS credential-process endpoint.
#[derive(Serialize)]
pub struct EcsCredentialResponse {
	#[serde(rename = "Version")]
	pub version: u8,
	#[serde(rename = "AccessKeyId")]
	pub access_key_id: String,
	#[serde(rename = "SecretAccessKey")]
	pub secret_access_key: String,
	#[serde(rename = "SessionToken")]
	pub session_token: String,
	#[serde(rename = "Expiration")]
	pub expiration: String,
}

impl From<&AwsCreds> for EcsCredentialResponse {
	fn from(c: &AwsCreds) -> Self {
		EcsCredentialResponse {
			version: 1,
			access_key_id: c.access_key_id.clone(),
			secret_access_key: c.secret_access_key.clone(),
			session_token: c.session_token.clone(),
			expiration: format_rfc3339(c.expires_at),
		}
	}
}

#[derive(Error, Debug)]
pub enum AwsCredentialError {
	#[error("sts assume-role failed: {0}")]
	AssumeRole(String),
	#[error("sts response missing credentials")]
	MissingCredentials,
}

pub struct AssumeRoleParams {
	pub role_arn: String,
	pub role_session_name: String,
	pub duration_seconds: i32,
	pub external_id: Option<String>,
}

/// Lazily calls STS `AssumeRole`, caches the result, and refreshes when the
/// remaining lifetime drops to the 5-minute buffer. A read-lock fast path avoids contention on the common case;
/// a write-lock slow path refreshes, with a double-check after acquiring the
/// write lock in case another caller already refreshed first.
pub struct AwsCredentialProvider {
	client: StsClient,
	params: AssumeRoleParams,
	cached: RwLock<Option<AwsCreds>>,
}

impl AwsCredentialProvider {
	pub fn new(client: StsClient, params: AssumeRoleParams) -> Self {
		AwsCredentialProvider { client, params, cached: RwLock::new(None) }
	}

	pub async fn credentials(&self) -> Result<AwsCreds, AwsCredentialError> {
		{
			let guard = self.cached.read().await;
			if let Some(creds) = guard.as_ref() {
				if !needs_refresh(creds) {
					return Ok(creds.clone());
				}
			}
		}

		let mut guard = self.cached.write().await;
		if let Some(creds) = guard.as_ref() {
			if !needs_refresh(creds) {
				return Ok(creds.clone());
			}
		}

		debug!(role_arn = %self.params.role_arn, "refreshing sts credentials");
		let fresh = self.assume_role().await?;
		*guard = Some(fresh.clone());
		Ok(fresh)
	}

	async fn assume_role(&self) -> Result<AwsCreds, AwsCredentialError> {
		let mut request = self
			.client
			.assume_role()
			.role_arn(&self.params.role_arn)
			.role_session_name(&self.params.role_session_name)
			.duration_seconds(self.params.duration_seconds);
		if let Some(external_id) = &self.params.external_id {
			request = request.external_id(external_id);
		}

		let output = request.send().await.map_err(|e| AwsCredentialError::AssumeRole(e.to_string()))?;
		let creds = output.credentials().ok_or(AwsCredentialError::MissingCredentials)?;

		let expires_at: SystemTime = creds.expiration().ok_or(AwsCredentialError::MissingCredentials)?.to_owned().try_into().map_err(|_| AwsCredentialError::MissingCredentials)?;

		Ok(AwsCreds {
			access_key_id: creds.access_key_id().to_string(),
			secret_access_key: creds.secret_access_key().to_string(),
			session_token: creds.session_token().to_string(),
			expires_at,
		})
	}
}

/// Formats a `SystemTime` as RFC3339 (`2025-01-01T12:34:56Z`) without
/// pulling in a calendar-math crate: STS expirations are always UTC, so a
/// plain civil-calendar conversion from the Unix epoch is sufficient.
pub(crate) fn format_rfc3339(t: SystemTime) -> String {
	let secs = t.duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0);
	let days = secs.div_euclid(86_400);
	let time_of_day = secs.rem_euclid(86_400);
	let (hour, minute, second) = (time_of_day / 3600, (time_of_day / 60) % 60, time_of_day % 60);

	// Civil-from-days algorithm (Howard Hinnant's public-domain `chrono`-free
	// date algorithms), proleptic Gregorian calendar.
	let z = days + 719_468;
	let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
	let doe = (z - era * 146_097) as u64;
	let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
	let y = yoe as i64 + era * 400;
	let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
	let mp = (5 * doy + 2) / 153;
	let d = (doy - (153 * mp + 2) / 5 + 1) as i64;
	let m = if mp < 10 { mp + 3 } else { mp - 9 } as i64;
	let y = if m <= 2 { y + 1 } else { y };

	format!("{y:04}-{m:02}-{d:02}T{hour:02}:{minute:02}:{second:02}Z")
}

fn needs_refresh(creds: &AwsCreds) -> bool {
	match creds.expires_at.duration_since(SystemTime::now()) {
		Ok(remaining) => remaining <= EARLY_REFRESH_BUFFER,
		Err(_) => {
			warn!("cached aws credentials already expired");
			true
		}
	}
}
