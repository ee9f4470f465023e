//! MCP relay handler, `/mcp/<name>/<path>`. Shared by the
//! direct-mode (`/mcp/<token>/<name>/...`) and in-band (proxied/CONNECT)
//! invocation shapes — both resolve a `RunContext` before calling here.

use std::time::{Duration, SystemTime};

use http::StatusCode;
use tracing::warn;

use crate::client::{Client, Request, Response};
use crate::context::{McpAuthType, RunContext};
use crate::error::ProxyError;
use crate::proxy::headers::strip_hop_by_hop;
use crate::store::CredentialStore;

const OAUTH_STALE_BUFFER: Duration = Duration::from_secs(60);

/// Joins the server's configured URL with the client-sent path suffix: if
/// `suffix` is empty or `/`, leave the configured path untouched; otherwise
/// append with exactly one separator.
pub fn build_target_url(server_url: &url::Url, suffix: &str, raw_query: Option<&str>) -> Result<url::Url, ProxyError> {
	let mut url = server_url.clone();
	if !(suffix.is_empty() || suffix == "/") {
		let base_path = url.path().trim_end_matches('/');
		let appended_path = suffix.trim_start_matches('/');
		url.set_path(&format!("{base_path}/{appended_path}"));
	}
	url.set_query(raw_query);
	Ok(url)
}

/// True if a stored credential's `expires_at` metadata means the token is
/// stale: "now + 60s >= expiresAt" (also stale if the field is absent,
/// unparseable, or the zero value).
pub fn is_stale(expires_at: Option<&str>) -> bool {
	let Some(expires_at) = expires_at else { return true };
	let Ok(expires_at) = httpdate_like_parse(expires_at) else { return true };
	SystemTime::now() + OAUTH_STALE_BUFFER >= expires_at
}

/// Minimal RFC3339 parser for the `expires_at` metadata field (UTC only,
/// seconds precision) — avoids pulling in a calendar crate purely to parse
/// back what `aws::format_rfc3339`-shaped strings (or an OAuth server) hand
/// us. Anything that doesn't parse is treated as stale (fail closed).
fn httpdate_like_parse(s: &str) -> Result<SystemTime, ()> {
	let s = s.trim_end_matches('Z');
	let (date, time) = s.split_once('T').ok_or(())?;
	let mut date_parts = date.split('-');
	let y: i64 = date_parts.next().ok_or(())?.parse().map_err(|_| ())?;
	let m: i64 = date_parts.next().ok_or(())?.parse().map_err(|_| ())?;
	let d: i64 = date_parts.next().ok_or(())?.parse().map_err(|_| ())?;
	let mut time_parts = time.split(':');
	let hh: i64 = time_parts.next().ok_or(())?.parse().map_err(|_| ())?;
	let mm: i64 = time_parts.next().ok_or(())?.parse().map_err(|_| ())?;
	let ss: i64 = time_parts.next().ok_or(())?.parse::<f64>().map_err(|_| ())? as i64;

	// days-from-civil (inverse of aws::format_rfc3339's civil-from-days).
	let y = if m <= 2 { y - 1 } else { y };
	let era = if y >= 0 { y } else { y - 399 } / 400;
	let yoe = (y - era * 400) as u64;
	let mp = ((m + 9) % 12) as u64;
	let doy = (153 * mp + 2) / 5 + d as u64 - 1;
	let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
	let days = era * 146_097 + doe as i64 - 719_468;

	let secs = days * 86_400 + hh * 3600 + mm * 60 + ss;
	if secs < 0 {
		return Err(());
	}
	Ok(SystemTime::UNIX_EPOCH + Duration::from_secs(secs as u64))
}

pub struct McpRefreshOutcome {
	pub header_value: String,
	pub refreshed: bool,
}

/// Resolves the auth header value for an MCP server's grant, refreshing an
/// OAuth token when stale. On refresh failure, falls back to the stale
/// value and lets upstream return 401 naturally.
pub async fn resolve_auth_header(
	store: &dyn CredentialStore,
	oauth_client: &Client,
	grant: &str,
	auth_type: McpAuthType,
) -> Result<McpRefreshOutcome, ProxyError> {
	let stored = store.get(grant).await.map_err(|_| ProxyError::CredentialMissing { grant: grant.to_string() })?;

	match auth_type {
		McpAuthType::Token => Ok(McpRefreshOutcome { header_value: stored.value, refreshed: false }),
		McpAuthType::OAuth => {
			let expires_at = stored.metadata.get("expires_at").map(String::as_str);
			if !is_stale(expires_at) {
				return Ok(McpRefreshOutcome { header_value: format!("Bearer {}", stored.value), refreshed: false });
			}

			let Some(refresh_token) = stored.metadata.get("refresh_token") else {
				warn!(grant, "oauth token stale with no refresh token; serving stale value");
				return Ok(McpRefreshOutcome { header_value: format!("Bearer {}", stored.value), refreshed: false });
			};
			let Some(token_url) = stored.metadata.get("token_url") else {
				warn!(grant, "oauth token stale with no token endpoint; serving stale value");
				return Ok(McpRefreshOutcome { header_value: format!("Bearer {}", stored.value), refreshed: false });
			};

			match refresh_oauth_token(oauth_client, token_url, refresh_token).await {
				Ok(new_token) => Ok(McpRefreshOutcome { header_value: format!("Bearer {new_token}"), refreshed: true }),
				Err(e) => {
					warn!(grant, error = %e, "oauth refresh failed; falling back to stale token");
					Ok(McpRefreshOutcome { header_value: format!("Bearer {}", stored.value), refreshed: false })
				}
			}
		}
	}
}

async fn refresh_oauth_token(client: &Client, token_url: &str, refresh_token: &str) -> Result<String, ProxyError> {
	let body = format!("grant_type=refresh_token&refresh_token={refresh_token}");
	let req = http::Request::post(token_url)
		.header(http::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
		.body(crate::client::full_body(bytes::Bytes::from(body)))
		.map_err(ProxyError::from)?;

	let response = client.send(req).await?;
	if !response.status().is_success() {
		return Err(ProxyError::UpstreamDialError(format!("token refresh returned {}", response.status())));
	}

	use http_body_util::BodyExt;
	let bytes = response.into_body().collect().await.map_err(|e| ProxyError::UpstreamDialError(e.to_string()))?.to_bytes();
	let json: serde_json::Value = serde_json::from_slice(&bytes).map_err(|e| ProxyError::UpstreamDialError(e.to_string()))?;
	json.get("access_token").and_then(|v| v.as_str()).map(str::to_string).ok_or_else(|| ProxyError::UpstreamDialError("token response missing access_token".to_string()))
}

pub async fn handle_mcp(
	server_name: &str,
	raw_suffix: &str,
	raw_query: Option<&str>,
	mut req: Request,
	ctx: &RunContext,
	store: Option<&dyn CredentialStore>,
	client: &Client,
) -> Result<Response, ProxyError> {
	let server = ctx.mcp_server(server_name).ok_or_else(|| ProxyError::UnknownMcpServer(server_name.to_string()))?;
	let target = build_target_url(&server.url, raw_suffix, raw_query)?;

	strip_hop_by_hop(req.headers_mut());

	if let Some(auth) = &server.auth {
		let store = store.ok_or_else(|| ProxyError::CredentialMissing { grant: auth.grant.clone() })?;
		let outcome = resolve_auth_header(store, client, &auth.grant, auth.auth_type).await?;
		let header_name = http::HeaderName::try_from(auth.header_name.as_str()).map_err(|_| ProxyError::ConfigError("invalid mcp auth header name".into()))?;
		let header_value = http::HeaderValue::try_from(outcome.header_value).map_err(|_| ProxyError::ConfigError("invalid mcp auth header value".into()))?;
		req.headers_mut().insert(header_name, header_value);
	}

	*req.uri_mut() = target.as_str().parse().map_err(|_| ProxyError::ConfigError("invalid mcp target uri".to_string()))?;

	client.send(req).await
}

pub fn not_found_response(name: &str) -> Response {
	let mut response = http::Response::new(crate::client::full_body(bytes::Bytes::from(format!("unknown mcp server `{name}`"))));
	*response.status_mut() = StatusCode::NOT_FOUND;
	response
}

pub fn credential_missing_response(grant: &str) -> Response {
	let body = format!("no credential found for grant `{grant}`; run `moat grant add {grant}` to provision it");
	let mut response = http::Response::new(crate::client::full_body(bytes::Bytes::from(body)));
	*response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
	response
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_suffix_leaves_configured_path_untouched() {
		let server_url = url::Url::parse("https://mcp.example.com/v1/endpoint").unwrap();
		let joined = build_target_url(&server_url, "", None).unwrap();
		assert_eq!(joined.path(), "/v1/endpoint");
	}

	#[test]
	fn bare_slash_suffix_leaves_configured_path_untouched() {
		let server_url = url::Url::parse("https://mcp.example.com/v1/endpoint").unwrap();
		let joined = build_target_url(&server_url, "/", None).unwrap();
		assert_eq!(joined.path(), "/v1/endpoint");
	}

	#[test]
	fn nonempty_suffix_appends_with_one_separator() {
		let server_url = url::Url::parse("https://mcp.example.com/v1").unwrap();
		let joined = build_target_url(&server_url, "/tools/list", None).unwrap();
		assert_eq!(joined.path(), "/v1/tools/list");
	}

	#[test]
	fn no_expiry_metadata_is_stale() {
		assert!(is_stale(None));
	}

	#[test]
	fn far_future_expiry_is_not_stale() {
		let future = SystemTime::now() + Duration::from_secs(3600);
		let formatted = crate::aws::format_rfc3339(future);
		assert!(!is_stale(Some(&formatted)));
	}

	#[test]
	fn expiry_within_60s_buffer_is_stale() {
		let soon = SystemTime::now() + Duration::from_secs(30);
		let formatted = crate::aws::format_rfc3339(soon);
		assert!(is_stale(Some(&formatted)));
	}
}
