//! Relay handler, `/relay/<name>/<path>`.

use http::StatusCode;

use crate::client::{Client, Request, Response};
use crate::context::RunContext;
use crate::error::ProxyError;
use crate::proxy::headers::{apply_header_rules, strip_hop_by_hop};

/// Joins a relay's configured target with the client-sent suffix. The
/// trailing configured `/` is trimmed and the *exact* client-sent suffix is
/// preserved verbatim — including when it's empty — per design note §9's
/// open question 2 ("`/relay/<name>` with no trailing slash forwards the
/// exact suffix the client sent", not a normalized `/`).
pub fn build_target_url(target: &url::Url, raw_suffix: &str, raw_query: Option<&str>) -> Result<url::Url, ProxyError> {
	let base = target.as_str().trim_end_matches('/');
	let mut joined = format!("{base}{raw_suffix}");
	if let Some(q) = raw_query {
		joined.push('?');
		joined.push_str(q);
	}
	url::Url::parse(&joined).map_err(|e| ProxyError::ConfigError(format!("relay target join failed: {e}")))
}

pub async fn handle_relay(
	name: &str,
	raw_suffix: &str,
	raw_query: Option<&str>,
	mut req: Request,
	ctx: &RunContext,
	client: &Client,
) -> Result<Response, ProxyError> {
	let relay = ctx.relay(name).ok_or_else(|| ProxyError::UnknownRelay(name.to_string()))?;

	let target = build_target_url(&relay.target_url, raw_suffix, raw_query)?;
	let host = target.host_str().unwrap_or_default().to_string();
	let port = target.port_or_known_default().unwrap_or(80);

	strip_hop_by_hop(req.headers_mut());
	apply_header_rules(req.headers_mut(), ctx, &host, port);

	*req.uri_mut() = target.as_str().parse().map_err(|_| ProxyError::ConfigError("invalid relay target uri".to_string()))?;

	match client.send_with_timeout(req, std::time::Duration::from_secs(30)).await {
		Ok(response) => Ok(response),
		Err(ProxyError::UpstreamTimeout(_)) => Err(ProxyError::UpstreamTimeout(name.to_string())),
		Err(e) => Err(e),
	}
}

pub fn not_found_response(name: &str) -> Response {
	let mut response = http::Response::new(crate::client::full_body(bytes::Bytes::from(format!("unknown relay `{name}`"))));
	*response.status_mut() = StatusCode::NOT_FOUND;
	response
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn build_target_url_trims_one_trailing_slash_on_target() {
		let target = url::Url::parse("https://api.github.com/").unwrap();
		let joined = build_target_url(&target, "/repos/owner/name", None).unwrap();
		assert_eq!(joined.as_str(), "https://api.github.com/repos/owner/name");
	}

	#[test]
	fn build_target_url_preserves_empty_suffix_exactly() {
		let target = url::Url::parse("https://api.github.com").unwrap();
		let joined = build_target_url(&target, "", None).unwrap();
		assert_eq!(joined.as_str(), "https://api.github.com/");
	}

	#[test]
	fn build_target_url_preserves_raw_query() {
		let target = url::Url::parse("https://api.github.com").unwrap();
		let joined = build_target_url(&target, "/search", Some("q=rust&sort=stars")).unwrap();
		assert_eq!(joined.query(), Some("q=rust&sort=stars"));
	}
}
