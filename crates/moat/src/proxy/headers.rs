//! Shared header-injection logic used identically by the plain forward,
//! CONNECT/MITM, relay, and MCP paths (design note §9 "Header merge
//! semantics must be mirrored in CONNECT, plain, and relay paths").

use http::HeaderMap;

use crate::context::RunContext;

pub const HOP_BY_HOP_TO_STRIP: [&str; 2] = ["proxy-connection", "proxy-authorization"];

/// Removes `Proxy-Connection`/`Proxy-Authorization` — never forwarded
/// onward regardless of path.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
	for name in HOP_BY_HOP_TO_STRIP {
		headers.remove(name);
	}
}

/// Outcome of applying the run's credential/extra-header/removed-header
/// rules to a request bound for `host:port`, used by the request logger.
pub struct InjectionResult {
	pub credential_injected: bool,
	pub injected_header_name: Option<String>,
}

/// Applies, in order: (1) the run's credential for the host (falling back to
/// host-without-port), default header name `Authorization`; (2) the extra
/// header map, concatenating onto any existing value with `,` rather than
/// replacing it (design note §9); (3) the removed-header set. Mirrors spec
/// §4.6.3 exactly, reused by relay/MCP/CONNECT.
pub fn apply_header_rules(headers: &mut HeaderMap, ctx: &RunContext, host: &str, port: u16) -> InjectionResult {
	let mut result = InjectionResult { credential_injected: false, injected_header_name: None };

	if let Some(cred) = ctx.lookup_credential(host, port) {
		if let Ok(name) = http::HeaderName::try_from(cred.header_name.as_str()) {
			if let Ok(value) = http::HeaderValue::try_from(cred.header_value.as_str()) {
				headers.insert(name.clone(), value);
				result.credential_injected = true;
				result.injected_header_name = Some(name.as_str().to_string());
			}
		}
	}

	for (name, value) in ctx.extra_headers_for(host, port) {
		let Ok(header_name) = http::HeaderName::try_from(name.as_str()) else { continue };
		let Ok(new_value) = http::HeaderValue::try_from(value.as_str()) else { continue };
		match headers.get(&header_name) {
			Some(existing) => {
				let mut combined = existing.to_str().unwrap_or_default().to_string();
				combined.push(',');
				combined.push_str(&value);
				if let Ok(combined_value) = http::HeaderValue::try_from(combined) {
					headers.insert(header_name, combined_value);
				}
			}
			None => {
				headers.insert(header_name, new_value);
			}
		}
	}

	for removed in ctx.removed_headers_for(host, port) {
		if let Ok(name) = http::HeaderName::try_from(removed.as_str()) {
			headers.remove(name);
		}
	}

	result
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::policy::NetworkPolicy;

	#[test]
	fn strip_hop_by_hop_removes_proxy_headers() {
		let mut headers = HeaderMap::new();
		headers.insert("proxy-authorization", "Basic xyz".parse().unwrap());
		headers.insert("proxy-connection", "keep-alive".parse().unwrap());
		headers.insert("x-other", "value".parse().unwrap());
		strip_hop_by_hop(&mut headers);
		assert!(headers.get("proxy-authorization").is_none());
		assert!(headers.get("proxy-connection").is_none());
		assert!(headers.get("x-other").is_some());
	}

	#[test]
	fn injects_credential_with_default_header_name() {
		let ctx = RunContext::new("run-1", NetworkPolicy::permissive());
		ctx.set_credential("127.0.0.1", "Bearer test-token");
		let mut headers = HeaderMap::new();
		let result = apply_header_rules(&mut headers, &ctx, "127.0.0.1", 9999);
		assert!(result.credential_injected);
		assert_eq!(result.injected_header_name.as_deref(), Some("authorization"));
		assert_eq!(headers.get("authorization").unwrap(), "Bearer test-token");
	}

	#[test]
	fn extra_headers_concatenate_onto_existing_value() {
		let ctx = RunContext::new("run-1", NetworkPolicy::permissive());
		ctx.add_extra_header("api.anthropic.com", "anthropic-beta", "feature-b");
		let mut headers = HeaderMap::new();
		headers.insert("anthropic-beta", "feature-a".parse().unwrap());
		apply_header_rules(&mut headers, &ctx, "api.anthropic.com", 443);
		assert_eq!(headers.get("anthropic-beta").unwrap(), "feature-a,feature-b");
	}

	#[test]
	fn removed_headers_are_stripped_after_injection() {
		let ctx = RunContext::new("run-1", NetworkPolicy::permissive());
		ctx.remove_header("api.example.com", "x-debug");
		let mut headers = HeaderMap::new();
		headers.insert("x-debug", "on".parse().unwrap());
		apply_header_rules(&mut headers, &ctx, "api.example.com", 443);
		assert!(headers.get("x-debug").is_none());
	}
}
