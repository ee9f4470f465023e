//! Ambient logging plus the pluggable per-request logger. The two are
//! deliberately distinct: the former is process-wide `tracing` setup owned
//! by `moat-cli`; the latter is a single structured event emitted once per
//! forwarded request, body redaction and all.

use std::time::Duration;

use thiserror::Error;
use tracing::info;

mod body;
pub use body::{inspect_body, is_text_like, CapturedBody};

#[cfg(test)]
#[path = "telemetry_tests.rs"]
mod tests;

/// Structured fields recorded for each per-request log event.
pub struct RequestLogEntry<'a> {
	pub method: &'a http::Method,
	pub url: &'a str,
	pub status: Option<u16>,
	pub duration: Duration,
	pub error: Option<&'a str>,
	pub credential_injected: bool,
	pub injected_header_name: Option<&'a str>,
	pub request_headers: &'a http::HeaderMap,
	pub captured_request_body: Option<&'a CapturedBody>,
}

/// The sink every forward/CONNECT/relay/MCP path calls exactly once per
/// request. The default implementation emits one `tracing::info!` event;
/// embedders can supply their own (e.g. a session-journaling component).
pub trait RequestLogger: Send + Sync {
	fn log(&self, entry: RequestLogEntry<'_>);
}

#[derive(Error, Debug)]
pub enum RequestLogError {}

/// Default `RequestLogger`: one `tracing::info!` event, headers redacted
/// (injected credential values become `[REDACTED]`,
/// `Proxy-Authorization`/`Proxy-Connection` dropped entirely, multi-value
/// headers comma-joined).
pub struct TracingRequestLogger;

impl RequestLogger for TracingRequestLogger {
	fn log(&self, entry: RequestLogEntry<'_>) {
		let headers = redact_headers(entry.request_headers, entry.credential_injected, entry.injected_header_name);
		info!(
			method = %entry.method,
			url = entry.url,
			status = entry.status,
			duration_ms = entry.duration.as_millis() as u64,
			error = entry.error,
			credential_injected = entry.credential_injected,
			injected_header = entry.injected_header_name,
			headers = ?headers,
			"proxied request",
		);
	}
}

/// Builds the redacted, comma-joined header dump used by the default logger.
/// Exposed standalone so other loggers can reuse the same redaction rule.
pub fn redact_headers(
	headers: &http::HeaderMap,
	credential_injected: bool,
	injected_header_name: Option<&str>,
) -> Vec<(String, String)> {
	let injected_lower = injected_header_name.map(|h| h.to_lowercase());
	let mut out: Vec<(String, Vec<String>)> = Vec::new();
	for name in headers.keys() {
		let lower = name.as_str().to_lowercase();
		if lower == "proxy-authorization" || lower == "proxy-connection" {
			continue;
		}
		let values: Vec<String> = headers
			.get_all(name)
			.iter()
			.map(|v| v.to_str().unwrap_or("<binary>").to_string())
			.collect();
		let values = if credential_injected && injected_lower.as_deref() == Some(lower.as_str()) {
			vec!["[REDACTED]".to_string()]
		} else {
			values
		};
		out.push((name.as_str().to_string(), values));
	}
	out.into_iter().map(|(name, values)| (name, values.join(","))).collect()
}
