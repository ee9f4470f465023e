//! Plain HTTP forward path.

use std::time::Instant;

use http::StatusCode;
use tracing::error;

use crate::client::{Client, Request, Response};
use crate::context::RunContext;
use crate::error::ProxyError;
use crate::proxy::headers::{apply_header_rules, strip_hop_by_hop};
use crate::telemetry::{is_text_like, RequestLogEntry, RequestLogger};

pub const BLOCKED_HEADER: &str = "X-Moat-Blocked";
pub const BLOCKED_HEADER_VALUE: &str = "network-policy";

/// Forwards one plain (non-CONNECT) proxied request, injecting credentials,
/// applying header rules, and routing the response body through any
/// transformer registered for the target host before it reaches the client.
pub async fn forward(
	mut req: Request,
	ctx: &RunContext,
	client: &Client,
	chained: Option<&crate::client::ChainedClient>,
	logger: &dyn RequestLogger,
	max_body_log_bytes: usize,
) -> Result<Response, ProxyError> {
	let started = Instant::now();
	let method = req.method().clone();
	let url = req.uri().to_string();

	let host = req.uri().host().unwrap_or_default().to_string();
	let port = req.uri().port_u16().unwrap_or_else(|| if req.uri().scheme_str() == Some("https") { 443 } else { 80 });

	strip_hop_by_hop(req.headers_mut());

	if !ctx.policy.allows(&host, port) {
		let mut response = http::Response::new(crate::client::full_body(bytes::Bytes::from_static(
			b"request blocked by network policy",
		)));
		*response.status_mut() = StatusCode::PROXY_AUTHENTICATION_REQUIRED;
		response.headers_mut().insert(BLOCKED_HEADER, BLOCKED_HEADER_VALUE.parse().unwrap());
		logger.log(RequestLogEntry {
			method: &method,
			url: &url,
			status: Some(response.status().as_u16()),
			duration: started.elapsed(),
			error: Some("blocked by network policy"),
			credential_injected: false,
			injected_header_name: None,
			request_headers: req.headers(),
			captured_request_body: None,
		});
		return Ok(response);
	}

	let injection = apply_header_rules(req.headers_mut(), ctx, &host, port);

	let request_content_type = req.headers().get(http::header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).map(str::to_string);
	let capture_requested = request_content_type.as_deref().is_some_and(is_text_like);
	let (body, capture) = if capture_requested {
		let (body, parts) = req.into_parts();
		let (teed, capture) = crate::telemetry::inspect_body(body, max_body_log_bytes);
		req = Request::from_parts(parts, teed);
		(true, Some(capture))
	} else {
		(false, None)
	};
	let _ = body;

	let sent_headers = req.headers().clone();

	let result = match chained {
		Some(chained) => chained.send(req).await,
		None => client.send(req).await,
	};

	let captured = capture.map(|c| c.lock().clone());

	match result {
		Ok(response) => {
			logger.log(RequestLogEntry {
				method: &method,
				url: &url,
				status: Some(response.status().as_u16()),
				duration: started.elapsed(),
				error: None,
				credential_injected: injection.credential_injected,
				injected_header_name: injection.injected_header_name.as_deref(),
				request_headers: &sent_headers,
				captured_request_body: captured.as_ref(),
			});
			let (parts, body) = response.into_parts();
			let body = crate::context::apply_response_transformers(ctx, &host, body);
			Ok(Response::from_parts(parts, body))
		}
		Err(err) => {
			error!(url = %url, error = %err, "upstream dial failed");
			logger.log(RequestLogEntry {
				method: &method,
				url: &url,
				status: Some(StatusCode::BAD_GATEWAY.as_u16()),
				duration: started.elapsed(),
				error: Some(&err.to_string()),
				credential_injected: injection.credential_injected,
				injected_header_name: injection.injected_header_name.as_deref(),
				request_headers: &sent_headers,
				captured_request_body: None,
			});
			let mut response = http::Response::new(crate::client::full_body(bytes::Bytes::from_static(b"Bad Gateway")));
			*response.status_mut() = StatusCode::BAD_GATEWAY;
			Ok(response)
		}
	}
}
