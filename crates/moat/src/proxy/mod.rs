//! Proxy engine: dispatcher, authentication, and the five request paths.
//! This module wires the other modules (`policy`, `ca`, `context`, `chain`,
//! `aws`, `client`) into the one thing external callers touch: `Engine`.

pub mod auth;
pub mod awsendpoint;
pub mod connect;
pub mod forward;
pub mod headers;
pub mod listener;
pub mod mcp;
pub mod relay;

use std::sync::Arc;

use http::{Method, StatusCode};
use tracing::warn;

use crate::ca::CertFactory;
use crate::client::{Client, Response};
use crate::context::Registry;
use crate::store::CredentialStore;
use crate::telemetry::{RequestLogger, TracingRequestLogger};

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;

pub const AWS_CREDENTIALS_PATH: &str = "/_aws/credentials";
pub const MCP_PATH_PREFIX: &str = "/mcp/";
pub const RELAY_PATH_PREFIX: &str = "/relay/";

/// The one long-lived object a binary needs: resolves run contexts, holds
/// the shared clients/CA, and answers every inbound request.
pub struct Engine {
	pub registry: Arc<Registry>,
	pub cert_factory: Option<Arc<CertFactory>>,
	pub auth_token: Option<String>,
	pub direct_client: Arc<Client>,
	pub relay_client: Arc<Client>,
	pub credential_store: Option<Arc<dyn CredentialStore>>,
	pub logger: Arc<dyn RequestLogger>,
	pub max_body_log_bytes: usize,
}

impl Engine {
	pub fn new(registry: Arc<Registry>, cert_factory: Option<Arc<CertFactory>>, auth_token: Option<String>, max_body_log_bytes: usize) -> Self {
		Engine {
			registry,
			cert_factory,
			auth_token,
			direct_client: Arc::new(Client::default_direct()),
			relay_client: Arc::new(Client::no_recursion()),
			credential_store: None,
			logger: Arc::new(TracingRequestLogger),
			max_body_log_bytes,
		}
	}

	/// Classification order:
	/// 1. direct MCP relay path (bypasses proxy auth; `host().is_none()`, i.e.
	///    a relative-path request addressed straight at the engine)
	/// 2. direct AWS credentials path (bypasses proxy auth, requires its own
	///    `Authorization: Bearer`)
	/// 3. everything else goes through proxy auth, then relay-path-vs-in-band-
	///    MCP-vs-CONNECT-vs-plain-forward.
	///
	/// This function handles classification and the direct/in-band endpoints
	/// inline; CONNECT is special (it needs the raw connection, not a
	/// `Request`) and is dispatched by the listener directly once it
	/// recognizes the method, per `is_connect_method`.
	pub async fn dispatch(&self, req: crate::client::Request, is_proxied: bool) -> Response {
		let path = req.uri().path().to_string();

		if !is_proxied && path.starts_with(MCP_PATH_PREFIX) {
			return self.dispatch_direct_mcp(req, &path).await;
		}

		if !is_proxied && path == AWS_CREDENTIALS_PATH {
			return self.dispatch_aws_credentials(req).await;
		}

		if let Some(token) = &self.auth_token {
			if let Err(resp) = self.check_proxy_auth(&req, token) {
				return resp;
			}
		}

		if !is_proxied && path.starts_with(RELAY_PATH_PREFIX) {
			return self.dispatch_relay(req, &path).await;
		}

		// In-band MCP: the RunContext comes from the already-authenticated
		// proxied/CONNECT-MITM session rather than a token in the path, so the
		// path here is `/mcp/<server>/...` with no token segment.
		if is_proxied && path.starts_with(MCP_PATH_PREFIX) {
			return self.dispatch_inband_mcp(req, &path).await;
		}

		// Proxied requests that happen to contain `/relay/` in the path are
		// NOT treated as relays — they reach their real target.
		self.dispatch_forward(req).await
	}

	fn check_proxy_auth(&self, req: &crate::client::Request, token: &str) -> Result<(), Response> {
		let header = req
			.headers()
			.get(http::header::PROXY_AUTHORIZATION)
			.and_then(|v| v.to_str().ok());
		let Some(header) = header else {
			return Err(auth_required_response());
		};
		let Some(candidate) = auth::token_from_proxy_authorization(header) else {
			return Err(auth_required_response());
		};
		if !auth::tokens_match(token, &candidate) {
			return Err(auth_required_response());
		}
		Ok(())
	}

	async fn dispatch_direct_mcp(&self, req: crate::client::Request, path: &str) -> Response {
		let Some(rest) = path.strip_prefix(MCP_PATH_PREFIX) else { return not_found() };
		let Some((token, server_and_path)) = rest.split_once('/') else { return not_found() };
		let Some(ctx) = self.registry.resolve(token) else { return auth_required_response() };
		let (server_name, suffix) = split_server_and_suffix(server_and_path);
		self.run_mcp(server_name, &suffix, req, &ctx).await
	}

	async fn dispatch_inband_mcp(&self, req: crate::client::Request, path: &str) -> Response {
		let Some(ctx) = self.resolve_from_request(&req) else { return auth_required_response() };
		let Some(rest) = path.strip_prefix(MCP_PATH_PREFIX) else { return not_found() };
		let (server_name, suffix) = split_server_and_suffix(rest);
		self.run_mcp(server_name, &suffix, req, &ctx).await
	}

	async fn run_mcp(&self, server_name: &str, suffix: &str, req: crate::client::Request, ctx: &Arc<crate::context::RunContext>) -> Response {
		match mcp::handle_mcp(server_name, suffix, req.uri().query(), req, ctx, self.credential_store.as_deref(), &self.relay_client).await {
			Ok(resp) => resp,
			Err(crate::error::ProxyError::UnknownMcpServer(name)) => mcp::not_found_response(&name),
			Err(crate::error::ProxyError::CredentialMissing { grant }) => mcp::credential_missing_response(&grant),
			Err(e) => bad_gateway(&e),
		}
	}

	async fn dispatch_aws_credentials(&self, req: crate::client::Request) -> Response {
		let header = req.headers().get(http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
		let token = header.and_then(auth::token_from_bearer_authorization);

		let Some(token) = token else { return awsendpoint::unauthorized_response() };
		let Some(ctx) = self.registry.resolve(&token) else { return awsendpoint::unauthorized_response() };
		let Some(provider) = &ctx.aws_handler else { return awsendpoint::unauthorized_response() };
		awsendpoint::handle_aws_credentials(provider).await
	}

	async fn dispatch_relay(&self, req: crate::client::Request, path: &str) -> Response {
		let Some(ctx) = self.resolve_from_request(&req) else { return auth_required_response() };
		let Some(rest) = path.strip_prefix(RELAY_PATH_PREFIX) else { return not_found() };
		let (name, suffix) = match rest.split_once('/') {
			Some((name, suffix)) => (name, format!("/{suffix}")),
			None => (rest, String::new()),
		};
		match relay::handle_relay(name, &suffix, req.uri().query(), req, &ctx, &self.relay_client).await {
			Ok(resp) => resp,
			Err(crate::error::ProxyError::UnknownRelay(name)) => relay::not_found_response(&name),
			Err(e) => bad_gateway(&e),
		}
	}

	async fn dispatch_forward(&self, req: crate::client::Request) -> Response {
		let Some(ctx) = self.resolve_from_request(&req) else { return auth_required_response() };
		let chained = ctx.upstream_chain.as_ref().and_then(|chain| chain.first_hop()).map(crate::client::ChainedClient::new);
		match forward::forward(req, &ctx, &self.direct_client, chained.as_ref(), self.logger.as_ref(), self.max_body_log_bytes).await {
			Ok(resp) => resp,
			Err(e) => bad_gateway(&e),
		}
	}

	/// For already-proxy-authenticated traffic, the same `Proxy-Authorization`
	/// token identifies the run.
	fn resolve_from_request(&self, req: &crate::client::Request) -> Option<Arc<crate::context::RunContext>> {
		let Some(token) = &self.auth_token else {
			// No engine-wide token configured: single-run mode resolves
			// whatever one run is registered, if exactly one exists. This
			// keeps the common single-run CLI case simple without a token.
			return self.registry.resolve("");
		};
		let header = req.headers().get(http::header::PROXY_AUTHORIZATION).and_then(|v| v.to_str().ok())?;
		let candidate = auth::token_from_proxy_authorization(header)?;
		if !auth::tokens_match(token, &candidate) {
			return None;
		}
		self.registry.resolve(&candidate)
	}
}

/// Splits `<server>[/<path>]` into the server name and a suffix that always
/// starts with `/` (empty path becomes `""`, not `"/"`, matching the bare
/// case).
fn split_server_and_suffix(rest: &str) -> (&str, String) {
	match rest.split_once('/') {
		Some((name, suffix)) => (name, format!("/{suffix}")),
		None => (rest, String::new()),
	}
}

fn auth_required_response() -> Response {
	let mut response = http::Response::new(crate::client::full_body(bytes::Bytes::from_static(b"Proxy authentication required")));
	*response.status_mut() = StatusCode::PROXY_AUTHENTICATION_REQUIRED;
	response
}

fn not_found() -> Response {
	let mut response = http::Response::new(crate::client::full_body(bytes::Bytes::new()));
	*response.status_mut() = StatusCode::NOT_FOUND;
	response
}

fn bad_gateway(err: &crate::error::ProxyError) -> Response {
	warn!(error = %err, "request failed");
	let mut response = http::Response::new(crate::client::full_body(bytes::Bytes::from(err.to_string())));
	*response.status_mut() = err.status();
	response
}

pub fn is_connect_method(method: &Method) -> bool {
	method == Method::CONNECT
}
