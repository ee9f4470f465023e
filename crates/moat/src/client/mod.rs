//! The HTTP client the forward/relay/MCP/AWS paths use to reach upstream
//! destinations: a `hyper-util` legacy client wrapping a `hyper-rustls`
//! connector, plus a variant that always dials a fixed proxy address for
//! the run's upstream chain.

use std::net::SocketAddr;
use std::time::Duration;

use http_body_util::combinators::BoxBody;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as LegacyClient;
use hyper_util::rt::TokioExecutor;

use crate::error::ProxyError;

pub type Body = BoxBody<bytes::Bytes, hyper::Error>;
pub type Request = http::Request<Body>;
pub type Response = http::Response<Body>;

type HttpsConnector = hyper_rustls::HttpsConnector<HttpConnector>;

/// A pooled client for direct (non-chained) egress. Used by the plain-HTTP
/// forward path, the MITM CONNECT path (an HTTPS transport that uses the
/// system trust store for the upstream), relay handlers, and MCP relay
/// handlers.
#[derive(Clone)]
pub struct Client {
	inner: LegacyClient<HttpsConnector, Body>,
}

impl Client {
	/// `header_timeout`/`idle_timeout` correspond to the 30s header timeout,
	/// 90s idle timeout used for relay/MCP clients; the plain-forward client
	/// uses `Client::default()` (no extra bound beyond the connector's own
	/// timeouts).
	pub fn new(header_timeout: Option<Duration>, idle_timeout: Option<Duration>) -> Self {
		let connector = HttpsConnectorBuilder::new()
			.with_native_roots()
			.expect("native root store must be loadable")
			.https_or_http()
			.enable_http1()
			.enable_http2()
			.build();

		let mut builder = LegacyClient::builder(TokioExecutor::new());
		if let Some(idle) = idle_timeout {
			builder.pool_idle_timeout(idle);
		}
		// hyper-util's legacy client does not expose a response-header-only
		// timeout; callers that need the 30s header bound wrap `send` with
		// `tokio::time::timeout` (see `proxy::relay`/`proxy::mcp`).
		let _ = header_timeout;

		Client { inner: builder.build(connector) }
	}

	pub fn default_direct() -> Self {
		Self::new(None, None)
	}

	/// Client used by relay/MCP handlers: `Proxy = nil` (no recursion through
	/// the engine's own chain), 30s header timeout enforced by the caller,
	/// 90s idle timeout baked into the pool.
	pub fn no_recursion() -> Self {
		Self::new(Some(Duration::from_secs(30)), Some(Duration::from_secs(90)))
	}

	pub async fn send(&self, req: Request) -> Result<Response, ProxyError> {
		self.inner.request(req).await.map_err(|e| ProxyError::UpstreamDialError(e.to_string()))
	}

	pub async fn send_with_timeout(&self, req: Request, timeout: Duration) -> Result<Response, ProxyError> {
		match tokio::time::timeout(timeout, self.send(req)).await {
			Ok(result) => result,
			Err(_) => Err(ProxyError::UpstreamTimeout(String::new())),
		}
	}
}

/// A `tower::Service<Uri>` that dials a single fixed address regardless of
/// the URI it is asked to connect -- the standard shape for a client that
/// must route *every* request through one forward-proxy hop.
#[derive(Clone)]
struct FixedAddrConnector {
	proxy_addr: SocketAddr,
	inner: HttpConnector,
}

impl tower::Service<http::Uri> for FixedAddrConnector {
	type Response = <HttpConnector as tower::Service<http::Uri>>::Response;
	type Error = <HttpConnector as tower::Service<http::Uri>>::Error;
	type Future = <HttpConnector as tower::Service<http::Uri>>::Future;

	fn poll_ready(&mut self, cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
		self.inner.poll_ready(cx)
	}

	fn call(&mut self, _uri: http::Uri) -> Self::Future {
		let proxy_uri: http::Uri = format!("http://{}", self.proxy_addr).parse().expect("socket addr is a valid authority");
		self.inner.call(proxy_uri)
	}
}

/// A client that always dials a fixed proxy address, used as the run's
/// `UpstreamTransport` when an upstream chain is configured.
#[derive(Clone)]
pub struct ChainedClient {
	h1: hyper_util::client::legacy::Client<FixedAddrConnector, Body>,
}

impl ChainedClient {
	pub fn new(proxy_addr: SocketAddr) -> Self {
		let connector = FixedAddrConnector { proxy_addr, inner: HttpConnector::new() };
		let h1 = LegacyClient::builder(TokioExecutor::new()).build(connector);
		ChainedClient { h1 }
	}

	/// Sends an absolute-form HTTP request to the configured proxy address
	/// instead of to the request's own authority — the standard "forward
	/// proxy" client shape, used for the plain-HTTP half of chained egress.
	/// HTTPS chaining additionally needs a CONNECT handshake before TLS,
	/// handled by `proxy::connect` alongside the rest of the CONNECT path
	/// rather than duplicated here.
	pub async fn send(&self, req: Request) -> Result<Response, ProxyError> {
		self.h1.request(req).await.map_err(|e| ProxyError::UpstreamDialError(e.to_string()))
	}
}

pub fn empty_body() -> Body {
	use http_body_util::BodyExt;
	http_body_util::Empty::new().map_err(|never| match never {}).boxed()
}

pub fn full_body(bytes: bytes::Bytes) -> Body {
	use http_body_util::BodyExt;
	http_body_util::Full::new(bytes).map_err(|never| match never {}).boxed()
}
