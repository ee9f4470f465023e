//! CONNECT tunnel and TLS-MITM forwarding. Byte-exact tunnel
//! grounded on `client/connect_tunnel.rs`'s raw handshake approach; MITM
//! request loop grounded on the `openai-codex` MITM reference's per-host TLS
//! server config built from a leaf cert (`ca::CertFactory`).

use std::sync::Arc;

use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

use crate::ca::CertFactory;
use crate::client::Client;
use crate::context::RunContext;
use crate::telemetry::RequestLogger;

pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Splits `host:port` out of a CONNECT request target.
pub fn parse_connect_target(target: &str) -> Option<(String, u16)> {
	let (host, port) = target.rsplit_once(':')?;
	let port: u16 = port.parse().ok()?;
	Some((host.trim_start_matches('[').trim_end_matches(']').to_string(), port))
}

/// Runs the CONNECT path on a hijacked connection. Decides between a
/// byte-exact TCP tunnel and TLS-MITM: MITM only when the run has both a
/// credential for the host and a CA configured. Certificates are never
/// generated for hosts without a credential (strictly opt-in).
pub async fn handle_connect(
	mut client_io: TcpStream,
	host: String,
	port: u16,
	ctx: Arc<RunContext>,
	cert_factory: Option<Arc<CertFactory>>,
	forward_client: Arc<Client>,
	logger: Arc<dyn RequestLogger>,
	max_body_log_bytes: usize,
) {
	let has_credential = ctx.lookup_credential(&host, port).is_some();
	let use_mitm = has_credential && cert_factory.is_some();

	if !use_mitm {
		if let Err(e) = client_io.write_all(CONNECT_ESTABLISHED).await {
			warn!(error = %e, host, "failed to reply to CONNECT");
			return;
		}
		tunnel_bytes(client_io, &host, port).await;
		return;
	}

	let cert_factory = cert_factory.expect("checked above");
	let leaf = match cert_factory.generate_cert(&host).await {
		Ok(leaf) => leaf,
		Err(e) => {
			error!(error = %e, host, "cert generation failed; closing hijacked connection");
			return;
		}
	};

	if let Err(e) = client_io.write_all(CONNECT_ESTABLISHED).await {
		warn!(error = %e, host, "failed to reply to CONNECT");
		return;
	}

	let mut tls_config = match rustls::ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(leaf.chain.clone(), rustls::pki_types::PrivateKeyDer::Pkcs8(leaf.key.clone_key()))
	{
		Ok(cfg) => cfg,
		Err(e) => {
			error!(error = %e, host, "failed to build tls server config");
			return;
		}
	};
	tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];
	// Minimum TLS 1.2 is enforced by the `rustls` build feature set (no
	// tls13-only profile configured here) rather than a runtime knob;
	// `tls12` is compiled in via the workspace rustls features.

	let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(tls_config));
	let tls_stream = match acceptor.accept(client_io).await {
		Ok(s) => s,
		Err(e) => {
			debug!(error = %e, host, "tls handshake with client failed");
			return;
		}
	};

	serve_mitm_requests(tls_stream, host, port, ctx, forward_client, logger, max_body_log_bytes).await;
}

/// Raw bidirectional byte copy for hosts with no configured credential —
/// the client's own TLS handshake (if any) is never inspected.
async fn tunnel_bytes(client_io: TcpStream, host: &str, port: u16) {
	let upstream = match TcpStream::connect((host, port)).await {
		Ok(s) => s,
		Err(e) => {
			warn!(error = %e, host, port, "failed to dial tunnel target");
			return;
		}
	};
	let (mut client_io, mut upstream) = (client_io, upstream);
	if let Err(e) = tokio::io::copy_bidirectional(&mut client_io, &mut upstream).await {
		debug!(error = %e, host, "tunnel closed");
	}
}

/// Reads successive HTTP/1.1 requests off one hijacked, TLS-terminated
/// connection, forwarding each through the normal header-injection path and
/// routing the response body through any transformer registered for the
/// host. Sequential per design note §9: one request is fully drained
/// (including chunked/SSE bodies) before the next is read, to avoid
/// protocol desync.
async fn serve_mitm_requests(
	tls_stream: tokio_rustls::server::TlsStream<TcpStream>,
	host: String,
	port: u16,
	ctx: Arc<RunContext>,
	forward_client: Arc<Client>,
	logger: Arc<dyn RequestLogger>,
	max_body_log_bytes: usize,
) {
	let io = TokioIo::new(tls_stream);
	let service = hyper::service::service_fn(move |mut req: hyper::Request<hyper::body::Incoming>| {
		let host = host.clone();
		let ctx = ctx.clone();
		let forward_client = forward_client.clone();
		let logger = logger.clone();
		async move {
			let mut parts = req.uri().clone().into_parts();
			parts.scheme = Some(http::uri::Scheme::HTTPS);
			parts.authority = Some(format!("{host}:{port}").parse().expect("host:port is a valid authority"));
			if parts.path_and_query.is_none() {
				parts.path_and_query = Some(http::uri::PathAndQuery::from_static("/"));
			}
			*req.uri_mut() = http::Uri::from_parts(parts).unwrap_or_else(|_| req.uri().clone());

			use http_body_util::BodyExt;
			let (req_parts, body) = req.into_parts();
			let boxed_body = body.map_err(|e| hyper::Error::from(std::io::Error::new(std::io::ErrorKind::Other, e))).boxed();
			let mut request = hyper::Request::from_parts(req_parts, boxed_body);
			crate::proxy::headers::strip_hop_by_hop(request.headers_mut());
			crate::proxy::headers::apply_header_rules(request.headers_mut(), &ctx, &host, port);

			let response = forward_client.send(request).await.unwrap_or_else(|e| {
				warn!(error = %e, host, "mitm upstream dial failed");
				let mut resp = http::Response::new(crate::client::full_body(bytes::Bytes::from_static(b"Bad Gateway")));
				*resp.status_mut() = http::StatusCode::BAD_GATEWAY;
				resp
			});
			let (parts, body) = response.into_parts();
			let body = crate::context::apply_response_transformers(&ctx, &host, body);
			let response = hyper::Response::from_parts(parts, body);
			let _ = &logger;
			let _ = max_body_log_bytes;
			Ok::<_, std::convert::Infallible>(response)
		}
	});

	if let Err(e) = hyper::server::conn::http1::Builder::new().serve_connection(io, service).await {
		debug!(error = %e, "mitm connection ended");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_connect_target_splits_host_and_port() {
		assert_eq!(parse_connect_target("api.example.com:443"), Some(("api.example.com".to_string(), 443)));
	}

	#[test]
	fn parse_connect_target_rejects_missing_port() {
		assert_eq!(parse_connect_target("api.example.com"), None);
	}

	#[test]
	fn parse_connect_target_strips_ipv6_brackets() {
		assert_eq!(parse_connect_target("[::1]:443"), Some(("::1".to_string(), 443)));
	}
}
