//! The single listening socket. One accept loop serves
//! three request shapes on the same port: CONNECT (hijacked to
//! `proxy::connect`), absolute-form proxied requests, and the two direct
//! endpoints (`/mcp/<token>/...`, `/_aws/credentials`).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use http_body_util::BodyExt;
use hyper_util::rt::TokioIo;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::error::ProxyError;
use crate::proxy::{connect, Engine};

/// `RawConfig::resolve` requires an `auth_token` whenever `bind_all_interfaces`
/// is set, so a misconfigured listener never opens a credential-injecting
/// proxy to the network without one.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_REQUEST_LINE_SCAN: usize = 16 * 1024;

pub struct Listener {
	listener: TcpListener,
	pub local_addr: SocketAddr,
}

impl Listener {
	pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
		let listener = TcpListener::bind(addr).await?;
		let local_addr = listener.local_addr()?;
		Ok(Listener { listener, local_addr })
	}

	/// Accepts connections until `shutdown` resolves. Each connection runs on
	/// its own task; a slow or hung connection never blocks another.
	pub async fn serve(self, engine: Arc<Engine>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
		info!(addr = %self.local_addr, "listening");
		loop {
			tokio::select! {
				accepted = self.listener.accept() => {
					let (stream, peer) = match accepted {
						Ok(pair) => pair,
						Err(e) => {
							warn!(error = %e, "accept failed");
							continue;
						}
					};
					let engine = engine.clone();
					tokio::spawn(async move {
						if let Err(e) = handle_connection(stream, engine).await {
							debug!(peer = %peer, error = %e, "connection ended with error");
						}
					});
				}
				_ = shutdown.changed() => {
					info!("listener shutting down");
					return;
				}
			}
		}
	}
}

async fn handle_connection(stream: TcpStream, engine: Arc<Engine>) -> Result<(), ProxyError> {
	stream.set_nodelay(true).ok();

	let Some(peeked) = peek_method(&stream).await? else {
		return Ok(());
	};

	if peeked == "CONNECT" {
		return handle_connect_connection(stream, engine).await;
	}

	serve_http_requests(stream, engine).await
}

/// Peeks (without consuming) enough of the connection to read the request
/// method token, so CONNECT can be routed to the raw-socket tunnel/MITM path
/// before any bytes are handed to hyper's HTTP/1 server loop.
async fn peek_method(stream: &TcpStream) -> Result<Option<String>, ProxyError> {
	let mut buf = [0u8; 32];
	let deadline = tokio::time::Instant::now() + HEADER_READ_TIMEOUT;
	loop {
		let n = match tokio::time::timeout_at(deadline, stream.peek(&mut buf)).await {
			Ok(Ok(n)) => n,
			Ok(Err(e)) => return Err(ProxyError::Io(e)),
			Err(_) => return Err(ProxyError::InvariantViolation("header read timed out".to_string())),
		};
		if n == 0 {
			return Ok(None);
		}
		if let Some(space) = buf[..n].iter().position(|b| *b == b' ') {
			return Ok(Some(String::from_utf8_lossy(&buf[..space]).to_string()));
		}
		if n == buf.len() {
			return Err(ProxyError::InvariantViolation("request line too long".to_string()));
		}
	}
}

/// Reads the CONNECT request line and headers directly off the socket (no
/// buffered wrapper), so the exact remaining bytes are handed to
/// `proxy::connect::handle_connect` untouched once the blank line is seen.
async fn handle_connect_connection(mut stream: TcpStream, engine: Arc<Engine>) -> Result<(), ProxyError> {
	let mut raw = BytesMut::with_capacity(1024);
	let deadline = tokio::time::Instant::now() + HEADER_READ_TIMEOUT;
	let header_end = loop {
		if let Some(pos) = find_header_end(&raw) {
			break pos;
		}
		if raw.len() > MAX_REQUEST_LINE_SCAN {
			return Err(ProxyError::InvariantViolation("connect headers too large".to_string()));
		}
		let mut chunk = [0u8; 512];
		let n = match tokio::time::timeout_at(deadline, stream.read(&mut chunk)).await {
			Ok(Ok(0)) => return Ok(()),
			Ok(Ok(n)) => n,
			Ok(Err(e)) => return Err(ProxyError::Io(e)),
			Err(_) => return Err(ProxyError::InvariantViolation("connect header read timed out".to_string())),
		};
		raw.extend_from_slice(&chunk[..n]);
	};

	let head = String::from_utf8_lossy(&raw[..header_end]).to_string();
	let mut lines = head.split("\r\n");
	let request_line = lines.next().unwrap_or_default();
	let mut parts = request_line.split_whitespace();
	let method = parts.next().unwrap_or_default();
	let target = parts.next().unwrap_or_default();

	if method != "CONNECT" {
		return Err(ProxyError::InvariantViolation("expected CONNECT".to_string()));
	}
	let Some((host, port)) = connect::parse_connect_target(target) else {
		let _ = tokio::io::AsyncWriteExt::write_all(&mut stream, b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
		return Ok(());
	};

	let auth_header = lines.find_map(|l| l.strip_prefix("Proxy-Authorization:").map(|v| v.trim().to_string()));
	let run = match resolve_run_for_connect(&engine, auth_header.as_deref()) {
		Ok(run) => run,
		Err(_) => {
			let _ = tokio::io::AsyncWriteExt::write_all(&mut stream, b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").await;
			return Ok(());
		}
	};

	connect::handle_connect(stream, host, port, run, engine.cert_factory.clone(), engine.direct_client.clone(), engine.logger.clone(), engine.max_body_log_bytes).await;
	Ok(())
}

fn resolve_run_for_connect(engine: &Engine, auth_header: Option<&str>) -> Result<Arc<crate::context::RunContext>, ()> {
	let Some(token) = &engine.auth_token else {
		return engine.registry.resolve("").ok_or(());
	};
	let header = auth_header.ok_or(())?;
	let candidate = super::auth::token_from_proxy_authorization(header).ok_or(())?;
	if !super::auth::tokens_match(token, &candidate) {
		return Err(());
	}
	engine.registry.resolve(&candidate).ok_or(())
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
	buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

async fn serve_http_requests(stream: TcpStream, engine: Arc<Engine>) -> Result<(), ProxyError> {
	let io = TokioIo::new(stream);
	let service = hyper::service::service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
		let engine = engine.clone();
		async move {
			let is_proxied = req.uri().host().is_some();
			let (parts, body) = req.into_parts();
			let boxed = body.map_err(|e| hyper::Error::from(std::io::Error::new(std::io::ErrorKind::Other, e))).boxed();
			let request = http::Request::from_parts(parts, boxed);
			let response = engine.dispatch(request, is_proxied).await;
			Ok::<_, std::convert::Infallible>(response)
		}
	});

	hyper::server::conn::http1::Builder::new()
		.serve_connection(io, service)
		.await
		.map_err(|e| ProxyError::InvariantViolation(e.to_string()))?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn find_header_end_locates_blank_line() {
		let buf = b"CONNECT a:443 HTTP/1.1\r\nHost: a\r\n\r\n";
		assert_eq!(find_header_end(buf), Some(buf.len()));
	}

	#[test]
	fn find_header_end_absent_when_incomplete() {
		let buf = b"CONNECT a:443 HTTP/1.1\r\nHost: a\r\n";
		assert_eq!(find_header_end(buf), None);
	}

	#[tokio::test]
	async fn bind_reports_local_addr() {
		let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
		assert_ne!(listener.local_addr.port(), 0);
	}
}
