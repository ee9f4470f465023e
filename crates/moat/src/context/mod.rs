//! Per-run context bundle and the token-keyed registry that resolves it
//!.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use arc_swap::ArcSwap;
use bytes::Bytes;
use http_body::Body as HttpBody;
use http_body_util::BodyExt;
use parking_lot::{Mutex, RwLock};
use pin_project_lite::pin_project;
use thiserror::Error;

use crate::aws::AwsCredentialProvider;
use crate::chain::UpstreamChain;
use crate::client::Body;
use crate::policy::NetworkPolicy;

#[cfg(test)]
#[path = "context_tests.rs"]
mod tests;

/// A single injected header, bound to a grant for bookkeeping/log redaction
/// purposes only — the header value is what actually gets sent.
#[derive(Clone)]
pub struct CredentialHeader {
	pub header_name: String,
	pub header_value: String,
	pub grant_name: Option<String>,
}

impl std::fmt::Debug for CredentialHeader {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CredentialHeader")
			.field("header_name", &self.header_name)
			.field("header_value", &"[REDACTED]")
			.field("grant_name", &self.grant_name)
			.finish()
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum McpAuthType {
	Token,
	OAuth,
}

#[derive(Clone, Debug)]
pub struct McpAuth {
	pub grant: String,
	pub header_name: String,
	pub auth_type: McpAuthType,
}

/// A registered MCP server binding. `name` must already have passed `validate_slug`.
#[derive(Clone, Debug)]
pub struct McpServer {
	pub name: String,
	pub url: url::Url,
	pub auth: Option<McpAuth>,
}

/// A registered plain relay binding. `name` must already have passed `validate_slug`.
#[derive(Clone, Debug)]
pub struct RelayBinding {
	pub name: String,
	pub target_url: url::Url,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistrationError {
	#[error("name must not be empty")]
	Empty,
	#[error("name must not contain `/` or whitespace")]
	InvalidCharacters,
	#[error("url must have an explicit scheme and host")]
	InvalidUrl,
	#[error("url scheme must be http or https")]
	UnsupportedScheme,
	#[error("name `{0}` is already registered in this run")]
	Duplicate(String),
}

/// Shared validation for relay and MCP server names.
pub fn validate_slug(name: &str) -> Result<(), RegistrationError> {
	if name.is_empty() {
		return Err(RegistrationError::Empty);
	}
	if name.contains('/') || name.chars().any(char::is_whitespace) {
		return Err(RegistrationError::InvalidCharacters);
	}
	Ok(())
}

pub fn validate_target_url(raw: &str) -> Result<url::Url, RegistrationError> {
	let url = url::Url::parse(raw).map_err(|_| RegistrationError::InvalidUrl)?;
	match url.scheme() {
		"http" | "https" => {}
		_ => return Err(RegistrationError::UnsupportedScheme),
	}
	if url.host_str().is_none() {
		return Err(RegistrationError::InvalidUrl);
	}
	Ok(url)
}

/// Trait object response-body transform, hooked per host. The
/// engine treats this as a declared, opt-in hook, never a general rewrite
/// facility.
pub trait ResponseTransformer: Send + Sync {
	fn transform(&self, chunk: bytes::Bytes) -> bytes::Bytes;
}

fn host_key(host: &str) -> String {
	host.to_lowercase()
}

fn host_without_port(host: &str) -> &str {
	host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host)
}

/// The per-run bundle of credentials, policy, and bindings. Mutable maps are guarded by
/// `parking_lot::RwLock` so mutations (`SetCredential`, `AddExtraHeader`,
/// `RemoveRequestHeader`, `AddRelay`) are immediately visible to concurrent
/// readers without ever holding the lock across I/O.
pub struct RunContext {
	pub run_id: String,
	credentials: RwLock<HashMap<String, CredentialHeader>>,
	extra_headers: RwLock<HashMap<String, Vec<(String, String)>>>,
	removed_headers: RwLock<HashMap<String, HashSet<String>>>,
	relays: RwLock<HashMap<String, Arc<RelayBinding>>>,
	mcp_servers: RwLock<HashMap<String, Arc<McpServer>>>,
	response_transformers: RwLock<HashMap<String, Vec<Arc<dyn ResponseTransformer>>>>,
	pub aws_handler: Option<Arc<AwsCredentialProvider>>,
	pub policy: NetworkPolicy,
	pub upstream_chain: Option<Arc<UpstreamChain>>,
}

impl RunContext {
	pub fn new(run_id: impl Into<String>, policy: NetworkPolicy) -> Self {
		RunContext {
			run_id: run_id.into(),
			credentials: RwLock::new(HashMap::new()),
			extra_headers: RwLock::new(HashMap::new()),
			removed_headers: RwLock::new(HashMap::new()),
			relays: RwLock::new(HashMap::new()),
			mcp_servers: RwLock::new(HashMap::new()),
			response_transformers: RwLock::new(HashMap::new()),
			aws_handler: None,
			policy,
			upstream_chain: None,
		}
	}

	pub fn with_aws_handler(mut self, handler: Arc<AwsCredentialProvider>) -> Self {
		self.aws_handler = Some(handler);
		self
	}

	pub fn with_upstream_chain(mut self, chain: Arc<UpstreamChain>) -> Self {
		self.upstream_chain = Some(chain);
		self
	}

	/// `SetCredential(host, "Bearer t")` — registers header name `Authorization`
	///.
	pub fn set_credential(&self, host_or_host_port: &str, value: impl Into<String>) {
		self.set_credential_named(host_or_host_port, "Authorization", value);
	}

	/// `SetCredential(host, name, value)` — registers the named header verbatim.
	pub fn set_credential_named(&self, host_or_host_port: &str, header_name: &str, value: impl Into<String>) {
		self.credentials.write().insert(
			host_key(host_or_host_port),
			CredentialHeader { header_name: header_name.to_string(), header_value: value.into(), grant_name: None },
		);
	}

	pub fn set_credential_for_grant(&self, host_or_host_port: &str, header_name: &str, value: impl Into<String>, grant: impl Into<String>) {
		self.credentials.write().insert(
			host_key(host_or_host_port),
			CredentialHeader { header_name: header_name.to_string(), header_value: value.into(), grant_name: Some(grant.into()) },
		);
	}

	/// Looks up a credential for `host:port`, falling back to the
	/// host-without-port key on miss.
	pub fn lookup_credential(&self, host: &str, port: u16) -> Option<CredentialHeader> {
		let map = self.credentials.read();
		let with_port = host_key(&format!("{host}:{port}"));
		map.get(&with_port).or_else(|| map.get(&host_key(host))).cloned()
	}

	pub fn add_extra_header(&self, host_or_host_port: &str, name: impl Into<String>, value: impl Into<String>) {
		self.extra_headers.write().entry(host_key(host_or_host_port)).or_default().push((name.into(), value.into()));
	}

	pub fn extra_headers_for(&self, host: &str, port: u16) -> Vec<(String, String)> {
		let map = self.extra_headers.read();
		let with_port = host_key(&format!("{host}:{port}"));
		map.get(&with_port).or_else(|| map.get(&host_key(host))).cloned().unwrap_or_default()
	}

	pub fn remove_header(&self, host_or_host_port: &str, name: impl Into<String>) {
		self.removed_headers.write().entry(host_key(host_or_host_port)).or_default().insert(name.into().to_lowercase());
	}

	pub fn removed_headers_for(&self, host: &str, port: u16) -> HashSet<String> {
		let map = self.removed_headers.read();
		let with_port = host_key(&format!("{host}:{port}"));
		map.get(&with_port).or_else(|| map.get(&host_key(host))).cloned().unwrap_or_default()
	}

	pub fn add_relay(&self, name: &str, target_url: &str) -> Result<(), RegistrationError> {
		validate_slug(name)?;
		let url = validate_target_url(target_url)?;
		let mut relays = self.relays.write();
		if relays.contains_key(name) {
			return Err(RegistrationError::Duplicate(name.to_string()));
		}
		relays.insert(name.to_string(), Arc::new(RelayBinding { name: name.to_string(), target_url: url }));
		Ok(())
	}

	pub fn relay(&self, name: &str) -> Option<Arc<RelayBinding>> {
		self.relays.read().get(name).cloned()
	}

	pub fn add_mcp_server(&self, server: McpServer) -> Result<(), RegistrationError> {
		validate_slug(&server.name)?;
		let mut servers = self.mcp_servers.write();
		if servers.contains_key(&server.name) {
			return Err(RegistrationError::Duplicate(server.name.clone()));
		}
		servers.insert(server.name.clone(), Arc::new(server));
		Ok(())
	}

	pub fn mcp_server(&self, name: &str) -> Option<Arc<McpServer>> {
		self.mcp_servers.read().get(name).cloned()
	}

	pub fn add_response_transformer(&self, host: &str, transformer: Arc<dyn ResponseTransformer>) {
		self.response_transformers.write().entry(host_key(host)).or_default().push(transformer);
	}

	pub fn response_transformers_for(&self, host: &str) -> Vec<Arc<dyn ResponseTransformer>> {
		self.response_transformers.read().get(&host_key(host_without_port(host))).cloned().unwrap_or_default()
	}
}

pin_project! {
	/// Routes every response data frame through a host's registered
	/// transformers, in registration order, before it reaches the client.
	/// Trailers pass through untouched.
	struct TransformedBody<B> {
		#[pin]
		inner: B,
		transformers: Vec<Arc<dyn ResponseTransformer>>,
	}
}

impl<B> HttpBody for TransformedBody<B>
where
	B: HttpBody<Data = Bytes>,
{
	type Data = Bytes;
	type Error = B::Error;

	fn poll_frame(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
		let this = self.project();
		match this.inner.poll_frame(cx) {
			Poll::Ready(Some(Ok(frame))) => {
				let frame = match frame.into_data() {
					Ok(data) => {
						let transformed = this.transformers.iter().fold(data, |chunk, t| t.transform(chunk));
						http_body::Frame::data(transformed)
					}
					Err(frame) => frame,
				};
				Poll::Ready(Some(Ok(frame)))
			}
			other => other,
		}
	}
}

/// If `host` has any registered response transformers, wraps `body` to route
/// every data frame through them in order before it reaches the client;
/// otherwise returns `body` unchanged. Either way the body keeps streaming
/// with incremental flushing — this never buffers the whole response.
pub fn apply_response_transformers(ctx: &RunContext, host: &str, body: Body) -> Body {
	let transformers = ctx.response_transformers_for(host);
	if transformers.is_empty() {
		return body;
	}
	TransformedBody { inner: body, transformers }.boxed()
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
	#[error("token already names a different run")]
	DuplicateToken,
}

/// Token → `RunContext` resolution. Reads are lock-free
/// (an `ArcSwap` snapshot); writes serialize through a mutex and publish a
/// fresh copy-on-write map.
#[derive(Default)]
pub struct Registry {
	inner: ArcSwap<HashMap<String, Arc<RunContext>>>,
	write_lock: Mutex<()>,
}

impl Registry {
	pub fn new() -> Self {
		Registry { inner: ArcSwap::from_pointee(HashMap::new()), write_lock: Mutex::new(()) }
	}

	/// `Register(token, ctx)` — fails with `DuplicateToken` only if the token
	/// already names a *different* run; re-registering the same run is a no-op.
	pub fn register(&self, token: String, ctx: Arc<RunContext>) -> Result<(), RegistryError> {
		let _guard = self.write_lock.lock();
		let current = self.inner.load();
		if let Some(existing) = current.get(&token) {
			if !Arc::ptr_eq(existing, &ctx) {
				return Err(RegistryError::DuplicateToken);
			}
			return Ok(());
		}
		let mut next = (**current).clone();
		next.insert(token, ctx);
		self.inner.store(Arc::new(next));
		Ok(())
	}

	/// `Deregister(token)` — removes atomically; in-flight requests that
	/// already hold their own `Arc<RunContext>` clone are unaffected.
	pub fn deregister(&self, token: &str) {
		let _guard = self.write_lock.lock();
		let current = self.inner.load();
		if !current.contains_key(token) {
			return;
		}
		let mut next = (**current).clone();
		next.remove(token);
		self.inner.store(Arc::new(next));
	}

	/// `Resolve(token) -> (ctx, ok)` — lock-free on the hot path.
	pub fn resolve(&self, token: &str) -> Option<Arc<RunContext>> {
		self.inner.load().get(token).cloned()
	}
}
