use std::sync::Arc;

use http::Method;

use super::*;
use crate::context::RunContext;
use crate::policy::NetworkPolicy;

fn engine_with_run(token: &str) -> (Engine, Arc<RunContext>) {
	let registry = Arc::new(Registry::new());
	let ctx = Arc::new(RunContext::new("run-1", NetworkPolicy::permissive()));
	registry.register(token.to_string(), ctx.clone()).unwrap();
	(Engine::new(registry, None, Some("secret-token".to_string()), 8192), ctx)
}

fn request(method: Method, uri: &str) -> crate::client::Request {
	http::Request::builder().method(method).uri(uri).body(crate::client::empty_body()).unwrap()
}

#[tokio::test]
async fn missing_proxy_auth_is_rejected() {
	let (engine, _ctx) = engine_with_run("tok");
	let req = request(Method::GET, "http://example.com/");
	let resp = engine.dispatch(req, true).await;
	assert_eq!(resp.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
}

#[tokio::test]
async fn unknown_aws_credentials_token_is_unauthorized() {
	let (engine, _ctx) = engine_with_run("tok");
	let req = request(Method::GET, AWS_CREDENTIALS_PATH);
	let resp = engine.dispatch(req, false).await;
	assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

/// `is_proxied` below is computed the same way the real listener computes
/// it (`req.uri().host().is_some()`), not asserted by hand — a relative-path
/// request like this one always has `host() == None`.
fn is_proxied_like_listener(req: &crate::client::Request) -> bool {
	req.uri().host().is_some()
}

#[tokio::test]
async fn direct_mcp_path_with_unknown_token_requires_auth() {
	let (engine, _ctx) = engine_with_run("tok");
	let req = request(Method::GET, "/mcp/not-a-real-token/myserver/tools/list");
	let is_proxied = is_proxied_like_listener(&req);
	let resp = engine.dispatch(req, is_proxied).await;
	assert_eq!(resp.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
}

#[tokio::test]
async fn direct_mcp_path_with_known_token_reaches_mcp_dispatch() {
	let (engine, _ctx) = engine_with_run("tok");
	let req = request(Method::GET, "/mcp/tok/myserver/tools/list");
	let is_proxied = is_proxied_like_listener(&req);
	assert!(!is_proxied, "a relative-path request must never look proxied to the listener");
	let resp = engine.dispatch(req, is_proxied).await;
	// The token resolves but `myserver` isn't registered on the run: this
	// only happens if classification actually reached `dispatch_direct_mcp`
	// instead of being swallowed by the always-false condition.
	assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn inband_mcp_path_reaches_mcp_dispatch_via_proxy_auth() {
	let (engine, _ctx) = engine_with_run("secret-token");
	let req = http::Request::builder()
		.method(Method::GET)
		.uri("http://example.com/mcp/myserver/tools/list")
		.header(http::header::PROXY_AUTHORIZATION, "Bearer secret-token")
		.body(crate::client::empty_body())
		.unwrap();
	let is_proxied = is_proxied_like_listener(&req);
	assert!(is_proxied, "an absolute-form request must look proxied to the listener");
	let resp = engine.dispatch(req, is_proxied).await;
	assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn relay_path_with_no_registered_relay_is_not_found() {
	let (engine, _ctx) = engine_with_run("secret-token");
	let req = http::Request::builder()
		.method(Method::GET)
		.uri("/relay/nope/anything")
		.header(http::header::PROXY_AUTHORIZATION, "Bearer secret-token")
		.body(crate::client::empty_body())
		.unwrap();
	let resp = engine.dispatch(req, false).await;
	assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[test]
fn is_connect_method_recognizes_connect_only() {
	assert!(is_connect_method(&Method::CONNECT));
	assert!(!is_connect_method(&Method::GET));
}
