use super::*;
use crate::policy::NetworkPolicy;

#[test]
fn set_credential_default_header_is_authorization() {
	let ctx = RunContext::new("run-1", NetworkPolicy::permissive());
	ctx.set_credential("127.0.0.1", "Bearer test-token");
	let cred = ctx.lookup_credential("127.0.0.1", 9000).unwrap();
	assert_eq!(cred.header_name, "Authorization");
	assert_eq!(cred.header_value, "Bearer test-token");
}

#[test]
fn set_credential_named_uses_given_header() {
	let ctx = RunContext::new("run-1", NetworkPolicy::permissive());
	ctx.set_credential_named("api.example.com", "X-Api-Key", "real-secret");
	let cred = ctx.lookup_credential("api.example.com", 443).unwrap();
	assert_eq!(cred.header_name, "X-Api-Key");
	assert_eq!(cred.header_value, "real-secret");
}

#[test]
fn credential_lookup_falls_back_to_host_without_port() {
	let ctx = RunContext::new("run-1", NetworkPolicy::permissive());
	ctx.set_credential("127.0.0.1", "Bearer test-token");
	assert!(ctx.lookup_credential("127.0.0.1", 51234).is_some());
	assert!(ctx.lookup_credential("127.0.0.1", 9).is_some());
}

#[test]
fn exact_host_port_key_takes_precedence_over_bare_host() {
	let ctx = RunContext::new("run-1", NetworkPolicy::permissive());
	ctx.set_credential("api.example.com", "generic");
	ctx.set_credential("api.example.com:9443", "specific");
	let cred = ctx.lookup_credential("api.example.com", 9443).unwrap();
	assert_eq!(cred.header_value, "specific");
	let cred = ctx.lookup_credential("api.example.com", 443).unwrap();
	assert_eq!(cred.header_value, "generic");
}

#[test]
fn relay_registration_rejects_invalid_names_and_urls() {
	let ctx = RunContext::new("run-1", NetworkPolicy::permissive());
	assert_eq!(ctx.add_relay("", "http://localhost:1/").unwrap_err(), RegistrationError::Empty);
	assert_eq!(ctx.add_relay("has space", "http://localhost:1/").unwrap_err(), RegistrationError::InvalidCharacters);
	assert_eq!(ctx.add_relay("has/slash", "http://localhost:1/").unwrap_err(), RegistrationError::InvalidCharacters);
	assert_eq!(ctx.add_relay("ok", "not-a-url").unwrap_err(), RegistrationError::InvalidUrl);
	assert_eq!(ctx.add_relay("ok", "ftp://localhost/").unwrap_err(), RegistrationError::UnsupportedScheme);
}

#[test]
fn relay_registration_succeeds_and_is_lookupable() {
	let ctx = RunContext::new("run-1", NetworkPolicy::permissive());
	ctx.add_relay("github", "https://api.github.com").unwrap();
	assert!(ctx.relay("github").is_some());
	assert!(ctx.relay("missing").is_none());
}

#[test]
fn duplicate_relay_name_is_rejected() {
	let ctx = RunContext::new("run-1", NetworkPolicy::permissive());
	ctx.add_relay("github", "https://api.github.com").unwrap();
	assert_eq!(ctx.add_relay("github", "https://api.github.com").unwrap_err(), RegistrationError::Duplicate("github".into()));
}

#[test]
fn extra_headers_concatenate_rather_than_replace() {
	let ctx = RunContext::new("run-1", NetworkPolicy::permissive());
	ctx.add_extra_header("api.anthropic.com", "anthropic-beta", "feature-a");
	ctx.add_extra_header("api.anthropic.com", "anthropic-beta", "feature-b");
	let headers = ctx.extra_headers_for("api.anthropic.com", 443);
	assert_eq!(headers, vec![("anthropic-beta".to_string(), "feature-a".to_string()), ("anthropic-beta".to_string(), "feature-b".to_string())]);
}

#[test]
fn removed_headers_tracked_per_host() {
	let ctx = RunContext::new("run-1", NetworkPolicy::permissive());
	ctx.remove_header("api.example.com", "X-Debug");
	assert!(ctx.removed_headers_for("api.example.com", 443).contains("x-debug"));
	assert!(ctx.removed_headers_for("other.example.com", 443).is_empty());
}

#[tokio::test]
async fn registry_register_resolve_deregister_round_trip() {
	let registry = Registry::new();
	let ctx = std::sync::Arc::new(RunContext::new("run-1", NetworkPolicy::permissive()));
	registry.register("token-1".to_string(), ctx.clone()).unwrap();
	assert!(registry.resolve("token-1").is_some());
	registry.deregister("token-1");
	assert!(registry.resolve("token-1").is_none());
}

#[test]
fn registry_rejects_duplicate_token_for_different_run() {
	let registry = Registry::new();
	let ctx_a = std::sync::Arc::new(RunContext::new("run-a", NetworkPolicy::permissive()));
	let ctx_b = std::sync::Arc::new(RunContext::new("run-b", NetworkPolicy::permissive()));
	registry.register("token-1".to_string(), ctx_a).unwrap();
	assert_eq!(registry.register("token-1".to_string(), ctx_b).unwrap_err(), RegistryError::DuplicateToken);
}

#[test]
fn registry_reregistering_same_run_is_a_no_op() {
	let registry = Registry::new();
	let ctx = std::sync::Arc::new(RunContext::new("run-a", NetworkPolicy::permissive()));
	registry.register("token-1".to_string(), ctx.clone()).unwrap();
	registry.register("token-1".to_string(), ctx).unwrap();
}
