//! Proxy authentication and the shared token-extraction logic
//! the dispatcher uses to resolve a `RunContext`.

use base64::Engine;
use subtle::ConstantTimeEq;

/// Extracts the bearer token from `Proxy-Authorization: Bearer <token>` or
/// `Basic base64(user:token)` (user is ignored, password is the token).
/// Returns `None` for any other form — the caller treats that identically to
/// a wrong token so failure never reveals which form was expected.
pub fn token_from_proxy_authorization(header: &str) -> Option<String> {
	if let Some(token) = header.strip_prefix("Bearer ") {
		return Some(token.trim().to_string());
	}
	if let Some(encoded) = header.strip_prefix("Basic ") {
		let decoded = base64::engine::general_purpose::STANDARD.decode(encoded.trim()).ok()?;
		let decoded = String::from_utf8(decoded).ok()?;
		let (_, password) = decoded.split_once(':')?;
		return Some(password.to_string());
	}
	None
}

/// Extracts the bearer token from a plain `Authorization: Bearer <token>`
/// header, used by the direct AWS endpoint.
pub fn token_from_bearer_authorization(header: &str) -> Option<String> {
	header.strip_prefix("Bearer ").map(|t| t.trim().to_string())
}

/// Constant-time comparison so a mismatched or partially-correct token takes
/// the same time to reject as a correct one.
pub fn tokens_match(expected: &str, actual: &str) -> bool {
	expected.as_bytes().ct_eq(actual.as_bytes()).into()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bearer_form_extracts_token() {
		assert_eq!(token_from_proxy_authorization("Bearer abc123"), Some("abc123".to_string()));
	}

	#[test]
	fn basic_form_extracts_password_ignores_user() {
		let encoded = base64::engine::general_purpose::STANDARD.encode("anyuser:the-token");
		let header = format!("Basic {encoded}");
		assert_eq!(token_from_proxy_authorization(&header), Some("the-token".to_string()));
	}

	#[test]
	fn unrecognized_scheme_yields_none() {
		assert_eq!(token_from_proxy_authorization("Digest abc"), None);
	}

	#[test]
	fn constant_time_match_is_correct() {
		assert!(tokens_match("secret", "secret"));
		assert!(!tokens_match("secret", "wrong"));
		assert!(!tokens_match("secret", "secretlonger"));
	}
}
