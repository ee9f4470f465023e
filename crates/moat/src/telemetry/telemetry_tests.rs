use super::*;
use crate::client::full_body;

#[test]
fn text_like_content_types() {
	assert!(is_text_like("text/plain"));
	assert!(is_text_like("text/html; charset=utf-8"));
	assert!(is_text_like("application/json"));
	assert!(is_text_like("APPLICATION/JSON"));
	assert!(is_text_like("application/xml"));
	assert!(is_text_like("application/x-www-form-urlencoded"));
	assert!(is_text_like("application/javascript"));
	assert!(!is_text_like("image/png"));
	assert!(!is_text_like("application/octet-stream"));
}

#[tokio::test]
async fn capture_truncates_but_forwards_full_body() {
	let original = bytes::Bytes::from_static(b"hello world, this is a longer body than the cap");
	let (teed, capture) = body::inspect_body(full_body(original.clone()), 10);

	use http_body_util::BodyExt;
	let forwarded = teed.collect().await.unwrap().to_bytes();
	assert_eq!(forwarded, original, "forwarded body must be byte-identical to the source");

	let captured = capture.lock();
	assert_eq!(captured.bytes.len(), 10);
	assert!(captured.truncated);
}

#[tokio::test]
async fn capture_does_not_truncate_small_bodies() {
	let original = bytes::Bytes::from_static(b"small");
	let (teed, capture) = body::inspect_body(full_body(original.clone()), 1024);
	use http_body_util::BodyExt;
	let forwarded = teed.collect().await.unwrap().to_bytes();
	assert_eq!(forwarded, original);
	let captured = capture.lock();
	assert_eq!(&captured.bytes[..], &original[..]);
	assert!(!captured.truncated);
}

#[test]
fn redact_headers_drops_proxy_headers_and_redacts_injected_value() {
	let mut headers = http::HeaderMap::new();
	headers.insert("Authorization", "Bearer real-secret".parse().unwrap());
	headers.insert("Proxy-Authorization", "Basic xyz".parse().unwrap());
	headers.insert("Proxy-Connection", "keep-alive".parse().unwrap());
	headers.insert("X-Other", "value".parse().unwrap());

	let redacted = redact_headers(&headers, true, Some("Authorization"));
	let map: std::collections::HashMap<_, _> = redacted.into_iter().collect();
	assert_eq!(map.get("Authorization").unwrap(), "[REDACTED]");
	assert!(!map.contains_key("Proxy-Authorization"));
	assert!(!map.contains_key("Proxy-Connection"));
	assert_eq!(map.get("X-Other").unwrap(), "value");
}

#[test]
fn redact_headers_joins_multi_value_headers_with_commas() {
	let mut headers = http::HeaderMap::new();
	headers.append("anthropic-beta", "feature-a".parse().unwrap());
	headers.append("anthropic-beta", "feature-b".parse().unwrap());
	let redacted = redact_headers(&headers, false, None);
	let map: std::collections::HashMap<_, _> = redacted.into_iter().collect();
	assert_eq!(map.get("anthropic-beta").unwrap(), "feature-a,feature-b");
}
