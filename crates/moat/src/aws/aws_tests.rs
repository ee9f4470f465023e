use super::*;

#[test]
fn rfc3339_formats_known_instant() {
	let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_735_729_200); // 2025-01-01T12:20:00Z-ish
	let s = format_rfc3339(t);
	assert!(s.ends_with('Z'));
	assert_eq!(&s[0..4], "2025");
}

#[test]
fn needs_refresh_true_within_buffer() {
	let creds = AwsCreds {
		access_key_id: "AKIA".into(),
		secret_access_key: "secret".into(),
		session_token: "token".into(),
		expires_at: SystemTime::now() + Duration::from_secs(60),
	};
	assert!(needs_refresh(&creds));
}

#[test]
fn needs_refresh_false_outside_buffer() {
	let creds = AwsCreds {
		access_key_id: "AKIA".into(),
		secret_access_key: "secret".into(),
		session_token: "token".into(),
		expires_at: SystemTime::now() + Duration::from_secs(3600),
	};
	assert!(!needs_refresh(&creds));
}

#[test]
fn needs_refresh_true_when_already_expired() {
	let creds = AwsCreds {
		access_key_id: "AKIA".into(),
		secret_access_key: "secret".into(),
		session_token: "token".into(),
		expires_at: SystemTime::now() - Duration::from_secs(60),
	};
	assert!(needs_refresh(&creds));
}

#[test]
fn ecs_response_shape_matches_spec() {
	let creds = AwsCreds {
		access_key_id: "AKIAEXAMPLE".into(),
		secret_access_key: "secret".into(),
		session_token: "token".into(),
		expires_at: SystemTime::now() + Duration::from_secs(3600),
	};
	let response = EcsCredentialResponse::from(&creds);
	let json = serde_json::to_value(&response).unwrap();
	assert_eq!(json["Version"], 1);
	assert_eq!(json["AccessKeyId"], "AKIAEXAMPLE");
	assert!(json["Expiration"].as_str().unwrap().ends_with('Z'));
}
