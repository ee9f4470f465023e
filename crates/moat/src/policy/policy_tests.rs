use super::*;

#[test]
fn wildcard_matches_subdomains_not_bare_suffix() {
	let p = HostPattern::parse("*.x.y").unwrap();
	assert!(p.matches("a.x.y", 443));
	assert!(p.matches("b.a.x.y", 443));
	assert!(!p.matches("x.y", 443));
}

#[test]
fn matching_is_case_insensitive() {
	let p = HostPattern::parse("API.Example.com").unwrap();
	assert!(p.matches("api.example.com", 443));
	assert!(p.matches("API.EXAMPLE.COM", 443));
}

#[test]
fn unspecified_port_only_matches_80_and_443() {
	let p = HostPattern::parse("example.com").unwrap();
	assert!(p.matches("example.com", 80));
	assert!(p.matches("example.com", 443));
	assert!(!p.matches("example.com", 8080));
}

#[test]
fn explicit_port_must_match_exactly() {
	let p = HostPattern::parse("example.com:8443").unwrap();
	assert!(p.matches("example.com", 8443));
	assert!(!p.matches("example.com", 443));
}

#[test]
fn invalid_port_downgrades_rather_than_failing() {
	let p = HostPattern::parse("example.com:notaport").unwrap();
	assert!(p.matches("example.com", 80));
	assert!(p.matches("example.com", 443));
	assert!(!p.matches("example.com", 1234));

	let p2 = HostPattern::parse("example.com:99999").unwrap();
	assert!(p2.matches("example.com", 443));
}

#[test]
fn no_match_fails_with_no_match_error() {
	let patterns = vec![HostPattern::parse("github.com").unwrap()];
	let err = match_host(&patterns, "evil.com", 443).unwrap_err();
	assert_eq!(err, MatchError::NoMatch { host: "evil.com".into(), port: 443 });
}

#[test]
fn grant_resolution_scoped_grant_uses_prefix() {
	let scoped = grant_hosts("github:repo");
	let unscoped = grant_hosts("github");
	assert_eq!(scoped, unscoped);
}

#[test]
fn unknown_grant_resolves_to_empty_list() {
	assert!(grant_hosts("definitely-not-a-grant").is_empty());
}

#[test]
fn grant_hosts_cover_documented_table() {
	let anthropic = grant_hosts("anthropic");
	assert!(anthropic.iter().any(|p| p.matches("api.anthropic.com", 443)));
	assert!(anthropic.iter().any(|p| p.matches("sub.anthropic.com", 443)));

	let aws = grant_hosts("aws");
	assert!(aws.iter().any(|p| p.matches("sts.amazonaws.com", 443)));
	assert!(aws.iter().any(|p| p.matches("sts.us-east-1.amazonaws.com", 443)));
}

#[test]
fn strict_policy_with_empty_allow_list_denies_everything() {
	let policy = NetworkPolicy::strict(Vec::new(), Vec::new());
	assert!(!policy.allows("anything.example.com", 443));
}

#[test]
fn permissive_policy_allows_everything() {
	let policy = NetworkPolicy::permissive();
	assert!(policy.allows("anything.example.com", 9999));
}

#[test]
fn strict_policy_allows_via_grant() {
	let policy = NetworkPolicy::strict(Vec::new(), vec!["github".to_string()]);
	assert!(policy.allows("api.github.com", 443));
	assert!(!policy.allows("evil.com", 443));
}

#[test]
fn display_round_trips_through_parse() {
	for raw in ["example.com", "example.com:8443", "*.example.com", "*.example.com:8443"] {
		let p = HostPattern::parse(raw).unwrap();
		let rendered = p.to_string();
		let reparsed = HostPattern::parse(&rendered).unwrap();
		assert_eq!(p, reparsed);
	}
}
