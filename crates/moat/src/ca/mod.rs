//! Self-signed root CA and per-host leaf certificate factory.
//!
//! Follows the `load_or_create_ca` / `issue_host_certificate_pem` shape
//! common to MITM proxies, generating 2048-bit RSA throughout rather than
//! ECDSA.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::RngCore;
use rcgen::{
	BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, Issuer,
	IsCa, KeyPair, KeyUsagePurpose, SanType, PKCS_RSA_SHA256,
};
use rustls_pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use thiserror::Error;
use tokio::sync::OnceCell;

#[cfg(test)]
#[path = "ca_tests.rs"]
mod tests;

#[derive(Error, Debug)]
pub enum CertError {
	#[error("certificate generation failed: {0}")]
	Generation(#[from] rcgen::Error),
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error("ca materials at {0} are corrupt: {1}")]
	Corrupt(PathBuf, String),
}

/// A generated leaf certificate plus the chain a TLS server config needs
/// (leaf first, root last — the chain must include the root certificate
/// after the leaf).
pub struct LeafCert {
	pub chain: Vec<CertificateDer<'static>>,
	pub key: PrivatePkcs8KeyDer<'static>,
}

/// The root CA plus a single-flight, per-host leaf cache.
pub struct CertFactory {
	root_der: CertificateDer<'static>,
	issuer: Issuer<'static, KeyPair>,
	cache: parking_lot::Mutex<HashMap<String, Arc<OnceCell<Arc<LeafCert>>>>>,
}

const ROOT_VALIDITY_DAYS: i64 = 365 * 10;
const LEAF_VALIDITY_DAYS: i64 = 365;

impl CertFactory {
	/// Loads an existing root from `dir` (`ca.crt` / `ca.key`), or generates
	/// and persists a new one. `dir` is created if missing.
	pub async fn load_or_create(dir: &Path) -> Result<Self, CertError> {
		fs_err::tokio::create_dir_all(dir).await?;
		let crt_path = dir.join("ca.crt");
		let key_path = dir.join("ca.key");

		if crt_path.exists() && key_path.exists() {
			Self::load(&crt_path, &key_path).await
		} else {
			let factory = Self::generate()?;
			factory.persist(&crt_path, &key_path).await?;
			Ok(factory)
		}
	}

	async fn load(crt_path: &Path, key_path: &Path) -> Result<Self, CertError> {
		let cert_pem = fs_err::tokio::read_to_string(crt_path).await?;
		let key_pem = fs_err::tokio::read_to_string(key_path).await?;

		let key_pair =
			KeyPair::from_pem(&key_pem).map_err(|e| CertError::Corrupt(key_path.to_path_buf(), e.to_string()))?;
		let params = CertificateParams::from_ca_cert_pem(&cert_pem)
			.map_err(|e| CertError::Corrupt(crt_path.to_path_buf(), e.to_string()))?;
		let root = params.self_signed(&key_pair)?;
		let root_der = root.der().clone();
		let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
			.map_err(|e| CertError::Corrupt(crt_path.to_path_buf(), e.to_string()))?;

		Ok(CertFactory { root_der, issuer, cache: parking_lot::Mutex::new(HashMap::new()) })
	}

	fn generate() -> Result<Self, CertError> {
		let key_pair = KeyPair::generate_for(&PKCS_RSA_SHA256)?;

		let mut params = CertificateParams::new(Vec::<String>::new())?;
		params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
		params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
		params.not_before = rcgen::date_time_ymd(2020, 1, 1);
		params.not_after = (std::time::SystemTime::now() + std::time::Duration::from_secs(ROOT_VALIDITY_DAYS as u64 * 86400)).into();
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, "Moat Local Dev CA");
		dn.push(DnType::OrganizationName, "Moat");
		params.distinguished_name = dn;

		let root = params.self_signed(&key_pair)?;
		let root_der = root.der().clone();
		let root_pem = root.pem();
		let issuer = Issuer::from_ca_cert_pem(&root_pem, key_pair)?;

		Ok(CertFactory { root_der, issuer, cache: parking_lot::Mutex::new(HashMap::new()) })
	}

	async fn persist(&self, crt_path: &Path, key_path: &Path) -> Result<(), CertError> {
		let cert_pem = pem_for_der(&self.root_der);
		fs_err::tokio::write(crt_path, cert_pem.as_bytes()).await?;
		set_permissions(crt_path, 0o644)?;

		let key_pem = self.issuer.key_pair().serialize_pem();
		fs_err::tokio::write(key_path, key_pem.as_bytes()).await?;
		set_permissions(key_path, 0o600)?;
		Ok(())
	}

	/// `GenerateCert(host)` — returns a cached leaf if present, otherwise
	/// generates exactly once per host even under concurrent callers
	///.
	pub async fn generate_cert(&self, host: &str) -> Result<Arc<LeafCert>, CertError> {
		let cell = {
			let mut cache = self.cache.lock();
			cache.entry(host.to_string()).or_insert_with(|| Arc::new(OnceCell::new())).clone()
		};
		cell
			.get_or_try_init(|| async { self.issue_leaf(host).map(Arc::new) })
			.await
			.cloned()
	}

	fn issue_leaf(&self, host: &str) -> Result<LeafCert, CertError> {
		let key_pair = KeyPair::generate_for(&PKCS_RSA_SHA256)?;

		let mut params = if let Ok(ip) = host.parse::<IpAddr>() {
			let mut p = CertificateParams::new(Vec::<String>::new())?;
			p.subject_alt_names.push(SanType::IpAddress(ip));
			p
		} else {
			CertificateParams::new(vec![host.to_string()])?
		};
		params.is_ca = IsCa::NoCa;
		params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
		params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, host);
		params.distinguished_name = dn;
		params.serial_number = Some(rcgen::SerialNumber::from(random_serial()));
		params.not_before = (std::time::SystemTime::now() - std::time::Duration::from_secs(3600)).into();
		params.not_after = (std::time::SystemTime::now() + std::time::Duration::from_secs(LEAF_VALIDITY_DAYS as u64 * 86400)).into();

		let leaf = params.signed_by(&key_pair, &self.issuer)?;
		let leaf_der = leaf.der().clone();
		let key_der = PrivatePkcs8KeyDer::from(key_pair.serialize_der());

		Ok(LeafCert { chain: vec![leaf_der, self.root_der.clone()], key: key_der })
	}

	pub fn root_der(&self) -> &CertificateDer<'static> {
		&self.root_der
	}
}

/// Serial numbers must stay within the 2^62 bound, drawn from the crypto
/// RNG rather than a counter.
fn random_serial() -> Vec<u8> {
	let mut bytes = [0u8; 8];
	rand::thread_rng().fill_bytes(&mut bytes);
	let mut v = u64::from_be_bytes(bytes);
	v &= (1u64 << 62) - 1;
	v.to_be_bytes().to_vec()
}

fn pem_for_der(der: &CertificateDer<'static>) -> String {
	use base64::Engine;
	let b64 = base64::engine::general_purpose::STANDARD.encode(der.as_ref());
	let mut out = String::from("-----BEGIN CERTIFICATE-----\n");
	for chunk in b64.as_bytes().chunks(64) {
		out.push_str(std::str::from_utf8(chunk).unwrap());
		out.push('\n');
	}
	out.push_str("-----END CERTIFICATE-----\n");
	out
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) -> Result<(), std::io::Error> {
	use std::os::unix::fs::PermissionsExt;
	std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path, _mode: u32) -> Result<(), std::io::Error> {
	Ok(())
}
