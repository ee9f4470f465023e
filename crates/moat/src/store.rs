//! Credential store façade. The engine never reads or writes
//! files directly; it consults this interface. In daemon mode the store is
//! absent and credentials instead arrive on the `RunContext` itself.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct StoredCredential {
	pub value: String,
	/// Side-channel data the MCP OAuth refresh path needs, e.g. `refresh_token`,
	/// `expires_at` (RFC3339). Never logged.
	pub metadata: HashMap<String, String>,
}

impl std::fmt::Debug for StoredCredential {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("StoredCredential").field("value", &"[REDACTED]").field("metadata", &"[REDACTED]").finish()
	}
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StoreError {
	#[error("no credential for provider `{0}`")]
	NotFound(String),
	#[error("store io error: {0}")]
	Io(String),
}

/// The on-disk credential vault lives outside this crate; this trait is the seam the engine talks to.
#[async_trait]
pub trait CredentialStore: Send + Sync {
	async fn get(&self, provider: &str) -> Result<StoredCredential, StoreError>;
	async fn list(&self) -> Vec<String>;
	async fn set(&self, provider: &str, credential: StoredCredential) -> Result<(), StoreError>;
	async fn remove(&self, provider: &str) -> Result<(), StoreError>;
}

/// An in-memory store, useful for tests and for embedders that don't need a
/// persistent vault. Not used by `moat-cli` in daemon mode.
#[derive(Default)]
pub struct MemoryCredentialStore {
	inner: tokio::sync::RwLock<HashMap<String, StoredCredential>>,
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
	async fn get(&self, provider: &str) -> Result<StoredCredential, StoreError> {
		self.inner.read().await.get(provider).cloned().ok_or_else(|| StoreError::NotFound(provider.to_string()))
	}

	async fn list(&self) -> Vec<String> {
		self.inner.read().await.keys().cloned().collect()
	}

	async fn set(&self, provider: &str, credential: StoredCredential) -> Result<(), StoreError> {
		self.inner.write().await.insert(provider.to_string(), credential);
		Ok(())
	}

	async fn remove(&self, provider: &str) -> Result<(), StoreError> {
		self.inner.write().await.remove(provider);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn memory_store_round_trips() {
		let store = MemoryCredentialStore::default();
		store.set("mcp-test", StoredCredential { value: "real-secret".into(), metadata: HashMap::new() }).await.unwrap();
		let got = store.get("mcp-test").await.unwrap();
		assert_eq!(got.value, "real-secret");
		assert_eq!(store.list().await, vec!["mcp-test".to_string()]);
	}

	#[tokio::test]
	async fn missing_provider_is_not_found() {
		let store = MemoryCredentialStore::default();
		assert_eq!(store.get("nope").await.unwrap_err(), StoreError::NotFound("nope".into()));
	}
}
