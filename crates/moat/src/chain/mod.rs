//! Upstream proxy chain. An ordered list of either external
//! proxy URLs or locally-managed subprocesses, started in order and torn
//! down in reverse, with each managed entry's outbound env wired to the next
//! hop (or to the core proxy's own address for the last entry — design
//! note §9 "Chain subprocess lifetime").

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{info, warn};

#[cfg(test)]
#[path = "chain_tests.rs"]
mod tests;

#[derive(Clone, Debug)]
pub enum ChainEntry {
	/// An already-running proxy the chain should hop through, identified by
	/// name for logging and `EntryAddress` lookups.
	External { name: String, url: url::Url },
	/// A subprocess started by the chain itself, addressed on a loopback
	/// port allocated at start time.
	Managed { name: String, image: String, env: HashMap<String, String> },
}

impl ChainEntry {
	fn name(&self) -> &str {
		match self {
			ChainEntry::External { name, .. } => name,
			ChainEntry::Managed { name, .. } => name,
		}
	}
}

#[derive(Error, Debug)]
pub enum ChainError {
	#[error("chain entry `{name}` failed to start: {source}")]
	StartFailed { name: String, source: std::io::Error },
	#[error("chain entry `{name}` did not become ready within the poll deadline")]
	NotReady { name: String },
	#[error("failed to allocate a loopback port for `{name}`: {source}")]
	PortAllocation { name: String, source: std::io::Error },
}

enum StartedEntry {
	External { name: String, addr: SocketAddr },
	Managed { name: String, addr: SocketAddr, child: Child },
}

impl StartedEntry {
	fn name(&self) -> &str {
		match self {
			StartedEntry::External { name, .. } => name,
			StartedEntry::Managed { name, .. } => name,
		}
	}

	fn addr(&self) -> SocketAddr {
		match self {
			StartedEntry::External { addr, .. } => *addr,
			StartedEntry::Managed { addr, .. } => *addr,
		}
	}
}

const READINESS_POLL_TOTAL: Duration = Duration::from_secs(15);
const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(500);
const TEARDOWN_GRACE: Duration = Duration::from_secs(3);

/// A started chain: owns any managed subprocesses and the transport used to
/// route the engine's own onward traffic through `entries[0]` when external
/// hops are declared.
pub struct UpstreamChain {
	entries: Vec<StartedEntry>,
}

impl UpstreamChain {
	/// Starts every declared entry in order. `core_proxy_addr` is the
	/// engine's own bound address, used to point the *last* managed entry's
	/// outbound env at the core proxy (design note §9); every other managed
	/// entry points at the next declared entry's address.
	///
	/// Addresses are resolved for every entry up front (a pass with no
	/// side effects to roll back — DNS lookups for external entries, a
	/// bind-then-drop loopback port reservation for managed ones) so that
	/// entry `i`, when actually started, already knows entry `i+1`'s
	/// address. Entries are then started for real in declaration order; on
	/// the first failure, everything already started is stopped in reverse
	/// order.
	pub async fn start(declared: Vec<ChainEntry>, core_proxy_addr: SocketAddr) -> Result<Self, ChainError> {
		let mut addrs: Vec<SocketAddr> = Vec::with_capacity(declared.len());
		for entry in &declared {
			let addr = match entry {
				ChainEntry::External { name, url } => {
					resolve_external(url).await.map_err(|source| ChainError::StartFailed { name: name.clone(), source })?
				}
				ChainEntry::Managed { name, .. } => allocate_loopback_addr(name).await?,
			};
			addrs.push(addr);
		}

		let mut started: Vec<StartedEntry> = Vec::new();

		for (i, entry) in declared.iter().enumerate() {
			let next_addr = next_addr_for(&addrs, i, core_proxy_addr);

			let result = match entry {
				ChainEntry::External { name, .. } => Ok(StartedEntry::External { name: name.clone(), addr: addrs[i] }),
				ChainEntry::Managed { name, image, env } => start_managed(name, image, env, addrs[i], next_addr).await,
			};

			match result {
				Ok(s) => {
					info!(entry = s.name(), addr = %s.addr(), next = %next_addr, "chain entry started");
					started.push(s);
				}
				Err(e) => {
					warn!(error = %e, entry = entry.name(), "chain entry failed to start; rolling back");
					stop_all(started).await;
					return Err(e);
				}
			}
		}

		Ok(UpstreamChain { entries: started })
	}

	pub fn entry_address(&self, name: &str) -> Option<SocketAddr> {
		self.entries.iter().find(|e| e.name() == name).map(|e| e.addr())
	}

	pub fn names(&self) -> Vec<String> {
		self.entries.iter().map(|e| e.name().to_string()).collect()
	}

	/// The address the engine's own onward requests should be sent to when a
	/// chain is configured — the first declared hop.
	pub fn first_hop(&self) -> Option<SocketAddr> {
		self.entries.first().map(|e| e.addr())
	}

	/// Idempotent, reverse-order, best-effort teardown.
	pub async fn stop(&mut self) {
		let entries = std::mem::take(&mut self.entries);
		stop_all(entries).await;
	}
}

async fn stop_all(entries: Vec<StartedEntry>) {
	for entry in entries.into_iter().rev() {
		match entry {
			StartedEntry::External { name, .. } => {
				info!(entry = %name, "external chain entry has no subprocess to stop");
			}
			StartedEntry::Managed { name, mut child, .. } => {
				stop_managed(&name, &mut child).await;
			}
		}
	}
}

async fn stop_managed(name: &str, child: &mut Child) {
	if let Some(pid) = child.id() {
		#[cfg(unix)]
		unsafe {
			libc::kill(pid as i32, libc::SIGTERM);
		}
		match tokio::time::timeout(TEARDOWN_GRACE, child.wait()).await {
			Ok(_) => info!(entry = name, "chain entry exited after interrupt"),
			Err(_) => {
				warn!(entry = name, "chain entry did not exit within grace period; killing");
				let _ = child.kill().await;
			}
		}
	}
}

async fn resolve_external(url: &url::Url) -> Result<SocketAddr, std::io::Error> {
	let host = url.host_str().ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "chain url has no host"))?;
	let port = url.port_or_known_default().unwrap_or(80);
	tokio::net::lookup_host((host, port))
		.await?
		.next()
		.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "chain url did not resolve"))
}

/// What a managed entry at index `i` should point its outbound env at: the
/// next declared entry's address, or `core_proxy_addr` if `i` is the last
/// entry.
fn next_addr_for(addrs: &[SocketAddr], i: usize, core_proxy_addr: SocketAddr) -> SocketAddr {
	addrs.get(i + 1).copied().unwrap_or(core_proxy_addr)
}

/// Reserves a loopback port for a managed entry by binding then immediately
/// dropping a listener, so its address is known before the entry (or its
/// successor, which needs this address) actually starts.
async fn allocate_loopback_addr(name: &str) -> Result<SocketAddr, ChainError> {
	let listener = TcpListener::bind(("127.0.0.1", 0))
		.await
		.map_err(|source| ChainError::PortAllocation { name: name.to_string(), source })?;
	let addr = listener.local_addr().map_err(|source| ChainError::PortAllocation { name: name.to_string(), source })?;
	drop(listener);
	Ok(addr)
}

async fn start_managed(
	name: &str,
	image: &str,
	env: &HashMap<String, String>,
	addr: SocketAddr,
	next_addr: SocketAddr,
) -> Result<StartedEntry, ChainError> {
	let proxy_url = format!("http://{next_addr}");
	let mut cmd = Command::new(image);
	cmd.envs(env.iter());
	cmd.env("HTTP_PROXY", &proxy_url);
	cmd.env("HTTPS_PROXY", &proxy_url);
	cmd.env("http_proxy", &proxy_url);
	cmd.env("https_proxy", &proxy_url);
	cmd.env("PORT", addr.port().to_string());
	cmd.kill_on_drop(true);

	let child = cmd.spawn().map_err(|source| ChainError::StartFailed { name: name.to_string(), source })?;

	wait_for_ready(name, addr).await?;

	Ok(StartedEntry::Managed { name: name.to_string(), addr, child })
}

async fn wait_for_ready(name: &str, addr: SocketAddr) -> Result<(), ChainError> {
	let deadline = Instant::now() + READINESS_POLL_TOTAL;
	loop {
		if tokio::net::TcpStream::connect(addr).await.is_ok() {
			return Ok(());
		}
		if Instant::now() >= deadline {
			return Err(ChainError::NotReady { name: name.to_string() });
		}
		tokio::time::sleep(READINESS_POLL_INTERVAL).await;
	}
}
