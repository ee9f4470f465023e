//! `moat serve` — stands up one proxy engine and runs until interrupted.
//! Registration of runs, container launching, and worktree/journaling
//! concerns are external collaborators and stay out of this binary; it
//! exposes just enough to get one `RunContext` onto the registry so the
//! proxy is reachable end to end.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use moat::{Config, Engine, Listener, RawConfig, Registry, RunContext};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "moat", about = "Credential-injecting intercepting proxy for agent CLI runs")]
struct Args {
	/// Path to a YAML config file. Missing file is not an error: defaults apply.
	#[arg(long)]
	config: Option<PathBuf>,

	/// Overrides `listen_addr` from the config file.
	#[arg(long)]
	listen: Option<SocketAddr>,

	/// Overrides `ca_dir` from the config file.
	#[arg(long)]
	ca_dir: Option<PathBuf>,

	#[arg(long, value_enum, default_value_t = LogFormat::Text)]
	log_format: LogFormat,
}

#[derive(Copy, Clone, Debug, clap::ValueEnum)]
enum LogFormat {
	Text,
	Json,
}

fn init_tracing(format: LogFormat) {
	let filter = tracing_subscriber::EnvFilter::try_from_env("MOAT_LOG").unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
	let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
	match format {
		LogFormat::Text => subscriber.init(),
		LogFormat::Json => subscriber.json().init(),
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	init_tracing(args.log_format);

	let mut config = load_config(args.config.as_deref())?;
	if let Some(listen) = args.listen {
		config.listen_addr = listen;
	}
	if let Some(ca_dir) = args.ca_dir {
		config.ca_dir = ca_dir;
	}

	// Bind first: an upstream chain's managed entries need the engine's real
	// bound address (not the configured one, which may be the `:0` ephemeral
	// wildcard) to point their last hop at the core proxy.
	let listener = Listener::bind(config.listen_addr).await.context("failed to bind listen address")?;
	let engine = Arc::new(build_engine(&config, listener.local_addr).await?);
	info!(addr = %listener.local_addr, "moat proxy ready");

	let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
	tokio::spawn(async move {
		let _ = tokio::signal::ctrl_c().await;
		let _ = shutdown_tx.send(true);
	});

	listener.serve(engine, shutdown_rx).await;
	Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<Config> {
	let raw = match path {
		Some(path) if path.exists() => {
			let text = fs_err::read_to_string(path).context("failed to read config file")?;
			RawConfig::from_yaml(&text).context("failed to parse config file")?
		}
		_ => RawConfig::default(),
	};
	raw.resolve().context("invalid configuration")
}

/// Builds the engine and registers exactly one `RunContext`, keyed on the
/// engine's own auth token (or the empty token, in single-run no-auth mode).
/// A real deployment's run-registration control surface is external to this
/// binary; this is the minimum needed to drive one run through the listener
/// for local use and integration tests. `bound_addr` must be the listener's
/// actual local address (post-bind), not the configured one, since an
/// upstream chain's last managed entry needs the engine's real port.
async fn build_engine(config: &Config, bound_addr: SocketAddr) -> anyhow::Result<Engine> {
	let cert_factory = match moat::ca::CertFactory::load_or_create(&config.ca_dir).await {
		Ok(factory) => Some(Arc::new(factory)),
		Err(e) => {
			tracing::warn!(error = %e, "failed to initialize ca; connect requests will tunnel only");
			None
		}
	};

	let registry = Arc::new(Registry::new());
	let mut run_ctx = RunContext::new(uuid::Uuid::new_v4().to_string(), config.network_policy.clone());

	if let Some(aws) = &config.aws {
		let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
		let sts_client = aws_sdk_sts::Client::new(&sdk_config);
		let provider = moat::aws::AwsCredentialProvider::new(
			sts_client,
			moat::aws::AssumeRoleParams {
				role_arn: aws.role_arn.clone(),
				role_session_name: aws.role_session_name.clone(),
				duration_seconds: aws.duration_seconds,
				external_id: aws.external_id.clone(),
			},
		);
		run_ctx = run_ctx.with_aws_handler(Arc::new(provider));
	}

	if !config.upstream_chain.is_empty() {
		let chain = moat::chain::UpstreamChain::start(config.upstream_chain.clone(), bound_addr).await?;
		run_ctx = run_ctx.with_upstream_chain(Arc::new(chain));
	}

	registry.register(config.auth_token.clone().unwrap_or_default(), Arc::new(run_ctx))?;

	Ok(Engine::new(registry, cert_factory, config.auth_token.clone(), config.max_body_log_bytes))
}
