//! Running on the computer that should be reachable from outside

use std::error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tunnel_relay::config::AcceptMode;
use tunnel_relay::executor::TokioExecutor;
use tunnel_relay::reactor::EventRegistrar;
use tunnel_relay::{dispatch, ListenContext, ListenRegistry, ListenService, ServerConfig};

#[derive(clap::Parser, Debug, Clone)]
struct Cli {
	/// JSON file with the port mappings, e.g. `relay.json`.
	#[arg(long)]
	config: PathBuf,
	/// Overrides the address tunnel clients connect to, e.g. `0.0.0.0:10010`.
	#[arg(long)]
	service_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn error::Error>> {
	env_logger::init();
	let cli_args = Cli::parse();

	let mut config = ServerConfig::load(&cli_args.config)?;
	if let Some(service_addr) = cli_args.service_addr {
		config.service_ip = service_addr.ip();
		config.service_port = service_addr.port();
		config.validate()?;
	}

	#[cfg(unix)]
	let reactor = match config.accept_mode {
		AcceptMode::Reactor => Some(tunnel_relay::reactor::Reactor::start().context("Starting event registrar")?),
		AcceptMode::Thread => None,
	};
	#[cfg(unix)]
	let registrar = reactor.clone().map(|reactor| reactor as Arc<dyn EventRegistrar>);
	#[cfg(not(unix))]
	let registrar: Option<Arc<dyn EventRegistrar>> = None;
	if config.accept_mode == AcceptMode::Reactor && registrar.is_none() {
		log::warn!("Event registrar is not available on this platform, using accept threads");
	}

	let registry = ListenRegistry::new();
	let context = ListenContext {
		executor: Arc::new(TokioExecutor::current()),
		registrar,
		registry: registry.clone(),
	};

	for mapping in &config.listen {
		let listen_config = Arc::new(config.listen_config(mapping, tokio::runtime::Handle::current()));
		ListenService::create(listen_config, context.clone())
			.context(format!("Creating listen service for port {}", mapping.listen_port))?;
		log::info!(
			"Listen port {} forwards to {}:{} once a tunnel client attaches",
			mapping.listen_port,
			mapping.dest_ip,
			mapping.dest_port
		);
	}

	let service_addr = config.service_addr();
	let service_listener = TcpListener::bind(service_addr)
		.await
		.context(format!("Listening for tunnel clients on {}", service_addr))?;
	log::info!("Listening for tunnel clients on {}", service_addr);

	let result = tokio::select! {
		result = dispatch::serve(service_listener, registry.clone()) => result,
		result = tokio::signal::ctrl_c() => result.context("Waiting for Ctrl+C"),
	};

	log::info!("Shutting down listen ports {:?}", registry.ports());
	let shutdown_registry = registry.clone();
	tokio::task::spawn_blocking(move || shutdown_registry.cancel_all()).await?;
	#[cfg(unix)]
	let _ = reactor.map(|reactor| reactor.shutdown());
	Ok(result?)
}
