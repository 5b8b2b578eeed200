//! The shared service port every tunnel client talks to. The first line of a
//! connection decides whether it becomes a control channel or the dial-back
//! connection of a pending socket part.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};

use crate::messages::{self, ClientToServer, MAX_LINE_LEN};
use crate::registry::ListenRegistry;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts tunnel client connections until the listener fails.
pub async fn serve(listener: TcpListener, registry: Arc<ListenRegistry>) -> anyhow::Result<()> {
	loop {
		let (conn, addr) = listener.accept().await.context("Accepting tunnel client")?;
		log::debug!("Tunnel client connected from {}", addr);
		let registry = registry.clone();
		tokio::spawn(async move {
			if let Err(e) = handle_connection(conn, addr, registry).await {
				log::warn!("Tunnel client connection from {} failed: {:#}", addr, e);
			}
		});
	}
}

async fn handle_connection(mut conn: TcpStream, addr: SocketAddr, registry: Arc<ListenRegistry>) -> anyhow::Result<()> {
	let line = tokio::time::timeout(HANDSHAKE_TIMEOUT, messages::read_line(&mut conn, MAX_LINE_LEN))
		.await
		.context("Waiting for the first line")?
		.context("Reading the first line")?;
	let message: ClientToServer = messages::decode_line(&line).context(format!("Parsing first line {:?}", line))?;

	// the listen service works on blocking sockets
	let conn = conn.into_std().context("Detaching connection from the runtime")?;
	conn.set_nonblocking(false).context("Switching connection to blocking")?;

	match message {
		ClientToServer::Control { listen_port } => {
			let service = registry.get(listen_port).context(format!("No listen service on port {}", listen_port))?;
			tokio::task::spawn_blocking(move || service.set_control_socket(conn))
				.await
				.context("Attaching control channel")??;
			log::info!("Tunnel client {} took control of listen port {}", addr, listen_port);
		}
		ClientToServer::Connect { listen_port, socket_part_key } => {
			let service = registry.get(listen_port).context(format!("No listen service on port {}", listen_port))?;
			let paired = tokio::task::spawn_blocking({
				let socket_part_key = socket_part_key.clone();
				move || service.do_set_part_client(&socket_part_key, conn)
			})
			.await
			.context("Pairing socket part")?;
			anyhow::ensure!(paired, "Socket part {} could not be paired", socket_part_key);
			log::info!("Socket part {} paired with {}", socket_part_key, addr);
		}
		ClientToServer::Heartbeat => anyhow::bail!("Heartbeat before the connection was announced"),
	}
	Ok(())
}
