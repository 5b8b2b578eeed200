use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::Context;

use crate::listen::ListenService;
use crate::messages::{self, ClientToServer, ServerToClient, MAX_LINE_LEN};

/// The persistent connection a tunnel client opened to announce itself for a
/// listen port.
pub trait ControlChannel: Send + Sync {
	/// Tells the client that an external connection waits under `key`.
	/// Sends on one channel are serialized.
	fn send_client_wait(&self, key: &str) -> anyhow::Result<bool>;
	fn is_valid(&self) -> bool;
	fn close(&self) -> anyhow::Result<()>;
	/// Starts consuming what the client sends on this channel.
	fn start_recv(&self) -> anyhow::Result<()>;
}

/// Control channel speaking newline delimited JSON (see [`messages`]).
///
/// The receive thread only reads heartbeats. When the client goes away it marks
/// the channel invalid and soft-stops the owning listen service.
pub struct LineControlChannel {
	listen_port: u16,
	writer: Mutex<TcpStream>,
	// separate handle so closing never waits for a send in flight
	closer: TcpStream,
	owner: Weak<ListenService>,
	valid: Arc<AtomicBool>,
	closed: Arc<AtomicBool>,
}

impl LineControlChannel {
	pub fn new(conn: TcpStream, listen_port: u16, owner: Weak<ListenService>) -> io::Result<Self> {
		let closer = conn.try_clone()?;
		Ok(Self {
			listen_port,
			writer: Mutex::new(conn),
			closer,
			owner,
			valid: Arc::new(AtomicBool::new(true)),
			closed: Arc::new(AtomicBool::new(false)),
		})
	}
}

impl ControlChannel for LineControlChannel {
	fn send_client_wait(&self, key: &str) -> anyhow::Result<bool> {
		if !self.is_valid() {
			return Ok(false);
		}
		let line = messages::encode_line(&ServerToClient::ClientWait { socket_part_key: key.to_string() })
			.context("Encoding client wait")?;
		let mut writer = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
		let sent = writer.write_all(&line).and_then(|_| writer.flush());
		if let Err(e) = sent {
			self.valid.store(false, Ordering::Release);
			return Err(e).context(format!("Sending client wait {} on control channel {}", key, self.listen_port));
		}
		Ok(true)
	}

	fn is_valid(&self) -> bool {
		self.valid.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
	}

	fn close(&self) -> anyhow::Result<()> {
		if self.closed.swap(true, Ordering::AcqRel) {
			return Ok(());
		}
		self.valid.store(false, Ordering::Release);
		self.closer.shutdown(Shutdown::Both).context("Shutting down control channel")
	}

	fn start_recv(&self) -> anyhow::Result<()> {
		let mut reader = self.closer.try_clone().context("Cloning control channel for receiving")?;
		let port = self.listen_port;
		let owner = self.owner.clone();
		let valid = self.valid.clone();
		let closed = self.closed.clone();

		std::thread::Builder::new()
			.name(format!("control-recv-{}", port))
			.spawn(move || {
				loop {
					let line = match messages::read_line_blocking(&mut reader, MAX_LINE_LEN) {
						Ok(line) => line,
						Err(e) => {
							log::debug!("Control channel {} stopped receiving: {}", port, e);
							break;
						}
					};
					match messages::decode_line::<ClientToServer>(&line) {
						Ok(ClientToServer::Heartbeat) => log::trace!("Heartbeat on control channel {}", port),
						Ok(other) => log::warn!("Unexpected message on control channel {}: {:?}", port, other),
						Err(e) => log::warn!("Ignoring invalid control message on {}: {}", port, e),
					}
				}
				valid.store(false, Ordering::Release);
				// a channel closed by us was replaced or stopped on purpose
				if closed.load(Ordering::Acquire) {
					return;
				}
				log::info!("Tunnel client of listen port {} disconnected", port);
				if let Some(owner) = owner.upgrade() {
					owner.control_lost(|| closed.load(Ordering::Acquire));
				}
			})
			.context("Spawning control channel receiver")?;
		Ok(())
	}
}
