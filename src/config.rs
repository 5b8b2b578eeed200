use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use crate::control::{ControlChannel, LineControlChannel};
use crate::listen::ListenService;
use crate::socket::ListenSocket;
use crate::socket_part::{PartOwner, RelaySocketPart, SocketPart};
use crate::sweep::{IntervalSweeper, SweepAgent};

pub const DEFAULT_SERVICE_PORT: u16 = 10010;

/// One externally exposed port and the private destination behind it.
///
/// The destination is only meaningful to the tunnel client, the server never dials it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
	pub listen_port: u16,
	pub dest_ip: String,
	pub dest_port: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptMode {
	/// One blocking accept thread per listen port.
	#[default]
	Thread,
	/// Listen ports share the event registrar.
	Reactor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
	/// Address the listen ports and the service port bind to.
	pub service_ip: IpAddr,
	/// Port tunnel clients connect to, both for control channels and callbacks.
	pub service_port: u16,
	pub listen: Vec<PortMapping>,
	pub sweep_interval_secs: u64,
	/// How long an accepted connection waits for the tunnel client to dial back.
	pub part_wait_timeout_secs: u64,
	pub accept_mode: AcceptMode,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			service_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
			service_port: DEFAULT_SERVICE_PORT,
			listen: Vec::new(),
			sweep_interval_secs: 10,
			part_wait_timeout_secs: 20,
			accept_mode: AcceptMode::default(),
		}
	}
}

impl ServerConfig {
	pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
		let path = path.as_ref();
		let raw = std::fs::read_to_string(path).context(format!("Reading config file {}", path.display()))?;
		let config: ServerConfig =
			serde_json::from_str(&raw).context(format!("Parsing config file {}", path.display()))?;
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> anyhow::Result<()> {
		let mut seen = std::collections::HashSet::new();
		for mapping in &self.listen {
			anyhow::ensure!(
				seen.insert(mapping.listen_port),
				"listen port {} is mapped more than once",
				mapping.listen_port
			);
			anyhow::ensure!(
				mapping.listen_port != self.service_port,
				"listen port {} collides with the service port",
				mapping.listen_port
			);
		}
		anyhow::ensure!(self.sweep_interval_secs > 0, "sweep_interval_secs must be positive");
		Ok(())
	}

	pub fn service_addr(&self) -> SocketAddr {
		SocketAddr::new(self.service_ip, self.service_port)
	}

	/// Listen configuration for one mapping, collaborators run on `runtime`.
	pub fn listen_config(&self, mapping: &PortMapping, runtime: Handle) -> TcpListenConfig {
		TcpListenConfig {
			bind_addr: SocketAddr::new(self.service_ip, mapping.listen_port),
			multiplexable: self.accept_mode == AcceptMode::Reactor,
			sweep_interval: Duration::from_secs(self.sweep_interval_secs),
			part_wait_timeout: Duration::from_secs(self.part_wait_timeout_secs),
			runtime,
		}
	}
}

/// Everything a listen service creates on its own: the bound socket, socket
/// parts, control channels and its sweep agent.
pub trait ListenConfig: Send + Sync + 'static {
	fn listen_port(&self) -> u16;
	/// Must fail fast when the port is taken.
	fn create_listen_socket(&self) -> io::Result<ListenSocket>;
	fn new_socket_part(&self, key: String, owner: Weak<dyn PartOwner>) -> Arc<dyn SocketPart>;
	/// Returns an unstarted channel bound to `owner`.
	fn new_control_channel(&self, conn: TcpStream, owner: Weak<ListenService>) -> anyhow::Result<Arc<dyn ControlChannel>>;
	/// `None` disables sweeping.
	fn new_sweep_agent(&self, owner: Weak<ListenService>) -> Option<Box<dyn SweepAgent>>;
}

/// Production [`ListenConfig`]: TCP sockets, line control channels and relays on tokio.
#[derive(Debug, Clone)]
pub struct TcpListenConfig {
	pub bind_addr: SocketAddr,
	pub multiplexable: bool,
	pub sweep_interval: Duration,
	pub part_wait_timeout: Duration,
	pub runtime: Handle,
}

impl ListenConfig for TcpListenConfig {
	fn listen_port(&self) -> u16 {
		self.bind_addr.port()
	}

	fn create_listen_socket(&self) -> io::Result<ListenSocket> {
		ListenSocket::bind(self.bind_addr, self.multiplexable)
	}

	fn new_socket_part(&self, key: String, owner: Weak<dyn PartOwner>) -> Arc<dyn SocketPart> {
		Arc::new(RelaySocketPart::new(key, owner, self.runtime.clone(), self.part_wait_timeout))
	}

	fn new_control_channel(&self, conn: TcpStream, owner: Weak<ListenService>) -> anyhow::Result<Arc<dyn ControlChannel>> {
		conn.set_nodelay(true).context("Disable nagle on control channel")?;
		let channel = LineControlChannel::new(conn, self.listen_port(), owner).context("Cloning control channel")?;
		Ok(Arc::new(channel))
	}

	fn new_sweep_agent(&self, owner: Weak<ListenService>) -> Option<Box<dyn SweepAgent>> {
		Some(Box::new(IntervalSweeper::new(owner, self.runtime.clone(), self.sweep_interval)))
	}
}
