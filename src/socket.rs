use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};

use socket2::{Domain, Socket, Type};

const LISTEN_BACKLOG: i32 = 128;

/// A bound listening socket owned by exactly one listen service.
///
/// Binding happens in [`ListenSocket::bind`] so that the externally advertised
/// port is held from the moment the service exists. The socket stays bound
/// across soft stops and is closed once, by [`ListenSocket::close`]. An accept
/// in flight holds its own handle, so the descriptor is released as soon as
/// the last such accept returns.
#[derive(Debug)]
pub struct ListenSocket {
	socket: Mutex<Option<Arc<Socket>>>,
	port: u16,
	multiplexable: bool,
	#[cfg(unix)]
	fd: std::os::fd::RawFd,
}

impl ListenSocket {
	/// Binds `addr`. A multiplexable socket is switched to non-blocking mode and
	/// is meant to be driven by an event registrar instead of a blocking thread.
	pub fn bind(addr: SocketAddr, multiplexable: bool) -> io::Result<Self> {
		let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
		#[cfg(unix)]
		socket.set_reuse_address(true)?;
		socket.bind(&addr.into())?;
		socket.listen(LISTEN_BACKLOG)?;
		let multiplexable = multiplexable && cfg!(unix);
		socket.set_nonblocking(multiplexable)?;
		let port = socket
			.local_addr()?
			.as_socket()
			.map(|addr| addr.port())
			.unwrap_or(addr.port());
		#[cfg(unix)]
		let fd = std::os::fd::AsRawFd::as_raw_fd(&socket);
		Ok(Self {
			socket: Mutex::new(Some(Arc::new(socket))),
			port,
			multiplexable,
			#[cfg(unix)]
			fd,
		})
	}

	fn handle(&self) -> Option<Arc<Socket>> {
		self.socket.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
	}

	/// The actually bound port, useful when binding port 0.
	pub fn local_port(&self) -> u16 {
		self.port
	}

	pub fn is_multiplexable(&self) -> bool {
		self.multiplexable
	}

	/// Accepts the next connection. Blocks unless the socket is multiplexable,
	/// in which case `Ok(None)` means there is nothing to accept right now.
	pub fn accept(&self) -> io::Result<Option<TcpStream>> {
		let Some(socket) = self.handle() else {
			return Err(io::Error::new(io::ErrorKind::NotConnected, format!("listen port {} is closed", self.port)));
		};
		match socket.accept() {
			Ok((conn, peer)) => {
				let conn: TcpStream = conn.into();
				// accepted sockets may inherit O_NONBLOCK on some platforms
				conn.set_nonblocking(false)?;
				log::debug!("Accepted {:?} on listen port {}", peer.as_socket(), self.port);
				Ok(Some(conn))
			}
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
			Err(e) => Err(e),
		}
	}

	/// Closes the socket. Returns `false` if it was already closed.
	///
	/// A thread blocked in [`ListenSocket::accept`] is woken up with an error.
	pub fn close(&self) -> bool {
		let socket = self.socket.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
		let Some(socket) = socket else {
			return false;
		};
		if let Err(e) = socket.shutdown(Shutdown::Both) {
			log::debug!("Shutting down listen port {}: {}", self.port, e);
		}
		true
	}

	pub fn is_closed(&self) -> bool {
		self.handle().is_none()
	}
}

/// The descriptor the socket was bound with, kept after close so a
/// registration can still be looked up by it.
#[cfg(unix)]
impl std::os::fd::AsRawFd for ListenSocket {
	fn as_raw_fd(&self) -> std::os::fd::RawFd {
		self.fd
	}
}

#[cfg(test)]
mod tests {
	use std::net::{Ipv4Addr, TcpStream};

	use super::*;

	fn loopback() -> SocketAddr {
		SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
	}

	#[test]
	fn bind_reports_port_and_rejects_reuse() {
		let socket = ListenSocket::bind(loopback(), false).unwrap();
		let port = socket.local_port();
		assert_ne!(port, 0);

		let again = ListenSocket::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)), false);
		assert!(again.is_err());
	}

	#[test]
	fn blocking_accept_returns_connection() {
		let socket = ListenSocket::bind(loopback(), false).unwrap();
		let _client = TcpStream::connect((Ipv4Addr::LOCALHOST, socket.local_port())).unwrap();
		assert!(socket.accept().unwrap().is_some());
	}

	#[cfg(unix)]
	#[test]
	fn multiplexable_accept_does_not_block() {
		let socket = ListenSocket::bind(loopback(), true).unwrap();
		assert!(socket.is_multiplexable());
		assert!(socket.accept().unwrap().is_none());
	}

	#[test]
	fn close_happens_once() {
		let socket = ListenSocket::bind(loopback(), false).unwrap();
		assert!(socket.close());
		assert!(!socket.close());
		assert!(socket.is_closed());
		assert!(socket.accept().is_err());
	}

	#[test]
	fn close_releases_the_port() {
		let socket = ListenSocket::bind(loopback(), false).unwrap();
		let port = socket.local_port();
		assert!(socket.close());

		let rebound = ListenSocket::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)), false);
		assert!(rebound.is_ok());
	}

	#[cfg(target_os = "linux")]
	#[test]
	fn close_wakes_a_blocked_accept() {
		let socket = std::sync::Arc::new(ListenSocket::bind(loopback(), false).unwrap());
		let acceptor = std::thread::spawn({
			let socket = socket.clone();
			move || socket.accept()
		});
		std::thread::sleep(std::time::Duration::from_millis(50));
		assert!(socket.close());
		assert!(acceptor.join().unwrap().is_err());
	}
}
