use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// One external connection ("recv") waiting for, or paired with, the
/// connection the tunnel client dialed back with ("send").
pub trait SocketPart: Send + Sync {
	fn key(&self) -> &str;
	fn set_recv(&self, conn: TcpStream);
	/// Takes the dial-back connection. A part accepts only one; any later
	/// connection is shut down and `false` returned, leaving the part as is.
	fn set_send(&self, conn: TcpStream) -> bool;
	/// Establishes the relay. Only meaningful once both endpoints are set.
	fn create_pass_way(&self) -> bool;
	/// Tears the part down. Idempotent.
	fn cancel(&self);
	fn is_valid(&self) -> bool;
}

/// Whoever holds a socket part in its registry.
pub trait PartOwner: Send + Sync {
	/// Removes the part from the registry and cancels it.
	/// Returns `false` if the key was not (or no longer) registered.
	fn stop_socket_part(&self, key: &str) -> bool;
}

#[derive(Default)]
struct Endpoints {
	recv: Option<TcpStream>,
	send: Option<TcpStream>,
	relay: Option<JoinHandle<()>>,
}

/// Socket part that relays with [`tokio::io::copy_bidirectional`] once paired.
///
/// Until paired it stays valid for `wait_timeout`, after that the sweep reaps it.
/// Once relaying it stays valid until either side closes.
pub struct RelaySocketPart {
	key: String,
	owner: Weak<dyn PartOwner>,
	runtime: Handle,
	created: Instant,
	wait_timeout: Duration,
	endpoints: Mutex<Endpoints>,
	relaying: AtomicBool,
	relay_done: Arc<AtomicBool>,
	canceled: AtomicBool,
}

impl RelaySocketPart {
	pub fn new(key: String, owner: Weak<dyn PartOwner>, runtime: Handle, wait_timeout: Duration) -> Self {
		Self {
			key,
			owner,
			runtime,
			created: Instant::now(),
			wait_timeout,
			endpoints: Mutex::new(Endpoints::default()),
			relaying: AtomicBool::new(false),
			relay_done: Arc::new(AtomicBool::new(false)),
			canceled: AtomicBool::new(false),
		}
	}

	fn endpoints(&self) -> std::sync::MutexGuard<'_, Endpoints> {
		self.endpoints.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	fn spawn_relay(&self, recv: TcpStream, send: TcpStream) -> anyhow::Result<JoinHandle<()>> {
		let _guard = self.runtime.enter();
		recv.set_nonblocking(true).context("Set recv socket non-blocking")?;
		send.set_nonblocking(true).context("Set send socket non-blocking")?;
		let mut recv = tokio::net::TcpStream::from_std(recv).context("Register recv socket with runtime")?;
		let mut send = tokio::net::TcpStream::from_std(send).context("Register send socket with runtime")?;

		let key = self.key.clone();
		let owner = self.owner.clone();
		let relay_done = self.relay_done.clone();
		Ok(self.runtime.spawn(async move {
			match tokio::io::copy_bidirectional(&mut recv, &mut send).await {
				Ok((to_client, to_external)) => {
					log::debug!("Relay {} finished, {} bytes out, {} bytes back", key, to_client, to_external)
				}
				Err(e) => log::debug!("Relay {} ended: {}", key, e),
			}
			relay_done.store(true, Ordering::Release);
			if let Some(owner) = owner.upgrade() {
				owner.stop_socket_part(&key);
			}
		}))
	}
}

impl SocketPart for RelaySocketPart {
	fn key(&self) -> &str {
		&self.key
	}

	fn set_recv(&self, conn: TcpStream) {
		let mut endpoints = self.endpoints();
		if self.canceled.load(Ordering::Acquire) {
			let _ = conn.shutdown(Shutdown::Both);
			return;
		}
		endpoints.recv = Some(conn);
	}

	fn set_send(&self, conn: TcpStream) -> bool {
		let mut endpoints = self.endpoints();
		if self.canceled.load(Ordering::Acquire) || self.relaying.load(Ordering::Acquire) || endpoints.send.is_some() {
			let _ = conn.shutdown(Shutdown::Both);
			return false;
		}
		endpoints.send = Some(conn);
		true
	}

	fn create_pass_way(&self) -> bool {
		if self.canceled.load(Ordering::Acquire) || self.relaying.swap(true, Ordering::AcqRel) {
			return false;
		}
		let mut endpoints = self.endpoints();
		let (Some(recv), Some(send)) = (endpoints.recv.take(), endpoints.send.take()) else {
			log::warn!("Socket part {} is missing an endpoint", self.key);
			return false;
		};
		match self.spawn_relay(recv, send) {
			Ok(relay) => {
				endpoints.relay = Some(relay);
				true
			}
			Err(e) => {
				log::warn!("Creating pass-way for {}: {:#}", self.key, e);
				false
			}
		}
	}

	fn cancel(&self) {
		if self.canceled.swap(true, Ordering::AcqRel) {
			return;
		}
		log::debug!("Cancel socket part {}", self.key);
		let mut endpoints = self.endpoints();
		for conn in [endpoints.recv.take(), endpoints.send.take()].into_iter().flatten() {
			let _ = conn.shutdown(Shutdown::Both);
		}
		if let Some(relay) = endpoints.relay.take() {
			relay.abort();
		}
	}

	fn is_valid(&self) -> bool {
		if self.canceled.load(Ordering::Acquire) {
			return false;
		}
		if self.relaying.load(Ordering::Acquire) {
			return !self.relay_done.load(Ordering::Acquire);
		}
		self.created.elapsed() < self.wait_timeout
	}
}

#[cfg(test)]
mod tests {
	use std::io::{Read, Write};
	use std::net::{Ipv4Addr, TcpListener};

	use dashmap::DashSet;

	use super::*;

	#[derive(Default)]
	struct RecordingOwner {
		stopped: DashSet<String>,
	}

	impl PartOwner for RecordingOwner {
		fn stop_socket_part(&self, key: &str) -> bool {
			self.stopped.insert(key.to_string())
		}
	}

	fn pair() -> (TcpStream, TcpStream) {
		let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
		let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
		let (server, _) = listener.accept().unwrap();
		(client, server)
	}

	fn part(owner: &Arc<RecordingOwner>, wait_timeout: Duration) -> RelaySocketPart {
		let owner: Arc<dyn PartOwner> = owner.clone();
		RelaySocketPart::new("SK-7000-1-test".into(), Arc::downgrade(&owner), Handle::current(), wait_timeout)
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn pending_part_expires() {
		let owner = Arc::new(RecordingOwner::default());
		let part = part(&owner, Duration::ZERO);
		assert!(!part.is_valid());
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn pass_way_needs_both_endpoints() {
		let owner = Arc::new(RecordingOwner::default());
		let part = part(&owner, Duration::from_secs(10));
		let (_external, recv) = pair();
		part.set_recv(recv);
		assert!(!part.create_pass_way());
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn relays_bytes_and_reports_end_to_owner() {
		let owner = Arc::new(RecordingOwner::default());
		let part = part(&owner, Duration::from_secs(10));
		let (mut external, recv) = pair();
		let (mut client, send) = pair();
		part.set_recv(recv);
		assert!(part.set_send(send));
		assert!(part.create_pass_way());
		assert!(part.is_valid());

		let echoed = tokio::task::spawn_blocking(move || {
			external.write_all(b"ping").unwrap();
			let mut buf = [0_u8; 4];
			client.read_exact(&mut buf).unwrap();
			client.write_all(b"pong").unwrap();
			external.read_exact(&mut buf).unwrap();
			drop(client);
			drop(external);
			buf
		})
		.await
		.unwrap();
		assert_eq!(&echoed, b"pong");

		for _ in 0..100 {
			if owner.stopped.contains("SK-7000-1-test") {
				break;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		assert!(owner.stopped.contains("SK-7000-1-test"));
		assert!(!part.is_valid());
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn cancel_is_idempotent_and_blocks_pairing() {
		let owner = Arc::new(RecordingOwner::default());
		let part = part(&owner, Duration::from_secs(10));
		let (_external, recv) = pair();
		let (_client, send) = pair();
		part.set_recv(recv);
		assert!(part.set_send(send));
		part.cancel();
		part.cancel();
		assert!(!part.is_valid());
		assert!(!part.create_pass_way());
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn second_dial_back_is_refused_and_relay_survives() {
		let owner = Arc::new(RecordingOwner::default());
		let part = part(&owner, Duration::from_secs(10));
		let (mut external, recv) = pair();
		let (mut client, send) = pair();
		part.set_recv(recv);
		assert!(part.set_send(send));
		assert!(part.create_pass_way());

		let (mut intruder, duplicate) = pair();
		assert!(!part.set_send(duplicate));
		assert!(!part.create_pass_way());
		assert!(part.is_valid());

		let (echoed, intruder_read) = tokio::task::spawn_blocking(move || {
			let mut buf = [0_u8; 4];
			let intruder_read = intruder.read(&mut buf).unwrap();
			external.write_all(b"ping").unwrap();
			client.read_exact(&mut buf).unwrap();
			client.write_all(b"pong").unwrap();
			external.read_exact(&mut buf).unwrap();
			(buf, intruder_read)
		})
		.await
		.unwrap();
		assert_eq!(&echoed, b"pong");
		assert_eq!(intruder_read, 0);
		assert!(owner.stopped.is_empty());
		part.cancel();
	}
}
