//! The per-port listen service: accepts external connections, asks the tunnel
//! client to dial back for each of them and pairs the two into a relay.

use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use mio::Interest;

use crate::config::ListenConfig;
use crate::control::ControlChannel;
use crate::error::ListenError;
use crate::executor::Executor;
use crate::reactor::{AcceptProcessor, EventRegistrar, ReadyKey};
use crate::registry::ListenRegistry;
use crate::socket::ListenSocket;
use crate::socket_part::{PartOwner, SocketPart};
use crate::sweep::SweepAgent;

/// Shared collaborators a listen service is plugged into.
#[derive(Clone)]
pub struct ListenContext {
	pub executor: Arc<dyn Executor>,
	/// Required when the bound socket is multiplexable.
	pub registrar: Option<Arc<dyn EventRegistrar>>,
	pub registry: Arc<ListenRegistry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenState {
	Created,
	Listening,
	SoftStopped,
	Canceled,
}

const ACCEPT_RUNNING: u8 = 0;
const ACCEPT_STOP_REQUESTED: u8 = 1;
const ACCEPT_EXITED: u8 = 2;

/// The dedicated accept thread. It survives a soft stop while blocked in
/// `accept`, so a restart takes back the stop request instead of spawning
/// a second thread.
struct AcceptThread {
	handle: JoinHandle<()>,
	state: Arc<AtomicU8>,
}

impl AcceptThread {
	fn request_stop(&self) {
		let _ = self.state.compare_exchange(ACCEPT_RUNNING, ACCEPT_STOP_REQUESTED, Ordering::SeqCst, Ordering::SeqCst);
	}

	/// `false` once the thread has committed to exiting.
	fn resume(&self) -> bool {
		match self.state.compare_exchange(ACCEPT_STOP_REQUESTED, ACCEPT_RUNNING, Ordering::SeqCst, Ordering::SeqCst) {
			Ok(_) => true,
			Err(current) => current == ACCEPT_RUNNING,
		}
	}
}

/// Where accepted connections come from, chosen once per `start()`.
enum AcceptSource {
	Thread(AcceptThread),
	Registered(Arc<dyn EventRegistrar>),
}

pub struct ListenService {
	me: Weak<ListenService>,
	config: Arc<dyn ListenConfig>,
	context: ListenContext,
	socket: Arc<ListenSocket>,
	port: u16,
	instance: u64,
	next_seq: AtomicU64,

	alive: AtomicBool,
	started: AtomicBool,
	canceled: AtomicBool,
	// serializes start, stop_listen and cancel
	lifecycle: Mutex<()>,

	accept_source: Mutex<Option<AcceptSource>>,
	control: Mutex<Option<Arc<dyn ControlChannel>>>,
	sweep_agent: Mutex<Option<Box<dyn SweepAgent>>>,
	socket_parts: DashMap<String, Arc<dyn SocketPart>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ListenService {
	/// Binds the listen port right away so no second service can take it.
	pub fn new(config: Arc<dyn ListenConfig>, context: ListenContext) -> Result<Arc<Self>, ListenError> {
		let socket = config
			.create_listen_socket()
			.map_err(|source| ListenError::Bind { port: config.listen_port(), source })?;
		let port = socket.local_port();
		let instance = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|elapsed| elapsed.as_nanos() as u64 & 0xffff_ffff)
			.unwrap_or_default();

		let service = Arc::new_cyclic(|me| Self {
			me: me.clone(),
			config,
			context,
			socket: Arc::new(socket),
			port,
			instance,
			next_seq: AtomicU64::new(1),
			alive: AtomicBool::new(false),
			started: AtomicBool::new(false),
			canceled: AtomicBool::new(false),
			lifecycle: Mutex::new(()),
			accept_source: Mutex::new(None),
			control: Mutex::new(None),
			sweep_agent: Mutex::new(None),
			socket_parts: DashMap::new(),
		});
		log::info!("Server listen port {} is created", port);
		Ok(service)
	}

	/// Creates the service and registers it with the context's registry.
	pub fn create(config: Arc<dyn ListenConfig>, context: ListenContext) -> Result<Arc<Self>, ListenError> {
		let registry = context.registry.clone();
		let service = Self::new(config, context)?;
		if let Err(e) = registry.insert(service.clone()) {
			service.socket.close();
			return Err(e);
		}
		Ok(service)
	}

	/// Starts (or resumes) accepting. Safe to call repeatedly.
	pub fn start(&self) -> Result<(), ListenError> {
		let result = {
			let _lifecycle = lock(&self.lifecycle);
			self.start_locked()
		};
		if let Err(e) = &result {
			if !matches!(e, ListenError::IllegalRestart { .. }) {
				log::error!("Server listen port {} failed to start: {}", self.port, e);
				self.cancel();
			}
		}
		result
	}

	fn start_locked(&self) -> Result<(), ListenError> {
		if self.canceled.load(Ordering::SeqCst) {
			return Err(ListenError::IllegalRestart { port: self.port });
		}
		self.alive.store(true, Ordering::SeqCst);
		self.started.store(true, Ordering::SeqCst);
		log::info!("Server listen port {} starting ...", self.port);

		self.start_sweep_agent();

		let mut source = lock(&self.accept_source);
		if self.socket.is_multiplexable() {
			let registrar = self.context.registrar.clone().ok_or_else(|| ListenError::Register {
				port: self.port,
				source: std::io::Error::new(std::io::ErrorKind::Unsupported, "no event registrar configured"),
			})?;
			if !registrar.is_registered(&self.socket, Interest::READABLE) {
				let processor: Weak<dyn AcceptProcessor> = self.me.clone();
				registrar
					.register(&self.socket, Interest::READABLE, processor)
					.map_err(|source| ListenError::Register { port: self.port, source })?;
			}
			*source = Some(AcceptSource::Registered(registrar));
		} else {
			let running = matches!(&*source, Some(AcceptSource::Thread(thread)) if thread.resume());
			if !running {
				*source = Some(AcceptSource::Thread(self.spawn_accept_thread()?));
			}
		}

		log::info!("Server listen port {} start success", self.port);
		Ok(())
	}

	fn start_sweep_agent(&self) {
		let mut sweep_agent = lock(&self.sweep_agent);
		if sweep_agent.is_some() {
			return;
		}
		if let Some(agent) = self.config.new_sweep_agent(self.me.clone()) {
			agent.start();
			*sweep_agent = Some(agent);
		}
	}

	fn spawn_accept_thread(&self) -> Result<AcceptThread, ListenError> {
		let state = Arc::new(AtomicU8::new(ACCEPT_RUNNING));
		let handle = std::thread::Builder::new()
			.name(format!("server-listen-{}", self.format_info()))
			.spawn({
				let service = self.me.clone();
				let socket = self.socket.clone();
				let state = state.clone();
				move || run_accept_loop(service, socket, state)
			})
			.map_err(|source| ListenError::Spawn { port: self.port, source })?;
		Ok(AcceptThread { handle, state })
	}

	/// Soft stop: drops the control channel and halts accepting, but keeps the
	/// bound socket, the registry entry and the pending socket parts.
	pub fn stop_listen(&self) {
		let _lifecycle = lock(&self.lifecycle);
		self.stop_listen_locked();
	}

	fn stop_listen_locked(&self) {
		log::info!("Stop listen {}", self.port);
		self.alive.store(false, Ordering::SeqCst);

		let control = lock(&self.control).take();
		if let Some(control) = control {
			if let Err(e) = control.close() {
				log::debug!("Closing control channel of listen port {}: {:#}", self.port, e);
			}
		}

		if let Some(AcceptSource::Thread(thread)) = &*lock(&self.accept_source) {
			// a blocked accept only notices on its next connection, or when cancel closes the socket
			thread.request_stop();
		}
	}

	/// Soft-stops on behalf of a control channel whose client went away,
	/// unless `superseded` says that channel was already replaced or closed.
	/// Checked under the lifecycle lock so it cannot race a replacement.
	pub fn control_lost(&self, superseded: impl FnOnce() -> bool) {
		let _lifecycle = lock(&self.lifecycle);
		if superseded() {
			log::debug!("Ignoring loss of a replaced control channel on {}", self.port);
			return;
		}
		self.stop_listen_locked();
	}

	/// Terminal shutdown. Only the first call does anything.
	pub fn cancel(&self) {
		if self.canceled.swap(true, Ordering::SeqCst) {
			return;
		}
		let _lifecycle = lock(&self.lifecycle);
		self.stop_listen_locked();

		self.context.registry.remove(self.port);
		log::info!("Server listen cancelling {}", self.port);

		let source = lock(&self.accept_source).take();
		if let Some(AcceptSource::Registered(registrar)) = source {
			registrar.deregister(&self.socket);
		}
		self.socket.close();

		let sweep_agent = lock(&self.sweep_agent).take();
		if let Some(sweep_agent) = sweep_agent {
			sweep_agent.cancel();
		}

		for key in self.socket_part_keys() {
			self.stop_socket_part(&key);
		}
		log::debug!("Server listen cancel {} is success", self.port);
	}

	/// Hands an accepted connection to the executor, never handled inline.
	fn dispatch_accepted(&self, conn: TcpStream) {
		let Some(service) = self.me.upgrade() else {
			return;
		};
		self.context.executor.execute(Box::new(move || service.handle_accepted(conn)));
	}

	fn handle_accepted(&self, conn: TcpStream) {
		// without a tunnel client nobody could ever pick this connection up
		let Some(control) = self.control_channel() else {
			log::debug!("No control channel on listen port {}, closing accepted connection", self.port);
			let _ = conn.shutdown(Shutdown::Both);
			return;
		};

		let key = self.next_socket_part_key();
		let owner: Weak<dyn PartOwner> = self.me.clone();
		let part = self.config.new_socket_part(key.clone(), owner);
		part.set_recv(conn);
		self.socket_parts.insert(key.clone(), part);

		if self.canceled.load(Ordering::SeqCst) {
			self.stop_socket_part(&key);
			return;
		}

		if !self.send_client_wait(control.as_ref(), &key) {
			self.stop_socket_part(&key);
			let dead = self.control_channel().map(|control| !control.is_valid()).unwrap_or(true);
			if dead {
				self.stop_listen();
			}
		}
	}

	fn send_client_wait(&self, control: &dyn ControlChannel, key: &str) -> bool {
		log::info!("Notify client of new connection {}", key);
		match control.send_client_wait(key) {
			Ok(true) => true,
			Ok(false) => {
				log::warn!("Notify client of new connection {} failed", key);
				false
			}
			Err(e) => {
				log::error!("Notify client of new connection {} failed: {:#}", key, e);
				false
			}
		}
	}

	fn next_socket_part_key(&self) -> String {
		let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
		format!("SK-{}-{}-{:x}", self.port, seq, self.instance)
	}

	/// Pairs the pending socket part `key` with the connection the tunnel
	/// client dialed back with.
	pub fn do_set_part_client(&self, key: &str, conn: TcpStream) -> bool {
		log::debug!("Set part client {}", key);
		let Some(part) = self.socket_parts.get(key).map(|entry| entry.value().clone()) else {
			log::warn!("Socket part {} on listen port {} is unknown or expired", key, self.port);
			let _ = conn.shutdown(Shutdown::Both);
			return false;
		};
		if !part.set_send(conn) {
			// the part keeps its first dial-back and whatever relay runs on it
			log::warn!("Socket part {} on listen port {} already has a client", key, self.port);
			return false;
		}

		if !part.create_pass_way() {
			log::warn!("Creating pass-way for {} failed", key);
			self.stop_socket_part(key);
			return false;
		}
		true
	}

	/// Replaces the control channel with one wrapping `conn`, then (re)starts.
	pub fn set_control_socket(&self, conn: TcpStream) -> Result<(), ListenError> {
		log::info!("Set control socket {}", self.port);
		let control = self
			.config
			.new_control_channel(conn, self.me.clone())
			.map_err(|source| ListenError::ControlChannel { port: self.port, source })?;

		{
			let _lifecycle = lock(&self.lifecycle);
			if self.canceled.load(Ordering::SeqCst) {
				let _ = control.close();
				return Err(ListenError::IllegalRestart { port: self.port });
			}

			let previous = lock(&self.control).take();
			if let Some(previous) = previous {
				if let Err(e) = previous.close() {
					log::debug!("Closing previous control channel of listen port {}: {:#}", self.port, e);
				}
			}

			if let Err(source) = control.start_recv() {
				let _ = control.close();
				return Err(ListenError::ControlChannel { port: self.port, source });
			}
			*lock(&self.control) = Some(control);
		}

		self.start()
	}

	/// Drops every socket part that reports itself invalid.
	pub fn clear_invalid_socket_part(&self) -> usize {
		log::debug!("Clear invalid socket parts {}", self.port);
		let mut cleared = 0;
		for key in self.socket_part_keys() {
			// the key may be gone already, the part is not held while checking
			let Some(part) = self.socket_parts.get(&key).map(|entry| entry.value().clone()) else {
				continue;
			};
			if !part.is_valid() && self.stop_socket_part(&key) {
				cleared += 1;
			}
		}
		cleared
	}

	fn control_channel(&self) -> Option<Arc<dyn ControlChannel>> {
		lock(&self.control).clone()
	}

	pub fn listen_port(&self) -> u16 {
		self.port
	}

	pub fn is_alive(&self) -> bool {
		self.alive.load(Ordering::SeqCst)
	}

	pub fn is_canceled(&self) -> bool {
		self.canceled.load(Ordering::SeqCst)
	}

	pub fn has_control(&self) -> bool {
		lock(&self.control).is_some()
	}

	pub fn state(&self) -> ListenState {
		if self.is_canceled() {
			ListenState::Canceled
		} else if self.is_alive() {
			ListenState::Listening
		} else if self.started.load(Ordering::SeqCst) {
			ListenState::SoftStopped
		} else {
			ListenState::Created
		}
	}

	/// Snapshot of pending and relaying socket part keys.
	pub fn socket_part_keys(&self) -> Vec<String> {
		self.socket_parts.iter().map(|entry| entry.key().clone()).collect()
	}

	pub fn socket_parts(&self) -> &DashMap<String, Arc<dyn SocketPart>> {
		&self.socket_parts
	}

	pub fn config(&self) -> &Arc<dyn ListenConfig> {
		&self.config
	}

	pub fn format_info(&self) -> String {
		self.port.to_string()
	}
}

impl PartOwner for ListenService {
	fn stop_socket_part(&self, key: &str) -> bool {
		log::debug!("Stop socket part {}", key);
		// whoever removes the entry cancels the part
		let Some((_, part)) = self.socket_parts.remove(key) else {
			return false;
		};
		part.cancel();
		true
	}
}

impl AcceptProcessor for ListenService {
	fn process(&self, key: &ReadyKey) {
		if !key.is_valid() {
			log::warn!("Listen port {} got an invalid readiness key", self.port);
			self.cancel();
			return;
		}
		match self.socket.accept() {
			Ok(Some(conn)) => self.dispatch_accepted(conn),
			Ok(None) => {}
			Err(e) => {
				if self.is_canceled() {
					return;
				}
				log::warn!("Listen service {} accept failed: {}", self.port, e);
				self.cancel();
			}
		}
	}
}

fn run_accept_loop(service: Weak<ListenService>, socket: Arc<ListenSocket>, state: Arc<AtomicU8>) {
	loop {
		let accepted = socket.accept();
		if state
			.compare_exchange(ACCEPT_STOP_REQUESTED, ACCEPT_EXITED, Ordering::SeqCst, Ordering::SeqCst)
			.is_ok()
		{
			// soft-stopped while blocked, the connection is dropped unanswered
			break;
		}
		let Some(service) = service.upgrade() else {
			state.store(ACCEPT_EXITED, Ordering::SeqCst);
			break;
		};
		match accepted {
			Ok(Some(conn)) => service.dispatch_accepted(conn),
			Ok(None) => {}
			Err(e) => {
				let previous = state.swap(ACCEPT_EXITED, Ordering::SeqCst);
				if previous == ACCEPT_RUNNING && !service.is_canceled() {
					log::warn!("Listen service {} accept failed: {}", service.port, e);
					service.cancel();
				}
				break;
			}
		}
	}
	log::debug!("Accept thread of listen port {} stopped", socket.local_port());
}
