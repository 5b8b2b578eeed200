use std::io;
use std::sync::Weak;

use mio::{Interest, Token};

use crate::socket::ListenSocket;

/// Readiness notification handed to an [`AcceptProcessor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyKey {
	token: Token,
	valid: bool,
}

impl ReadyKey {
	pub fn new(token: Token, valid: bool) -> Self {
		Self { token, valid }
	}

	pub fn token(&self) -> Token {
		self.token
	}

	/// `false` when the poller reported an error for the registration.
	pub fn is_valid(&self) -> bool {
		self.valid
	}
}

/// Receiver of readiness events for one registered listening socket.
pub trait AcceptProcessor: Send + Sync {
	fn process(&self, key: &ReadyKey);
}

/// Multiplexed readiness source for listening sockets.
pub trait EventRegistrar: Send + Sync {
	/// Registers `socket` for `interest`. Registering an interest that is
	/// already registered for the socket is a no-op.
	fn register(&self, socket: &ListenSocket, interest: Interest, processor: Weak<dyn AcceptProcessor>) -> io::Result<()>;
	fn is_registered(&self, socket: &ListenSocket, interest: Interest) -> bool;
	fn deregister(&self, socket: &ListenSocket);
}

#[cfg(unix)]
pub use self::mio_reactor::Reactor;

#[cfg(unix)]
mod mio_reactor {
	use std::io;
	use std::os::fd::{AsRawFd, RawFd};
	use std::sync::atomic::{AtomicBool, Ordering};
	use std::sync::{Arc, Mutex, Weak};
	use std::thread::JoinHandle;

	use dashmap::DashMap;
	use mio::unix::SourceFd;
	use mio::{Events, Interest, Poll, Registry, Token, Waker};

	use super::{AcceptProcessor, EventRegistrar, ReadyKey};
	use crate::socket::ListenSocket;

	const WAKE_TOKEN: Token = Token(usize::MAX);
	const EVENTS_CAPACITY: usize = 128;

	struct Registration {
		fd: RawFd,
		interest: Interest,
		processor: Weak<dyn AcceptProcessor>,
	}

	/// Event registrar backed by a mio [`Poll`] running on its own thread.
	///
	/// mio is edge triggered, so every registration is re-armed after its
	/// processor ran. A listener that still has queued connections is
	/// reported again on the next poll.
	pub struct Reactor {
		registry: Registry,
		waker: Waker,
		registrations: Arc<DashMap<Token, Registration>>,
		shutdown: Arc<AtomicBool>,
		thread: Mutex<Option<JoinHandle<()>>>,
	}

	impl Reactor {
		pub fn start() -> io::Result<Arc<Self>> {
			let poll = Poll::new()?;
			let registry = poll.registry().try_clone()?;
			let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
			let registrations = Arc::new(DashMap::new());
			let shutdown = Arc::new(AtomicBool::new(false));

			let thread = std::thread::Builder::new().name("event-registrar".to_string()).spawn({
				let registrations = registrations.clone();
				let shutdown = shutdown.clone();
				move || run(poll, registrations, shutdown)
			})?;

			Ok(Arc::new(Self { registry, waker, registrations, shutdown, thread: Mutex::new(Some(thread)) }))
		}

		/// Stops the poll thread. Registered sockets are left untouched.
		pub fn shutdown(&self) {
			if self.shutdown.swap(true, Ordering::AcqRel) {
				return;
			}
			if let Err(e) = self.waker.wake() {
				log::warn!("Waking event registrar for shutdown: {}", e);
			}
			let thread = self.thread.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
			if let Some(thread) = thread {
				if thread.join().is_err() {
					log::error!("Event registrar thread panicked");
				}
			}
		}
	}

	fn token_for(fd: RawFd) -> Token {
		Token(fd as usize)
	}

	impl EventRegistrar for Reactor {
		fn register(&self, socket: &ListenSocket, interest: Interest, processor: Weak<dyn AcceptProcessor>) -> io::Result<()> {
			let fd = socket.as_raw_fd();
			let token = token_for(fd);
			match self.registrations.entry(token) {
				dashmap::mapref::entry::Entry::Occupied(mut entry) => {
					let registration = entry.get_mut();
					if registration.interest == interest {
						return Ok(());
					}
					let interest = registration.interest | interest;
					self.registry.reregister(&mut SourceFd(&fd), token, interest)?;
					registration.interest = interest;
					registration.processor = processor;
				}
				dashmap::mapref::entry::Entry::Vacant(entry) => {
					self.registry.register(&mut SourceFd(&fd), token, interest)?;
					entry.insert(Registration { fd, interest, processor });
				}
			}
			log::debug!("Registered listen port {} with the event registrar", socket.local_port());
			Ok(())
		}

		fn is_registered(&self, socket: &ListenSocket, interest: Interest) -> bool {
			self.registrations
				.get(&token_for(socket.as_raw_fd()))
				.map(|registration| registration.interest == (registration.interest | interest))
				.unwrap_or(false)
		}

		fn deregister(&self, socket: &ListenSocket) {
			let fd = socket.as_raw_fd();
			if self.registrations.remove(&token_for(fd)).is_none() {
				return;
			}
			if let Err(e) = self.registry.deregister(&mut SourceFd(&fd)) {
				log::debug!("Deregistering listen port {}: {}", socket.local_port(), e);
			}
		}
	}

	impl Drop for Reactor {
		fn drop(&mut self) {
			self.shutdown();
		}
	}

	fn run(mut poll: Poll, registrations: Arc<DashMap<Token, Registration>>, shutdown: Arc<AtomicBool>) {
		let mut events = Events::with_capacity(EVENTS_CAPACITY);
		loop {
			if let Err(e) = poll.poll(&mut events, None) {
				if e.kind() == io::ErrorKind::Interrupted {
					continue;
				}
				log::error!("Event registrar poll failed: {}", e);
				break;
			}
			if shutdown.load(Ordering::Acquire) {
				break;
			}

			for event in events.iter() {
				let token = event.token();
				if token == WAKE_TOKEN {
					continue;
				}
				// never hold a shard while the processor runs, it may deregister
				let Some((fd, interest, processor)) = registrations
					.get(&token)
					.map(|registration| (registration.fd, registration.interest, registration.processor.clone()))
				else {
					continue;
				};
				let Some(processor) = processor.upgrade() else {
					registrations.remove(&token);
					let _ = poll.registry().deregister(&mut SourceFd(&fd));
					continue;
				};

				processor.process(&ReadyKey::new(token, !event.is_error()));

				if registrations.contains_key(&token) {
					if let Err(e) = poll.registry().reregister(&mut SourceFd(&fd), token, interest) {
						log::debug!("Re-arming registration {:?}: {}", token, e);
					}
				}
			}
		}
		log::debug!("Event registrar stopped");
	}

}
