use std::sync::Arc;

use dashmap::DashMap;

use crate::error::ListenError;
use crate::listen::ListenService;

/// Process-wide lookup of listen services by port.
///
/// Services deregister themselves when canceled.
#[derive(Default)]
pub struct ListenRegistry {
	services: DashMap<u16, Arc<ListenService>>,
}

impl ListenRegistry {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn insert(&self, service: Arc<ListenService>) -> Result<(), ListenError> {
		let port = service.listen_port();
		match self.services.entry(port) {
			dashmap::mapref::entry::Entry::Occupied(_) => Err(ListenError::Duplicate { port }),
			dashmap::mapref::entry::Entry::Vacant(entry) => {
				entry.insert(service);
				Ok(())
			}
		}
	}

	pub fn get(&self, port: u16) -> Option<Arc<ListenService>> {
		self.services.get(&port).map(|service| service.value().clone())
	}

	pub fn remove(&self, port: u16) -> Option<Arc<ListenService>> {
		self.services.remove(&port).map(|(_, service)| service)
	}

	pub fn contains(&self, port: u16) -> bool {
		self.services.contains_key(&port)
	}

	pub fn ports(&self) -> Vec<u16> {
		let mut ports: Vec<u16> = self.services.iter().map(|entry| *entry.key()).collect();
		ports.sort_unstable();
		ports
	}

	/// Cancels every registered service, used on shutdown.
	pub fn cancel_all(&self) {
		// cancel() removes the entry, never call it while holding a shard
		let services: Vec<Arc<ListenService>> = self.services.iter().map(|entry| entry.value().clone()).collect();
		for service in services {
			service.cancel();
		}
	}
}
