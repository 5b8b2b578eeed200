use std::sync::{Mutex, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::listen::ListenService;

/// Periodically asks its listen service to purge dead socket parts.
pub trait SweepAgent: Send + Sync {
	fn start(&self);
	fn cancel(&self);
}

/// Sweep agent driven by a [`tokio::time::interval`].
pub struct IntervalSweeper {
	owner: Weak<ListenService>,
	runtime: Handle,
	period: Duration,
	task: Mutex<Option<JoinHandle<()>>>,
}

impl IntervalSweeper {
	pub fn new(owner: Weak<ListenService>, runtime: Handle, period: Duration) -> Self {
		Self { owner, runtime, period, task: Mutex::new(None) }
	}
}

impl SweepAgent for IntervalSweeper {
	fn start(&self) {
		let mut task = self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
		if task.is_some() {
			return;
		}
		let owner = self.owner.clone();
		let period = self.period;
		*task = Some(self.runtime.spawn(async move {
			let mut interval = tokio::time::interval(period);
			// the first tick completes immediately
			interval.tick().await;
			loop {
				interval.tick().await;
				let Some(service) = owner.upgrade() else {
					break;
				};
				if service.is_canceled() {
					break;
				}
				// sweeping cancels parts, which may touch blocking sockets
				let swept = tokio::task::spawn_blocking(move || service.clear_invalid_socket_part()).await;
				if let Err(e) = swept {
					log::warn!("Sweep of invalid socket parts failed: {}", e);
				}
			}
		}));
	}

	fn cancel(&self) {
		let task = self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
		if let Some(task) = task {
			task.abort();
		}
	}
}
