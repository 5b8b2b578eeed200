use tokio::runtime::Handle;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs per-connection work off the accept thread and the reactor thread.
pub trait Executor: Send + Sync {
	/// Fire and forget, no ordering between unrelated tasks.
	fn execute(&self, task: Task);
}

/// Runs tasks on the blocking pool of a tokio runtime, acceptance handlers
/// block on control channel writes.
#[derive(Clone)]
pub struct TokioExecutor {
	runtime: Handle,
}

impl TokioExecutor {
	pub fn new(runtime: Handle) -> Self {
		Self { runtime }
	}

	/// Uses the runtime of the calling context. Panics outside of a runtime.
	pub fn current() -> Self {
		Self::new(Handle::current())
	}
}

impl Executor for TokioExecutor {
	fn execute(&self, task: Task) {
		drop(self.runtime.spawn_blocking(task));
	}
}

#[cfg(test)]
mod tests {
	use std::sync::mpsc;
	use std::time::Duration;

	use super::*;

	#[tokio::test]
	async fn runs_task_on_blocking_pool() {
		let (tx, rx) = mpsc::channel();
		TokioExecutor::current().execute(Box::new(move || {
			tx.send(std::thread::current().name().map(str::to_string)).unwrap();
		}));
		let name = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(5)).unwrap())
			.await
			.unwrap();
		assert!(name.is_some());
	}
}
