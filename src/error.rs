use std::io;

/// Errors surfaced by a listen service to whoever drives its lifecycle.
///
/// Per-connection failures never show up here, they are handled and logged
/// inside the acceptance and pairing paths.
#[derive(Debug, thiserror::Error)]
pub enum ListenError {
	#[error("failed to bind listen port {port}: {source}")]
	Bind { port: u16, source: io::Error },
	#[error("listen service on port {port} is canceled and cannot be restarted")]
	IllegalRestart { port: u16 },
	#[error("failed to register listen port {port} with the event registrar: {source}")]
	Register { port: u16, source: io::Error },
	#[error("failed to attach control channel on port {port}: {source}")]
	ControlChannel { port: u16, source: anyhow::Error },
	#[error("a listen service for port {port} is already registered")]
	Duplicate { port: u16 },
	#[error("failed to spawn accept thread for port {port}: {source}")]
	Spawn { port: u16, source: io::Error },
}
