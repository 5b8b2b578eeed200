//! Reverse tunnel relay: exposes listen ports on a public host and pairs every
//! external connection with a connection the tunnel client dials back with.

pub mod config;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod listen;
pub mod messages;
pub mod reactor;
pub mod registry;
pub mod socket;
pub mod socket_part;
pub mod sweep;

pub use config::{ListenConfig, PortMapping, ServerConfig, TcpListenConfig};
pub use error::ListenError;
pub use listen::{ListenContext, ListenService, ListenState};
pub use registry::ListenRegistry;
