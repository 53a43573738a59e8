pub mod client;
pub mod peers;
pub mod server;

pub use client::{ChatClient, ClientConfig, ClientError};
pub use server::{RendezvousServer, ServerConfig};

/// UDP receive buffer size, enough for any datagram this protocol sends.
pub(crate) const MAX_DATAGRAM: usize = 65_535;
