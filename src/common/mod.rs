pub mod commands;
pub mod envelope;
pub mod events;
pub mod types;

pub use commands::ClientCommand;
pub use envelope::{DecodeError, Envelope, MessageKind, Payload};
pub use events::ClientEvent;
pub use types::{PresenceKind, UserEntry};
