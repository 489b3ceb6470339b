pub mod client;
pub mod connection_manager;
pub mod protocol;
pub mod server;
pub mod transport;

pub use protocol::{Frame, MessageType, ProtocolError};
