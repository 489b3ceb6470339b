//! Abstract framed message transport.
//!
//! The tunnel core is transport-agnostic: it only needs something that can
//! hand it reliable, ordered, message-boundary-preserving frames plus a bit
//! of handshake metadata. Concrete substrates (length-prefixed TCP, QUIC) live
//! in sibling modules and implement [`Transport`].

pub mod quic;
pub mod tcp;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("message exceeds maximum frame size ({0} bytes)")]
    FrameTooLarge(usize),
    #[error("connection closed")]
    Closed,
    #[error("tls error: {0}")]
    Tls(String),
}

/// Maximum size of a single message this transport will pack or accept.
/// `Data` frames carrying large bodies are expected to be chunked by the
/// caller rather than sent as one oversized message.
pub const MAX_FRAME_SIZE: usize = 1 << 20;

/// Handshake metadata carried out-of-band by the transport (HTTP headers,
/// gRPC metadata, QUIC connection attributes, ...). Immutable for the
/// lifetime of the connection.
#[derive(Debug, Clone, Default)]
pub struct HandshakeMetadata {
    pub client_id: String,
    pub group_id: String,
    pub password: String,
}

/// One established, message-framed connection to a peer.
///
/// Methods take `&self`, not `&mut self`: the tunnel core runs one task that
/// only ever calls `read_message` and a separate single-writer task that
/// only ever calls `write_message` (§5), so implementations guard their read
/// half and write half with independent interior locks rather than forcing
/// a single exclusive borrow across both directions.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn read_message(&self) -> Result<Bytes, TransportError>;
    async fn write_message(&self, msg: Bytes) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
    fn metadata(&self) -> &HandshakeMetadata;
    fn peer_addr(&self) -> String;
}

#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn accept(&mut self) -> Result<Box<dyn Connection>, TransportError>;
}

/// A transport substrate: binds listeners and dials outbound connections.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn listen(&self, addr: &str) -> Result<Box<dyn TransportListener>, TransportError>;

    async fn dial(
        &self,
        addr: &str,
        handshake: HandshakeMetadata,
    ) -> Result<Box<dyn Connection>, TransportError>;
}

/// TLS material for a listening transport, loaded by the caller (certificate
/// and key loading itself is explicitly out of scope for the tunnel core).
#[derive(Debug, Clone)]
pub struct TlsIdentity {
    pub cert_chain_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    pub server_name: String,
    pub insecure_skip_verify: bool,
}
