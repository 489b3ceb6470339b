//! Length-prefixed TCP transport: the simplest substrate, one TCP stream per
//! tunnel with a 4-byte big-endian length prefix in front of every message.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use super::{Connection, HandshakeMetadata, Transport, TransportError, TransportListener, MAX_FRAME_SIZE};

#[derive(Debug, Serialize, Deserialize)]
struct HandshakeWire {
    client_id: String,
    group_id: String,
    password: String,
}

impl From<&HandshakeMetadata> for HandshakeWire {
    fn from(m: &HandshakeMetadata) -> Self {
        Self {
            client_id: m.client_id.clone(),
            group_id: m.group_id.clone(),
            password: m.password.clone(),
        }
    }
}

impl From<HandshakeWire> for HandshakeMetadata {
    fn from(w: HandshakeWire) -> Self {
        Self {
            client_id: w.client_id,
            group_id: w.group_id,
            password: w.password,
        }
    }
}

pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(&self, addr: &str) -> Result<Box<dyn TransportListener>, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Box::new(TcpTransportListener { listener }))
    }

    async fn dial(
        &self,
        addr: &str,
        handshake: HandshakeMetadata,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true).ok();
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let (read_half, write_half) = stream.into_split();
        let conn = TcpConnection {
            reader: Mutex::new(BufReader::new(read_half)),
            writer: Mutex::new(BufWriter::new(write_half)),
            metadata: handshake,
            peer_addr,
        };
        conn.write_handshake().await?;
        Ok(Box::new(conn))
    }
}

struct TcpTransportListener {
    listener: TcpListener,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&mut self) -> Result<Box<dyn Connection>, TransportError> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let metadata = read_handshake(&mut reader).await?;
        let conn = TcpConnection {
            reader: Mutex::new(reader),
            writer: Mutex::new(BufWriter::new(write_half)),
            metadata,
            peer_addr: peer.to_string(),
        };
        Ok(Box::new(conn))
    }
}

/// Reader and writer halves are each guarded by their own lock so the tunnel
/// core's single receive task and single writer task never contend with one
/// another, only (harmlessly) with themselves.
struct TcpConnection {
    reader: Mutex<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    writer: Mutex<BufWriter<tokio::net::tcp::OwnedWriteHalf>>,
    metadata: HandshakeMetadata,
    peer_addr: String,
}

/// Reads the one handshake frame a freshly-accepted stream must send before
/// anything else, directly off the raw reader half. Runs before the
/// `TcpConnection` exists, so `metadata` never needs to change after
/// construction.
async fn read_handshake(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
) -> Result<HandshakeMetadata, TransportError> {
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::Closed)
        }
        Err(e) => return Err(e.into()),
    };
    let len = len as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    let wire: HandshakeWire = serde_json::from_slice(&buf)
        .map_err(|e| TransportError::Handshake(e.to_string()))?;
    Ok(wire.into())
}

impl TcpConnection {
    async fn write_handshake(&self) -> Result<(), TransportError> {
        let wire = HandshakeWire::from(&self.metadata);
        let bytes = serde_json::to_vec(&wire)
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        self.write_raw(&bytes).await
    }

    async fn write_raw(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(bytes.len()));
        }
        let mut writer = self.writer.lock().await;
        writer.write_u32(bytes.len() as u32).await?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_raw(&self) -> Result<Bytes, TransportError> {
        let mut reader = self.reader.lock().await;
        let len = match reader.read_u32().await {
            Ok(len) => len,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(TransportError::Closed)
            }
            Err(e) => return Err(e.into()),
        };
        let len = len as usize;
        if len > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(len));
        }
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn read_message(&self) -> Result<Bytes, TransportError> {
        self.read_raw().await
    }

    async fn write_message(&self, msg: Bytes) -> Result<(), TransportError> {
        self.write_raw(&msg).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.writer.lock().await.shutdown().await.ok();
        Ok(())
    }

    fn metadata(&self) -> &HandshakeMetadata {
        &self.metadata
    }

    fn peer_addr(&self) -> String {
        self.peer_addr.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anyproxy::tunnel::protocol::Frame;

    #[tokio::test]
    async fn tcp_transport_round_trips_handshake_and_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bound = listener.local_addr().unwrap();
        let mut wrapped = TcpTransportListener { listener };

        let dial_handshake = HandshakeMetadata {
            client_id: "agent-1".into(),
            group_id: "G".into(),
            password: "secret".into(),
        };

        let dial_task = tokio::spawn(async move {
            let transport = TcpTransport::new();
            transport.dial(&bound.to_string(), dial_handshake).await
        });

        let mut server_conn = wrapped.accept().await.unwrap();
        let mut client_conn = dial_task.await.unwrap().unwrap();

        assert_eq!(server_conn.metadata().client_id, "agent-1");
        assert_eq!(server_conn.metadata().group_id, "G");
        assert_eq!(server_conn.metadata().password, "secret");

        let frame = Frame::Ping.encode();
        client_conn.write_message(frame.clone()).await.unwrap();
        let received = server_conn.read_message().await.unwrap();
        assert_eq!(received, frame);
    }
}
