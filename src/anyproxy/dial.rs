//! The external `dial()` surface consumed by proxy front-ends, and the
//! gateway-side plumbing that turns a dial into a `Connect` frame plus a
//! registered logical connection.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rand::RngCore;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::warn;

use crate::anyproxy::group::{ClientRecord, GroupRegistry};
use crate::anyproxy::metrics::Metrics;
use crate::anyproxy::tunnel::connection_manager::LocalHandle;
use crate::anyproxy::tunnel::protocol::{ConnId, Frame, Network, CONN_ID_LEN};

/// Default capacity of the in-process pipe bridged into the front-end.
const PIPE_BUFFER: usize = 64 * 1024;

pub type BidirectionalStream = tokio::io::DuplexStream;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DialError {
    #[error("no healthy clients in group")]
    NoClients,
    #[error("tunnel to selected client is gone")]
    TunnelClosed,
}

/// `dial(group, network, addr, user_ctx) -> BidirectionalStream`.
///
/// `user_ctx` in this codebase is just the caller-chosen `group_id`; the
/// front-ends own any richer per-request context and only need this single
/// call to get a socket-like stream back.
pub async fn dial(
    registry: &GroupRegistry,
    metrics: &Arc<Metrics>,
    group_id: &str,
    network: Network,
    address: &str,
) -> Result<BidirectionalStream, DialError> {
    let client = registry
        .select_client(group_id)
        .await
        .ok_or(DialError::NoClients)?;
    open_logical_connection(client, metrics, network, address).await
}

/// Dials through one specific client, bypassing group selection. Used by
/// the port-forward manager, which must route through the owning client.
pub async fn dial_client(
    client: ClientRecord,
    metrics: &Arc<Metrics>,
    network: Network,
    address: &str,
) -> Result<BidirectionalStream, DialError> {
    open_logical_connection(client, metrics, network, address).await
}

async fn open_logical_connection(
    client: ClientRecord,
    metrics: &Arc<Metrics>,
    network: Network,
    address: &str,
) -> Result<BidirectionalStream, DialError> {
    let conn_id = new_conn_id();

    let (gateway_end, front_end) = tokio::io::duplex(PIPE_BUFFER);
    let (read_half, write_half) = tokio::io::split(gateway_end);

    let handle: Arc<dyn LocalHandle> = Arc::new(PipeLocalHandle {
        write_half: tokio::sync::Mutex::new(write_half),
    });

    client.connections.add(conn_id, handle).await;

    if client
        .writer
        .send(Frame::Connect {
            conn_id,
            network,
            address: address.to_string(),
        })
        .await
        .is_err()
    {
        client.connections.remove(conn_id).await;
        metrics.inc_dial_failures();
        return Err(DialError::TunnelClosed);
    }

    spawn_reader(conn_id, read_half, client.clone());

    Ok(front_end)
}

fn new_conn_id() -> ConnId {
    let mut id = [0u8; CONN_ID_LEN];
    rand::rng().fill_bytes(&mut id);
    id
}

/// Writes incoming `Data`/`ConnectResponse` frames into the front-end's side
/// of the duplex pipe. `ConnectResponse{ok=false}` or any local-socket write
/// error tells the connection manager to tear the LC down.
struct PipeLocalHandle {
    write_half: tokio::sync::Mutex<tokio::io::WriteHalf<tokio::io::DuplexStream>>,
}

#[async_trait]
impl LocalHandle for PipeLocalHandle {
    async fn on_frame(&self, frame: Frame) -> bool {
        match frame {
            Frame::Data { payload, .. } => {
                let mut w = self.write_half.lock().await;
                w.write_all(&payload).await.is_ok()
            }
            Frame::ConnectResponse { ok, .. } => ok,
            _ => true,
        }
    }

    async fn close(&self) {
        let mut w = self.write_half.lock().await;
        let _ = w.shutdown().await;
    }
}

/// One reader task per local socket bridged into a tunnel (§5): reads bytes
/// written by the front-end into the pipe and forwards them upstream as
/// `Data` frames until EOF or error, then emits `Close` and cleans up.
fn spawn_reader(
    conn_id: ConnId,
    mut read_half: tokio::io::ReadHalf<tokio::io::DuplexStream>,
    client: ClientRecord,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            let n = match read_half.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(?conn_id, error = %e, "local pipe read error");
                    break;
                }
            };
            let frame = Frame::Data {
                conn_id,
                payload: Bytes::copy_from_slice(&buf[..n]),
            };
            if client.writer.send(frame).await.is_err() {
                break;
            }
        }
        let _ = client.writer.send(Frame::Close { conn_id }).await;
        client.connections.remove(conn_id).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anyproxy::tunnel::connection_manager::ConnectionManager;
    use tokio::sync::mpsc;

    fn client_with(writer: mpsc::Sender<Frame>) -> ClientRecord {
        let (tx, _rx) = mpsc::channel(8);
        ClientRecord {
            client_id: "c1".into(),
            group_id: "G".into(),
            writer,
            connections: ConnectionManager::new(tx, Arc::new(Metrics::new())),
        }
    }

    #[tokio::test]
    async fn dial_with_no_clients_returns_no_clients() {
        let registry = GroupRegistry::new();
        let metrics = Arc::new(Metrics::new());
        let err = dial(&registry, &metrics, "G", Network::Tcp, "example.com:80")
            .await
            .unwrap_err();
        assert_eq!(err, DialError::NoClients);
    }

    #[tokio::test]
    async fn dial_client_sends_connect_and_bridges_data() {
        let (writer_tx, mut writer_rx) = mpsc::channel(8);
        let client = client_with(writer_tx);
        let metrics = Arc::new(Metrics::new());

        let mut stream = dial_client(client, &metrics, Network::Tcp, "example.com:80")
            .await
            .unwrap();

        let first = writer_rx.recv().await.unwrap();
        match first {
            Frame::Connect { network, address, .. } => {
                assert_eq!(network, Network::Tcp);
                assert_eq!(address, "example.com:80");
            }
            other => panic!("expected Connect, got {other:?}"),
        }

        stream.write_all(b"hello").await.unwrap();
        let second = writer_rx.recv().await.unwrap();
        match second {
            Frame::Data { payload, .. } => assert_eq!(&payload[..], b"hello"),
            other => panic!("expected Data, got {other:?}"),
        }
    }
}
