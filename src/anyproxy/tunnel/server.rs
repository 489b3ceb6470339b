//! Gateway tunnel endpoint: accepts connections on a [`Transport`] listener,
//! validates group credentials, registers the client, and serves `dial()`
//! requests against it until the tunnel closes (§4.4.2).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::anyproxy::group::GroupRegistry;
use crate::anyproxy::metrics::Metrics;
use crate::anyproxy::portforward::PortForwardManager;
use crate::anyproxy::tunnel::connection_manager::ConnectionManager;
use crate::anyproxy::tunnel::protocol::Frame;
use crate::anyproxy::tunnel::transport::{Connection, Transport, TransportListener};

/// Liveness deadlines for every long-running I/O loop (§5): a read or write
/// that stalls past these is treated as a dead connection, not a slow one.
const READ_DEADLINE: Duration = Duration::from_secs(30);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(30);

pub struct GatewayTunnelServer {
    transport: Arc<dyn Transport>,
    registry: Arc<GroupRegistry>,
    port_forwards: Arc<PortForwardManager>,
    metrics: Arc<Metrics>,
}

impl GatewayTunnelServer {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<GroupRegistry>,
        port_forwards: Arc<PortForwardManager>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            transport,
            registry,
            port_forwards,
            metrics,
        }
    }

    /// Binds `addr` and accepts tunnels until `shutdown` fires. Each accepted
    /// tunnel is handled on its own task so a slow handshake or a stuck peer
    /// never blocks the accept loop.
    pub async fn run(&self, addr: &str, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut listener = self.transport.listen(addr).await?;
        info!(%addr, "gateway: listening for tunnels");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                accepted = listener.accept() => {
                    let conn = match accepted {
                        Ok(conn) => conn,
                        Err(err) => {
                            warn!(error = %err, "gateway: accept failed");
                            continue;
                        }
                    };
                    self.spawn_tunnel(conn, shutdown.clone());
                }
            }
        }
    }

    fn spawn_tunnel(&self, conn: Box<dyn Connection>, shutdown: watch::Receiver<bool>) {
        let registry = self.registry.clone();
        let port_forwards = self.port_forwards.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_tunnel(conn, registry, port_forwards, metrics, shutdown).await {
                warn!(error = %err, "gateway: tunnel ended with error");
            }
        });
    }
}

/// Handles exactly one accepted tunnel from handshake validation through
/// teardown. Runs entirely on its own task; errors here only end this
/// tunnel, never the accept loop.
async fn serve_tunnel(
    conn: Box<dyn Connection>,
    registry: Arc<GroupRegistry>,
    port_forwards: Arc<PortForwardManager>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let meta = conn.metadata().clone();
    let peer = conn.peer_addr();

    let conn: Arc<dyn Connection> = Arc::from(conn);
    let (writer_tx, writer_rx) = mpsc::channel::<Frame>(256);
    let connections = ConnectionManager::new(writer_tx.clone(), metrics.clone());

    if let Err(err) = registry
        .register_client(
            meta.client_id.clone(),
            meta.group_id.clone(),
            meta.password.clone(),
            writer_tx.clone(),
            connections.clone(),
        )
        .await
    {
        warn!(client_id = %meta.client_id, group_id = %meta.group_id, %peer, error = %err, "gateway: rejecting tunnel handshake");
        let _ = conn
            .write_message(
                Frame::Error {
                    message: err.to_string(),
                }
                .encode(),
            )
            .await;
        conn.close().await.ok();
        return Ok(());
    }

    info!(client_id = %meta.client_id, group_id = %meta.group_id, %peer, "gateway: client registered");

    let writer_task = tokio::spawn(run_writer(conn.clone(), writer_rx, metrics.clone()));

    let result = receive_loop(
        &conn,
        &meta.client_id,
        &connections,
        &port_forwards,
        &writer_tx,
        &mut shutdown,
        &metrics,
    )
    .await;

    registry.unregister_client(&meta.client_id).await;
    port_forwards.release_client(&meta.client_id).await;
    connections.close_all().await;
    writer_task.abort();
    conn.close().await.ok();

    info!(client_id = %meta.client_id, group_id = %meta.group_id, %peer, "gateway: client disconnected");

    result
}

async fn receive_loop(
    conn: &Arc<dyn Connection>,
    client_id: &str,
    connections: &Arc<ConnectionManager>,
    port_forwards: &Arc<PortForwardManager>,
    writer_tx: &mpsc::Sender<Frame>,
    shutdown: &mut watch::Receiver<bool>,
    metrics: &Arc<Metrics>,
) -> anyhow::Result<()> {
    let mut ping_interval =
        tokio::time::interval_at(tokio::time::Instant::now() + PING_INTERVAL, PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            _ = ping_interval.tick() => {
                let _ = writer_tx.send(Frame::Ping).await;
            }
            msg = tokio::time::timeout(READ_DEADLINE, conn.read_message()) => {
                let bytes = msg.map_err(|_| anyhow::anyhow!("tunnel read timed out"))??;
                metrics.inc_frames_received();
                let frame = Frame::decode(&bytes)?;
                match frame {
                    Frame::ConnectResponse { .. } | Frame::Data { .. } | Frame::Close { .. } => {
                        connections.route(frame).await;
                    }
                    Frame::PortForwardRequest { entries, .. } => {
                        let response = port_forwards.reserve(client_id, entries).await;
                        let _ = writer_tx.send(response).await;
                    }
                    Frame::Ping => {}
                    other => {
                        tracing::debug!(?other, "gateway: unexpected frame on tunnel");
                    }
                }
            }
        }
    }
}

/// Single writer task per tunnel (§5): every outbound frame funnels through
/// one owner of the connection's write half.
async fn run_writer(conn: Arc<dyn Connection>, mut rx: mpsc::Receiver<Frame>, metrics: Arc<Metrics>) {
    while let Some(frame) = rx.recv().await {
        match tokio::time::timeout(WRITE_DEADLINE, conn.write_message(frame.encode())).await {
            Ok(Ok(())) => metrics.inc_frames_sent(),
            Ok(Err(_)) | Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::Mutex as AsyncMutex;

    use super::*;
    use crate::anyproxy::tunnel::protocol::{Network, PortForwardEntry};
    use crate::anyproxy::tunnel::transport::{HandshakeMetadata, TransportError};

    /// A connection whose `read_message` always errors, standing in for a
    /// tunnel that drops right after the handshake; `write_message`/`close`
    /// record what was sent so the teardown path can be asserted on.
    struct FakeConn {
        meta: HandshakeMetadata,
        closed: Arc<AtomicBool>,
        writes: Arc<AsyncMutex<Vec<Bytes>>>,
    }

    #[async_trait]
    impl Connection for FakeConn {
        async fn read_message(&self) -> Result<Bytes, TransportError> {
            Err(TransportError::Closed)
        }

        async fn write_message(&self, msg: Bytes) -> Result<(), TransportError> {
            self.writes.lock().await.push(msg);
            Ok(())
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn metadata(&self) -> &HandshakeMetadata {
            &self.meta
        }

        fn peer_addr(&self) -> String {
            "test-peer:0".into()
        }
    }

    fn entry(remote_port: u16, proto: Network) -> PortForwardEntry {
        PortForwardEntry {
            remote_port,
            local_port: remote_port,
            host: "127.0.0.1".into(),
            proto,
        }
    }

    #[tokio::test]
    async fn tunnel_drop_unregisters_releases_ports_and_closes_connection() {
        let registry = Arc::new(GroupRegistry::new());
        let metrics = Arc::new(Metrics::new());
        let port_forwards = PortForwardManager::new(registry.clone(), metrics.clone());

        port_forwards
            .reserve("gw-test-1", vec![entry(19420, Network::Tcp)])
            .await;

        let closed = Arc::new(AtomicBool::new(false));
        let conn = Box::new(FakeConn {
            meta: HandshakeMetadata {
                client_id: "gw-test-1".into(),
                group_id: "G".into(),
                password: "secret".into(),
            },
            closed: closed.clone(),
            writes: Arc::new(AsyncMutex::new(Vec::new())),
        });

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let result = serve_tunnel(conn, registry.clone(), port_forwards.clone(), metrics, shutdown_rx).await;

        // The fake tunnel errors on its very first read, so the whole call
        // reports that error back up to the accept loop...
        assert!(result.is_err());
        // ...but the teardown cascade still ran to completion: the client is
        // gone from the registry, its connection was closed, and its port
        // reservation is free for someone else to claim.
        assert!(registry.get_client("gw-test-1").await.is_none());
        assert!(closed.load(Ordering::SeqCst));
        let reclaimed = port_forwards
            .reserve("gw-test-2", vec![entry(19420, Network::Tcp)])
            .await;
        assert!(matches!(reclaimed, Frame::PortForwardResponse { ok: true, .. }));
    }

    #[tokio::test]
    async fn handshake_credential_mismatch_is_rejected_without_registering() {
        let registry = Arc::new(GroupRegistry::new());
        let metrics = Arc::new(Metrics::new());
        let port_forwards = PortForwardManager::new(registry.clone(), metrics.clone());

        let (existing_tx, _existing_rx) = mpsc::channel(8);
        let existing_connections = ConnectionManager::new(existing_tx.clone(), metrics.clone());
        registry
            .register_client(
                "existing".into(),
                "G".into(),
                "right-password".into(),
                existing_tx,
                existing_connections,
            )
            .await
            .unwrap();

        let closed = Arc::new(AtomicBool::new(false));
        let writes = Arc::new(AsyncMutex::new(Vec::new()));
        let conn = Box::new(FakeConn {
            meta: HandshakeMetadata {
                client_id: "newcomer".into(),
                group_id: "G".into(),
                password: "wrong-password".into(),
            },
            closed: closed.clone(),
            writes: writes.clone(),
        });

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let result = serve_tunnel(conn, registry.clone(), port_forwards, metrics, shutdown_rx).await;

        assert!(result.is_ok());
        assert!(closed.load(Ordering::SeqCst));
        assert!(registry.get_client("newcomer").await.is_none());
        assert_eq!(writes.lock().await.len(), 1);
        assert!(matches!(
            Frame::decode(&writes.lock().await[0]).unwrap(),
            Frame::Error { .. }
        ));
    }
}
