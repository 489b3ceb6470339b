//! Port-forward manager (§4.6): reserves `(remote_port, protocol)` pairs on
//! behalf of a client and bridges inbound connections through that client's
//! tunnel via [`dial_client`].
//!
//! A single lock over the reservation table makes reserve/release atomic,
//! mirroring the connection manager's and group registry's single-lock rule.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::anyproxy::dial::dial_client;
use crate::anyproxy::group::GroupRegistry;
use crate::anyproxy::metrics::Metrics;
use crate::anyproxy::tunnel::protocol::{Frame, Network, PortForwardEntry, PortStatus};

/// 60s idle deadline and 32 KiB buffers for the TCP forwarding path (§4.6).
const TCP_IDLE_DEADLINE: Duration = Duration::from_secs(60);
const TCP_BUFFER: usize = 32 * 1024;
/// UDP waits up to 1s for a reply before giving up on that datagram.
const UDP_RESPONSE_WAIT: Duration = Duration::from_secs(1);
const UDP_BUFFER: usize = 64 * 1024;

type PortKey = (u16, Network);

struct PortOwner {
    client_id: String,
    task: JoinHandle<()>,
}

pub struct PortForwardManager {
    registry: Arc<GroupRegistry>,
    metrics: Arc<Metrics>,
    state: tokio::sync::Mutex<HashMap<PortKey, PortOwner>>,
}

impl PortForwardManager {
    pub fn new(registry: Arc<GroupRegistry>, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            metrics,
            state: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Reserves every requested port, binding a listener/socket for each
    /// newly-owned entry, and reports per-entry success in the returned
    /// `PortForwardResponse`.
    pub async fn reserve(&self, owner_client_id: &str, entries: Vec<PortForwardEntry>) -> Frame {
        let mut statuses = Vec::with_capacity(entries.len());
        let mut overall_ok = true;

        for entry in entries {
            let status = self.reserve_one(owner_client_id, entry).await;
            if !status.ok {
                overall_ok = false;
            }
            statuses.push(status);
        }

        Frame::PortForwardResponse {
            ok: overall_ok,
            error: String::new(),
            statuses,
        }
    }

    async fn reserve_one(&self, owner_client_id: &str, entry: PortForwardEntry) -> PortStatus {
        let key = (entry.remote_port, entry.proto);
        let mut state = self.state.lock().await;

        if let Some(existing) = state.get(&key) {
            return if existing.client_id == owner_client_id {
                PortStatus {
                    remote_port: entry.remote_port,
                    proto: entry.proto,
                    ok: true,
                    error: String::new(),
                }
            } else {
                PortStatus {
                    remote_port: entry.remote_port,
                    proto: entry.proto,
                    ok: false,
                    error: "port already in use".into(),
                }
            };
        }

        let bound = match entry.proto {
            Network::Tcp => self.spawn_tcp_listener(owner_client_id.to_string(), entry.clone()).await,
            Network::Udp => self.spawn_udp_listener(owner_client_id.to_string(), entry.clone()).await,
        };

        match bound {
            Ok(task) => {
                state.insert(
                    key,
                    PortOwner {
                        client_id: owner_client_id.to_string(),
                        task,
                    },
                );
                PortStatus {
                    remote_port: entry.remote_port,
                    proto: entry.proto,
                    ok: true,
                    error: String::new(),
                }
            }
            Err(err) => PortStatus {
                remote_port: entry.remote_port,
                proto: entry.proto,
                ok: false,
                error: err.to_string(),
            },
        }
    }

    async fn spawn_tcp_listener(
        &self,
        owner_client_id: String,
        entry: PortForwardEntry,
    ) -> std::io::Result<JoinHandle<()>> {
        let listener = TcpListener::bind(format!("0.0.0.0:{}", entry.remote_port)).await?;
        let registry = self.registry.clone();
        let metrics = self.metrics.clone();
        let target = format!("{}:{}", entry.host, entry.local_port);

        Ok(tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, port = entry.remote_port, "port-forward: tcp accept failed");
                        break;
                    }
                };
                let registry = registry.clone();
                let metrics = metrics.clone();
                let owner = owner_client_id.clone();
                let target = target.clone();
                tokio::spawn(async move {
                    serve_tcp_forward(stream, registry, metrics, owner, target).await;
                });
            }
        }))
    }

    async fn spawn_udp_listener(
        &self,
        owner_client_id: String,
        entry: PortForwardEntry,
    ) -> std::io::Result<JoinHandle<()>> {
        let sock = Arc::new(UdpSocket::bind(format!("0.0.0.0:{}", entry.remote_port)).await?);
        let registry = self.registry.clone();
        let metrics = self.metrics.clone();
        let target = format!("{}:{}", entry.host, entry.local_port);

        Ok(tokio::spawn(async move {
            let mut buf = vec![0u8; UDP_BUFFER];
            loop {
                let (n, src) = match sock.recv_from(&mut buf).await {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, port = entry.remote_port, "port-forward: udp recv failed");
                        break;
                    }
                };
                let datagram = buf[..n].to_vec();
                let registry = registry.clone();
                let metrics = metrics.clone();
                let owner = owner_client_id.clone();
                let target = target.clone();
                let sock = sock.clone();
                tokio::spawn(async move {
                    serve_udp_forward(sock, src, datagram, registry, metrics, owner, target).await;
                });
            }
        }))
    }

    /// Tears down every port owned by `client_id`, invoked when that
    /// client's tunnel ends.
    pub async fn release_client(&self, client_id: &str) {
        let mut state = self.state.lock().await;
        let keys: Vec<PortKey> = state
            .iter()
            .filter(|(_, owner)| owner.client_id == client_id)
            .map(|(key, _)| *key)
            .collect();
        for key in keys {
            if let Some(owner) = state.remove(&key) {
                owner.task.abort();
            }
        }
    }

    #[cfg(test)]
    async fn is_owned_by(&self, remote_port: u16, proto: Network, client_id: &str) -> bool {
        self.state
            .lock()
            .await
            .get(&(remote_port, proto))
            .is_some_and(|o| o.client_id == client_id)
    }
}

async fn serve_tcp_forward(
    mut inbound: TcpStream,
    registry: Arc<GroupRegistry>,
    metrics: Arc<Metrics>,
    owner_client_id: String,
    target: String,
) {
    let Some(client) = registry.get_client(&owner_client_id).await else {
        return;
    };
    let relayed = match dial_client(client, &metrics, Network::Tcp, &target).await {
        Ok(s) => s,
        Err(err) => {
            warn!(%target, error = %err, "port-forward: dial through owning client failed");
            return;
        }
    };

    let (inbound_r, inbound_w) = inbound.split();
    let (relayed_r, relayed_w) = tokio::io::split(relayed);

    let to_target = copy_with_idle(inbound_r, relayed_w, TCP_IDLE_DEADLINE);
    let to_inbound = copy_with_idle(relayed_r, inbound_w, TCP_IDLE_DEADLINE);
    let _ = tokio::join!(to_target, to_inbound);
}

async fn copy_with_idle<R, W>(mut reader: R, mut writer: W, idle: Duration)
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; TCP_BUFFER];
    loop {
        let n = match tokio::time::timeout(idle, reader.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => n,
            Ok(Err(_)) => break,
        };
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
    writer.shutdown().await.ok();
}

async fn serve_udp_forward(
    sock: Arc<UdpSocket>,
    src: SocketAddr,
    datagram: Vec<u8>,
    registry: Arc<GroupRegistry>,
    metrics: Arc<Metrics>,
    owner_client_id: String,
    target: String,
) {
    let Some(client) = registry.get_client(&owner_client_id).await else {
        return;
    };
    let mut relayed = match dial_client(client, &metrics, Network::Udp, &target).await {
        Ok(s) => s,
        Err(_) => return,
    };
    if relayed.write_all(&datagram).await.is_err() {
        return;
    }

    let mut buf = vec![0u8; UDP_BUFFER];
    if let Ok(Ok(n)) = tokio::time::timeout(UDP_RESPONSE_WAIT, relayed.read(&mut buf)).await {
        if n > 0 {
            let _ = sock.send_to(&buf[..n], src).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn client_with(
        client_id: &str,
        writer: mpsc::Sender<Frame>,
    ) -> crate::anyproxy::group::ClientRecord {
        let (tx, _rx) = mpsc::channel(8);
        crate::anyproxy::group::ClientRecord {
            client_id: client_id.into(),
            group_id: "G".into(),
            writer,
            connections: crate::anyproxy::tunnel::connection_manager::ConnectionManager::new(
                tx,
                Arc::new(Metrics::new()),
            ),
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
    async fn same_owner_reserving_twice_is_a_no_op() {
        let registry = Arc::new(GroupRegistry::new());
        let (writer_tx, _writer_rx) = mpsc::channel(8);
        let client = client_with("c1", writer_tx.clone());
        registry
            .register_client("c1".into(), "G".into(), "p".into(), writer_tx, client.connections.clone())
            .await
            .unwrap();
        let mgr = PortForwardManager::new(registry, Arc::new(Metrics::new()));

        let first = mgr.reserve("c1", vec![entry(19401, Network::Tcp)]).await;
        let second = mgr.reserve("c1", vec![entry(19401, Network::Tcp)]).await;

        assert!(matches!(first, Frame::PortForwardResponse { ok: true, .. }));
        assert!(matches!(second, Frame::PortForwardResponse { ok: true, .. }));
        assert!(mgr.is_owned_by(19401, Network::Tcp, "c1").await);
    }

    #[tokio::test]
    async fn conflicting_owner_is_rejected_while_other_protocol_succeeds() {
        let registry = Arc::new(GroupRegistry::new());
        let (writer_tx, _writer_rx) = mpsc::channel(8);
        let client = client_with("c1", writer_tx.clone());
        registry
            .register_client("c1".into(), "G".into(), "p".into(), writer_tx, client.connections.clone())
            .await
            .unwrap();
        let mgr = PortForwardManager::new(registry, Arc::new(Metrics::new()));

        let first = mgr.reserve("c1", vec![entry(19402, Network::Tcp)]).await;
        assert!(matches!(first, Frame::PortForwardResponse { ok: true, .. }));

        let second = mgr
            .reserve("c2", vec![entry(19402, Network::Tcp), entry(19402, Network::Udp)])
            .await;
        match second {
            Frame::PortForwardResponse { ok, statuses, .. } => {
                assert!(!ok);
                assert!(!statuses[0].ok);
                assert_eq!(statuses[0].error, "port already in use");
                assert!(statuses[1].ok);
            }
            other => panic!("expected PortForwardResponse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn release_client_frees_its_ports() {
        let registry = Arc::new(GroupRegistry::new());
        let (writer_tx, _writer_rx) = mpsc::channel(8);
        let client = client_with("c1", writer_tx.clone());
        registry
            .register_client("c1".into(), "G".into(), "p".into(), writer_tx, client.connections.clone())
            .await
            .unwrap();
        let mgr = PortForwardManager::new(registry, Arc::new(Metrics::new()));

        mgr.reserve("c1", vec![entry(19403, Network::Tcp)]).await;
        assert!(mgr.is_owned_by(19403, Network::Tcp, "c1").await);

        mgr.release_client("c1").await;
        assert!(!mgr.is_owned_by(19403, Network::Tcp, "c1").await);

        let reclaimed = mgr.reserve("c2", vec![entry(19403, Network::Tcp)]).await;
        assert!(matches!(reclaimed, Frame::PortForwardResponse { ok: true, .. }));
    }
}
