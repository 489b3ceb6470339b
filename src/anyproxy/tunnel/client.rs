//! Client (agent) tunnel endpoint: dials out to the gateway, then serves
//! inbound `Connect` requests by dialing the actual target from inside the
//! private network. State machine: `Connecting` -> `Connected` -> `Draining`
//! -> `Connecting` ... (§4.4.1).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::anyproxy::config::ClientConfig;
use crate::anyproxy::host_policy::HostPolicy;
use crate::anyproxy::metrics::Metrics;
use crate::anyproxy::tunnel::connection_manager::{ConnectionManager, LocalHandle};
use crate::anyproxy::tunnel::protocol::{ConnId, Frame, Network, PortForwardEntry};
use crate::anyproxy::tunnel::transport::{HandshakeMetadata, Transport};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const BACKOFF_FACTOR: f64 = 1.5;
const MAX_CONSECUTIVE_FAILURES: u32 = 20;

/// Liveness deadlines for every long-running I/O loop (§5): a read or write
/// that stalls past these is treated as a dead connection, not a slow one.
const READ_DEADLINE: Duration = Duration::from_secs(30);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(30);

pub struct Client {
    config: ClientConfig,
    host_policy: Arc<HostPolicy>,
    metrics: Arc<Metrics>,
    transport: Arc<dyn Transport>,
    replica_idx: u32,
}

impl Client {
    /// `replica_idx` identifies this instance among `config.replicas`
    /// independently-dialing tunnels sharing one configured identity; it is
    /// folded into the wire `actual_id` so the gateway sees distinct clients.
    pub fn new(
        config: ClientConfig,
        host_policy: HostPolicy,
        metrics: Arc<Metrics>,
        transport: Arc<dyn Transport>,
        replica_idx: u32,
    ) -> Self {
        Self {
            config,
            host_policy: Arc::new(host_policy),
            metrics,
            transport,
            replica_idx,
        }
    }

    /// Outer `Connecting -> Connected -> Draining` loop. Returns once
    /// `shutdown` fires or the failure ceiling is hit (the process
    /// supervisor is expected to restart the process in the latter case).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = INITIAL_BACKOFF;
        let mut consecutive_failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return;
            }

            match self.run_once(shutdown.clone()).await {
                Ok(()) => {
                    if *shutdown.borrow() {
                        return;
                    }
                    consecutive_failures = 0;
                    backoff = INITIAL_BACKOFF;
                }
                Err(err) => {
                    consecutive_failures += 1;
                    warn!(
                        server = %self.config.server_addr,
                        attempt = consecutive_failures,
                        backoff = ?backoff,
                        error = %err,
                        "tunnel: disconnected; retrying"
                    );
                    if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        warn!("tunnel: giving up after {MAX_CONSECUTIVE_FAILURES} consecutive failures");
                        return;
                    }
                }
            }

            let jittered = jitter(backoff);
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = tokio::time::sleep(jittered) => {}
            }

            let next_millis = (backoff.as_secs_f64() * BACKOFF_FACTOR).min(MAX_BACKOFF.as_secs_f64());
            backoff = Duration::from_secs_f64(next_millis);
        }
    }

    /// One `Connecting` attempt through to `Draining`. Errors here cause the
    /// outer loop to back off and retry; `Ok(())` only happens on a clean
    /// caller-initiated shutdown.
    async fn run_once(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let actual_id = self.compute_actual_id();
        let handshake = HandshakeMetadata {
            client_id: actual_id.clone(),
            group_id: self.config.group_id.clone(),
            password: self.config.group_password.clone(),
        };

        let dial = self.transport.dial(&self.config.server_addr, handshake);
        let conn = tokio::time::timeout(self.config.dial_timeout, dial)
            .await
            .map_err(|_| anyhow::anyhow!("dial timed out"))??;

        info!(server = %self.config.server_addr, client_id = %actual_id, "tunnel: connected");
        self.metrics.inc_tunnels_connected();

        let (writer_tx, writer_rx) = mpsc::channel::<Frame>(256);
        let connections = ConnectionManager::new(writer_tx.clone(), self.metrics.clone());

        let conn: Arc<dyn crate::anyproxy::tunnel::transport::Connection> = Arc::from(conn);
        let writer_task = tokio::spawn(run_writer(conn.clone(), writer_rx, self.metrics.clone()));

        if !self.config.open_ports.is_empty() {
            let entries = self
                .config
                .open_ports
                .iter()
                .map(|p| PortForwardEntry {
                    remote_port: p.remote_port,
                    local_port: p.local_port,
                    host: p.host.clone(),
                    proto: if p.proto == "udp" { Network::Udp } else { Network::Tcp },
                })
                .collect();
            let _ = writer_tx
                .send(Frame::PortForwardRequest {
                    client_id: actual_id.clone(),
                    entries,
                })
                .await;
        }

        let result = self.receive_loop(&conn, &connections, &writer_tx, &mut shutdown).await;

        connections.close_all().await;
        writer_task.abort();
        self.metrics.inc_tunnels_disconnected();

        result
    }

    async fn receive_loop(
        &self,
        conn: &Arc<dyn crate::anyproxy::tunnel::transport::Connection>,
        connections: &Arc<ConnectionManager>,
        writer_tx: &mpsc::Sender<Frame>,
        shutdown: &mut watch::Receiver<bool>,
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
                    self.metrics.inc_frames_received();
                    let frame = Frame::decode(&bytes)?;
                    match frame {
                        Frame::Connect { conn_id, network, address } => {
                            self.handle_connect(conn_id, network, address, connections, writer_tx.clone()).await;
                        }
                        Frame::Data { .. } | Frame::Close { .. } => {
                            connections.route(frame).await;
                        }
                        Frame::Error { message } => {
                            warn!(error = %message, "tunnel: gateway rejected credentials");
                            return Err(anyhow::anyhow!("gateway error: {message}"));
                        }
                        Frame::Ping => {}
                        Frame::PortForwardResponse { ok, error, statuses } => {
                            if !ok {
                                warn!(error = %error, "tunnel: port forward request rejected");
                            }
                            for s in statuses {
                                if !s.ok {
                                    warn!(port = s.remote_port, proto = %s.proto, error = %s.error, "tunnel: port reservation failed");
                                }
                            }
                        }
                        other => {
                            debug!(?other, "tunnel: unexpected frame on client endpoint");
                        }
                    }
                }
            }
        }
    }

    async fn handle_connect(
        &self,
        conn_id: ConnId,
        network: Network,
        address: String,
        connections: &Arc<ConnectionManager>,
        writer_tx: mpsc::Sender<Frame>,
    ) {
        if !self.host_policy.is_allowed(&address) {
            let _ = writer_tx
                .send(Frame::ConnectResponse {
                    conn_id,
                    ok: false,
                    error: "forbidden".into(),
                })
                .await;
            return;
        }

        match network {
            Network::Tcp => self.handle_connect_tcp(conn_id, address, connections, writer_tx).await,
            Network::Udp => self.handle_connect_udp(conn_id, address, connections, writer_tx).await,
        }
    }

    async fn handle_connect_tcp(
        &self,
        conn_id: ConnId,
        address: String,
        connections: &Arc<ConnectionManager>,
        writer_tx: mpsc::Sender<Frame>,
    ) {
        let dial = TcpStream::connect(&address);
        let stream = match tokio::time::timeout(self.config.dial_timeout, dial).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                self.metrics.inc_dial_failures();
                let _ = writer_tx
                    .send(Frame::ConnectResponse { conn_id, ok: false, error: e.to_string() })
                    .await;
                return;
            }
            Err(_) => {
                self.metrics.inc_dial_failures();
                let _ = writer_tx
                    .send(Frame::ConnectResponse { conn_id, ok: false, error: "dial timed out".into() })
                    .await;
                return;
            }
        };
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();

        let handle: Arc<dyn LocalHandle> = Arc::new(TcpLocalHandle {
            write_half: tokio::sync::Mutex::new(write_half),
        });
        connections.add(conn_id, handle).await;

        let _ = writer_tx
            .send(Frame::ConnectResponse { conn_id, ok: true, error: String::new() })
            .await;

        spawn_tcp_reader(conn_id, read_half, writer_tx, connections.clone());
    }

    async fn handle_connect_udp(
        &self,
        conn_id: ConnId,
        address: String,
        connections: &Arc<ConnectionManager>,
        writer_tx: mpsc::Sender<Frame>,
    ) {
        let sock = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(s) => s,
            Err(e) => {
                self.metrics.inc_dial_failures();
                let _ = writer_tx
                    .send(Frame::ConnectResponse { conn_id, ok: false, error: e.to_string() })
                    .await;
                return;
            }
        };
        if let Err(e) = tokio::time::timeout(self.config.dial_timeout, sock.connect(&address)).await {
            self.metrics.inc_dial_failures();
            let _ = writer_tx
                .send(Frame::ConnectResponse { conn_id, ok: false, error: e.to_string() })
                .await;
            return;
        }
        let sock = Arc::new(sock);

        let handle: Arc<dyn LocalHandle> = Arc::new(UdpLocalHandle { sock: sock.clone() });
        connections.add(conn_id, handle).await;

        let _ = writer_tx
            .send(Frame::ConnectResponse { conn_id, ok: true, error: String::new() })
            .await;

        spawn_udp_reader(conn_id, sock, writer_tx, connections.clone());
    }

    fn compute_actual_id(&self) -> String {
        let suffix: u64 = rand::rng().random();
        format!(
            "{}-r{}-{:020x}",
            self.config.client_id, self.replica_idx, suffix
        )
    }
}

struct TcpLocalHandle {
    write_half: tokio::sync::Mutex<tokio::net::tcp::OwnedWriteHalf>,
}

#[async_trait]
impl LocalHandle for TcpLocalHandle {
    async fn on_frame(&self, frame: Frame) -> bool {
        match frame {
            Frame::Data { payload, .. } => {
                let mut w = self.write_half.lock().await;
                matches!(
                    tokio::time::timeout(WRITE_DEADLINE, w.write_all(&payload)).await,
                    Ok(Ok(()))
                )
            }
            _ => true,
        }
    }

    async fn close(&self) {
        let mut w = self.write_half.lock().await;
        let _ = w.shutdown().await;
    }
}

struct UdpLocalHandle {
    sock: Arc<UdpSocket>,
}

#[async_trait]
impl LocalHandle for UdpLocalHandle {
    async fn on_frame(&self, frame: Frame) -> bool {
        match frame {
            Frame::Data { payload, .. } => matches!(
                tokio::time::timeout(WRITE_DEADLINE, self.sock.send(&payload)).await,
                Ok(Ok(_))
            ),
            _ => true,
        }
    }

    async fn close(&self) {}
}

fn spawn_tcp_reader(
    conn_id: ConnId,
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    writer_tx: mpsc::Sender<Frame>,
    connections: Arc<ConnectionManager>,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            let n = match tokio::time::timeout(READ_DEADLINE, read_half.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(n)) => n,
            };
            let frame = Frame::Data { conn_id, payload: Bytes::copy_from_slice(&buf[..n]) };
            if writer_tx.send(frame).await.is_err() {
                break;
            }
        }
        let _ = writer_tx.send(Frame::Close { conn_id }).await;
        connections.remove(conn_id).await;
    });
}

fn spawn_udp_reader(
    conn_id: ConnId,
    sock: Arc<UdpSocket>,
    writer_tx: mpsc::Sender<Frame>,
    connections: Arc<ConnectionManager>,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = match tokio::time::timeout(READ_DEADLINE, sock.recv(&mut buf)).await {
                Ok(Ok(n)) => n,
                Ok(Err(_)) | Err(_) => break,
            };
            let frame = Frame::Data { conn_id, payload: Bytes::copy_from_slice(&buf[..n]) };
            if writer_tx.send(frame).await.is_err() {
                break;
            }
        }
        let _ = writer_tx.send(Frame::Close { conn_id }).await;
        connections.remove(conn_id).await;
    });
}

/// Single writer task per tunnel: serializes every outbound frame through
/// one owner of the transport's write half, the canonical way to make
/// `write_message` race-free (§5).
async fn run_writer(
    conn: Arc<dyn crate::anyproxy::tunnel::transport::Connection>,
    mut rx: mpsc::Receiver<Frame>,
    metrics: Arc<Metrics>,
) {
    while let Some(frame) = rx.recv().await {
        match tokio::time::timeout(WRITE_DEADLINE, conn.write_message(frame.encode())).await {
            Ok(Ok(())) => metrics.inc_frames_sent(),
            Ok(Err(_)) | Err(_) => break,
        }
    }
}

fn jitter(d: Duration) -> Duration {
    let factor = rand::rng().random_range(0.85..=1.15);
    Duration::from_secs_f64((d.as_secs_f64() * factor).max(0.001))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::anyproxy::config::{LoggingConfig, TlsConfig};
    use crate::anyproxy::tunnel::transport::{TransportError, TransportListener};

    use super::*;

    fn test_client_config() -> ClientConfig {
        ClientConfig {
            server_addr: "gateway.test:9000".into(),
            transport: "tcp".into(),
            client_id: "agent".into(),
            group_id: "G".into(),
            group_password: "secret".into(),
            replicas: 1,
            allowed_hosts: Vec::new(),
            forbidden_hosts: Vec::new(),
            open_ports: Vec::new(),
            dial_timeout: Duration::from_millis(50),
            quic_server_name: String::new(),
            quic_insecure_skip_verify: false,
            tls: TlsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Never produces a usable tunnel; every `dial` fails instantly so the
    /// outer retry loop's backoff/give-up path can be driven without ever
    /// touching a real socket.
    struct FailingTransport {
        dials: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for FailingTransport {
        async fn listen(&self, _addr: &str) -> Result<Box<dyn TransportListener>, TransportError> {
            Err(TransportError::Closed)
        }

        async fn dial(
            &self,
            _addr: &str,
            _handshake: HandshakeMetadata,
        ) -> Result<Box<dyn crate::anyproxy::tunnel::transport::Connection>, TransportError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Closed)
        }
    }

    #[test]
    fn jitter_stays_within_fifteen_percent_band() {
        let base = Duration::from_secs(10);
        for _ in 0..50 {
            let j = jitter(base);
            assert!(j >= Duration::from_secs_f64(8.5));
            assert!(j <= Duration::from_secs_f64(11.5));
        }
    }

    #[test]
    fn compute_actual_id_embeds_replica_index_not_replica_count() {
        let mut config = test_client_config();
        config.replicas = 5;
        let host_policy = HostPolicy::compile(&[], &[]).unwrap();
        let transport: Arc<dyn Transport> = Arc::new(FailingTransport {
            dials: Arc::new(AtomicUsize::new(0)),
        });
        let client = Client::new(config, host_policy, Arc::new(Metrics::new()), transport, 2);

        let id = client.compute_actual_id();
        assert!(id.starts_with("agent-r2-"), "id was {id:?}");
        assert!(!id.contains("-r5-"), "id folded replica count instead of replica_idx: {id:?}");
    }

    #[tokio::test]
    async fn run_returns_immediately_when_shutdown_already_set() {
        let dials = Arc::new(AtomicUsize::new(0));
        let transport: Arc<dyn Transport> = Arc::new(FailingTransport {
            dials: dials.clone(),
        });
        let host_policy = HostPolicy::compile(&[], &[]).unwrap();
        let client = Client::new(
            test_client_config(),
            host_policy,
            Arc::new(Metrics::new()),
            transport,
            0,
        );

        let (_shutdown_tx, shutdown_rx) = watch::channel(true);
        client.run(shutdown_rx).await;

        assert_eq!(dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_consecutive_failures() {
        let dials = Arc::new(AtomicUsize::new(0));
        let transport: Arc<dyn Transport> = Arc::new(FailingTransport {
            dials: dials.clone(),
        });
        let host_policy = HostPolicy::compile(&[], &[]).unwrap();
        let client = Client::new(
            test_client_config(),
            host_policy,
            Arc::new(Metrics::new()),
            transport,
            0,
        );

        // Keep the sender alive: a dropped `watch::Sender` makes `changed()`
        // resolve immediately, which would short-circuit the backoff sleeps
        // this test depends on (virtual time still needs a pending timer to
        // advance past).
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        client.run(shutdown_rx).await;

        assert_eq!(dials.load(Ordering::SeqCst), MAX_CONSECUTIVE_FAILURES as usize);
        drop(shutdown_tx);
    }
}
