//! CLI wiring: loads config, starts logging, builds the selected transport,
//! and runs either the gateway or client endpoint until a shutdown signal
//! arrives. Mirrors the teacher's JoinSet + bounded-drain shutdown shape.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinSet;

use crate::anyproxy::config::{self, GatewayConfig, ClientConfig, TlsConfig};
use crate::anyproxy::group::GroupRegistry;
use crate::anyproxy::host_policy::HostPolicy;
use crate::anyproxy::logging;
use crate::anyproxy::metrics::Metrics;
use crate::anyproxy::net::normalize_bind_addr;
use crate::anyproxy::portforward::PortForwardManager;
use crate::anyproxy::tunnel::client::Client;
use crate::anyproxy::tunnel::server::GatewayTunnelServer;
use crate::anyproxy::tunnel::transport::{DialOptions, Transport, TlsIdentity};
use crate::anyproxy::tunnel::transport::quic::QuicTransport;
use crate::anyproxy::tunnel::transport::tcp::TcpTransport;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run_gateway(config_path: PathBuf) -> anyhow::Result<()> {
    let cfg = config::load_gateway_config(&config_path)
        .with_context(|| format!("load gateway config: {}", config_path.display()))?;

    let _logging = logging::init(&cfg.logging)?;

    tracing::info!(
        config = %config_path.display(),
        listen_addr = %cfg.listen_addr,
        transport = %cfg.transport,
        "anyproxy gateway: starting"
    );

    let metrics = Arc::new(Metrics::new());
    let registry = Arc::new(GroupRegistry::new());
    let port_forwards = PortForwardManager::new(registry.clone(), metrics.clone());

    let transport = build_gateway_transport(&cfg)?;
    let server = GatewayTunnelServer::new(transport, registry, port_forwards, metrics.clone());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    let listen_addr = normalize_bind_addr(&cfg.listen_addr).into_owned();
    let shutdown = shutdown_rx.clone();
    tasks.spawn(async move { server.run(&listen_addr, shutdown).await });

    if !cfg.admin_addr.trim().is_empty() {
        let admin_addr = normalize_bind_addr(&cfg.admin_addr).into_owned();
        let addr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;
        let metrics = metrics.clone();
        tasks.spawn(async move { crate::anyproxy::admin::serve(addr, metrics).await });
    }

    run_until_shutdown(tasks, shutdown_tx).await
}

pub async fn run_client(config_path: PathBuf) -> anyhow::Result<()> {
    let cfg = config::load_client_config(&config_path)
        .with_context(|| format!("load client config: {}", config_path.display()))?;

    let _logging = logging::init(&cfg.logging)?;

    tracing::info!(
        config = %config_path.display(),
        server_addr = %cfg.server_addr,
        transport = %cfg.transport,
        group_id = %cfg.group_id,
        "anyproxy client: starting"
    );

    let metrics = Arc::new(Metrics::new());
    let transport = build_client_transport(&cfg)?;
    let replicas = cfg.replicas.max(1);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    for replica_idx in 0..replicas {
        let host_policy = HostPolicy::compile(&cfg.allowed_hosts, &cfg.forbidden_hosts)
            .context("client: compile host policy")?;
        let client = Arc::new(Client::new(
            cfg.clone(),
            host_policy,
            metrics.clone(),
            transport.clone(),
            replica_idx,
        ));
        let shutdown_rx = shutdown_rx.clone();
        tasks.spawn(async move {
            client.run(shutdown_rx).await;
            Ok(())
        });
    }

    run_until_shutdown(tasks, shutdown_tx).await
}

async fn run_until_shutdown(
    mut tasks: JoinSet<anyhow::Result<()>>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
) -> anyhow::Result<()> {
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn build_gateway_transport(cfg: &GatewayConfig) -> anyhow::Result<Arc<dyn Transport>> {
    match cfg.transport.as_str() {
        "tcp" => Ok(Arc::new(TcpTransport::new())),
        "quic" => {
            let tls = load_tls_identity(&cfg.tls)?;
            Ok(Arc::new(QuicTransport::new(tls, DialOptions::default())))
        }
        other => anyhow::bail!("gateway: unsupported transport {other:?}"),
    }
}

fn build_client_transport(cfg: &ClientConfig) -> anyhow::Result<Arc<dyn Transport>> {
    match cfg.transport.as_str() {
        "tcp" => Ok(Arc::new(TcpTransport::new())),
        "quic" => {
            let tls = load_tls_identity(&cfg.tls)?;
            let dial_opts = DialOptions {
                server_name: cfg.quic_server_name.clone(),
                insecure_skip_verify: cfg.quic_insecure_skip_verify,
            };
            Ok(Arc::new(QuicTransport::new(tls, dial_opts)))
        }
        other => anyhow::bail!("client: unsupported transport {other:?}"),
    }
}

/// Loads a PEM cert/key pair from disk when both paths are configured.
/// Leaving both blank lets the QUIC transport fall back to a generated
/// self-signed certificate (fine for client-authenticated-by-password
/// deployments; operators terminating TLS at the edge supply real files).
fn load_tls_identity(tls: &TlsConfig) -> anyhow::Result<Option<TlsIdentity>> {
    if tls.cert_file.trim().is_empty() && tls.key_file.trim().is_empty() {
        return Ok(None);
    }
    let cert_chain_pem = std::fs::read(&tls.cert_file)
        .with_context(|| format!("read tls cert_file: {}", tls.cert_file))?;
    let key_pem = std::fs::read(&tls.key_file)
        .with_context(|| format!("read tls key_file: {}", tls.key_file))?;
    Ok(Some(TlsIdentity {
        cert_chain_pem,
        key_pem,
    }))
}
