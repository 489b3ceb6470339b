use std::{path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: String,
    pub transport: String,
    pub auth: GatewayAuthConfig,
    pub tls: TlsConfig,
    pub admin_addr: String,
    pub logging: LoggingConfig,
}

/// Per-group credentials are presented by clients at handshake time and
/// validated against the live group registry, not against this config; this
/// section only carries transport-level knobs that apply to every tunnel the
/// gateway accepts.
#[derive(Debug, Clone, Default)]
pub struct GatewayAuthConfig {
    pub quic_server_name: String,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub transport: String,
    pub client_id: String,
    pub group_id: String,
    pub group_password: String,
    pub replicas: u32,
    pub allowed_hosts: Vec<String>,
    pub forbidden_hosts: Vec<String>,
    pub open_ports: Vec<PortForwardSpec>,
    pub dial_timeout: Duration,
    pub quic_server_name: String,
    pub quic_insecure_skip_verify: bool,
    pub tls: TlsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct PortForwardSpec {
    pub remote_port: u16,
    pub local_port: u16,
    pub host: String,
    pub proto: String,
}

pub fn load_gateway_config(path: &Path) -> anyhow::Result<GatewayConfig> {
    let data = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let fc: FileGatewayConfig = serde_yaml::from_slice(&data)
        .with_context(|| format!("parse yaml {}", path.display()))?;
    fc.normalize()
}

pub fn load_client_config(path: &Path) -> anyhow::Result<ClientConfig> {
    let data = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let fc: FileClientConfig = serde_yaml::from_slice(&data)
        .with_context(|| format!("parse yaml {}", path.display()))?;
    fc.normalize()
}

#[derive(Debug, Deserialize)]
struct FileGatewayConfig {
    listen_addr: String,
    #[serde(default)]
    transport: String,
    #[serde(default)]
    quic_server_name: String,
    tls: Option<FileTls>,
    #[serde(default)]
    admin_addr: String,
    logging: Option<FileLogging>,
}

impl FileGatewayConfig {
    fn normalize(self) -> anyhow::Result<GatewayConfig> {
        let listen_addr = self.listen_addr.trim().to_string();
        if listen_addr.is_empty() {
            anyhow::bail!("config: gateway.listen_addr is required");
        }
        Ok(GatewayConfig {
            listen_addr,
            transport: normalize_transport(&self.transport)?,
            auth: GatewayAuthConfig {
                quic_server_name: self.quic_server_name.trim().to_string(),
            },
            tls: self.tls.map(FileTls::normalize).unwrap_or_default(),
            admin_addr: self.admin_addr.trim().to_string(),
            logging: self.logging.map(FileLogging::normalize).unwrap_or_default(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct FileClientConfig {
    server_addr: String,
    #[serde(default)]
    transport: String,
    client_id: String,
    group_id: String,
    #[serde(default)]
    group_password: String,
    #[serde(default)]
    replicas: u32,
    #[serde(default)]
    allowed_hosts: Vec<String>,
    #[serde(default)]
    forbidden_hosts: Vec<String>,
    #[serde(default)]
    open_ports: Vec<FilePortForward>,
    #[serde(default)]
    dial_timeout_ms: u64,
    #[serde(default)]
    quic_server_name: String,
    #[serde(default)]
    quic_insecure_skip_verify: bool,
    tls: Option<FileTls>,
    logging: Option<FileLogging>,
}

impl FileClientConfig {
    fn normalize(self) -> anyhow::Result<ClientConfig> {
        let server_addr = self.server_addr.trim().to_string();
        if server_addr.is_empty() {
            anyhow::bail!("config: client.server_addr is required");
        }
        let client_id = self.client_id.trim().to_string();
        if client_id.is_empty() {
            anyhow::bail!("config: client.client_id is required");
        }
        let group_id = self.group_id.trim().to_string();
        if group_id.is_empty() {
            anyhow::bail!("config: client.group_id is required");
        }

        let replicas = if self.replicas == 0 { 1 } else { self.replicas };

        let mut open_ports = Vec::with_capacity(self.open_ports.len());
        for p in self.open_ports {
            open_ports.push(p.normalize()?);
        }

        let dial_timeout = if self.dial_timeout_ms == 0 {
            Duration::from_secs(5)
        } else {
            Duration::from_millis(self.dial_timeout_ms)
        };

        Ok(ClientConfig {
            server_addr,
            transport: normalize_transport(&self.transport)?,
            client_id,
            group_id,
            group_password: self.group_password,
            replicas,
            allowed_hosts: self.allowed_hosts,
            forbidden_hosts: self.forbidden_hosts,
            open_ports,
            dial_timeout,
            quic_server_name: self.quic_server_name.trim().to_string(),
            quic_insecure_skip_verify: self.quic_insecure_skip_verify,
            tls: self.tls.map(FileTls::normalize).unwrap_or_default(),
            logging: self.logging.map(FileLogging::normalize).unwrap_or_default(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct FilePortForward {
    remote_port: u16,
    #[serde(default)]
    local_port: u16,
    #[serde(default)]
    host: String,
    #[serde(default)]
    proto: String,
}

impl FilePortForward {
    fn normalize(self) -> anyhow::Result<PortForwardSpec> {
        if self.remote_port == 0 {
            anyhow::bail!("config: open_ports entry missing remote_port");
        }
        let local_port = if self.local_port == 0 {
            self.remote_port
        } else {
            self.local_port
        };
        let host = if self.host.trim().is_empty() {
            "127.0.0.1".to_string()
        } else {
            self.host.trim().to_string()
        };
        let mut proto = self.proto.trim().to_ascii_lowercase();
        if proto.is_empty() {
            proto = "tcp".into();
        }
        if proto != "tcp" && proto != "udp" {
            anyhow::bail!("config: open_ports proto must be tcp or udp, got {proto:?}");
        }
        Ok(PortForwardSpec {
            remote_port: self.remote_port,
            local_port,
            host,
            proto,
        })
    }
}

#[derive(Debug, Deserialize)]
struct FileTls {
    #[serde(default)]
    cert_file: String,
    #[serde(default)]
    key_file: String,
}

impl FileTls {
    fn normalize(self) -> TlsConfig {
        TlsConfig {
            cert_file: self.cert_file.trim().to_string(),
            key_file: self.key_file.trim().to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
}

impl FileLogging {
    fn normalize(self) -> LoggingConfig {
        let defaults = LoggingConfig::default();
        LoggingConfig {
            level: self.level.unwrap_or(defaults.level),
            format: self.format.unwrap_or(defaults.format),
        }
    }
}

fn normalize_transport(name: &str) -> anyhow::Result<String> {
    let mut n = name.trim().to_ascii_lowercase();
    if n.is_empty() {
        n = "tcp".into();
    }
    match n.as_str() {
        "tcp" | "quic" => Ok(n),
        other => anyhow::bail!("config: unknown transport {other:?} (expected tcp|quic)"),
    }
}
