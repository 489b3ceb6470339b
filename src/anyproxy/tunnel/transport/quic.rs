//! QUIC transport: one bidirectional stream per tunnel, length-prefixed
//! messages on it. Multiplexing of logical connections happens in-band via
//! `conn_id`, not via additional QUIC streams, so a tunnel only ever opens
//! (dial side) or accepts (listen side) a single stream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream, ServerConfig, TransportConfig};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{Connection as TunnelConnection, DialOptions, HandshakeMetadata, Transport, TransportError, TransportListener, MAX_FRAME_SIZE, TlsIdentity};

const ALPN: &[u8] = b"anyproxy/1";

#[derive(Debug, Serialize, Deserialize)]
struct HandshakeWire {
    client_id: String,
    group_id: String,
    password: String,
}

pub struct QuicTransport {
    tls: Option<TlsIdentity>,
    dial_opts: DialOptions,
}

impl QuicTransport {
    pub fn new(tls: Option<TlsIdentity>, dial_opts: DialOptions) -> Self {
        Self { tls, dial_opts }
    }
}

#[async_trait]
impl Transport for QuicTransport {
    async fn listen(&self, addr: &str) -> Result<Box<dyn TransportListener>, TransportError> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| TransportError::Tls(format!("invalid listen addr: {e}")))?;

        let (cert_chain, key) = quic_tls::load_or_generate_cert(self.tls.as_ref())?;

        let mut transport_cfg = TransportConfig::default();
        transport_cfg
            .max_idle_timeout(Some(Duration::from_secs(60).try_into().unwrap()));
        transport_cfg.keep_alive_interval(Some(Duration::from_secs(20)));

        let server_crypto = quic_tls::server_crypto_config(cert_chain, key)?;
        let mut server_cfg = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
                .map_err(|e| TransportError::Tls(e.to_string()))?,
        ));
        server_cfg.transport_config(Arc::new(transport_cfg));

        let endpoint = Endpoint::server(server_cfg, addr)?;
        Ok(Box::new(QuicTransportListener { endpoint }))
    }

    async fn dial(
        &self,
        addr: &str,
        handshake: HandshakeMetadata,
    ) -> Result<Box<dyn TunnelConnection>, TransportError> {
        let mut transport_cfg = TransportConfig::default();
        transport_cfg
            .max_idle_timeout(Some(Duration::from_secs(60).try_into().unwrap()));
        transport_cfg.keep_alive_interval(Some(Duration::from_secs(20)));

        let client_crypto = quic_tls::client_crypto_config(self.dial_opts.insecure_skip_verify)?;
        let mut client_cfg = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
                .map_err(|e| TransportError::Tls(e.to_string()))?,
        ));
        client_cfg.transport_config(Arc::new(transport_cfg));

        let bind: SocketAddr = "0.0.0.0:0".parse().unwrap();
        let mut endpoint = Endpoint::client(bind)?;
        endpoint.set_default_client_config(client_cfg);

        let name = if self.dial_opts.server_name.trim().is_empty() {
            "localhost".to_string()
        } else {
            self.dial_opts.server_name.clone()
        };

        let remote = resolve_socket_addr(addr).await?;
        let connecting = endpoint
            .connect(remote, &name)
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        let conn = connecting
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        let (mut send, recv) = conn
            .open_bi()
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        let peer_addr = conn.remote_address().to_string();
        write_handshake(&mut send, &handshake).await?;
        let wrapped = QuicConnection {
            send: Mutex::new(send),
            recv: Mutex::new(recv),
            metadata: handshake,
            peer_addr,
            _endpoint: endpoint,
        };
        Ok(Box::new(wrapped))
    }
}

async fn resolve_socket_addr(addr: &str) -> Result<SocketAddr, TransportError> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(sa);
    }
    let mut it = tokio::net::lookup_host(addr).await?;
    it.next()
        .ok_or_else(|| TransportError::Handshake(format!("could not resolve {addr:?}")))
}

struct QuicTransportListener {
    endpoint: Endpoint,
}

#[async_trait]
impl TransportListener for QuicTransportListener {
    async fn accept(&mut self) -> Result<Box<dyn TunnelConnection>, TransportError> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| TransportError::Closed)?;
        let conn: Connection = incoming
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        let (send, mut recv) = conn
            .accept_bi()
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        let peer_addr = conn.remote_address().to_string();
        let metadata = read_handshake(&mut recv).await?;
        let wrapped = QuicConnection {
            send: Mutex::new(send),
            recv: Mutex::new(recv),
            metadata,
            peer_addr,
            _endpoint: self.endpoint.clone(),
        };
        Ok(Box::new(wrapped))
    }
}

async fn write_handshake(
    send: &mut SendStream,
    metadata: &HandshakeMetadata,
) -> Result<(), TransportError> {
    let wire = HandshakeWire {
        client_id: metadata.client_id.clone(),
        group_id: metadata.group_id.clone(),
        password: metadata.password.clone(),
    };
    let bytes = serde_json::to_vec(&wire).map_err(|e| TransportError::Handshake(e.to_string()))?;
    write_raw(send, &bytes).await
}

/// Reads the one handshake frame a freshly-accepted stream must send,
/// directly off the raw recv half before `QuicConnection` exists.
async fn read_handshake(recv: &mut RecvStream) -> Result<HandshakeMetadata, TransportError> {
    let bytes = read_raw(recv).await?;
    let wire: HandshakeWire =
        serde_json::from_slice(&bytes).map_err(|e| TransportError::Handshake(e.to_string()))?;
    Ok(HandshakeMetadata {
        client_id: wire.client_id,
        group_id: wire.group_id,
        password: wire.password,
    })
}

async fn write_raw(send: &mut SendStream, bytes: &[u8]) -> Result<(), TransportError> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(bytes.len()));
    }
    send.write_u32(bytes.len() as u32).await?;
    send.write_all(bytes).await?;
    Ok(())
}

async fn read_raw(recv: &mut RecvStream) -> Result<Bytes, TransportError> {
    let len = match recv.read_u32().await {
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
    recv.read_exact(&mut buf).await.map_err(|e| {
        TransportError::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, e))
    })?;
    Ok(Bytes::from(buf))
}

/// Send and recv halves are each guarded by their own lock so the tunnel
/// core's single receive task and single writer task never contend with one
/// another, only (harmlessly) with themselves.
struct QuicConnection {
    send: Mutex<SendStream>,
    recv: Mutex<RecvStream>,
    metadata: HandshakeMetadata,
    peer_addr: String,
    _endpoint: Endpoint,
}

#[async_trait]
impl TunnelConnection for QuicConnection {
    async fn read_message(&self) -> Result<Bytes, TransportError> {
        read_raw(&mut *self.recv.lock().await).await
    }

    async fn write_message(&self, msg: Bytes) -> Result<(), TransportError> {
        write_raw(&mut *self.send.lock().await, &msg).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.send.lock().await.finish().ok();
        Ok(())
    }

    fn metadata(&self) -> &HandshakeMetadata {
        &self.metadata
    }

    fn peer_addr(&self) -> String {
        self.peer_addr.clone()
    }
}

mod quic_tls {
    use std::sync::Arc;

    use rcgen::generate_simple_self_signed;
    use rustls::{
        client::danger::{ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
    };

    use crate::anyproxy::tunnel::transport::{TlsIdentity, TransportError};

    pub fn load_or_generate_cert(
        tls: Option<&TlsIdentity>,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TransportError> {
        if let Some(tls) = tls {
            let mut rd = std::io::Cursor::new(&tls.cert_chain_pem);
            let certs = rustls_pemfile::certs(&mut rd)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| TransportError::Tls(e.to_string()))?
                .into_iter()
                .map(CertificateDer::from)
                .collect();
            let mut rd = std::io::Cursor::new(&tls.key_pem);
            let key = rustls_pemfile::private_key(&mut rd)
                .map_err(|e| TransportError::Tls(e.to_string()))?
                .ok_or_else(|| TransportError::Tls("no private key in PEM".into()))?;
            return Ok((certs, key));
        }

        let rcgen::CertifiedKey { cert, signing_key } =
            generate_simple_self_signed(["localhost".to_string()])
                .map_err(|e| TransportError::Tls(e.to_string()))?;
        let cert_der = cert.der().clone();
        let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));
        Ok((vec![cert_der], key_der))
    }

    pub fn server_crypto_config(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<rustls::ServerConfig, TransportError> {
        let mut cfg = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        cfg.alpn_protocols = vec![super::ALPN.to_vec()];
        Ok(cfg)
    }

    pub fn client_crypto_config(
        insecure_skip_verify: bool,
    ) -> Result<rustls::ClientConfig, TransportError> {
        if insecure_skip_verify {
            let mut cfg = rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipServerVerification::new())
                .with_no_client_auth();
            cfg.alpn_protocols = vec![super::ALPN.to_vec()];
            return Ok(cfg);
        }

        let root = rustls::RootCertStore::empty();
        let mut cfg = rustls::ClientConfig::builder()
            .with_root_certificates(root)
            .with_no_client_auth();
        cfg.alpn_protocols = vec![super::ALPN.to_vec()];
        Ok(cfg)
    }

    /// Dummy certificate verifier that treats any certificate as valid.
    /// Only meaningful when `quic_insecure_skip_verify` is set in config,
    /// e.g. for a client talking to a gateway with a self-signed cert whose
    /// fingerprint is already trusted out of band.
    #[derive(Debug)]
    struct SkipServerVerification(Arc<rustls::crypto::CryptoProvider>);

    impl SkipServerVerification {
        fn new() -> Arc<Self> {
            Arc::new(Self(Arc::new(rustls::crypto::ring::default_provider())))
        }
    }

    impl ServerCertVerifier for SkipServerVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}
