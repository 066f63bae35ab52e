//! QUIC transport.
//!
//! One connection per session. Every frame travels on its own
//! unidirectional stream in both directions; the first client stream carries
//! the `Connect` handshake. Inbound frames are decoded and reported to the
//! [`TransportSink`] by a receive task, and losing the connection is
//! reported as a transient network error.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use quinn::{ClientConfig, Connection, Endpoint, RecvStream};
use tether_core::ErrorCause;
use tether_proto::{Frame, FrameHeader};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{ConnectRequest, Transport, TransportFactory, TransportSink};
use crate::error::TransportError;

/// ALPN protocol id; must match the server's.
pub const ALPN: &[u8] = b"tether";

/// Default idle timeout before quinn drops a silent connection.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// QUIC client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuicConfig {
    /// TLS server name to verify
    pub server_name: String,
    /// Idle timeout
    pub idle_timeout: Duration,
    /// Skip certificate verification. Development only.
    pub insecure: bool,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            server_name: "localhost".to_string(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            insecure: false,
        }
    }
}

/// Opens QUIC transports.
pub struct QuicTransportFactory {
    client_config: ClientConfig,
    server_name: String,
}

impl std::fmt::Debug for QuicTransportFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicTransportFactory").field("server_name", &self.server_name).finish()
    }
}

impl QuicTransportFactory {
    /// Factory from a ready quinn client config.
    pub fn new(client_config: ClientConfig, server_name: impl Into<String>) -> Self {
        Self { client_config, server_name: server_name.into() }
    }

    /// Factory from [`QuicConfig`]. Verifies certificates against the
    /// platform roots unless `insecure` is set.
    pub fn from_config(config: &QuicConfig) -> Result<Self, TransportError> {
        let mut crypto = if config.insecure {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier))
                .with_no_client_auth()
        } else {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::ClientConfig::builder().with_root_certificates(roots).with_no_client_auth()
        };
        crypto.alpn_protocols = vec![ALPN.to_vec()];

        let quic = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .map_err(|e| TransportError::Connection(format!("invalid TLS config: {e}")))?;
        let mut client_config = ClientConfig::new(Arc::new(quic));

        let idle = quinn::IdleTimeout::try_from(config.idle_timeout)
            .map_err(|e| TransportError::Connection(format!("invalid idle timeout: {e}")))?;
        let mut transport = quinn::TransportConfig::default();
        transport.max_idle_timeout(Some(idle));
        client_config.transport_config(Arc::new(transport));

        Ok(Self::new(client_config, config.server_name.clone()))
    }
}

#[async_trait]
impl TransportFactory for QuicTransportFactory {
    async fn open(
        &self,
        request: &ConnectRequest,
        sink: TransportSink,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let addr: SocketAddr = request
            .endpoint
            .parse()
            .map_err(|e| TransportError::Connection(format!("invalid address: {e}")))?;

        let mut endpoint = Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0)))
            .map_err(|e| TransportError::Connection(format!("endpoint creation failed: {e}")))?;
        endpoint.set_default_client_config(self.client_config.clone());

        let connection = endpoint
            .connect(addr, &self.server_name)
            .map_err(|e| TransportError::Connection(format!("connect failed: {e}")))?
            .await
            .map_err(|e| TransportError::Connection(format!("handshake failed: {e}")))?;
        debug!(attempt = sink.attempt(), %addr, "quic connection established");

        let hello = request.connect_payload().to_wire()?;
        write_frame(&connection, &hello).await?;

        let receiver = tokio::spawn(receive_loop(connection.clone(), sink));
        Ok(Box::new(QuicTransport { connection, receiver, _endpoint: endpoint }))
    }
}

struct QuicTransport {
    connection: Connection,
    receiver: JoinHandle<()>,
    _endpoint: Endpoint,
}

#[async_trait]
impl Transport for QuicTransport {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        write_frame(&self.connection, &frame).await
    }

    async fn close(&mut self, code: u16, reason: &str) {
        // Abort first so the local close is not reported as an error.
        self.receiver.abort();
        self.connection.close(quinn::VarInt::from(code), reason.as_bytes());
    }
}

async fn write_frame(connection: &Connection, frame: &[u8]) -> Result<(), TransportError> {
    let mut send = connection
        .open_uni()
        .await
        .map_err(|e| TransportError::Stream(format!("open stream failed: {e}")))?;
    send.write_all(frame).await.map_err(|e| TransportError::Stream(format!("write failed: {e}")))?;
    send.finish().map_err(|e| TransportError::Stream(format!("finish failed: {e}")))?;
    Ok(())
}

async fn receive_loop(connection: Connection, sink: TransportSink) {
    loop {
        match connection.accept_uni().await {
            Ok(recv) => match read_frame(recv).await {
                Ok(bytes) => sink.on_frame(&bytes),
                Err(TransportError::Protocol(e)) => {
                    sink.on_transport_error(ErrorCause::Protocol(e.to_string()));
                },
                Err(e) => warn!(attempt = sink.attempt(), error = %e, "dropping broken stream"),
            },
            Err(e) => {
                debug!(attempt = sink.attempt(), error = %e, "quic connection lost");
                sink.on_transport_error(ErrorCause::Network(e.to_string()));
                return;
            },
        }
    }
}

async fn read_frame(mut recv: RecvStream) -> Result<Vec<u8>, TransportError> {
    let mut buf = vec![0u8; FrameHeader::SIZE];
    recv.read_exact(&mut buf)
        .await
        .map_err(|e| TransportError::Stream(format!("header read failed: {e}")))?;

    let total = Frame::encoded_len(&buf)?;
    buf.resize(total, 0);
    recv.read_exact(&mut buf[FrameHeader::SIZE..])
        .await
        .map_err(|e| TransportError::Stream(format!("payload read failed: {e}")))?;
    trace!(len = total, "frame received");
    Ok(buf)
}

/// Accepts any server certificate. Development only.
#[derive(Debug)]
struct InsecureCertVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
