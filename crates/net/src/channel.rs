//! Mutually authenticated TLS channel to an edge server, framed with a
//! 16-bit big-endian length prefix.
//!
//! Certificate-chain verification is disabled on purpose: the server's
//! identity is checked by pinning the public key recovered from its
//! certificate against the chain's node registry, not by a CA. The
//! client presents an ephemeral certificate for the handshake; its
//! long-lived secp256k1 key stays the protocol identity.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::debug;

use diode_core::bert::FRAME_LIMIT;
use diode_core::crypto;
use diode_core::util::Address;

use crate::error::{Error, Result};

/// Transfer counters shared between the reader half, the actor and the
/// ticket logic. All values are monotonic while a client lives.
#[derive(Debug, Default)]
pub struct Counters {
    pub total_bytes: AtomicU64,
    pub total_connections: AtomicU64,
    /// Byte count covered by the last submitted ticket.
    pub counter: AtomicU64,
}

impl Counters {
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn counter(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    pub fn update_counter(&self, n: u64) {
        self.counter.store(n, Ordering::Relaxed);
    }

    fn add_bytes(&self, n: u64) {
        self.total_bytes.fetch_add(n, Ordering::Relaxed);
    }
}

pub struct Channel {
    pub reader: FrameReader,
    pub writer: FrameWriter,
    pub local_addr: SocketAddr,
    pub server_id: Option<Address>,
}

pub struct FrameReader {
    inner: ReadHalf<TlsStream<TcpStream>>,
    counters: Arc<Counters>,
}

pub struct FrameWriter {
    inner: WriteHalf<TlsStream<TcpStream>>,
    counters: Arc<Counters>,
}

impl FrameReader {
    /// Read one length-prefixed frame payload.
    pub async fn read_frame(&mut self) -> io::Result<Vec<u8>> {
        let mut prefix = [0u8; 2];
        self.inner.read_exact(&mut prefix).await?;
        let len = u16::from_be_bytes(prefix) as usize;
        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload).await?;
        self.counters.add_bytes((2 + len) as u64);
        Ok(payload)
    }
}

impl FrameWriter {
    /// Write one length-prefixed frame.
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > FRAME_LIMIT {
            return Err(Error::MalformedFrame);
        }
        let prefix = (payload.len() as u16).to_be_bytes();
        self.inner.write_all(&prefix).await?;
        self.inner.write_all(payload).await?;
        self.inner.flush().await?;
        self.counters.add_bytes((2 + payload.len()) as u64);
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

/// Open the TLS session and split it into framed halves. Bumps the
/// connection counter on success.
pub async fn dial(
    host: &str,
    counters: Arc<Counters>,
    keepalive: Option<Duration>,
) -> Result<Channel> {
    let tcp = TcpStream::connect(host).await?;
    tcp.set_nodelay(true)?;
    if let Some(interval) = keepalive {
        let ka = socket2::TcpKeepalive::new().with_time(interval);
        socket2::SockRef::from(&tcp).set_tcp_keepalive(&ka)?;
    }
    let local_addr = tcp.local_addr()?;

    let config = insecure_client_config()?;
    let connector = TlsConnector::from(Arc::new(config));
    let name = host.rsplit_once(':').map_or(host, |(h, _)| h);
    let server_name = ServerName::try_from(name.to_string())
        .map_err(|_| Error::Transport(io::Error::new(io::ErrorKind::InvalidInput, "bad host")))?;
    let stream = connector.connect(server_name, tcp).await?;

    let server_id = stream
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .and_then(|cert| extract_server_id(cert.as_ref()));
    debug!(host, server_id = ?server_id, "tls session established");

    counters.total_connections.fetch_add(1, Ordering::Relaxed);
    let (read_half, write_half) = tokio::io::split(stream);
    Ok(Channel {
        reader: FrameReader {
            inner: read_half,
            counters: counters.clone(),
        },
        writer: FrameWriter {
            inner: write_half,
            counters,
        },
        local_addr,
        server_id,
    })
}

/// Client-side TLS config: ephemeral identity cert, no server-cert
/// verification. Shared by the edge channel and the end-to-end layer.
pub fn insecure_client_config() -> Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let (cert, key) = ephemeral_identity()?;
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureVerifier { provider }))
        .with_client_auth_cert(vec![cert], key)?;
    Ok(config)
}

/// Server-side TLS config for the accepting end of an end-to-end tunnel.
pub fn insecure_server_config() -> Result<ServerConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let (cert, key) = ephemeral_identity()?;
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)?;
    Ok(config)
}

fn ephemeral_identity() -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["diode.client".to_string()]).map_err(|e| {
            Error::Transport(io::Error::new(io::ErrorKind::Other, e))
        })?;
    let cert_der = cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    Ok((cert_der, key_der))
}

/// Pull the node identity out of the server certificate: scan the DER
/// for the uncompressed-point BIT STRING and derive the address from the
/// key. Keys that do not parse as secp256k1 points are pinned by their
/// raw coordinates so the registry comparison still has a stable value.
pub fn extract_server_id(der: &[u8]) -> Option<Address> {
    const MARKER: [u8; 4] = [0x03, 0x42, 0x00, 0x04];
    let start = der.windows(4).position(|w| w == MARKER)? + 3;
    let raw = der.get(start..start + 65)?;
    if let Ok(addr) = crypto::raw_public_key_to_address(raw) {
        return Some(addr);
    }
    let digest = crypto::keccak256(&raw[1..]);
    Address::from_slice(&digest[12..])
}

#[derive(Debug)]
struct InsecureVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Framed reader/writer over any byte stream; used by the in-process
/// test servers and the end-to-end layer, same framing as the channel.
pub async fn read_frame_from<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<Vec<u8>> {
    let mut prefix = [0u8; 2];
    stream.read_exact(&mut prefix).await?;
    let len = u16::from_be_bytes(prefix) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

pub async fn write_frame_to<S: AsyncWrite + Unpin>(stream: &mut S, payload: &[u8]) -> Result<()> {
    if payload.len() > FRAME_LIMIT {
        return Err(Error::MalformedFrame);
    }
    stream.write_all(&(payload.len() as u16).to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_id_extraction() {
        let sk = diode_core::crypto::signing_key_from_bytes(&{
            let mut raw = [3u8; 32];
            raw[0] = 1;
            raw
        })
        .unwrap();
        let vk = sk.verifying_key();
        let point = vk.to_encoded_point(false);
        // fake DER: garbage around the subjectPublicKey BIT STRING
        let mut der = vec![0x30, 0x10, 0xaa, 0xbb];
        der.extend_from_slice(&[0x03, 0x42, 0x00]);
        der.extend_from_slice(point.as_bytes());
        der.extend_from_slice(&[0x01, 0x02]);
        let id = extract_server_id(&der).unwrap();
        assert_eq!(id, diode_core::crypto::public_key_to_address(vk));
    }

    #[test]
    fn extraction_rejects_truncated() {
        let der = [0x03, 0x42, 0x00, 0x04, 0x01];
        assert!(extract_server_id(&der).is_none());
    }
}
