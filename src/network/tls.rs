//! TLS for the stream transport.
//!
//! Peers use self-signed (or operator-supplied) certificates. Trust is a
//! set of pinned SHA-256 certificate fingerprints read from trust-store
//! files, reloaded on an interval. Message-level signatures authenticate
//! senders either way; TLS adds confidentiality and, when client
//! certificates are required, an admission policy.

use parking_lot::RwLock;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, SignatureScheme};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// SNI name presented on outbound connections; verification ignores it.
pub const PEER_SERVER_NAME: &str = "chainmesh.node";

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("Invalid certificate")]
    InvalidCertificate,
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid fingerprint {0:?} in trust store")]
    InvalidFingerprint(String),
}

/// Any duplex byte stream a peer connection can run over.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerStream for T {}

pub type BoxedStream = Box<dyn PeerStream>;

pub fn fingerprint(cert_der: &[u8]) -> [u8; 32] {
    Sha256::digest(cert_der).into()
}

/// Parse a hex fingerprint, tolerating `AA:BB:..` separators.
pub fn parse_fingerprint(text: &str) -> Result<[u8; 32], TlsError> {
    let cleaned: String = text.chars().filter(|c| *c != ':').collect();
    let mut out = [0u8; 32];
    hex::decode_to_slice(cleaned.trim(), &mut out)
        .map_err(|_| TlsError::InvalidFingerprint(text.to_string()))?;
    Ok(out)
}

/// Pinned certificate fingerprints backed by read-only files.
#[derive(Debug, Default)]
pub struct TrustStore {
    paths: Vec<PathBuf>,
    fingerprints: RwLock<HashSet<[u8; 32]>>,
}

impl TrustStore {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            paths,
            fingerprints: RwLock::new(HashSet::new()),
        }
    }

    /// Re-read every trust-store file. The previous set is kept on error.
    pub fn reload(&self) -> Result<usize, TlsError> {
        let mut next = HashSet::new();
        for path in &self.paths {
            for line in std::fs::read_to_string(path)?.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                next.insert(parse_fingerprint(line)?);
            }
        }
        let count = next.len();
        *self.fingerprints.write() = next;
        Ok(count)
    }

    pub fn insert(&self, fp: [u8; 32]) {
        self.fingerprints.write().insert(fp);
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.fingerprints.read().len()
    }

    pub fn is_trusted(&self, cert_der: &[u8]) -> bool {
        let presented = fingerprint(cert_der);
        self.fingerprints
            .read()
            .iter()
            .any(|pinned| bool::from(pinned.ct_eq(&presented)))
    }
}

#[derive(Debug)]
struct PinnedServerVerifier {
    trust: Arc<TrustStore>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        // An empty store pins nothing; envelope signatures still authenticate
        if self.trust.is_empty() || self.trust.is_trusted(end_entity.as_ref()) {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Requires a client certificate whose fingerprint is pinned.
#[derive(Debug)]
struct PinnedClientVerifier {
    trust: Arc<TrustStore>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ClientCertVerifier for PinnedClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        if self.trust.is_trusted(end_entity.as_ref()) {
            Ok(ClientCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

/// TLS configuration for secure peer-to-peer communication
#[derive(Clone)]
pub struct TlsConfig {
    pub client_config: Arc<rustls::ClientConfig>,
    pub server_config: Arc<rustls::ServerConfig>,
    trust: Arc<TrustStore>,
    local_fingerprint: [u8; 32],
}

impl TlsConfig {
    /// Generate a fresh self-signed certificate for this node.
    pub fn new_self_signed(
        trust: Arc<TrustStore>,
        require_client_cert: bool,
    ) -> Result<Self, TlsError> {
        let cert = rcgen::generate_simple_self_signed(vec![PEER_SERVER_NAME.to_string()])
            .map_err(|_| TlsError::InvalidCertificate)?;

        let cert_der = CertificateDer::from(cert.cert.der().to_vec());
        let key_der = PrivateKeyDer::try_from(cert.key_pair.serialize_der())
            .map_err(|_| TlsError::InvalidPrivateKey)?;

        Self::build(vec![cert_der], key_der, trust, require_client_cert)
    }

    /// Load TLS configuration from PEM files
    pub fn from_pem_files(
        cert_path: &Path,
        key_path: &Path,
        trust: Arc<TrustStore>,
        require_client_cert: bool,
    ) -> Result<Self, TlsError> {
        let cert_file = std::fs::File::open(cert_path)?;
        let key_file = std::fs::File::open(key_path)?;

        let mut cert_reader = io::BufReader::new(cert_file);
        let mut key_reader = io::BufReader::new(key_file);

        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
        if certs.is_empty() {
            return Err(TlsError::InvalidCertificate);
        }

        let key =
            rustls_pemfile::private_key(&mut key_reader)?.ok_or(TlsError::InvalidPrivateKey)?;

        Self::build(certs, key, trust, require_client_cert)
    }

    fn build(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        trust: Arc<TrustStore>,
        require_client_cert: bool,
    ) -> Result<Self, TlsError> {
        let provider: Arc<CryptoProvider> = Arc::new(rustls::crypto::ring::default_provider());
        let algorithms = provider.signature_verification_algorithms;
        let local_fingerprint = fingerprint(certs[0].as_ref());

        let server_builder = rustls::ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?;
        let server_builder = if require_client_cert {
            server_builder.with_client_cert_verifier(Arc::new(PinnedClientVerifier {
                trust: trust.clone(),
                algorithms,
            }))
        } else {
            server_builder.with_no_client_auth()
        };
        let server_config = server_builder.with_single_cert(certs.clone(), key.clone_key())?;

        // Always present our certificate so pinned servers can admit us
        let mut client_config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PinnedServerVerifier {
                trust: trust.clone(),
                algorithms,
            }))
            .with_client_auth_cert(certs, key)?;

        // Enable session resumption for performance
        client_config.resumption = rustls::client::Resumption::default();

        Ok(Self {
            client_config: Arc::new(client_config),
            server_config: Arc::new(server_config),
            trust,
            local_fingerprint,
        })
    }

    pub fn trust_store(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    /// Hex fingerprint operators add to their peers' trust stores.
    pub fn local_fingerprint(&self) -> String {
        hex::encode(self.local_fingerprint)
    }

    /// Wrap a stream with TLS as a client
    pub async fn connect<S>(&self, stream: S) -> Result<BoxedStream, TlsError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let connector = TlsConnector::from(self.client_config.clone());
        let domain = ServerName::try_from(PEER_SERVER_NAME)
            .map_err(|_| TlsError::InvalidCertificate)?
            .to_owned();
        let tls = connector.connect(domain, stream).await?;
        Ok(Box::new(tls))
    }

    /// Wrap a stream with TLS as a server
    pub async fn accept<S>(&self, stream: S) -> Result<BoxedStream, TlsError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let acceptor = TlsAcceptor::from(self.server_config.clone());
        let tls = acceptor.accept(stream).await?;
        Ok(Box::new(tls))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn handshake(client: &TlsConfig, server: &TlsConfig) -> (bool, bool) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = server.clone();
        let server_task = tokio::spawn(async move {
            match server.accept(b).await {
                Ok(mut stream) => {
                    let mut buf = [0u8; 4];
                    stream.read_exact(&mut buf).await.is_ok()
                }
                Err(_) => false,
            }
        });
        let client_ok = match client.connect(a).await {
            Ok(mut stream) => {
                let wrote = stream.write_all(b"ping").await.is_ok();
                let _ = stream.flush().await;
                wrote
            }
            Err(_) => false,
        };
        let server_ok = server_task.await.unwrap_or(false);
        (client_ok, server_ok)
    }

    #[test]
    fn test_create_self_signed_config() {
        let config = TlsConfig::new_self_signed(Arc::new(TrustStore::default()), false);
        assert!(config.is_ok());
        assert_eq!(config.unwrap().local_fingerprint().len(), 64);
    }

    #[test]
    fn test_trust_store_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trusted.txt");
        let fp = hex::encode([0xABu8; 32]);
        std::fs::write(&path, format!("# pinned peers\n{}\n\n", fp)).unwrap();

        let store = TrustStore::new(vec![path.clone()]);
        assert_eq!(store.reload().unwrap(), 1);
        assert_eq!(store.len(), 1);

        std::fs::write(&path, "not-a-fingerprint\n").unwrap();
        assert!(store.reload().is_err());
        // Previous set survives a bad reload
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_colon_separated_fingerprint() {
        let colon = [0x01u8; 32]
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":");
        assert_eq!(parse_fingerprint(&colon).unwrap(), [0x01u8; 32]);
    }

    #[tokio::test]
    async fn test_tls_handshake_without_pinning() {
        let client = TlsConfig::new_self_signed(Arc::new(TrustStore::default()), false).unwrap();
        let server = TlsConfig::new_self_signed(Arc::new(TrustStore::default()), false).unwrap();
        assert_eq!(handshake(&client, &server).await, (true, true));
    }

    #[tokio::test]
    async fn test_required_client_cert_must_be_pinned() {
        let server_trust = Arc::new(TrustStore::default());
        let server = TlsConfig::new_self_signed(server_trust.clone(), true).unwrap();
        let client = TlsConfig::new_self_signed(Arc::new(TrustStore::default()), false).unwrap();

        let (_, server_ok) = handshake(&client, &server).await;
        assert!(!server_ok);

        server_trust.insert(parse_fingerprint(&client.local_fingerprint()).unwrap());
        assert_eq!(handshake(&client, &server).await, (true, true));
    }

    #[tokio::test]
    async fn test_client_rejects_unpinned_server() {
        let client_trust = Arc::new(TrustStore::default());
        client_trust.insert([0x42u8; 32]);
        let client = TlsConfig::new_self_signed(client_trust, false).unwrap();
        let server = TlsConfig::new_self_signed(Arc::new(TrustStore::default()), false).unwrap();

        let (client_ok, _) = handshake(&client, &server).await;
        assert!(!client_ok);
    }
}
