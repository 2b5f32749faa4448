use std::io::{self, BufReader, ErrorKind};
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::common::phys::PhysLayer;

/// TLS-related errors
#[derive(Debug)]
pub enum TlsError {
    /// Invalid peer certificate
    InvalidPeerCertificate(io::Error),
    /// Invalid local certificate
    InvalidLocalCertificate(io::Error),
    /// Invalid private key
    InvalidPrivateKey(io::Error),
    /// Error building TLS configuration
    BadConfig(String),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPeerCertificate(err) => {
                write!(f, "invalid peer certificate file: {err}")
            }
            Self::InvalidLocalCertificate(err) => {
                write!(f, "invalid local certificate file: {err}")
            }
            Self::InvalidPrivateKey(err) => write!(f, "invalid private key file: {err}"),
            Self::BadConfig(err) => write!(f, "bad config: {err}"),
        }
    }
}

impl std::error::Error for TlsError {}

impl From<rustls::Error> for TlsError {
    fn from(err: rustls::Error) -> Self {
        Self::BadConfig(err.to_string())
    }
}

/// Minimum TLS version to allow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinTlsVersion {
    /// TLS 1.2
    V1_2,
    /// TLS 1.3
    V1_3,
}

impl MinTlsVersion {
    fn to_rustls(self) -> &'static [&'static rustls::SupportedProtocolVersion] {
        static MIN_TLS12_VERSIONS: &[&rustls::SupportedProtocolVersion] =
            &[&rustls::version::TLS13, &rustls::version::TLS12];
        static MIN_TLS13_VERSIONS: &[&rustls::SupportedProtocolVersion] =
            &[&rustls::version::TLS13];

        match self {
            Self::V1_2 => MIN_TLS12_VERSIONS,
            Self::V1_3 => MIN_TLS13_VERSIONS,
        }
    }
}

/// TLS configuration of a listener
#[derive(Clone)]
pub struct TlsServerConfig {
    inner: Arc<rustls::ServerConfig>,
}

impl TlsServerConfig {
    /// Load the server identity from PEM files
    ///
    /// When `peer_ca_path` is provided, masters must present a certificate chaining to one of
    /// the authorities in that file. Otherwise any master may connect.
    pub fn new(
        local_cert_path: &Path,
        private_key_path: &Path,
        peer_ca_path: Option<&Path>,
        min_tls_version: MinTlsVersion,
    ) -> Result<Self, TlsError> {
        let local_certs = read_certificates(local_cert_path)
            .map_err(TlsError::InvalidLocalCertificate)?;
        let private_key =
            read_private_key(private_key_path).map_err(TlsError::InvalidPrivateKey)?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = rustls::ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(min_tls_version.to_rustls())?;

        let builder = match peer_ca_path {
            None => builder.with_no_client_auth(),
            Some(path) => {
                let mut roots = rustls::RootCertStore::empty();
                for cert in read_certificates(path).map_err(TlsError::InvalidPeerCertificate)? {
                    roots.add(cert).map_err(|err| {
                        TlsError::InvalidPeerCertificate(io::Error::new(
                            ErrorKind::InvalidData,
                            err.to_string(),
                        ))
                    })?;
                }
                let verifier =
                    rustls::server::WebPkiClientVerifier::builder_with_provider(
                        Arc::new(roots),
                        provider,
                    )
                    .build()
                    .map_err(|err| TlsError::BadConfig(err.to_string()))?;
                builder.with_client_cert_verifier(verifier)
            }
        };

        let config = builder.with_single_cert(local_certs, private_key)?;

        Ok(Self {
            inner: Arc::new(config),
        })
    }

    /// Use a `rustls` configuration built by the caller as is
    pub fn from_rustls(config: Arc<rustls::ServerConfig>) -> Self {
        Self { inner: config }
    }

    pub(crate) async fn handle_connection(&self, socket: TcpStream) -> Result<PhysLayer, String> {
        let acceptor = tokio_rustls::TlsAcceptor::from(self.inner.clone());
        match acceptor.accept(socket).await {
            Err(err) => Err(format!("failed to establish TLS session: {err}")),
            Ok(stream) => {
                tracing::debug!("TLS session established");
                Ok(PhysLayer::new_tls(stream))
            }
        }
    }
}

fn read_certificates(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(std::fs::File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            "no certificate found in file",
        ));
    }
    Ok(certs)
}

fn read_private_key(path: &Path) -> io::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(std::fs::File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidData, "no private key found in file"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("modbus-slave-{}-{name}", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn missing_certificate_file_is_reported() {
        let key = temp_file("missing-cert.key", "");
        let result = TlsServerConfig::new(
            Path::new("/does/not/exist.pem"),
            &key,
            None,
            MinTlsVersion::V1_2,
        );
        assert!(matches!(result, Err(TlsError::InvalidLocalCertificate(_))));
    }

    #[test]
    fn certificate_file_without_certificates_is_reported() {
        let cert = temp_file("empty.pem", "not a certificate\n");
        let key = temp_file("empty.key", "");
        let result = TlsServerConfig::new(&cert, &key, None, MinTlsVersion::V1_3);
        match result {
            Err(TlsError::InvalidLocalCertificate(err)) => {
                assert_eq!(err.kind(), ErrorKind::InvalidData)
            }
            _ => panic!("expected an invalid local certificate"),
        }
    }

    #[test]
    fn protocol_versions_respect_the_minimum() {
        assert_eq!(MinTlsVersion::V1_2.to_rustls().len(), 2);
        assert_eq!(MinTlsVersion::V1_3.to_rustls().len(), 1);
    }
}
