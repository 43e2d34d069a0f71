//! TLS credentials for authenticated carriers.
//!
//! Two ways to obtain a [`TlsSettings`]: generate an ephemeral
//! self-signed certificate (peer verification disabled on the client
//! side), or load PEM files. Both produce ready-to-use rustls client
//! and server configurations.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rcgen::{CertificateParams, KeyPair};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};

use crate::error::{Error, Result};

/// Validity of a generated self-signed certificate.
pub const SELF_SIGNED_VALIDITY: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// TLS client and server configurations for a transport.
#[derive(Clone)]
pub struct TlsSettings {
    pub(crate) client: Arc<ClientConfig>,
    pub(crate) server: Arc<ServerConfig>,
}

impl std::fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSettings").finish_non_exhaustive()
    }
}

impl TlsSettings {
    /// Generate an ephemeral self-signed certificate.
    ///
    /// The certificate is valid for [`SELF_SIGNED_VALIDITY`] (30 days).
    /// The client configuration accepts any peer certificate, so this
    /// mode provides encryption without authentication.
    pub fn self_signed() -> Result<Self> {
        let (cert, key) = generate_certificate(SELF_SIGNED_VALIDITY)?;

        let server = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .map_err(|e| Error::Tls(e.to_string()))?;

        let client = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth();

        Ok(Self {
            client: Arc::new(client),
            server: Arc::new(server),
        })
    }

    /// Load credentials from PEM files.
    ///
    /// The certificate chain also seeds the client's trust roots, so a
    /// client and server sharing the same files can verify each other.
    pub fn from_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
                .collect::<std::io::Result<_>>()?;
        if certs.is_empty() {
            return Err(Error::Tls(format!(
                "no certificates in {}",
                cert_path.display()
            )));
        }

        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| Error::Tls(format!("no private key in {}", key_path.display())))?;

        let server = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs.clone(), key)
            .map_err(|e| Error::Tls(e.to_string()))?;

        let mut roots = RootCertStore::empty();
        for cert in &certs {
            roots
                .add(cert.clone())
                .map_err(|e| Error::Tls(e.to_string()))?;
        }
        let client = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            client: Arc::new(client),
            server: Arc::new(server),
        })
    }
}

/// Generate a self-signed certificate and its private key.
pub fn generate_certificate(
    validity: Duration,
) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let key_pair = KeyPair::generate().map_err(|e| Error::Tls(e.to_string()))?;

    let mut params = CertificateParams::new(vec!["localhost".to_string()])
        .map_err(|e| Error::Tls(e.to_string()))?;
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before
        + time::Duration::seconds(i64::try_from(validity.as_secs()).unwrap_or(i64::MAX));

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::Tls(e.to_string()))?;

    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    Ok((cert.der().clone(), key))
}

/// Certificate verifier that accepts any peer.
///
/// Installed by [`TlsSettings::self_signed`]; the carrier is encrypted
/// but the peer is not authenticated.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
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
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}
