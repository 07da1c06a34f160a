//! AutoMTLS 인증서 관리
//!
//! 호스트와 플러그인은 연결마다 자체 서명 인증서를 새로 만들고, 상대방
//! 인증서의 SHA-256 지문을 고정(pin)합니다. CA 체인이나 호스트명 검증은
//! 하지 않으며 지문 일치 여부만 신뢰 기준입니다.

use rcgen::{CertificateParams, DnType, KeyPair};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig,
    SignatureScheme,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use zeroize::Zeroizing;

/// Environment variable carrying the host's PEM certificate to the plugin.
pub const ENV_CLIENT_CERT: &str = "PLUGIN_CLIENT_CERT";

/// SNI name used on the loopback connection. Never verified.
pub const TLS_SERVER_NAME: &str = "localhost";

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("invalid PEM certificate: {0}")]
    Pem(String),

    #[error("invalid TLS server name: {0}")]
    ServerName(String),

    #[error("TLS configuration failed: {0}")]
    Config(#[from] rustls::Error),
}

/// Hex SHA-256 of a DER certificate.
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// One side's ephemeral certificate and private key.
pub struct TlsIdentity {
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    key_der: Zeroizing<Vec<u8>>,
    fingerprint: String,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 키는 절대 출력하지 않음
        f.debug_struct("TlsIdentity")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl TlsIdentity {
    /// Generate a fresh self-signed ECDSA P-256 identity.
    pub fn generate(common_name: &str) -> Result<Self, TlsError> {
        let mut params = CertificateParams::new(vec![TLS_SERVER_NAME.to_string()])?;
        params.distinguished_name.push(DnType::CommonName, common_name);
        params
            .distinguished_name
            .push(DnType::OrganizationName, "saba-plugin");

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;

        let cert_der = cert.der().clone();
        let fingerprint = fingerprint(&cert_der);
        Ok(Self {
            cert_pem: cert.pem(),
            cert_der,
            key_der: Zeroizing::new(key_pair.serialize_der()),
            fingerprint,
        })
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.to_vec()))
    }
}

/// PEM → DER (first certificate in the input).
pub fn parse_pem_certificate(pem: &str) -> Result<CertificateDer<'static>, TlsError> {
    CertificateDer::from_pem_slice(pem.as_bytes()).map_err(|e| TlsError::Pem(e.to_string()))
}

/// Host side: present `identity`, accept only a server cert whose fingerprint
/// matches `server_cert_der`.
pub fn client_config(
    identity: &TlsIdentity,
    server_cert_der: &[u8],
) -> Result<Arc<ClientConfig>, TlsError> {
    let provider = provider();
    let verifier = PinnedServerVerifier {
        expected: fingerprint(server_cert_der),
        provider: provider.clone(),
    };
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(vec![identity.cert_der.clone()], identity.private_key())?;
    Ok(Arc::new(config))
}

/// Plugin side: present `identity`, require a client cert pinned to
/// `client_cert_der`.
pub fn server_config(
    identity: &TlsIdentity,
    client_cert_der: &[u8],
) -> Result<Arc<ServerConfig>, TlsError> {
    let provider = provider();
    let verifier = PinnedClientVerifier {
        expected: fingerprint(client_cert_der),
        provider: provider.clone(),
    };
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(Arc::new(verifier))
        .with_single_cert(vec![identity.cert_der.clone()], identity.private_key())?;
    Ok(Arc::new(config))
}

pub fn server_name() -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(TLS_SERVER_NAME).map_err(|e| TlsError::ServerName(e.to_string()))
}

fn check_pin(expected: &str, presented: &CertificateDer<'_>) -> Result<(), rustls::Error> {
    let actual = fingerprint(presented);
    if actual == expected {
        Ok(())
    } else {
        tracing::warn!(
            "Plugin TLS peer fingerprint mismatch: expected {}… got {}…",
            &expected[..16],
            &actual[..16]
        );
        Err(rustls::Error::InvalidCertificate(
            CertificateError::ApplicationVerificationFailure,
        ))
    }
}

#[derive(Debug)]
struct PinnedServerVerifier {
    expected: String,
    provider: Arc<CryptoProvider>,
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
        check_pin(&self.expected, end_entity)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

#[derive(Debug)]
struct PinnedClientVerifier {
    expected: String,
    provider: Arc<CryptoProvider>,
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
        check_pin(&self.expected, end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}
