//! Certificate thumbprint pinning
//!
//! vCenter commonly runs with a self-signed certificate. Instead of a CA
//! chain, the operator supplies the SHA-1 thumbprint of the leaf certificate
//! (the format `govc about.cert -thumbprint` prints) and only that exact
//! certificate is accepted.

use crate::error::VSphereError;
use ring::digest::{SHA1_FOR_LEGACY_USE_ONLY, digest};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;

const SHA1_LEN: usize = 20;

/// Parse a thumbprint, accepting upper or lower case with or without `:`
pub fn parse_thumbprint(thumbprint: &str) -> Result<Vec<u8>, VSphereError> {
    let hex: String = thumbprint
        .chars()
        .filter(|c| *c != ':' && !c.is_whitespace())
        .collect();
    if hex.len() != SHA1_LEN * 2 || !hex.is_ascii() {
        return Err(VSphereError::Tls(format!("invalid thumbprint {:?}", thumbprint)));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| VSphereError::Tls(format!("invalid thumbprint {:?}", thumbprint)))
        })
        .collect()
}

/// Format a fingerprint the way vCenter displays it
pub fn format_thumbprint(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Accepts exactly one leaf certificate, identified by its SHA-1 fingerprint
#[derive(Debug)]
pub struct ThumbprintVerifier {
    expected: Vec<u8>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ThumbprintVerifier {
    /// Create a verifier for the given thumbprint
    pub fn new(thumbprint: &str, algorithms: WebPkiSupportedAlgorithms) -> Result<Self, VSphereError> {
        Ok(Self {
            expected: parse_thumbprint(thumbprint)?,
            algorithms,
        })
    }

    fn matches(&self, certificate: &[u8]) -> Result<(), String> {
        let actual = digest(&SHA1_FOR_LEGACY_USE_ONLY, certificate);
        if actual.as_ref() == self.expected.as_slice() {
            Ok(())
        } else {
            Err(format!(
                "certificate thumbprint mismatch: expected {}, got {}",
                format_thumbprint(&self.expected),
                format_thumbprint(actual.as_ref())
            ))
        }
    }
}

impl ServerCertVerifier for ThumbprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.matches(end_entity.as_ref())
            .map(|()| ServerCertVerified::assertion())
            .map_err(rustls::Error::General)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// rustls client configuration pinned to a single certificate thumbprint
pub fn pinned_client_config(thumbprint: &str) -> Result<rustls::ClientConfig, VSphereError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = ThumbprintVerifier::new(thumbprint, provider.signature_verification_algorithms)?;
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| VSphereError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(config)
}
