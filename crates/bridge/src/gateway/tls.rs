// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! TLS setup for the GW connection.
//!
//! The GW presents a self-signed certificate. If `tlsFingerprint` is
//! configured, the presented leaf certificate's SHA-256 fingerprint must
//! match exactly; otherwise any self-signed certificate is accepted. Either
//! way the handshake signature itself is still verified — only chain-of-trust
//! validation is skipped, matching what a household gateway with no real CA
//! can offer.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, Error as TlsError, SignatureScheme};
use sha2::{Digest, Sha256};

/// Verifier that trusts any certificate (self-signed GW default), or that
/// pins an exact SHA-256 fingerprint when one is configured.
#[derive(Debug)]
struct GatewayCertVerifier {
    expected_fingerprint: Option<[u8; 32]>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for GatewayCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        if let Some(expected) = self.expected_fingerprint {
            let actual: [u8; 32] = Sha256::digest(end_entity.as_ref()).into();
            if actual != expected {
                return Err(TlsError::General(format!(
                    "GW certificate fingerprint mismatch: expected {}, got {}",
                    hex(&expected),
                    hex(&actual)
                )));
            }
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Parse a colon- or bare-hex SHA-256 fingerprint string (e.g.
/// `"AA:BB:CC:..."` or `"aabbcc..."`) into raw bytes.
pub fn parse_fingerprint(s: &str) -> Option<[u8; 32]> {
    let cleaned: String = s.chars().filter(|c| *c != ':' && *c != ' ').collect();
    if cleaned.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, chunk) in cleaned.as_bytes().chunks(2).enumerate() {
        let byte_str = std::str::from_utf8(chunk).ok()?;
        out[i] = u8::from_str_radix(byte_str, 16).ok()?;
    }
    Some(out)
}

/// Build a `rustls::ClientConfig` that accepts the GW's self-signed
/// certificate, pinning `tls_fingerprint` when present.
pub fn client_config(tls_fingerprint: Option<&str>) -> Result<Arc<ClientConfig>, crate::error::BridgeError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let expected_fingerprint = tls_fingerprint.and_then(parse_fingerprint);
    let verifier = Arc::new(GatewayCertVerifier { expected_fingerprint, provider: Arc::clone(&provider) });

    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| crate::error::BridgeError::transport(format!("unsupported TLS provider config: {e}")))?;
    let config = builder.dangerous().with_custom_certificate_verifier(verifier).with_no_client_auth();
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_fingerprint_accepts_colon_separated_hex() {
        let s = "AA:BB:CC:00:11:22:33:44:55:66:77:88:99:AA:BB:CC:DD:EE:FF:00:11:22:33:44:55:66:77:88:99:AA:BB:CC";
        let parsed = parse_fingerprint(s).unwrap();
        assert_eq!(parsed[0], 0xAA);
        assert_eq!(parsed[1], 0xBB);
    }

    #[test]
    fn parse_fingerprint_rejects_wrong_length() {
        assert!(parse_fingerprint("aabbcc").is_none());
    }

    #[test]
    fn client_config_builds_without_fingerprint() {
        assert!(client_config(None).is_ok());
    }

    #[test]
    fn client_config_builds_with_fingerprint() {
        let fp = "00".repeat(32);
        assert!(client_config(Some(&fp)).is_ok());
    }
}
