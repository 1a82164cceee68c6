//! TLS client configuration shared by the TCP connection and HTTP client.
//!
//! The trust store is a union: a caller-supplied PEM anchor (when present)
//! plus the platform's root bundle, so certificates chaining to either are
//! accepted.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::debug;

use crate::error::TlsError;

/// Builds a verifying client config from the optional PEM trust anchor plus
/// the platform root bundle.
pub(crate) fn client_config(anchor: Option<&[u8]>) -> Result<Arc<ClientConfig>, TlsError> {
	let mut roots = RootCertStore::empty();

	if let Some(pem) = anchor {
		let mut parsed = 0usize;
		for cert in rustls_pemfile::certs(&mut &pem[..]) {
			let cert = cert.map_err(|e| TlsError::InvalidAnchor { reason: e.to_string() })?;
			roots
				.add(cert)
				.map_err(|e| TlsError::InvalidAnchor { reason: e.to_string() })?;
			parsed += 1;
		}
		if parsed == 0 {
			return Err(TlsError::InvalidAnchor {
				reason: "no certificate found in pem input".to_string(),
			});
		}
	}

	let native = rustls_native_certs::load_native_certs();
	for err in &native.errors {
		debug!(error = %err, "skipping unloadable platform root");
	}
	let (added, ignored) = roots.add_parsable_certificates(native.certs);
	debug!(added, ignored, "platform root store loaded");

	if roots.is_empty() {
		return Err(TlsError::Session {
			reason: "trust store is empty".to_string(),
		});
	}

	Ok(Arc::new(
		ClientConfig::builder()
			.with_root_certificates(roots)
			.with_no_client_auth(),
	))
}

/// Builds a client config that skips server certificate verification.
///
/// Used by the HTTP client when no trust anchor was supplied. Encryption
/// still happens but the peer is unauthenticated; callers opting into this
/// accept man-in-the-middle exposure.
pub(crate) fn client_config_unverified() -> Arc<ClientConfig> {
	let provider = rustls::crypto::aws_lc_rs::default_provider();
	Arc::new(
		ClientConfig::builder()
			.dangerous()
			.with_custom_certificate_verifier(Arc::new(NoVerify { provider }))
			.with_no_client_auth(),
	)
}

/// Accepts any server certificate. Signature checks still run so a garbled
/// handshake fails rather than silently passing.
#[derive(Debug)]
struct NoVerify {
	provider: CryptoProvider,
}

impl ServerCertVerifier for NoVerify {
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
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		rustls::crypto::verify_tls12_signature(
			message,
			cert,
			dss,
			&self.provider.signature_verification_algorithms,
		)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		rustls::crypto::verify_tls13_signature(
			message,
			cert,
			dss,
			&self.provider.signature_verification_algorithms,
		)
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self.provider
			.signature_verification_algorithms
			.supported_schemes()
	}
}
