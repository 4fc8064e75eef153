//! Per-endpoint TLS client configuration
//!
//! Every endpoint gets its own `ClientConfig`: skip-verify, private CA roots
//! and the default trust store are all scoped to the endpoint they are
//! configured on.

use crate::error::ForwardError;
use fleetgate_types::Endpoint;
use rustls::{ClientConfig, RootCertStore};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

pub(crate) fn client_config(endpoint: &Endpoint) -> Result<ClientConfig, ForwardError> {
    if endpoint.tls.skip_verify {
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerification::new()))
            .with_no_client_auth();
        return Ok(config);
    }

    let mut roots = RootCertStore::empty();
    if let Some(ca_path) = &endpoint.tls.ca_cert_path {
        let file = File::open(ca_path).map_err(|_| ForwardError::TlsVerification {
            endpoint_id: endpoint.id,
        })?;
        let mut reader = BufReader::new(file);
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|_| ForwardError::TlsVerification {
                endpoint_id: endpoint.id,
            })?;
            roots
                .add(cert)
                .map_err(|_| ForwardError::TlsVerification {
                    endpoint_id: endpoint.id,
                })?;
        }
    } else {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

mod danger {
    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::crypto::CryptoProvider;
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    /// Accepts any server certificate. Only ever installed on the client of
    /// an endpoint whose TLS policy explicitly enables skip-verify;
    /// signature checks on the handshake itself still run.
    #[derive(Debug)]
    pub(super) struct NoVerification(CryptoProvider);

    impl NoVerification {
        pub(super) fn new() -> Self {
            Self(rustls::crypto::ring::default_provider())
        }
    }

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
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
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}
