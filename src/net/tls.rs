//! TLS transport with directory-based certificate pinning. Deliberately
//! *not* a CA-chain validator: a connection is accepted only if the
//! peer's leaf certificate DER bytes exactly match a file under
//! `<remote_cert_dir>/<hostname-or-ip>.pem`. Full chain validation,
//! CRLs, and OCSP are out of scope.

use crate::error::{JalError, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, Error as TlsError, SignatureScheme};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Certificates pinned by hostname/IP, loaded once from
/// `remote_cert_dir` at startup.
#[derive(Debug)]
pub struct PinnedCerts {
    by_name: HashMap<String, CertificateDer<'static>>,
}

impl PinnedCerts {
    pub fn load(dir: &Path) -> Result<Self> {
        let mut by_name = HashMap::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pem") {
                continue;
            }
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| JalError::Tls(format!("unreadable cert filename: {path:?}")))?
                .to_string();
            let pem = std::fs::read(&path)?;
            let mut certs = rustls_pemfile::certs(&mut pem.as_slice());
            let cert = certs
                .next()
                .ok_or_else(|| JalError::Tls(format!("no certificate in {path:?}")))?
                .map_err(|e| JalError::Tls(format!("{path:?}: {e}")))?;
            by_name.insert(name, cert);
        }
        Ok(PinnedCerts { by_name })
    }

    fn matches(&self, name: &str, cert: &CertificateDer<'_>) -> bool {
        self.by_name.get(name).is_some_and(|pinned| pinned.as_ref() == cert.as_ref())
    }

    fn matches_any(&self, cert: &CertificateDer<'_>) -> bool {
        self.by_name.values().any(|pinned| pinned.as_ref() == cert.as_ref())
    }
}

/// Verifies a server's leaf certificate against the pinned set for the
/// hostname being connected to. Used when *we* are the TCP client
/// (subscribing from a remote publisher).
#[derive(Debug)]
pub struct PinningServerVerifier {
    pinned: Arc<PinnedCerts>,
}

impl PinningServerVerifier {
    pub fn new(pinned: Arc<PinnedCerts>) -> Self {
        PinningServerVerifier { pinned }
    }
}

impl ServerCertVerifier for PinningServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, TlsError> {
        let name = server_name_to_string(server_name);
        if self.pinned.matches(&name, end_entity) {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(TlsError::General(format!(
                "no pinned certificate for {name}"
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Verifies an inbound client's leaf certificate against the full pinned
/// set (we don't know which hostname is connecting until after the
/// handshake completes, so any pin match is accepted here; the peer
/// policy layer does the hostname-specific publish/subscribe check
/// afterwards).
#[derive(Debug)]
pub struct PinningClientVerifier {
    pinned: Arc<PinnedCerts>,
    root_hint_subjects: Vec<DistinguishedName>,
}

impl PinningClientVerifier {
    pub fn new(pinned: Arc<PinnedCerts>) -> Self {
        PinningClientVerifier {
            pinned,
            root_hint_subjects: Vec::new(),
        }
    }
}

impl ClientCertVerifier for PinningClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &self.root_hint_subjects
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, TlsError> {
        if self.pinned.matches_any(end_entity) {
            Ok(ClientCertVerified::assertion())
        } else {
            Err(TlsError::General("certificate not pinned".to_string()))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn server_name_to_string(name: &ServerName<'_>) -> String {
    match name {
        ServerName::DnsName(dns) => dns.as_ref().to_string(),
        ServerName::IpAddress(ip) => std::net::IpAddr::from(*ip).to_string(),
        _ => "<unknown>".to_string(),
    }
}

fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)?;
    rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| JalError::Tls(format!("{}: {e}", path.display())))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| JalError::Tls(format!("{}: {e}", path.display())))?
        .ok_or_else(|| JalError::Tls(format!("no private key found in {}", path.display())))
}

/// Builds the server-side TLS configuration: our own identity
/// (`public_cert`/`private_key`) plus mandatory client-certificate
/// pinning against `remote_cert_dir`. Every inbound connection must
/// present a certificate that matches one of the pinned files — this is
/// the directory-based pinning used in place of a CA-chain validator.
pub fn server_config(
    private_key: &Path,
    public_cert: &Path,
    pinned: Arc<PinnedCerts>,
) -> Result<rustls::ServerConfig> {
    let cert_chain = load_cert_chain(public_cert)?;
    let key = load_private_key(private_key)?;
    let verifier = Arc::new(PinningClientVerifier::new(pinned));
    rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(cert_chain, key)
        .map_err(|e| JalError::Tls(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_pem_files_keyed_by_stem() {
        let dir = tempfile::tempdir().unwrap();
        // A syntactically valid, self-signed throwaway cert isn't needed
        // here: `load` only needs `rustls_pemfile::certs` to find one PEM
        // block, so this exercises the file-selection logic without
        // depending on a real key pair.
        let pem = b"-----BEGIN CERTIFICATE-----\nMAA=\n-----END CERTIFICATE-----\n";
        std::fs::write(dir.path().join("collector-a.pem"), pem).unwrap();
        std::fs::write(dir.path().join("ignored.txt"), b"not a cert").unwrap();

        let pinned = PinnedCerts::load(dir.path()).unwrap();
        assert!(pinned.by_name.contains_key("collector-a"));
        assert_eq!(pinned.by_name.len(), 1);
    }
}
