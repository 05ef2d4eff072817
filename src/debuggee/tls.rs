//! TLS client side of the debuggee connection.

use crate::dap::args::TlsVerification;
use crate::debuggee::socket::RawStream;
use crate::error::Error;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme,
    StreamOwned,
};
use std::fs::File;
use std::io::{BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Read timeout of an established TLS socket, see [`crate::debuggee::socket::DebuggeeChannel::tls`].
const TLS_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TlsOptions {
    pub verification: TlsVerification,
    /// Client certificate chain (PEM).
    pub certificate: Option<PathBuf>,
    /// Client private key (PEM), when missing the key is read from the certificate file.
    pub key: Option<PathBuf>,
}

/// Certificate verifier for `tlsVerification: ignore`.
#[derive(Debug)]
struct AcceptAnyServer(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServer {
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
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn open_pem(path: &Path) -> Result<BufReader<File>, Error> {
    let file = File::open(path).map_err(|e| {
        Error::InvalidConfiguration(format!("can not open {}: {e}", path.display()))
    })?;
    Ok(BufReader::new(file))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let certs = rustls_pemfile::certs(&mut open_pem(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::InvalidConfiguration(format!("{}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(Error::InvalidConfiguration(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    rustls_pemfile::private_key(&mut open_pem(path)?)
        .map_err(|e| Error::InvalidConfiguration(format!("{}: {e}", path.display())))?
        .ok_or_else(|| {
            Error::InvalidConfiguration(format!("no private key found in {}", path.display()))
        })
}

fn root_store(verification: &TlsVerification) -> Result<RootCertStore, Error> {
    match verification {
        TlsVerification::CaFile(path) => {
            let mut store = RootCertStore::empty();
            let (added, _ignored) = store.add_parsable_certificates(load_certs(path)?);
            if added == 0 {
                return Err(Error::InvalidConfiguration(format!(
                    "no usable CA certificates in {}",
                    path.display()
                )));
            }
            Ok(store)
        }
        _ => Ok(RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        }),
    }
}

/// Build client configuration from attach options.
pub fn client_config(options: &TlsOptions) -> Result<Arc<ClientConfig>, Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder =
        ClientConfig::builder_with_provider(provider.clone()).with_safe_default_protocol_versions()?;

    let builder = match &options.verification {
        TlsVerification::Ignore => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServer(provider))),
        other => builder.with_root_certificates(root_store(other)?),
    };

    let config = match &options.certificate {
        Some(cert) => {
            let key = load_key(options.key.as_deref().unwrap_or(cert))?;
            builder.with_client_auth_cert(load_certs(cert)?, key)?
        }
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// Run client handshake over `stream`, the handshake must complete within `timeout`.
pub fn handshake(
    mut stream: RawStream,
    server_name: &str,
    config: Arc<ClientConfig>,
    timeout: Duration,
) -> Result<StreamOwned<ClientConnection, RawStream>, Error> {
    let name = ServerName::try_from(server_name.to_string()).map_err(|_| {
        Error::InvalidConfiguration(format!("`{server_name}` is not a valid TLS server name"))
    })?;
    let mut conn = ClientConnection::new(config, name)?;

    let deadline = Instant::now() + timeout;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    while conn.is_handshaking() {
        if Instant::now() >= deadline {
            return Err(Error::ConnectTimeout(timeout));
        }
        if let Err(e) = conn.complete_io(&mut stream) {
            if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) {
                return Err(Error::ConnectTimeout(timeout));
            }
            return Err(Error::TlsHandshake(server_name.to_string(), e));
        }
    }
    log::debug!(target: "debuggee", "TLS handshake with {server_name} complete");

    stream.set_write_timeout(None)?;
    stream.set_read_timeout(Some(TLS_POLL))?;
    Ok(StreamOwned::new(conn, stream))
}
