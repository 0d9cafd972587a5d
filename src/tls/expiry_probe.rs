//! Live TLS endpoint probe: reads the validity window of whatever leaf
//! certificate a host currently serves.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::{ServerCertVerified, ServerCertVerifier};
use tokio_rustls::rustls::{self, Certificate, ClientConfig, ServerName};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::cdn::DomainCertificateStatus;

/// Accepts any chain. The probe only reads dates; it never trusts the peer.
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

fn probe_connector() -> TlsConnector {
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| anyhow!("Certificate timestamp out of range: {}", secs))
}

/// Validity window of a DER-encoded certificate
pub fn certificate_validity(der: &[u8]) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| anyhow!("Failed to parse certificate: {}", e))?;
    let validity = cert.validity();
    Ok((
        timestamp(validity.not_before.timestamp())?,
        timestamp(validity.not_after.timestamp())?,
    ))
}

async fn fetch_leaf(host: &str, port: u16) -> Result<Vec<u8>> {
    let server_name = ServerName::try_from(host)
        .map_err(|e| anyhow!("Invalid server name {}: {}", host, e))?;
    let stream = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("Failed to connect to {}:{}", host, port))?;
    let tls = probe_connector()
        .connect(server_name, stream)
        .await
        .with_context(|| format!("TLS handshake with {}:{} failed", host, port))?;

    let (_, connection) = tls.get_ref();
    let leaf = connection
        .peer_certificates()
        .and_then(|chain| chain.first())
        .ok_or_else(|| anyhow!("{} presented no certificate", host))?;
    Ok(leaf.0.clone())
}

/// Probe `host:port` and report the served certificate's validity.
///
/// Any failure (DNS, connect, handshake, parse, timeout) is reported as "no
/// certificate deployed" so the domain becomes a renewal candidate.
pub async fn probe_certificate(host: &str, port: u16, timeout: Duration) -> DomainCertificateStatus {
    let result = tokio::time::timeout(timeout, fetch_leaf(host, port))
        .await
        .map_err(|_| anyhow!("Timed out after {:?}", timeout))
        .and_then(|inner| inner)
        .and_then(|der| certificate_validity(&der));

    match result {
        Ok((not_before, not_after)) => {
            debug!(domain = %host, %not_after, "Probed certificate");
            DomainCertificateStatus {
                hostname: host.to_string(),
                not_before: Some(not_before),
                not_after: Some(not_after),
            }
        }
        Err(e) => {
            warn!(domain = %host, "Certificate probe failed: {:#}", e);
            DomainCertificateStatus::without_certificate(host)
        }
    }
}
