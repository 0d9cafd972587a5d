use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use std::io::{BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

const CERT_SUFFIX: &str = "_cert.pem";
const KEY_SUFFIX: &str = "_key.pem";
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";
const MAX_NAME_ATTEMPTS: u32 = 100;

/// Metadata read from a leaf certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Serial number as lowercase hex, without leading zero bytes
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Domain names this certificate is valid for
    pub domains: Vec<String>,
}

/// A freshly issued certificate chain with the domain key it was issued for
#[derive(Clone)]
pub struct IssuedCertificate {
    /// DER chain, leaf first
    pub chain: Vec<Vec<u8>>,
    pub chain_pem: String,
    pub key_pem: String,
    pub leaf: CertificateInfo,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("chain_len", &self.chain.len())
            .field("leaf", &self.leaf)
            .field("key_pem", &"<REDACTED>")
            .finish()
    }
}

impl IssuedCertificate {
    pub fn from_pem(chain_pem: String, key_pem: String) -> Result<Self> {
        let chain = parse_certificate_chain(&chain_pem)?;
        let leaf = extract_cert_info(&chain[0]).context("Failed to read leaf certificate")?;
        Ok(Self {
            chain,
            chain_pem,
            key_pem,
            leaf,
        })
    }
}

/// A certificate/key pair on disk
#[derive(Debug, Clone)]
pub struct StoredCertificate {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub certificate: IssuedCertificate,
}

/// Parse every certificate in a PEM bundle, preserving order
pub fn parse_certificate_chain(pem: &str) -> Result<Vec<Vec<u8>>> {
    let mut reader = BufReader::new(pem.as_bytes());
    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|e| anyhow!("Failed to parse PEM certificate: {}", e))?;

    if certs.is_empty() {
        bail!("No certificates found in PEM data");
    }
    Ok(certs)
}

/// Extract serial, validity and domains from a DER certificate
pub fn extract_cert_info(der: &[u8]) -> Result<CertificateInfo> {
    use x509_parser::extensions::{GeneralName, ParsedExtension};
    use x509_parser::parse_x509_certificate;

    let (_, x509) = parse_x509_certificate(der)
        .map_err(|e| anyhow!("Failed to parse X.509 certificate: {}", e))?;

    let serial = serial_hex(x509.raw_serial());
    let not_before = parse_asn1_time(&x509.validity().not_before)?;
    let not_after = parse_asn1_time(&x509.validity().not_after)?;

    let mut domains = Vec::new();
    if let Some(cn) = x509.subject().iter_common_name().next() {
        if let Ok(cn_str) = cn.as_str() {
            domains.push(cn_str.to_string());
        }
    }

    for ext in x509.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
            for name in &san.general_names {
                if let GeneralName::DNSName(dns) = name {
                    domains.push(dns.to_string());
                }
            }
        }
    }

    domains.sort();
    domains.dedup();

    Ok(CertificateInfo {
        serial,
        not_before,
        not_after,
        domains,
    })
}

fn serial_hex(raw: &[u8]) -> String {
    let start = raw.iter().position(|b| *b != 0).unwrap_or(raw.len().saturating_sub(1));
    raw[start..].iter().map(|b| format!("{:02x}", b)).collect()
}

fn parse_asn1_time(time: &x509_parser::time::ASN1Time) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(time.timestamp(), 0)
        .single()
        .ok_or_else(|| anyhow!("Failed to convert ASN.1 time to DateTime"))
}

/// Persists issued certificates as `<domain>_<timestamp>_cert.pem` and
/// `<domain>_<timestamp>_key.pem`. Files are never overwritten.
#[derive(Debug)]
pub struct CertificateStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl CertificateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn save(&self, domain: &str, certificate: &IssuedCertificate) -> Result<StoredCertificate> {
        self.save_at(domain, certificate, Utc::now()).await
    }

    /// Save under the timestamp of `now`, suffixing `-N` when that name is taken
    pub async fn save_at(
        &self,
        domain: &str,
        certificate: &IssuedCertificate,
        now: DateTime<Utc>,
    ) -> Result<StoredCertificate> {
        let _guard = self.write_lock.lock().await;

        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create certificate directory: {}", self.dir.display()))?;

        let timestamp = now.format(TIMESTAMP_FORMAT).to_string();

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let stem = if attempt == 0 {
                format!("{}_{}", domain, timestamp)
            } else {
                format!("{}_{}-{}", domain, timestamp, attempt)
            };
            let cert_path = self.dir.join(format!("{}{}", stem, CERT_SUFFIX));
            let key_path = self.dir.join(format!("{}{}", stem, KEY_SUFFIX));

            match write_new(&cert_path, certificate.chain_pem.as_bytes(), false) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!("{} exists, trying next name", cert_path.display());
                    continue;
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to write certificate: {}", cert_path.display()))
                }
            }

            if let Err(e) = write_new(&key_path, certificate.key_pem.as_bytes(), true) {
                let _ = std::fs::remove_file(&cert_path);
                return Err(e).with_context(|| format!("Failed to write private key: {}", key_path.display()));
            }

            info!(
                domain = %domain,
                serial = %certificate.leaf.serial,
                "Saved certificate to {}",
                cert_path.display()
            );

            return Ok(StoredCertificate {
                cert_path,
                key_path,
                certificate: certificate.clone(),
            });
        }

        bail!("No free certificate file name for {} at {}", domain, timestamp)
    }

    /// Most recently saved certificate for `domain`, if any
    pub async fn latest(&self, domain: &str) -> Result<Option<StoredCertificate>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read certificate directory: {}", self.dir.display()))
            }
        };

        let prefix = format!("{}_", domain);
        let mut newest: Option<((String, u32), String)> = None;

        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else { continue };
            let Some(stamp) = name
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_suffix(CERT_SUFFIX))
            else {
                continue;
            };
            let Some(order) = parse_stamp(stamp) else { continue };

            let stem = name.trim_end_matches(CERT_SUFFIX).to_string();
            if newest.as_ref().map_or(true, |(best, _)| order > *best) {
                newest = Some((order, stem));
            }
        }

        let Some((_, stem)) = newest else {
            return Ok(None);
        };

        let cert_path = self.dir.join(format!("{}{}", stem, CERT_SUFFIX));
        let key_path = self.dir.join(format!("{}{}", stem, KEY_SUFFIX));

        let chain_pem = std::fs::read_to_string(&cert_path)
            .with_context(|| format!("Failed to read certificate file: {}", cert_path.display()))?;
        let key_pem = std::fs::read_to_string(&key_path)
            .with_context(|| format!("Failed to read key file: {}", key_path.display()))?;
        let certificate = IssuedCertificate::from_pem(chain_pem, key_pem)
            .with_context(|| format!("Failed to parse {}", cert_path.display()))?;

        Ok(Some(StoredCertificate {
            cert_path,
            key_path,
            certificate,
        }))
    }
}

/// `20250101120000` or `20250101120000-3` into a sortable key
fn parse_stamp(stamp: &str) -> Option<(String, u32)> {
    let (ts, counter) = match stamp.split_once('-') {
        Some((ts, n)) => (ts, n.parse().ok()?),
        None => (stamp, 0),
    };
    if ts.len() != 14 || !ts.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((ts.to_string(), counter))
}

fn write_new(path: &Path, contents: &[u8], private: bool) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(if private { 0o600 } else { 0o644 });
    }
    #[cfg(not(unix))]
    let _ = private;

    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minted_chain(domain: &str) -> (String, String) {
        let leaf_key = rcgen::KeyPair::generate().unwrap();
        let leaf = rcgen::CertificateParams::new(vec![domain.to_string()])
            .unwrap()
            .self_signed(&leaf_key)
            .unwrap();
        let issuer_key = rcgen::KeyPair::generate().unwrap();
        let issuer = rcgen::CertificateParams::new(vec!["issuer.test".to_string()])
            .unwrap()
            .self_signed(&issuer_key)
            .unwrap();
        (format!("{}{}", leaf.pem(), issuer.pem()), leaf_key.serialize_pem())
    }

    #[test]
    fn test_parse_invalid_certificate() {
        assert!(parse_certificate_chain("NOT A PEM FILE").is_err());
        assert!(parse_certificate_chain("").is_err());
    }

    #[test]
    fn test_serial_hex_strips_padding() {
        assert_eq!(serial_hex(&[0x00, 0x8f, 0x01]), "8f01");
        assert_eq!(serial_hex(&[0x00]), "00");
    }

    #[test]
    fn test_parse_stamp() {
        assert_eq!(parse_stamp("20250101120000"), Some(("20250101120000".to_string(), 0)));
        assert_eq!(parse_stamp("20250101120000-2"), Some(("20250101120000".to_string(), 2)));
        assert_eq!(parse_stamp("2025"), None);
        assert_eq!(parse_stamp("backup"), None);
    }

    #[tokio::test]
    async fn test_save_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path());
        let (chain, key) = minted_chain("a.example.com");
        let cert = IssuedCertificate::from_pem(chain, key).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();

        let first = store.save_at("a.example.com", &cert, now).await.unwrap();
        let second = store.save_at("a.example.com", &cert, now).await.unwrap();

        assert_eq!(
            first.cert_path.file_name().unwrap(),
            "a.example.com_20250301120000_cert.pem"
        );
        assert_eq!(
            second.cert_path.file_name().unwrap(),
            "a.example.com_20250301120000-1_cert.pem"
        );
        assert!(first.key_path.exists());

        let latest = store.latest("a.example.com").await.unwrap().unwrap();
        assert_eq!(latest.cert_path, second.cert_path);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path());
        let (chain, key) = minted_chain("k.example.com");
        let cert = IssuedCertificate::from_pem(chain, key).unwrap();

        let stored = store.save("k.example.com", &cert).await.unwrap();
        let mode = std::fs::metadata(&stored.key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_latest_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path().join("absent"));
        assert!(store.latest("a.example.com").await.unwrap().is_none());
    }
}
